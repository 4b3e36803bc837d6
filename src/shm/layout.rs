//! Memory layout of a shared channel
//!
//! ```text
//! offset 0
//! ┌──────────────────────┬──────────────────────┬─────────────┬──────────┬────────────┬───────────┬───────────────────────┐
//! │ producer-ready sem_t │ consumer-ready sem_t │ pending_len │ is_last  │ total_size │ abandoned │ data ...              │
//! │                      │                      │ (size_t)    │ (int)    │ (size_t)   │ (int)     │ capacity - HEADER_SIZE│
//! └──────────────────────┴──────────────────────┴─────────────┴──────────┴────────────┴───────────┴───────────────────────┘
//! ```
//!
//! `abandoned` is set once by the proxy when it gives up on a transfer and
//! retires the channel; a producer that wakes up afterwards stops.
//!
//! Both semaphores are unnamed POSIX semaphores initialised with
//! `pshared = 1`, so they synchronise across every process that maps the
//! region. The scalar fields are only written by the side that currently
//! holds the turn in the handshake; atomics are used so that each access is
//! a single well-defined load or store on memory another process may touch.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Header placed at the start of every channel mapping.
#[repr(C)]
pub struct ChannelHeader {
    /// Posted by the producer when a chunk is ready; the consumer waits here
    producer_ready: RawSemaphore,
    /// Posted by the consumer when a chunk was consumed; the producer waits here
    consumer_ready: RawSemaphore,
    /// Length of the chunk currently in the buffer
    pending_len: AtomicUsize,
    /// Non-zero when the pending chunk is the final one
    is_last_chunk: AtomicI32,
    /// Total content size, valid once the first chunk was signalled
    total_size: AtomicUsize,
    /// Non-zero once the consumer retired the channel mid-transfer
    abandoned: AtomicI32,
}

/// Size of [`ChannelHeader`]; the data buffer starts at this offset.
pub const HEADER_SIZE: usize = mem::size_of::<ChannelHeader>();

/// Usable data bytes of a channel with the given total capacity.
#[inline]
pub const fn usable_capacity(capacity: usize) -> usize {
    capacity.saturating_sub(HEADER_SIZE)
}

impl ChannelHeader {
    /// Initialise both semaphores to "not signalled" and clear the fields.
    ///
    /// # Safety
    ///
    /// No other process or thread may be using the semaphores.
    pub(crate) unsafe fn init(&self) -> Result<()> {
        self.producer_ready.init()?;
        if let Err(e) = self.consumer_ready.init() {
            self.producer_ready.destroy();
            return Err(e);
        }
        self.pending_len.store(0, Ordering::Release);
        self.is_last_chunk.store(0, Ordering::Release);
        self.total_size.store(0, Ordering::Release);
        self.abandoned.store(0, Ordering::Release);
        Ok(())
    }

    /// Release both semaphores.
    ///
    /// # Safety
    ///
    /// No other process or thread may be blocked on either semaphore.
    pub(crate) unsafe fn destroy(&self) {
        self.producer_ready.destroy();
        self.consumer_ready.destroy();
    }

    pub fn producer_ready(&self) -> &RawSemaphore {
        &self.producer_ready
    }

    pub fn consumer_ready(&self) -> &RawSemaphore {
        &self.consumer_ready
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending_len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_last_chunk(&self) -> bool {
        self.is_last_chunk.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire) as u64
    }

    #[inline]
    pub fn set_total_size(&self, size: u64) {
        self.total_size.store(size as usize, Ordering::Release);
    }

    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire) != 0
    }

    /// Flag the transfer as abandoned and release a producer waiting for
    /// its acknowledgment.
    pub(crate) fn abandon(&self) -> Result<()> {
        self.abandoned.store(1, Ordering::Release);
        self.consumer_ready.post()
    }

    /// Store the chunk metadata. Callers validate `len` first.
    #[inline]
    pub(crate) fn set_chunk(&self, len: usize, last: bool) {
        self.pending_len.store(len, Ordering::Release);
        self.is_last_chunk.store(last as i32, Ordering::Release);
    }
}

// =============================================================================
// RawSemaphore
// =============================================================================

/// A process-shared POSIX semaphore living inside a mapping.
#[repr(transparent)]
pub struct RawSemaphore(UnsafeCell<libc::sem_t>);

// SAFETY: sem_post/sem_wait are safe to call concurrently from any thread.
unsafe impl Sync for RawSemaphore {}

impl RawSemaphore {
    unsafe fn init(&self) -> Result<()> {
        if libc::sem_init(self.0.get(), 1, 0) != 0 {
            return Err(Error::Semaphore {
                op: "init",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    unsafe fn destroy(&self) {
        libc::sem_destroy(self.0.get());
    }

    /// Signal the semaphore.
    pub fn post(&self) -> Result<()> {
        // SAFETY: the semaphore was initialised by the creating side and the
        // mapping outlives `self`.
        if unsafe { libc::sem_post(self.0.get()) } != 0 {
            return Err(Error::Semaphore {
                op: "post",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Block until the semaphore is signalled.
    pub fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: see `post`.
            if unsafe { libc::sem_wait(self.0.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Semaphore {
                    op: "wait",
                    source: err,
                });
            }
        }
    }

    /// Block until signalled or until `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            // SAFETY: see `post`; `deadline` is a valid timespec.
            if unsafe { libc::sem_timedwait(self.0.get(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => {
                    return Err(Error::Semaphore {
                        op: "timedwait",
                        source: err,
                    })
                }
            }
        }
    }

    /// Try to take the semaphore without blocking.
    pub fn try_wait(&self) -> Result<bool> {
        // SAFETY: see `post`.
        if unsafe { libc::sem_trywait(self.0.get()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(Error::Semaphore {
                op: "trywait",
                source: err,
            }),
        }
    }
}

/// sem_timedwait takes an absolute CLOCK_REALTIME deadline.
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(Error::Semaphore {
            op: "clock_gettime",
            source: io::Error::last_os_error(),
        });
    }

    let mut nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }

    Ok(libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as _,
    })
}

// =============================================================================
// Chunk views
// =============================================================================

/// A validated chunk as seen by the consumer.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView<'a> {
    /// Chunk bytes, never longer than the usable buffer
    pub data: &'a [u8],
    /// Whether this is the final chunk of the transfer
    pub last: bool,
}

impl ChunkView<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Producer-side access to the data buffer.
///
/// The buffer capacity is fixed by the channel; the used length is only set
/// through [`ChunkWriter::publish`], which checks it against the capacity.
pub struct ChunkWriter<'a> {
    pub(crate) header: &'a ChannelHeader,
    pub(crate) data: &'a mut [u8],
}

impl ChunkWriter<'_> {
    /// Writable data buffer (the full usable capacity).
    pub fn buf(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    /// Maximum chunk size.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Record the total content size.
    pub fn set_total_size(&self, size: u64) {
        self.header.set_total_size(size);
    }

    /// Set the pending chunk and signal producer-ready.
    pub fn publish(&mut self, len: usize, last: bool) -> Result<()> {
        if len > self.data.len() {
            return Err(Error::ChunkOverflow {
                len,
                max: self.data.len(),
            });
        }
        self.header.set_chunk(len, last);
        self.header.producer_ready().post()
    }

    /// Encode a miss: zero-length last chunk.
    pub fn publish_miss(&mut self) -> Result<()> {
        self.publish(0, true)
    }

    /// Block until the consumer acknowledged the pending chunk.
    ///
    /// Fails with [`Error::TransferAbandoned`] when the consumer retired the
    /// channel instead.
    pub fn wait_consumed(&self) -> Result<()> {
        self.header.consumer_ready().wait()?;
        if self.header.is_abandoned() {
            return Err(Error::TransferAbandoned);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fits_in_default_capacity() {
        assert!(HEADER_SIZE < crate::config::DEFAULT_CHANNEL_CAPACITY);
        assert!(HEADER_SIZE >= 2 * mem::size_of::<libc::sem_t>());
    }

    #[test]
    fn test_usable_capacity() {
        assert_eq!(usable_capacity(HEADER_SIZE + 4000), 4000);
        assert_eq!(usable_capacity(HEADER_SIZE), 0);
        assert_eq!(usable_capacity(1), 0);
    }

    #[test]
    fn test_realtime_deadline_normalises_nanos() {
        let ts = realtime_deadline(Duration::from_nanos(999_999_999)).unwrap();
        assert!(ts.tv_nsec < 1_000_000_000);
        assert!(ts.tv_nsec >= 0);
    }

    #[test]
    fn test_semaphore_post_wait() {
        // SAFETY: all-zero bytes are a valid bit pattern for every field
        // before init, and the boxed header never moves after init.
        let header: Box<ChannelHeader> = Box::new(unsafe { mem::zeroed() });
        unsafe { header.init().unwrap() };

        assert!(!header.producer_ready().try_wait().unwrap());
        header.producer_ready().post().unwrap();
        assert!(header.producer_ready().try_wait().unwrap());
        assert!(!header
            .producer_ready()
            .wait_timeout(Duration::from_millis(10))
            .unwrap());

        unsafe { header.destroy() };
    }

    #[test]
    fn test_abandon_releases_waiting_producer() {
        // SAFETY: as above.
        let header: Box<ChannelHeader> = Box::new(unsafe { mem::zeroed() });
        unsafe { header.init().unwrap() };
        let mut data = [0u8; 8];
        let writer = ChunkWriter {
            header: &*header,
            data: &mut data,
        };

        assert!(!header.is_abandoned());
        header.abandon().unwrap();
        assert!(header.is_abandoned());
        assert!(matches!(writer.wait_consumed(), Err(Error::TransferAbandoned)));

        unsafe { header.destroy() };
    }
}
