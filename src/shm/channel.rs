//! Shared Channel - one named shared-memory region
//!
//! The proxy creates every channel at startup and is the only side that ever
//! destroys one. The cache daemon attaches to a channel by name for the
//! duration of a single transfer, using the capacity it was told over the
//! control socket.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};

use super::layout::{usable_capacity, ChannelHeader, ChunkView, ChunkWriter, HEADER_SIZE};
use crate::error::{Error, Result};

/// Maximum length of a POSIX shared memory name (including the leading '/')
pub const MAX_CHANNEL_NAME_LEN: usize = 255;

/// Which side of the transfer owns this mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Created (and eventually destroyed) by this process
    Owner,
    /// Attached to a region created elsewhere
    Attached,
}

/// A mapped shared channel.
///
/// Producer access goes through [`SharedChannel::writer`]; consumer access
/// through [`SharedChannel::wait_producer_ready`] and
/// [`SharedChannel::pending_chunk`].
pub struct SharedChannel {
    name: String,
    capacity: usize,
    map: MmapMut,
    // Keeps the shm descriptor open for the lifetime of the mapping
    _file: File,
    role: ChannelRole,
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("role", &self.role)
            .finish()
    }
}

impl SharedChannel {
    /// Create, size and map a named region, then initialise its header.
    ///
    /// An existing region with the same name (left behind by a crashed
    /// process) is reused and re-initialised.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        let init_err = |reason: String| Error::ChannelInit {
            name: name.to_string(),
            reason,
        };

        validate_name(name).map_err(init_err)?;
        if capacity <= HEADER_SIZE {
            return Err(init_err(format!(
                "capacity {} must exceed header size {}",
                capacity, HEADER_SIZE
            )));
        }

        let file = shm_open(name, libc::O_CREAT | libc::O_RDWR)
            .map_err(|e| init_err(format!("shm_open: {}", e)))?;
        file.set_len(capacity as u64)
            .map_err(|e| init_err(format!("ftruncate: {}", e)))?;

        // SAFETY: the region is sized to `capacity` above; concurrent
        // modification by the other process is governed by the semaphore
        // handshake.
        let map = unsafe { MmapOptions::new().len(capacity).map_mut(&file) }
            .map_err(|e| init_err(format!("mmap: {}", e)))?;

        let channel = Self {
            name: name.to_string(),
            capacity,
            map,
            _file: file,
            role: ChannelRole::Owner,
        };

        // SAFETY: the channel was just created and is not yet announced to
        // any other process.
        unsafe { channel.header().init() }.map_err(|e| init_err(e.to_string()))?;

        tracing::debug!(channel = %channel.name, capacity, "Created shared channel");
        Ok(channel)
    }

    /// Open and map an existing region without touching its contents.
    pub fn attach(name: &str, capacity: usize) -> Result<Self> {
        let attach_err = |reason: String| Error::ChannelAttach {
            name: name.to_string(),
            reason,
        };

        validate_name(name).map_err(attach_err)?;
        if capacity <= HEADER_SIZE {
            return Err(attach_err(format!(
                "capacity {} must exceed header size {}",
                capacity, HEADER_SIZE
            )));
        }

        let file =
            shm_open(name, libc::O_RDWR).map_err(|e| attach_err(format!("shm_open: {}", e)))?;

        let actual = file
            .metadata()
            .map_err(|e| attach_err(format!("fstat: {}", e)))?
            .len();
        if actual < capacity as u64 {
            return Err(attach_err(format!(
                "region is {} bytes, requested capacity {}",
                actual, capacity
            )));
        }

        // SAFETY: the region is at least `capacity` bytes (checked above).
        let map = unsafe { MmapOptions::new().len(capacity).map_mut(&file) }
            .map_err(|e| attach_err(format!("mmap: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            capacity,
            map,
            _file: file,
            role: ChannelRole::Attached,
        })
    }

    /// Release the semaphores, unmap, close and unlink the region.
    ///
    /// Only the owner may destroy a channel, and only when no other process
    /// is attached to it.
    pub fn destroy(self) -> Result<()> {
        if self.role != ChannelRole::Owner {
            return Err(Error::Internal(format!(
                "channel {} is attached, not owned; only the owner destroys it",
                self.name
            )));
        }

        // SAFETY: ownership discipline guarantees no peer is blocked on
        // either semaphore at shutdown.
        unsafe { self.header().destroy() };

        let SharedChannel {
            name, map, _file, ..
        } = self;
        drop(map);
        drop(_file);

        unlink(&name)?;
        tracing::debug!(channel = %name, "Destroyed shared channel");
        Ok(())
    }

    /// Give up on an unfinished transfer: flag it abandoned, wake the
    /// producer and unlink the name.
    ///
    /// The semaphores are left alone since a late producer may still be
    /// using its own mapping of the region; the kernel frees the memory once
    /// that mapping goes away.
    pub fn retire(self) -> Result<()> {
        if self.role != ChannelRole::Owner {
            return Err(Error::Internal(format!(
                "channel {} is attached, not owned; only the owner retires it",
                self.name
            )));
        }

        let abandoned = self.header().abandon();
        let SharedChannel {
            name, map, _file, ..
        } = self;
        drop(map);
        drop(_file);

        unlink(&name)?;
        tracing::debug!(channel = %name, "Retired shared channel");
        abandoned
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total capacity in bytes (header included).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest chunk this channel can carry.
    #[inline]
    pub fn max_chunk_size(&self) -> usize {
        usable_capacity(self.capacity)
    }

    #[inline]
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub(crate) fn header(&self) -> &ChannelHeader {
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE bytes;
        // every field of the header is valid for any bit pattern after init.
        unsafe { &*(self.map.as_ptr() as *const ChannelHeader) }
    }

    // -------------------------------------------------------------------------
    // Producer side
    // -------------------------------------------------------------------------

    /// Borrow the data buffer for writing chunks.
    pub fn writer(&mut self) -> ChunkWriter<'_> {
        let (head, data) = self.map.split_at_mut(HEADER_SIZE);
        // SAFETY: `head` covers exactly the header at the start of the
        // mapping and does not overlap `data`.
        let header = unsafe { &*(head.as_ptr() as *const ChannelHeader) };
        ChunkWriter { header, data }
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    /// Block until the producer signals a chunk.
    ///
    /// With `timeout = None` the wait is unbounded.
    pub fn wait_producer_ready(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => self.header().producer_ready().wait(),
            Some(timeout) => {
                if self.header().producer_ready().wait_timeout(timeout)? {
                    Ok(())
                } else {
                    Err(Error::HandshakeTimeout {
                        channel: self.name.clone(),
                        timeout,
                    })
                }
            }
        }
    }

    /// The chunk currently in the buffer, validated against the capacity.
    pub fn pending_chunk(&self) -> Result<ChunkView<'_>> {
        let header = self.header();
        let len = header.pending_len();
        let max = self.max_chunk_size();
        if len > max {
            return Err(Error::ChunkOverflow { len, max });
        }
        Ok(ChunkView {
            data: &self.map[HEADER_SIZE..HEADER_SIZE + len],
            last: header.is_last_chunk(),
        })
    }

    /// Total content size as published by the producer.
    pub fn total_size(&self) -> u64 {
        self.header().total_size()
    }

    /// Acknowledge the pending chunk.
    pub fn signal_consumed(&self) -> Result<()> {
        self.header().consumer_ready().post()
    }
}

/// Remove a named region without mapping it.
pub fn unlink(name: &str) -> Result<()> {
    let cname = channel_cstring(name)?;
    // SAFETY: `cname` is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err.into());
        }
    }
    Ok(())
}

fn shm_open(name: &str, flags: libc::c_int) -> io::Result<File> {
    let cname = channel_cstring(name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    // SAFETY: `cname` is a valid NUL-terminated string.
    let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0o666 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly opened descriptor we exclusively own.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn channel_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Config(format!("channel name {:?} contains NUL", name)))
}

/// Names must be a single POSIX path component and a single control-line token.
fn validate_name(name: &str) -> std::result::Result<(), String> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(format!("name {:?} must start with '/'", name));
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(format!("name longer than {} bytes", MAX_CHANNEL_NAME_LEN));
    }
    if name[1..].contains('/') {
        return Err(format!("name {:?} must not contain '/' after the first byte", name));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(format!("name {:?} must not contain whitespace", name));
    }
    Ok(())
}
