//! Channel Pool - bounded free list of shared channels
//!
//! The proxy creates every channel up front. A transfer checks one out with
//! [`ChannelPool::acquire`]; the [`ChannelLease`] guard hands it back on drop
//! so that every error path returns the channel exactly once.
//!
//! Acquisition never blocks: an empty pool is reported immediately as
//! [`Error::NoChannelAvailable`].
//!
//! A lease whose handshake was abandoned half way is retired with
//! [`ChannelLease::retire`] instead. The old region is unlinked and a fresh
//! one under a new name takes its slot, so a late producer can never touch a
//! channel that is back in circulation.

use std::collections::VecDeque;
use std::mem::{self, ManuallyDrop};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::channel::{self, ChannelRole, SharedChannel};
use crate::error::{Error, Result};
use crate::metrics;

/// A pool of pre-created shared channels.
#[derive(Debug)]
pub struct ChannelPool {
    /// Available channels (FIFO)
    available: Mutex<VecDeque<SharedChannel>>,
    /// Names of every live channel this pool owns
    names: Mutex<Vec<String>>,
    /// Name prefix for new channels
    prefix: String,
    /// Suffix of the next channel created
    next_id: AtomicUsize,
    /// Capacity of each channel
    capacity: usize,
}

impl ChannelPool {
    /// Create `count` channels named `<prefix>0 .. <prefix>{count-1}`.
    ///
    /// A channel that fails to create is logged and skipped; the call only
    /// fails when no channel at all could be created.
    pub fn create(prefix: &str, count: usize, capacity: usize) -> Result<Self> {
        let mut channels = VecDeque::with_capacity(count);
        let mut last_err = None;

        for i in 0..count {
            let name = format!("{}{}", prefix, i);
            match SharedChannel::create(&name, capacity) {
                Ok(channel) => channels.push_back(channel),
                Err(e) => {
                    error!(channel = %name, "Failed to create shared channel: {}", e);
                    last_err = Some(e);
                }
            }
        }

        if channels.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                Error::Config("channel pool requires at least one channel".into())
            }));
        }

        let names = channels.iter().map(|c| c.name().to_string()).collect();
        metrics::CHANNELS_AVAILABLE.set(channels.len() as i64);

        Ok(Self {
            available: Mutex::new(channels),
            names: Mutex::new(names),
            prefix: prefix.to_string(),
            next_id: AtomicUsize::new(count),
            capacity,
        })
    }

    /// Check out a channel, failing fast when none is free.
    pub fn acquire(&self) -> Result<ChannelLease<'_>> {
        let channel = self.try_pop().ok_or(Error::NoChannelAvailable)?;
        Ok(ChannelLease {
            pool: self,
            channel: ManuallyDrop::new(channel),
        })
    }

    /// Return a checked-out channel. Anything that is not one of this
    /// pool's own, currently checked-out channels is refused.
    fn release(&self, channel: SharedChannel) {
        if let Err(reason) = self.check_returnable(&channel) {
            warn!(channel = %channel.name(), "Refusing to pool channel: {}", reason);
            return;
        }

        let mut available = self.available.lock();
        if available.iter().any(|c| c.name() == channel.name()) {
            warn!(channel = %channel.name(), "Refusing to pool channel: already available");
            return;
        }
        available.push_back(channel);
        metrics::CHANNELS_AVAILABLE.set(available.len() as i64);
    }

    fn check_returnable(&self, channel: &SharedChannel) -> std::result::Result<(), &'static str> {
        if channel.role() != ChannelRole::Owner {
            return Err("not owned by this process");
        }
        if !self.names.lock().iter().any(|n| n == channel.name()) {
            return Err("does not belong to this pool");
        }
        Ok(())
    }

    /// Unlink a channel with an abandoned handshake and put a fresh one in
    /// its slot.
    fn retire(&self, channel: SharedChannel) {
        let old = channel.name().to_string();
        if let Err(reason) = self.check_returnable(&channel) {
            warn!(channel = %old, "Refusing to retire channel: {}", reason);
            return;
        }

        self.names.lock().retain(|n| *n != old);
        if let Err(e) = channel.retire() {
            error!(channel = %old, "Failed to retire channel: {}", e);
        }
        metrics::CHANNELS_RETIRED_TOTAL.inc();

        let name = format!("{}{}", self.prefix, self.next_id.fetch_add(1, Ordering::Relaxed));
        match SharedChannel::create(&name, self.capacity) {
            Ok(replacement) => {
                info!(retired = %old, channel = %name, "Replaced abandoned channel");
                self.names.lock().push(name);
                let mut available = self.available.lock();
                available.push_back(replacement);
                metrics::CHANNELS_AVAILABLE.set(available.len() as i64);
            }
            Err(e) => {
                error!(retired = %old, "Failed to replace channel; pool shrinks: {}", e);
            }
        }
    }

    fn try_pop(&self) -> Option<SharedChannel> {
        let mut available = self.available.lock();
        let channel = available.pop_front();
        metrics::CHANNELS_AVAILABLE.set(available.len() as i64);
        channel
    }

    /// Number of channels currently available.
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }

    /// Number of live channels owned by the pool.
    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// Capacity of each channel in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Destroy every available channel and unlink the names of channels
    /// still checked out. Returns the number of channels destroyed.
    pub fn destroy_all(&self) -> usize {
        let drained: Vec<SharedChannel> = self.available.lock().drain(..).collect();
        metrics::CHANNELS_AVAILABLE.set(0);

        let returned: Vec<String> = drained.iter().map(|c| c.name().to_string()).collect();
        let mut destroyed = 0;
        for channel in drained {
            let name = channel.name().to_string();
            match channel.destroy() {
                Ok(()) => destroyed += 1,
                Err(e) => error!(channel = %name, "Failed to destroy channel: {}", e),
            }
        }

        let names = self.names.lock().clone();
        for name in names.iter().filter(|n| !returned.contains(n)) {
            warn!(channel = %name, "Channel still checked out at shutdown; unlinking name");
            if let Err(e) = channel::unlink(name) {
                error!(channel = %name, "Failed to unlink channel: {}", e);
            }
        }

        debug!(destroyed, "Channel pool torn down");
        destroyed
    }
}

/// A checked-out channel; returned to its pool when dropped.
#[derive(Debug)]
pub struct ChannelLease<'a> {
    pool: &'a ChannelPool,
    channel: ManuallyDrop<SharedChannel>,
}

impl ChannelLease<'_> {
    /// Retire the channel instead of returning it; the pool gets a fresh
    /// replacement.
    pub fn retire(mut self) {
        // SAFETY: the channel is taken exactly once and `self` is forgotten
        // so `Drop` never sees it.
        let channel = unsafe { ManuallyDrop::take(&mut self.channel) };
        let pool = self.pool;
        mem::forget(self);
        pool.retire(channel);
    }
}

impl Deref for ChannelLease<'_> {
    type Target = SharedChannel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        // SAFETY: the channel is taken exactly once, here, and never touched again.
        let channel = unsafe { ManuallyDrop::take(&mut self.channel) };
        self.pool.release(channel);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::HEADER_SIZE;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn unique_prefix() -> String {
        format!("/shmcache_pool_{}_", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_create_and_acquire() {
        let pool = ChannelPool::create(&unique_prefix(), 2, HEADER_SIZE + 128).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.capacity(), HEADER_SIZE + 128);

        {
            let lease = pool.acquire().unwrap();
            assert_eq!(lease.capacity(), HEADER_SIZE + 128);
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 2);

        assert_eq!(pool.destroy_all(), 2);
    }

    #[test]
    fn test_exhausted_pool_fails_fast() {
        let pool = ChannelPool::create(&unique_prefix(), 1, 4096).unwrap();
        let first = pool.acquire().unwrap();
        assert_matches!(pool.acquire(), Err(Error::NoChannelAvailable));
        drop(first);
        assert!(pool.acquire().is_ok());
        pool.destroy_all();
    }

    #[test]
    fn test_create_fails_when_nothing_created() {
        let result = ChannelPool::create(&unique_prefix(), 2, HEADER_SIZE);
        assert_matches!(result, Err(Error::ChannelInit { .. }));
    }

    #[test]
    fn test_destroy_all_unlinks_checked_out_names() {
        let prefix = unique_prefix();
        let pool = ChannelPool::create(&prefix, 2, 4096).unwrap();
        let lease = pool.acquire().unwrap();
        let name = lease.name().to_string();

        assert_eq!(pool.destroy_all(), 1);
        assert_matches!(
            SharedChannel::attach(&name, 4096),
            Err(Error::ChannelAttach { .. })
        );
        drop(lease);
    }

    #[test]
    fn test_attached_alias_is_not_pooled_twice() {
        let pool = ChannelPool::create(&unique_prefix(), 1, 4096).unwrap();
        let name = pool.acquire().unwrap().name().to_string();

        let alias = SharedChannel::attach(&name, 4096).unwrap();
        pool.release(alias);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.destroy_all(), 1);
    }

    #[test]
    fn test_retired_channel_is_replaced() {
        let prefix = unique_prefix();
        let pool = ChannelPool::create(&prefix, 2, HEADER_SIZE + 64).unwrap();

        let lease = pool.acquire().unwrap();
        let old = lease.name().to_string();
        lease.retire();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.available(), 2);
        assert_matches!(
            SharedChannel::attach(&old, HEADER_SIZE + 64),
            Err(Error::ChannelAttach { .. })
        );

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first.name(), old);
        assert_ne!(second.name(), old);
        assert_eq!(second.name(), format!("{}2", prefix));
        assert!(!second.header().is_abandoned());

        drop((first, second));
        assert_eq!(pool.destroy_all(), 2);
    }

    #[test]
    fn test_foreign_channel_is_rejected() {
        let pool = ChannelPool::create(&unique_prefix(), 1, 4096).unwrap();
        let foreign_name = format!("/shmcache_foreign_{}", uuid::Uuid::new_v4().simple());
        let foreign = SharedChannel::create(&foreign_name, 4096).unwrap();

        let lease = pool.acquire().unwrap();
        drop(lease);
        // Pool is full again; a foreign channel must not grow it.
        let foreign_handle = SharedChannel::attach(&foreign_name, 4096).unwrap();
        pool.release(foreign_handle);
        assert_eq!(pool.available(), 1);

        foreign.destroy().unwrap();
        pool.destroy_all();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_available_stays_within_bounds(ops in prop::collection::vec(any::<bool>(), 1..64)) {
            let size = 3;
            let pool = ChannelPool::create(&unique_prefix(), size, 4096).unwrap();
            let mut leases = Vec::new();

            for acquire in ops {
                if acquire {
                    match pool.acquire() {
                        Ok(lease) => leases.push(lease),
                        Err(e) => {
                            prop_assert!(matches!(e, Error::NoChannelAvailable));
                            prop_assert_eq!(leases.len(), size);
                        }
                    }
                } else {
                    leases.pop();
                }
                prop_assert!(pool.available() <= size);
                prop_assert_eq!(pool.available() + leases.len(), size);
            }

            drop(leases);
            prop_assert_eq!(pool.available(), size);
            pool.destroy_all();
        }
    }
}
