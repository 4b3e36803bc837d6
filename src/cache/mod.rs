//! Cache Daemon (boss/worker)
//!
//! # Architecture
//!
//! ```text
//!  control socket          ┌──────────────┐
//!  ───────────────────────▶│     Boss     │  accept, parse one line
//!                          └──────┬───────┘
//!                                 │ push
//!                          ┌──────▼───────┐
//!                          │  Task Queue  │  FIFO, mutex + not-empty condvar
//!                          └──────┬───────┘
//!                 pop ┌───────────┼───────────┐ pop
//!              ┌──────▼──┐  ┌─────▼───┐  ┌────▼────┐
//!              │ Worker  │  │ Worker  │  │ Worker  │  attach channel, stream chunks
//!              └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! All daemon state lives in a [`DaemonContext`] created by
//! [`CacheDaemon::start`] and shared by the boss and every worker.

mod boss;
pub mod queue;
pub mod store;
pub mod worker;

use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::Result;

pub use boss::CONTROL_READ_TIMEOUT;
pub use queue::{TaskQueue, TransferTask};
pub use store::{ContentHandle, ContentStore, FileStore, MemoryStore};
pub use worker::{serve_task, TaskOutcome};

/// State shared by the boss and the workers.
pub struct DaemonContext {
    pub(crate) config: DaemonConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) store: Arc<dyn ContentStore>,
    shutting_down: AtomicBool,
}

impl DaemonContext {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// Handle to a running cache daemon.
pub struct CacheDaemon {
    ctx: Arc<DaemonContext>,
    boss: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl CacheDaemon {
    /// Bind the control socket and start the boss and worker threads.
    pub fn start(config: DaemonConfig, store: Arc<dyn ContentStore>) -> Result<Self> {
        config.validate()?;

        remove_socket_file(&config.socket_path)?;
        let listener = UnixListener::bind(&config.socket_path)?;

        let worker_threads = config.worker_threads;
        let ctx = Arc::new(DaemonContext {
            config,
            queue: TaskQueue::new(),
            store,
            shutting_down: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_threads);
        for id in 0..worker_threads {
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("cache-worker-{}", id))
                .spawn(move || worker::worker_loop(id, &ctx))?;
            workers.push(handle);
        }

        let boss = {
            let ctx = ctx.clone();
            thread::Builder::new()
                .name("cache-boss".into())
                .spawn(move || boss::boss_loop(&ctx, listener))?
        };

        info!(
            socket = %ctx.config.socket_path.display(),
            workers = worker_threads,
            keys = ctx.store.len(),
            "Cache daemon started"
        );

        Ok(Self {
            ctx,
            boss: Some(boss),
            workers,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.ctx.config.socket_path
    }

    /// Tasks waiting for a worker.
    pub fn queued_tasks(&self) -> usize {
        self.ctx.queue.len()
    }

    /// Stop accepting requests, wake idle workers and remove the socket file.
    ///
    /// Workers finish the task they are on; queued tasks are still served.
    pub fn stop(&self) {
        if self.ctx.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake the boss out of accept(); it checks the flag first.
        let _ = UnixStream::connect(&self.ctx.config.socket_path);
        self.ctx.queue.close();

        if let Err(e) = remove_socket_file(&self.ctx.config.socket_path) {
            warn!("Failed to remove control socket: {}", e);
        }
        info!("Cache daemon stopping");
    }

    /// Stop and wait for every thread to exit.
    pub fn join(mut self) {
        self.stop();
        if let Some(boss) = self.boss.take() {
            let _ = boss.join();
        }
        for worker in std::mem::take(&mut self.workers) {
            let _ = worker.join();
        }
        info!("Cache daemon stopped");
    }

    /// Stop and wait at most `grace` for every thread to exit.
    ///
    /// Returns `false` when a worker is still busy once `grace` elapsed; the
    /// remaining threads are left to finish on their own.
    pub fn join_timeout(self, grace: Duration) -> bool {
        self.stop();
        let (done_tx, done_rx) = mpsc::channel();
        let joiner = thread::Builder::new()
            .name("cache-join".into())
            .spawn(move || {
                self.join();
                let _ = done_tx.send(());
            });
        if let Err(e) = joiner {
            warn!("Failed to spawn join thread: {}", e);
            return false;
        }
        done_rx.recv_timeout(grace).is_ok()
    }
}

impl Drop for CacheDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_socket_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlClient, ControlRequest};
    use crate::shm::{SharedChannel, HEADER_SIZE};
    use std::time::Instant;

    fn test_config(dir: &tempfile::TempDir) -> DaemonConfig {
        DaemonConfig {
            socket_path: dir.path().join("cache.sock"),
            worker_threads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_and_stop_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = CacheDaemon::start(test_config(&dir), Arc::new(MemoryStore::new())).unwrap();
        let path = daemon.socket_path().to_path_buf();
        assert!(path.exists());

        daemon.join();
        assert!(!path.exists());
    }

    #[test]
    fn test_start_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        fs::write(&config.socket_path, b"stale").unwrap();

        let daemon = CacheDaemon::start(config, Arc::new(MemoryStore::new())).unwrap();
        daemon.join();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            worker_threads: 0,
            ..test_config(&dir)
        };
        assert!(CacheDaemon::start(config, Arc::new(MemoryStore::new())).is_err());
    }

    #[test]
    fn test_control_request_reaches_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("hello", b"hello world".to_vec());
        let daemon = CacheDaemon::start(test_config(&dir), store).unwrap();

        let name = format!("/shmcache_daemon_{}", uuid::Uuid::new_v4().simple());
        let capacity = HEADER_SIZE + 64;
        let channel = SharedChannel::create(&name, capacity).unwrap();

        ControlClient::new(daemon.socket_path())
            .send(&ControlRequest::new(&name, "hello", capacity))
            .unwrap();

        channel
            .wait_producer_ready(Some(Duration::from_secs(10)))
            .unwrap();
        let chunk = channel.pending_chunk().unwrap();
        assert_eq!(chunk.data, b"hello world");
        assert!(chunk.last);
        channel.signal_consumed().unwrap();

        daemon.join();
        channel.destroy().unwrap();
    }

    #[test]
    fn test_join_timeout_bounds_wait_on_busy_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("big", vec![7u8; 32]);
        let daemon = CacheDaemon::start(test_config(&dir), store).unwrap();

        let name = format!("/shmcache_daemon_{}", uuid::Uuid::new_v4().simple());
        let capacity = HEADER_SIZE + 8;
        let channel = SharedChannel::create(&name, capacity).unwrap();
        ControlClient::new(daemon.socket_path())
            .send(&ControlRequest::new(&name, "big", capacity))
            .unwrap();

        // First chunk published; the worker now waits for an ack that never comes.
        channel
            .wait_producer_ready(Some(Duration::from_secs(10)))
            .unwrap();

        let started = Instant::now();
        assert!(!daemon.join_timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(2));

        // Release the stuck worker.
        channel.retire().unwrap();
    }

    #[test]
    fn test_join_timeout_idle_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = CacheDaemon::start(test_config(&dir), Arc::new(MemoryStore::new())).unwrap();
        assert!(daemon.join_timeout(Duration::from_secs(5)));
    }
}
