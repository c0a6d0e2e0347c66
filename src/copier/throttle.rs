//! IO throttle: a token bucket refilled once per second

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::backoff::StopSignal;
use crate::observability::Logger;

const REFILL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Bucket {
    available: u64,
    closed: bool,
}

/// Caps combined read and write operations per second across all workers
#[derive(Debug)]
pub struct IoThrottle {
    limit: u64,
    bucket: Mutex<Bucket>,
    refilled: Condvar,
    stop: StopSignal,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl IoThrottle {
    /// Starts a throttle with its refill watcher thread
    pub fn start(ops_per_sec: u64) -> std::io::Result<Arc<Self>> {
        let throttle = Arc::new(Self::manual(ops_per_sec));
        let watched = Arc::clone(&throttle);
        let handle = thread::Builder::new()
            .name("aero-io-throttle".to_string())
            .spawn(move || {
                while !watched.stop.wait_timeout(REFILL_INTERVAL) {
                    watched.refill();
                }
            })?;
        *throttle.watcher.lock() = Some(handle);
        Logger::info(
            "IO_THROTTLE_STARTED",
            &[("ops_per_sec", &ops_per_sec.to_string())],
        );
        Ok(throttle)
    }

    /// A throttle without a watcher; refills happen only through `refill`
    pub fn manual(ops_per_sec: u64) -> Self {
        let limit = ops_per_sec.max(1);
        Self {
            limit,
            bucket: Mutex::new(Bucket {
                available: limit,
                closed: false,
            }),
            refilled: Condvar::new(),
            stop: StopSignal::new(),
            watcher: Mutex::new(None),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.bucket.lock().available
    }

    /// Takes one operation token, blocking until the next refill if needed.
    ///
    /// Returns immediately once the throttle is shut down.
    pub fn acquire(&self) {
        let mut bucket = self.bucket.lock();
        while bucket.available == 0 && !bucket.closed {
            self.refilled.wait(&mut bucket);
        }
        if bucket.available > 0 {
            bucket.available -= 1;
        }
    }

    pub fn refill(&self) {
        let mut bucket = self.bucket.lock();
        bucket.available = self.limit;
        self.refilled.notify_all();
    }

    /// Stops the watcher and releases every blocked worker
    pub fn shutdown(&self) {
        {
            let mut bucket = self.bucket.lock();
            bucket.closed = true;
            self.refilled.notify_all();
        }
        self.stop.request();
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoThrottle {
    fn drop(&mut self) {
        self.stop.request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_bucket_drains_and_refills() {
        let throttle = IoThrottle::manual(3);
        throttle.acquire();
        throttle.acquire();
        assert_eq!(throttle.available(), 1);
        throttle.refill();
        assert_eq!(throttle.available(), 3);
    }

    #[test]
    fn test_acquire_blocks_until_refill() {
        let throttle = Arc::new(IoThrottle::manual(1));
        throttle.acquire();

        let done = Arc::new(AtomicU64::new(0));
        let worker = {
            let throttle = Arc::clone(&throttle);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                throttle.acquire();
                done.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        throttle.refill();
        worker.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let throttle = IoThrottle::start(1).unwrap();
        throttle.acquire();
        let worker = {
            let throttle = Arc::clone(&throttle);
            thread::spawn(move || throttle.acquire())
        };
        throttle.shutdown();
        worker.join().unwrap();
    }
}
