//! Fixed pool of named copy threads fed through a channel

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
    panicked: AtomicUsize,
}

struct Completion<'a>(&'a Pending);

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl WorkerPool {
    pub fn new(threads: usize, name: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let mut workers = Vec::with_capacity(threads.max(1));

        for idx in 0..threads.max(1) {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, idx))
                .spawn(move || {
                    for job in receiver.iter() {
                        let _completion = Completion(&pending);
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            pending.panicked.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
            pending,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        *self.pending.count.lock() += 1;
        if sender.send(Box::new(job)).is_err() {
            let _ = Completion(&self.pending);
        }
    }

    /// Blocks until every submitted job has finished
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Number of jobs that panicked since the last call
    pub fn take_panicked(&self) -> usize {
        self.pending.panicked.swap(0, Ordering::SeqCst)
    }

    /// Lets queued jobs drain, then joins every worker
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_runs_every_job_before_idle() {
        let pool = WorkerPool::new(4, "test-copy").unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let done = Arc::clone(&done);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 32);
        pool.shutdown();
    }

    #[test]
    fn test_threads_are_named() {
        let pool = WorkerPool::new(2, "aero-copy").unwrap();
        let names = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let names = Arc::clone(&names);
            pool.execute(move || {
                let name = thread::current().name().unwrap_or("").to_string();
                names.lock().push(name);
            });
        }
        pool.wait_idle();
        assert!(names.lock().iter().all(|n| n.starts_with("aero-copy-")));
        assert_eq!(pool.threads(), 2);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::new(1, "test-panic").unwrap();
        pool.execute(|| panic!("boom"));
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.take_panicked(), 1);
        assert_eq!(pool.take_panicked(), 0);
    }
}
