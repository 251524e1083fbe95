//! [`Executor`]: a single OS thread running jobs off a FIFO queue, serially.
//!
//! Not the completion engine's own poll thread (see [`crate::poll_loop`]) —
//! this is the "serial executor" component a host scheduler can hand
//! continuation work to when it wants that work to run on one dedicated
//! thread rather than an arbitrary pool thread. Built the same way
//! [`crate::queues::bridge::EventBridge`] is: a plain `Mutex<VecDeque<_>>`
//! plus a `Condvar`, since there is exactly one consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

/// A serial executor: one OS thread, one FIFO job queue.
///
/// Jobs submitted via [`Executor::spawn`] run in submission order, one at a
/// time, on the executor's own thread. Dropping or [`Executor::shutdown`]ing
/// lets every already-queued job finish before the thread exits — a job can
/// never be silently discarded once accepted.
pub struct Executor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Executor {
    /// Spawn the executor's thread.
    pub fn new() -> Executor {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("completion-executor".to_string())
            .spawn(move || run(&worker_shared))
            .expect("failed to spawn the executor thread");

        Executor {
            shared,
            handle: Some(handle),
        }
    }

    /// Queue `job` to run on the executor thread. Accepted even if the
    /// executor is mid-shutdown-drain; rejected (job returned) only once the
    /// thread has actually exited.
    pub fn spawn<F>(&self, job: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(job);
        }
        state.jobs.push_back(Box::new(job));
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Stop accepting new jobs, let every already-queued job run, then join
    /// the thread. Idempotent.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.ready.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Executor {
    fn default() -> Executor {
        Executor::new()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                state = shared.ready.wait(state).unwrap();
            }
        };
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

/// A fixed-size pool of [`Executor`]s, assigning submitted jobs round-robin.
/// Mirrors the "fixed-size pool variant assigns executors round-robin"
/// clause: each member is still a fully serial executor on its own thread,
/// the pool only load-balances which member a given job lands on.
pub struct ExecutorPool {
    members: Vec<Executor>,
    next: std::sync::atomic::AtomicUsize,
}

impl ExecutorPool {
    /// Spawn `size` executor threads. Panics if `size == 0`.
    pub fn new(size: usize) -> ExecutorPool {
        assert!(size > 0, "an executor pool needs at least one member");
        ExecutorPool {
            members: (0..size).map(|_| Executor::new()).collect(),
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Queue `job` on the next executor in round-robin order.
    pub fn spawn<F>(&self, job: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.members.len();
        self.members[idx].spawn(job)
    }

    /// Shut down every member, joining each thread in turn.
    pub fn shutdown(&mut self) {
        for member in &mut self.members {
            member.shutdown();
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn jobs_run_in_submission_order() {
        let mut exec = Executor::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            exec.spawn(move || tx.send(i).unwrap()).unwrap();
        }
        drop(tx);
        let received: Vec<_> = rx.iter().collect();
        assert_eq!(received, (0..8).collect::<Vec<_>>());
        exec.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_jobs_before_exiting() {
        let mut exec = Executor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let ran = Arc::clone(&ran);
            exec.spawn(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        exec.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn spawn_after_shutdown_returns_the_job_back() {
        let mut exec = Executor::new();
        exec.shutdown();
        let result = exec.spawn(|| {});
        assert!(result.is_err());
    }

    #[test]
    fn pool_distributes_jobs_round_robin_across_members() {
        let mut pool = ExecutorPool::new(4);
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap()).unwrap();
        }
        drop(tx);
        let mut received: Vec<_> = rx.iter().collect();
        received.sort_unstable();
        assert_eq!(received, (0..16).collect::<Vec<_>>());
        pool.shutdown();
    }
}
