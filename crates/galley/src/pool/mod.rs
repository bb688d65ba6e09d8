//! The worker pool.
//!
//! A [`Pool`] owns a shared job queue and a growable set of workers. Each
//! worker is an OS process paired with a dedicated dispatcher thread that
//! pops jobs from the queue and runs one synchronous round trip at a time.
//!
//! ```text
//!   submit ──► JobQueue ──► dispatcher 0 ◄──socket──► worker process 0
//!                      ├──► dispatcher 1 ◄──socket──► worker process 1
//!                      └──► dispatcher N ◄──socket──► worker process N
//! ```
//!
//! A worker whose connection fails (typically because its handler panicked)
//! is marked [`WorkerStatus::Lost`]: the job it was serving completes with
//! [`Error::WorkerLost`], its dispatcher stops taking jobs, and nothing is
//! restarted. Jobs still queued wait for the remaining workers, or for
//! workers added later with [`Pool::spawn`].

mod config;
mod dispatcher;
mod queue;

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{RecvTimeoutError, Sender};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::ipc::{self, Transport, WorkerProcess};
use crate::signal::Signal;

pub use config::{PoolConfig, WORKER_PATH_ENV, WorkerCommand};
pub use dispatcher::{PoolStats, WorkerStatus};
pub use queue::{Callback, Job, JobQueue};

use dispatcher::{Dispatcher, StatsCounters, Startup, WorkerShared};

/// One spawned worker: its process and its dispatcher thread.
pub struct WorkerHandle {
    id: usize,
    process: WorkerProcess,
    shared: Arc<WorkerShared>,
    dispatcher: JoinHandle<()>,
}

impl WorkerHandle {
    /// Position of this worker in the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Process id, as announced during the handshake.
    pub fn pid(&self) -> u32 {
        self.shared.pid()
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    /// Jobs this worker has answered.
    pub fn jobs_served(&self) -> u64 {
        self.shared.served()
    }

    /// Whether the dispatcher thread has returned.
    pub fn dispatcher_finished(&self) -> bool {
        self.dispatcher.is_finished()
    }

    /// Exit status, if the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.process.exit_status()
    }

    /// Whether the worker can still take jobs.
    pub fn is_live(&self) -> bool {
        self.status() != WorkerStatus::Lost && self.process.exit_status().is_none()
    }

    /// Send `signal` and make one non-blocking reap attempt.
    fn terminate(&mut self, signal: Signal) {
        if let Err(e) = self.process.signal(signal) {
            tracing::debug!("Ignoring failed {} to worker {}: {}", signal, self.pid(), e);
        }
        if let Some(status) = self.process.try_reap() {
            tracing::debug!("Worker {} reaped: {}", self.pid(), status);
        }
    }
}

/// Cloneable handle for submitting jobs from other threads.
///
/// Submission after [`Pool::shutdown`] fails with [`Error::ShutDown`]. The
/// check is best-effort: a submit racing the shutdown call may still be
/// accepted, in which case its callback receives `Err(ShutDown)` instead.
pub struct Submitter<Req, Resp> {
    tx: Sender<Job<Req, Resp>>,
    shut_down: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
}

impl<Req, Resp> Clone for Submitter<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shut_down: self.shut_down.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<Req, Resp> Submitter<Req, Resp> {
    /// Enqueue a job without a callback.
    pub fn submit(&self, payload: Req) -> Result<()> {
        self.enqueue(Job::new(payload))
    }

    /// Enqueue a job; `callback` runs on a dispatcher thread with the result.
    pub fn submit_with(
        &self,
        payload: Req,
        callback: impl FnOnce(Result<Resp>) + Send + 'static,
    ) -> Result<()> {
        self.enqueue(Job::with_callback(payload, callback))
    }

    fn enqueue(&self, mut job: Job<Req, Resp>) -> Result<()> {
        // A rejected job reports through the returned error, not its callback.
        if self.shut_down.load(Ordering::Acquire) {
            job.disarm();
            return Err(Error::ShutDown);
        }
        self.tx.send(job).map_err(|e| {
            let mut job = e.into_inner();
            job.disarm();
            Error::ShutDown
        })?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A pool of isolated worker processes.
///
/// `Req` is the job payload type, `Resp` the result type, and `C` the codec
/// both sides of every worker connection use.
pub struct Pool<Req, Resp, C: Codec> {
    config: PoolConfig,
    codec: Arc<C>,
    queue: JobQueue<Req, Resp>,
    workers: Vec<WorkerHandle>,
    stats: Arc<StatsCounters>,
    shut_down: Arc<AtomicBool>,
}

impl<Req, Resp, C> Pool<Req, Resp, C>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
    C: Codec,
{
    /// Create a pool, spawning `config.worker_count` workers if set.
    pub fn new(config: PoolConfig, codec: C) -> Result<Self> {
        let initial = config.worker_count;
        let mut pool = Self {
            config,
            codec: Arc::new(codec),
            queue: JobQueue::new(),
            workers: Vec::new(),
            stats: Arc::new(StatsCounters::default()),
            shut_down: Arc::new(AtomicBool::new(false)),
        };
        if let Some(count) = initial {
            pool.spawn(count)?;
        }
        Ok(pool)
    }

    /// Add `n` workers, returning once every one of them has announced
    /// readiness.
    ///
    /// On error, workers spawned earlier in the same call stay in the pool.
    pub fn spawn(&mut self, n: usize) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        for _ in 0..n {
            self.spawn_one()?;
        }
        tracing::info!("Pool has {} workers ({} live)", self.len(), self.live_workers());
        Ok(())
    }

    fn spawn_one(&mut self) -> Result<()> {
        let id = self.workers.len();
        let (mut process, stream) = ipc::launch(&self.config.worker)?;

        let transport = match Transport::new(stream, self.codec.clone()) {
            Ok(t) => t.with_max_frame_len(self.config.max_frame_len),
            Err(e) => {
                process.abandon();
                return Err(e);
            }
        };

        let shared = Arc::new(WorkerShared::default());
        let dispatcher = Dispatcher {
            id,
            expected_pid: process.pid(),
            transport,
            jobs: self.queue.consumer(),
            shared: shared.clone(),
            stats: self.stats.clone(),
            shut_down: self.shut_down.clone(),
        };

        let (startup_tx, startup_rx) = crossbeam_channel::bounded(2);
        let thread = match dispatcher.start(startup_tx) {
            Ok(thread) => thread,
            Err(e) => {
                process.abandon();
                return Err(e);
            }
        };

        let timeout = self.config.handshake_timeout;
        let recv = || match timeout {
            Some(timeout) => startup_rx.recv_timeout(timeout),
            None => startup_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        // First the thread, then the process.
        let ready = match recv() {
            Ok(Startup::Launched) => recv(),
            other => other,
        };

        match ready {
            Ok(Startup::Ready(pid)) => {
                tracing::debug!("Worker {} ready with pid {}", id, pid);
                self.workers.push(WorkerHandle {
                    id,
                    process,
                    shared,
                    dispatcher: thread,
                });
                Ok(())
            }
            Ok(Startup::Failed(e)) => {
                process.abandon();
                Err(e)
            }
            Ok(Startup::Launched) => {
                process.abandon();
                Err(Error::Handshake("Dispatcher reported launch twice".to_string()))
            }
            Err(RecvTimeoutError::Timeout) => {
                // Killing the process unblocks the dispatcher's read.
                process.abandon();
                Err(Error::Handshake(format!(
                    "Worker {} did not announce readiness within {:?}",
                    process.pid(),
                    timeout.unwrap_or_default()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                process.abandon();
                Err(Error::Handshake(
                    "Dispatcher exited before the worker was ready".to_string(),
                ))
            }
        }
    }

    /// Enqueue a job without a callback. Never blocks.
    ///
    /// Rejection after shutdown is best-effort; see [`Submitter`].
    pub fn submit(&self, payload: Req) -> Result<()> {
        self.submitter().submit(payload)
    }

    /// Enqueue a job; `callback` runs on a dispatcher thread with the result.
    /// Never blocks.
    pub fn submit_with(
        &self,
        payload: Req,
        callback: impl FnOnce(Result<Resp>) + Send + 'static,
    ) -> Result<()> {
        self.submitter().submit_with(payload, callback)
    }

    /// Submit a job and block until its result arrives.
    ///
    /// Blocks indefinitely if no live worker ever picks the job up.
    pub fn run(&self, payload: Req) -> Result<Resp> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit_with(payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().map_err(|_| Error::ShutDown)?
    }

    /// Handle for submitting from other threads.
    pub fn submitter(&self) -> Submitter<Req, Resp> {
        Submitter {
            tx: self.queue.sender(),
            shut_down: self.shut_down.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<Req, Resp, C: Codec> Pool<Req, Resp, C> {
    /// Signal every worker with the configured shutdown signal.
    pub fn shutdown(&mut self) {
        self.shutdown_with(self.config.shutdown_signal);
    }

    /// Send `signal` to every worker and attempt a non-blocking reap.
    ///
    /// Delivery failures are ignored. Dispatcher threads are not joined and
    /// queued jobs are not drained. Further submissions fail with
    /// [`Error::ShutDown`].
    ///
    /// A job already sent to a worker completes with [`Error::WorkerLost`]
    /// once the signal takes the worker down. Jobs a dispatcher pops from
    /// now on are not sent; they, and jobs still queued when the pool is
    /// dropped, complete with [`Error::ShutDown`].
    pub fn shutdown_with(&mut self, signal: Signal) {
        self.shut_down.store(true, Ordering::Release);
        for worker in &mut self.workers {
            worker.terminate(signal);
        }
        tracing::info!("Sent {} to {} workers", signal, self.workers.len());
    }

    /// Reap exited workers without blocking. Returns how many have exited.
    pub fn reap(&mut self) -> usize {
        self.workers
            .iter_mut()
            .filter_map(|w| w.process.try_reap())
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Workers in spawn order.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Process ids of all spawned workers.
    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().map(WorkerHandle::pid).collect()
    }

    /// Number of spawned workers, live or not.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers still able to take jobs.
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_live()).count()
    }

    /// Jobs waiting for a dispatcher.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

impl<Req, Resp, C: Codec> Drop for Pool<Req, Resp, C> {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.shutdown();
        }
    }
}
