//! Per-worker dispatcher threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::ipc::Transport;

use super::queue::Job;

/// State of a spawned worker.
///
/// A worker joins the pool only after its readiness handshake, so it starts
/// out `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Idle, waiting for a job.
    Ready,
    /// A job is in flight.
    Busy,
    /// The connection failed; the slot no longer takes jobs.
    Lost,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Busy,
            _ => Self::Lost,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Busy => 1,
            Self::Lost => 2,
        }
    }
}

/// State a worker handle shares with its dispatcher.
#[derive(Debug, Default)]
pub(crate) struct WorkerShared {
    status: AtomicU8,
    pid: AtomicU32,
    served: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub(crate) fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

/// Pool-wide job counters.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StatsCounters {
    fn begin(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    fn reject(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn end(&self, ok: bool) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight.load(Ordering::Acquire),
        }
    }
}

/// Snapshot of pool job counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Jobs accepted by `submit`.
    pub submitted: u64,
    /// Round trips that returned a result.
    pub completed: u64,
    /// Jobs that completed with an error: rejected payloads and lost workers.
    pub failed: u64,
    /// Jobs currently sent to a worker and awaiting a reply.
    pub in_flight: usize,
    /// Highest `in_flight` value observed.
    pub peak_in_flight: usize,
}

/// Messages a dispatcher sends while its worker starts up.
pub(crate) enum Startup {
    /// The thread is running. The worker may not be ready yet.
    Launched,
    /// The worker announced this pid.
    Ready(u32),
    /// The handshake failed; the thread has exited.
    Failed(Error),
}

/// Owns the pool side of one worker connection.
pub(crate) struct Dispatcher<Req, Resp, C: Codec> {
    pub(crate) id: usize,
    pub(crate) expected_pid: u32,
    pub(crate) transport: Transport<C>,
    pub(crate) jobs: Receiver<Job<Req, Resp>>,
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) shut_down: Arc<AtomicBool>,
}

impl<Req, Resp, C> Dispatcher<Req, Resp, C>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
    C: Codec,
{
    /// Start the dispatcher thread.
    pub(crate) fn start(self, startup: Sender<Startup>) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("galley-dispatch-{}", self.id))
            .spawn(move || self.run(startup))
            .map_err(|e| Error::Spawn(format!("Failed to start dispatcher thread: {}", e)))
    }

    fn run(mut self, startup: Sender<Startup>) {
        let _ = startup.send(Startup::Launched);

        let pid = match self.handshake() {
            Ok(pid) => pid,
            Err(e) => {
                self.shared.set_status(WorkerStatus::Lost);
                let _ = startup.send(Startup::Failed(e));
                return;
            }
        };
        let _ = startup.send(Startup::Ready(pid));
        drop(startup);

        while let Ok(job) = self.jobs.recv() {
            // The worker has been signalled; dropping the job reports ShutDown.
            if self.shut_down.load(Ordering::Acquire) {
                drop(job);
                break;
            }
            if !self.dispatch(pid, job) {
                break;
            }
        }

        tracing::debug!("Dispatcher {} for worker {} exiting", self.id, pid);
    }

    fn handshake(&mut self) -> Result<u32> {
        let pid = self.transport.await_announcement()?;
        if pid != self.expected_pid {
            return Err(Error::Handshake(format!(
                "Worker announced pid {} but process {} was launched",
                pid, self.expected_pid
            )));
        }
        self.shared.pid.store(pid, Ordering::Release);
        Ok(pid)
    }

    /// One synchronous round trip. Returns `false` once the worker is lost.
    ///
    /// A payload the codec cannot encode, or one too large for a frame, fails
    /// only its own job: nothing has been written, so the worker stays usable.
    fn dispatch(&mut self, pid: u32, job: Job<Req, Resp>) -> bool {
        let body = match self.transport.encode(job.payload()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Job for worker {} rejected before sending: {}", pid, e);
                self.stats.reject();
                job.finish(Err(e));
                return true;
            }
        };

        self.shared.set_status(WorkerStatus::Busy);
        self.stats.begin();
        let result = self
            .transport
            .send_encoded(&body)
            .and_then(|()| self.transport.receive::<Resp>());
        self.stats.end(result.is_ok());

        match result {
            Ok(response) => {
                self.shared.served.fetch_add(1, Ordering::Relaxed);
                self.shared.set_status(WorkerStatus::Ready);
                job.finish(Ok(response));
                true
            }
            Err(e) => {
                self.shared.set_status(WorkerStatus::Lost);
                tracing::warn!("Worker {} lost during round trip: {}", pid, e);
                job.finish(Err(Error::WorkerLost {
                    pid,
                    message: e.to_string(),
                }));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::pool::queue::JobQueue;
    use crate::serve;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn dispatcher_with_thread_worker<F>(
        queue: &JobQueue<u32, u32>,
        handler: F,
    ) -> (Arc<WorkerShared>, Arc<StatsCounters>, Receiver<Startup>)
    where
        F: FnMut(u32) -> u32 + Send + 'static,
    {
        let (parent, child) = UnixStream::pair().unwrap();
        thread::spawn(move || serve(child, JsonCodec, handler));

        let shared = Arc::new(WorkerShared::default());
        let stats = Arc::new(StatsCounters::default());
        let dispatcher = Dispatcher {
            id: 0,
            expected_pid: std::process::id(),
            transport: Transport::new(parent, Arc::new(JsonCodec)).unwrap(),
            jobs: queue.consumer(),
            shared: shared.clone(),
            stats: stats.clone(),
            shut_down: Arc::new(AtomicBool::new(false)),
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        dispatcher.start(tx).unwrap();
        (shared, stats, rx)
    }

    #[test]
    fn test_two_phase_startup() {
        let queue = JobQueue::new();
        let (shared, _stats, startup) = dispatcher_with_thread_worker(&queue, |n| n);

        assert!(matches!(startup.recv().unwrap(), Startup::Launched));
        match startup.recv().unwrap() {
            Startup::Ready(pid) => assert_eq!(pid, std::process::id()),
            _ => panic!("Expected Ready"),
        }
        assert_eq!(shared.status(), WorkerStatus::Ready);
        assert_eq!(shared.pid(), std::process::id());
    }

    #[test]
    fn test_dispatches_jobs_and_runs_callbacks() {
        let queue = JobQueue::new();
        let (shared, stats, startup) = dispatcher_with_thread_worker(&queue, |n| n * 10);
        while let Ok(msg) = startup.recv() {
            if matches!(msg, Startup::Ready(_)) {
                break;
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..5u32 {
            let tx = tx.clone();
            queue
                .push(Job::with_callback(i, move |r| tx.send(r.unwrap()).unwrap()))
                .unwrap();
        }

        let mut results: Vec<u32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        results.sort();
        assert_eq!(results, vec![0, 10, 20, 30, 40]);
        assert_eq!(shared.served(), 5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 5);
        assert_eq!(snapshot.peak_in_flight, 1);
    }

    #[test]
    fn test_handshake_pid_mismatch() {
        let (parent, child) = UnixStream::pair().unwrap();
        thread::spawn(move || serve(child, JsonCodec, |n: u32| n));

        let queue: JobQueue<u32, u32> = JobQueue::new();
        let shared = Arc::new(WorkerShared::default());
        let dispatcher = Dispatcher {
            id: 0,
            expected_pid: std::process::id().wrapping_add(1),
            transport: Transport::new(parent, Arc::new(JsonCodec)).unwrap(),
            jobs: queue.consumer(),
            shared: shared.clone(),
            stats: Arc::new(StatsCounters::default()),
            shut_down: Arc::new(AtomicBool::new(false)),
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = dispatcher.start(tx).unwrap();

        assert!(matches!(rx.recv().unwrap(), Startup::Launched));
        assert!(matches!(
            rx.recv().unwrap(),
            Startup::Failed(Error::Handshake(_))
        ));
        handle.join().unwrap();
        assert_eq!(shared.status(), WorkerStatus::Lost);
    }

    #[test]
    fn test_lost_worker_fails_job_and_stops() {
        let (parent, child) = UnixStream::pair().unwrap();
        // Announce, then vanish without answering.
        thread::spawn(move || {
            let mut transport = Transport::new(child, Arc::new(JsonCodec)).unwrap();
            transport.announce(std::process::id()).unwrap();
            let _job: u32 = transport.receive().unwrap();
        });

        let queue: JobQueue<u32, u32> = JobQueue::new();
        let shared = Arc::new(WorkerShared::default());
        let stats = Arc::new(StatsCounters::default());
        let dispatcher = Dispatcher {
            id: 0,
            expected_pid: std::process::id(),
            transport: Transport::new(parent, Arc::new(JsonCodec)).unwrap(),
            jobs: queue.consumer(),
            shared: shared.clone(),
            stats: stats.clone(),
            shut_down: Arc::new(AtomicBool::new(false)),
        };
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = dispatcher.start(tx).unwrap();

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        queue
            .push(Job::with_callback(1, move |r| done_tx.send(r).unwrap()))
            .unwrap();

        let err = done_rx.recv().unwrap().unwrap_err();
        assert!(matches!(err, Error::WorkerLost { .. }));
        handle.join().unwrap();
        assert_eq!(shared.status(), WorkerStatus::Lost);
        assert_eq!(stats.snapshot().failed, 1);
        assert_eq!(stats.snapshot().in_flight, 0);
    }

    #[test]
    fn test_unencodable_job_fails_alone() {
        use std::collections::HashMap;

        let (parent, child) = UnixStream::pair().unwrap();
        thread::spawn(move || serve(child, JsonCodec, |m: HashMap<String, u32>| m.len()));

        let queue: JobQueue<HashMap<Vec<u8>, u32>, usize> = JobQueue::new();
        let shared = Arc::new(WorkerShared::default());
        let stats = Arc::new(StatsCounters::default());
        let dispatcher = Dispatcher {
            id: 0,
            expected_pid: std::process::id(),
            transport: Transport::new(parent, Arc::new(JsonCodec)).unwrap(),
            jobs: queue.consumer(),
            shared: shared.clone(),
            stats: stats.clone(),
            shut_down: Arc::new(AtomicBool::new(false)),
        };
        let (tx, _rx) = crossbeam_channel::unbounded();
        dispatcher.start(tx).unwrap();

        // JSON object keys must be strings.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let first = done_tx.clone();
        queue
            .push(Job::with_callback(bad, move |r| first.send(r).unwrap()))
            .unwrap();
        queue
            .push(Job::with_callback(HashMap::new(), move |r| {
                done_tx.send(r).unwrap()
            }))
            .unwrap();

        let err = done_rx.recv().unwrap().unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(done_rx.recv().unwrap().unwrap(), 0);

        assert_eq!(shared.status(), WorkerStatus::Ready);
        assert_eq!(shared.served(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.completed, 1);
    }

    #[test]
    fn test_jobs_popped_after_shutdown_are_not_sent() {
        let (parent, child) = UnixStream::pair().unwrap();
        thread::spawn(move || serve(child, JsonCodec, |n: u32| n));

        let queue: JobQueue<u32, u32> = JobQueue::new();
        let shared = Arc::new(WorkerShared::default());
        let shut_down = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            id: 0,
            expected_pid: std::process::id(),
            transport: Transport::new(parent, Arc::new(JsonCodec)).unwrap(),
            jobs: queue.consumer(),
            shared: shared.clone(),
            stats: Arc::new(StatsCounters::default()),
            shut_down: shut_down.clone(),
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = dispatcher.start(tx).unwrap();
        while let Ok(msg) = rx.recv() {
            if matches!(msg, Startup::Ready(_)) {
                break;
            }
        }

        shut_down.store(true, Ordering::Release);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        queue
            .push(Job::with_callback(1, move |r| done_tx.send(r).unwrap()))
            .unwrap();

        assert!(matches!(done_rx.recv().unwrap(), Err(Error::ShutDown)));
        handle.join().unwrap();
        assert_eq!(shared.served(), 0);
    }
}
