//! Jobs and the shared job queue.

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};

/// Completion callback for a job. Runs on the dispatcher thread that served it.
pub type Callback<Resp> = Box<dyn FnOnce(Result<Resp>) + Send + 'static>;

/// A payload plus an optional completion callback.
///
/// A job whose callback has not run by the time it is dropped reports
/// [`Error::ShutDown`] to that callback. That happens when a dispatcher pops
/// it after shutdown, or when the queue is torn down with the job in it.
pub struct Job<Req, Resp> {
    payload: Req,
    callback: Option<Callback<Resp>>,
}

impl<Req, Resp> Job<Req, Resp> {
    /// Fire-and-forget job.
    pub fn new(payload: Req) -> Self {
        Self {
            payload,
            callback: None,
        }
    }

    /// Job whose result is delivered to `callback`.
    pub fn with_callback(
        payload: Req,
        callback: impl FnOnce(Result<Resp>) + Send + 'static,
    ) -> Self {
        Self {
            payload,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn payload(&self) -> &Req {
        &self.payload
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Drop the callback without running it.
    pub(crate) fn disarm(&mut self) {
        self.callback = None;
    }

    /// Deliver the result, consuming the job.
    ///
    /// A panicking callback is logged and swallowed so the dispatcher that
    /// runs it keeps serving.
    pub fn finish(mut self, result: Result<Resp>) {
        if let Some(callback) = self.callback.take() {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || callback(result)));
            if let Err(e) = outcome {
                tracing::error!("Job callback panicked: {:?}", e);
            }
        }
    }
}

impl<Req, Resp> Drop for Job<Req, Resp> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                callback(Err(Error::ShutDown))
            }));
        }
    }
}

/// Unbounded FIFO queue shared by all submitters and all dispatchers.
///
/// Each job is received by exactly one consumer.
pub struct JobQueue<Req, Resp> {
    tx: Sender<Job<Req, Resp>>,
    rx: Receiver<Job<Req, Resp>>,
}

impl<Req, Resp> JobQueue<Req, Resp> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Enqueue a job without blocking.
    pub fn push(&self, job: Job<Req, Resp>) -> Result<()> {
        self.tx.send(job).map_err(|_| Error::ShutDown)
    }

    /// Handle for enqueueing from other threads.
    pub fn sender(&self) -> Sender<Job<Req, Resp>> {
        self.tx.clone()
    }

    /// Handle for a dispatcher to pop jobs with.
    pub fn consumer(&self) -> Receiver<Job<Req, Resp>> {
        self.rx.clone()
    }

    /// Jobs waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<Req, Resp> Default for JobQueue<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}
