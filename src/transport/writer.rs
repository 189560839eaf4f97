use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A queued send operation.
pub(crate) struct WriteJob(
    pub Box<dyn (FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>) + Send>,
);

/// Producer side of the write queue. Cheap to clone; pushes never block.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    jobs_tx: mpsc::Sender<WriteJob>,
}

impl WriterHandle {
    /// Enqueues a send operation. Fails with [`Error::ErrWriteQueueFull`]
    /// when the queue is full, without enqueueing.
    pub fn push(&self, job: WriteJob) -> Result<()> {
        self.jobs_tx
            .try_send(job)
            .map_err(|_| Error::ErrWriteQueueFull)
    }
}

/// The asynchronous write processor of a session: a bounded queue of send
/// operations drained by a dedicated task.
///
/// Jobs can be enqueued as soon as the writer exists; they are executed only
/// after [`Writer::start`], so a response can be committed to the wire
/// before the first stream packet.
pub(crate) struct Writer {
    handle: WriterHandle,
    jobs_rx: Option<mpsc::Receiver<WriteJob>>,
    error_tx: mpsc::Sender<Error>,
    close_tx: mpsc::Sender<()>,
    close_rx: Option<mpsc::Receiver<()>>,
}

impl Writer {
    pub fn new(queue_size: usize) -> (Writer, mpsc::Receiver<Error>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(queue_size.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);

        (
            Writer {
                handle: WriterHandle { jobs_tx },
                jobs_rx: Some(jobs_rx),
                error_tx,
                close_tx,
                close_rx: Some(close_rx),
            },
            error_rx,
        )
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Spawns the drain task. May be called at most once.
    pub fn start(&mut self) {
        let mut jobs_rx = match self.jobs_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut close_rx = match self.close_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let error_tx = self.error_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = jobs_rx.recv() => {
                        let job = match job {
                            Some(j) => j,
                            None => break,
                        };
                        if let Err(err) = (job.0)().await {
                            let _ = error_tx.send(err).await;
                            break;
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });
    }

    /// Stops the drain task; queued jobs that have not run yet are dropped.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}
