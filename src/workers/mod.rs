//! Dedicated worker threads for the timed blanking and tilting activities.
//!
//! A device connection is bound to the thread that opened it, so each worker
//! runs on its own OS thread with a single-threaded tokio runtime and opens its
//! own connection there. The coordinator talks to its workers through:
//!
//! - the per-step [`SyncBarriers`](crate::sync::SyncBarriers) (ordering),
//! - a [`ShutdownSignal`] (early stop),
//! - an unbounded failure channel (so a failed worker wakes the coordinator
//!   out of a barrier wait instead of leaving it blocked),
//! - a oneshot carrying the worker's final result.
//!
//! Teardown is deterministic: signal (abort path only), join each worker in a
//! fixed order with a timeout, and detach any worker that misses the deadline.

pub mod blanking;
pub mod tilting;

pub use blanking::{run_blanking, BlankingPlan, BlankingStep};
pub use tilting::{run_tilting, TiltPlan, TiltStep};

use crate::error::{DaqError, DaqResult};
use crate::hardware::DeviceConnector;
use crate::sync::{ShutdownListener, ShutdownSignal, SyncBarriers};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Failure reported by a worker thread as soon as it happens.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    /// Worker name
    pub worker: &'static str,
    /// What went wrong
    pub reason: String,
}

impl From<WorkerFailure> for DaqError {
    fn from(failure: WorkerFailure) -> Self {
        DaqError::worker(failure.worker, failure.reason)
    }
}

/// Reports a failure on drop unless the worker delivered a successful result.
///
/// Covers panics and any other way the thread can exit without reaching the
/// end of its body.
struct FailureNotice {
    worker: &'static str,
    failures: mpsc::UnboundedSender<WorkerFailure>,
    armed: bool,
}

impl FailureNotice {
    fn new(worker: &'static str, failures: mpsc::UnboundedSender<WorkerFailure>) -> Self {
        Self {
            worker,
            failures,
            armed: true,
        }
    }

    fn report(&mut self, reason: String) {
        self.armed = false;
        let _ = self.failures.send(WorkerFailure {
            worker: self.worker,
            reason,
        });
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailureNotice {
    fn drop(&mut self) {
        if self.armed {
            let reason = if std::thread::panicking() {
                "panicked"
            } else {
                "exited without reporting a result"
            };
            self.report(reason.to_string());
        }
    }
}

/// Handle to a running worker thread.
pub struct WorkerHandle<R> {
    name: &'static str,
    done: oneshot::Receiver<DaqResult<R>>,
    thread: Option<JoinHandle<()>>,
}

impl<R> std::fmt::Debug for WorkerHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl<R: Send + 'static> WorkerHandle<R> {
    /// Worker name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait up to `timeout` for the worker's result.
    ///
    /// A worker that misses the deadline is detached: its thread keeps running
    /// until it finishes on its own, and a [`DaqError::Worker`] is returned.
    pub async fn join(mut self, timeout: Duration) -> DaqResult<R> {
        match tokio::time::timeout(timeout, &mut self.done).await {
            Ok(Ok(result)) => {
                self.join_thread().await;
                result
            }
            Ok(Err(_)) => {
                let reason = match self.join_thread().await {
                    Some(message) => format!("panicked: {message}"),
                    None => "exited without reporting a result".to_string(),
                };
                Err(DaqError::worker(self.name, reason))
            }
            Err(_) => {
                error!(
                    "{} worker did not stop within {:?}, detaching its thread",
                    self.name, timeout
                );
                self.thread.take();
                Err(DaqError::worker(
                    self.name,
                    format!("did not stop within {timeout:?}"),
                ))
            }
        }
    }

    /// Join the OS thread off the async runtime. Returns the panic message, if any.
    async fn join_thread(&mut self) -> Option<String> {
        let thread = self.thread.take()?;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => None,
            Ok(Err(payload)) => Some(panic_message(payload.as_ref())),
            Err(e) => {
                warn!("Failed to join {} worker thread: {}", self.name, e);
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Spawn `body` on a dedicated thread with its own runtime and device connection.
///
/// The connection is opened on the worker thread and never leaves it, so
/// neither the connection nor the future produced by `body` has to be `Send`.
pub fn spawn_worker<C, F, Fut, R>(
    name: &'static str,
    connector: Arc<C>,
    failures: mpsc::UnboundedSender<WorkerFailure>,
    body: F,
) -> DaqResult<WorkerHandle<R>>
where
    C: DeviceConnector,
    F: FnOnce(C::Connection) -> Fut + Send + 'static,
    Fut: Future<Output = DaqResult<R>> + 'static,
    R: Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();

    let thread = std::thread::Builder::new()
        .name(format!("{name}-worker"))
        .spawn(move || {
            let mut notice = FailureNotice::new(name, failures);

            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(DaqError::from)
                .and_then(|runtime| {
                    runtime.block_on(async move {
                        let connection = connector.connect()?;
                        debug!("{} worker connected", name);
                        body(connection).await
                    })
                });

            match &result {
                Ok(_) => notice.disarm(),
                Err(e) => notice.report(e.to_string()),
            }
            let _ = done_tx.send(result);
        })?;

    Ok(WorkerHandle {
        name,
        done: done_rx,
        thread: Some(thread),
    })
}

/// Timing reports returned by the workers of one series.
#[derive(Debug, Default)]
pub struct WorkerReports {
    /// Blanking worker report, if it ran
    pub blanking: Option<Vec<BlankingStep>>,
    /// Tilting worker report, if it ran
    pub tilting: Option<Vec<TiltStep>>,
}

/// The workers of one acquisition series plus their control channels.
pub struct WorkerSet {
    barriers: SyncBarriers,
    shutdown: ShutdownSignal,
    failures_tx: mpsc::UnboundedSender<WorkerFailure>,
    failures: mpsc::UnboundedReceiver<WorkerFailure>,
    blanking: Option<WorkerHandle<Vec<BlankingStep>>>,
    tilting: Option<WorkerHandle<Vec<TiltStep>>>,
}

impl WorkerSet {
    /// Empty set sharing `barriers`. Workers are added with the `spawn_*` methods.
    pub fn new(barriers: SyncBarriers) -> Self {
        let (failures_tx, failures) = mpsc::unbounded_channel();
        Self {
            barriers,
            shutdown: ShutdownSignal::new(),
            failures_tx,
            failures,
            blanking: None,
            tilting: None,
        }
    }

    fn listener(&self) -> ShutdownListener {
        self.shutdown.subscribe()
    }

    /// Start the blanking worker.
    pub fn spawn_blanking<C: DeviceConnector>(
        &mut self,
        connector: Arc<C>,
        plan: BlankingPlan,
    ) -> DaqResult<()> {
        let barriers = self.barriers.clone();
        let shutdown = self.listener();
        let handle = spawn_worker(
            "blanking",
            connector,
            self.failures_tx.clone(),
            move |connection| async move {
                run_blanking(&connection, &plan, &barriers, shutdown).await
            },
        )?;
        self.blanking = Some(handle);
        Ok(())
    }

    /// Start the tilting worker.
    pub fn spawn_tilting<C: DeviceConnector>(
        &mut self,
        connector: Arc<C>,
        plan: TiltPlan,
    ) -> DaqResult<()> {
        let barriers = self.barriers.clone();
        let shutdown = self.listener();
        let handle = spawn_worker(
            "tilting",
            connector,
            self.failures_tx.clone(),
            move |connection| async move {
                run_tilting(&connection, &plan, &barriers, shutdown).await
            },
        )?;
        self.tilting = Some(handle);
        Ok(())
    }

    /// Rendezvous at the barrier for `step`, unless a worker fails first.
    pub async fn wait_at(&mut self, step: usize) -> DaqResult<()> {
        tokio::select! {
            released = self.barriers.wait(step) => released.ok_or_else(|| {
                DaqError::worker("coordinator", format!("no barrier for step {step}"))
            }),
            Some(failure) = self.failures.recv() => Err(failure.into()),
        }
    }

    /// Join after a successful series. Workers are not signalled.
    pub async fn finish(self, timeout: Duration) -> DaqResult<WorkerReports> {
        self.join_all(timeout).await
    }

    /// Signal every worker to stop, then join.
    pub async fn abort(self, timeout: Duration) -> DaqResult<WorkerReports> {
        self.shutdown.trigger();
        self.join_all(timeout).await
    }

    async fn join_all(self, timeout: Duration) -> DaqResult<WorkerReports> {
        let mut first_error = None;
        let mut reports = WorkerReports::default();

        if let Some(handle) = self.blanking {
            match handle.join(timeout).await {
                Ok(steps) => reports.blanking = Some(steps),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        if let Some(handle) = self.tilting {
            match handle.join(timeout).await {
                Ok(steps) => reports.tilting = Some(steps),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMicroscope;

    #[tokio::test]
    async fn test_worker_result_is_delivered() {
        let mock = Arc::new(MockMicroscope::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = spawn_worker("probe", mock.clone(), tx, |_connection| async { Ok(42) })
            .unwrap();
        assert_eq!(handle.join(Duration::from_secs(5)).await.unwrap(), 42);
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_worker_error_is_reported_on_failure_channel() {
        let mock = Arc::new(MockMicroscope::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_worker::<_, _, _, ()>("probe", mock, tx, |_connection| async {
            Err(DaqError::Device("stage fault".to_string()))
        })
        .unwrap();

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.worker, "probe");
        assert!(failure.reason.contains("stage fault"));
        assert!(matches!(
            handle.join(Duration::from_secs(5)).await,
            Err(DaqError::Device(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_worker_error() {
        let mock = Arc::new(MockMicroscope::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_worker::<_, _, _, ()>("probe", mock, tx, |_connection| async {
            panic!("boom");
        })
        .unwrap();

        assert_eq!(rx.recv().await.unwrap().reason, "panicked");
        let err = handle.join(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DaqError::Worker { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_worker_missing_deadline_is_detached() {
        let mock = Arc::new(MockMicroscope::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = spawn_worker("slow", mock, tx, |_connection| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .unwrap();

        let started = std::time::Instant::now();
        let err = handle.join(Duration::from_millis(50)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(err.to_string().contains("did not stop"));
    }
}
