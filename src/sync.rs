//! Timing primitives shared by the coordinator and its workers.
//!
//! - [`SyncBarriers`]: one N-party rendezvous per acquisition step. Parties only
//!   ever wait at barrier `i` while working on step `i`, so a slow party can never
//!   be overtaken by a fast one across steps.
//! - [`ShutdownSignal`] / [`ShutdownListener`]: a broadcast used to tell workers
//!   to stop early. Workers check it between hardware calls and while sleeping.
//! - [`CancelSource`] / [`CancelToken`]: external cancellation (Ctrl-C) of a whole
//!   procedure. Unlike the shutdown broadcast, a token observes a cancellation
//!   that happened before it started waiting.
//!
//! Barriers are `tokio::sync::Barrier`, which is runtime-agnostic: the
//! coordinator and each worker run on their own single-threaded runtime and
//! still rendezvous through the same barrier.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Barrier};

/// Per-step rendezvous barriers for one acquisition series.
#[derive(Clone)]
pub struct SyncBarriers {
    barriers: Arc<[Barrier]>,
    parties: usize,
}

impl SyncBarriers {
    /// Create `steps` barriers, each releasing once `parties` tasks have arrived.
    pub fn new(steps: usize, parties: usize) -> Self {
        let barriers: Vec<Barrier> = (0..steps).map(|_| Barrier::new(parties)).collect();
        Self {
            barriers: barriers.into(),
            parties,
        }
    }

    /// Number of parties per barrier.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    /// True when there are no steps.
    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    /// Wait at the barrier for `step`. Returns `None` if `step` is out of range.
    pub async fn wait(&self, step: usize) -> Option<()> {
        self.barriers.get(step)?.wait().await;
        Some(())
    }
}

impl std::fmt::Debug for SyncBarriers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBarriers")
            .field("steps", &self.barriers.len())
            .field("parties", &self.parties)
            .finish()
    }
}

/// Sender half of the worker shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// New, untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Create a listener. Listeners created after [`trigger`](Self::trigger) miss it.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
            fired: false,
        }
    }

    /// Tell every listener to stop.
    pub fn trigger(&self) {
        // No receivers simply means every worker already exited
        let _ = self.tx.send(());
    }
}

/// Receiver half of the worker shutdown broadcast.
#[derive(Debug)]
pub struct ShutdownListener {
    rx: broadcast::Receiver<()>,
    fired: bool,
}

impl ShutdownListener {
    /// Resolves once shutdown is requested (or the signal is dropped).
    pub async fn triggered(&mut self) {
        if self.fired {
            return;
        }
        // Both a message and a closed/lagged channel mean "stop"
        let _ = self.rx.recv().await;
        self.fired = true;
    }

    /// Non-blocking check.
    pub fn is_triggered(&mut self) -> bool {
        if !self.fired {
            self.fired = !matches!(self.rx.try_recv(), Err(broadcast::error::TryRecvError::Empty));
        }
        self.fired
    }

    /// Sleep for `duration`. Returns `false` if shutdown interrupted the sleep.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

/// Trigger side of an external cancellation.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    /// New, not yet cancelled.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancel every token, including ones created later.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observer side of an external cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the source is dropped uncancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|&cancelled| cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_barrier_releases_all_parties() {
        let barriers = SyncBarriers::new(2, 2);
        let other = barriers.clone();

        let handle = tokio::spawn(async move {
            other.wait(0).await;
            other.wait(1).await;
        });

        assert_eq!(barriers.wait(0).await, Some(()));
        assert_eq!(barriers.wait(1).await, Some(()));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_barrier_out_of_range() {
        let barriers = SyncBarriers::new(1, 1);
        assert_eq!(barriers.wait(1).await, None);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers.parties(), 1);
    }

    #[tokio::test]
    async fn test_barrier_works_across_runtimes() {
        let barriers = SyncBarriers::new(1, 2);
        let other = barriers.clone();

        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(other.wait(0))
        });

        assert_eq!(barriers.wait(0).await, Some(()));
        assert_eq!(thread.join().unwrap(), Some(()));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        assert!(!listener.is_triggered());

        let started = Instant::now();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        assert!(!listener.sleep(Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(listener.is_triggered());
    }

    #[tokio::test]
    async fn test_cancel_token_sees_earlier_cancel() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(source.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_stays_pending() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), token.cancelled())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_sleep_completes_without_signal() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        assert!(listener.sleep(Duration::from_millis(5)).await);
    }
}
