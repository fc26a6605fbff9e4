//! Blanking worker: keeps the beam blanked except while the camera records.
//!
//! After each barrier release the camera spends one command latency plus one
//! exposure interval blind, then records for one exposure interval. The worker
//! sleeps through the blind part, unblanks, holds for the recording interval
//! plus a small margin, and blanks again.

use crate::config::TimingConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::BeamBlanker;
use crate::sync::{ShutdownListener, SyncBarriers};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-step parameters, handed to the worker by value.
#[derive(Debug, Clone)]
pub struct BlankingPlan {
    /// Number of steps (acquisitions)
    pub steps: usize,
    /// Wait between barrier release and unblanking
    pub blind_wait: Duration,
    /// How long the beam stays unblanked
    pub unblanked_for: Duration,
}

impl BlankingPlan {
    /// Plan for `steps` acquisitions of `exposure_time` seconds each.
    pub fn new(steps: usize, exposure_time: f64, timing: &TimingConfig) -> Self {
        Self {
            steps,
            blind_wait: Duration::from_secs_f64(timing.blanker_blind_margin_s + exposure_time),
            unblanked_for: Duration::from_secs_f64(
                exposure_time + timing.blanker_recording_margin_s,
            ),
        }
    }
}

/// Timing of one blanking cycle.
#[derive(Debug, Clone, Copy)]
pub struct BlankingStep {
    /// Step index
    pub index: usize,
    /// Barrier release
    pub released_at: Instant,
    /// Unblank command returned
    pub unblanked_at: Instant,
    /// Blank command returned
    pub blanked_at: Instant,
}

/// Run the blanking loop. Returns the timing of every completed step.
///
/// On shutdown the worker stops early and leaves the beam blanked.
pub async fn run_blanking<B: BeamBlanker + ?Sized>(
    blanker: &B,
    plan: &BlankingPlan,
    barriers: &SyncBarriers,
    mut shutdown: ShutdownListener,
) -> DaqResult<Vec<BlankingStep>> {
    let mut steps = Vec::with_capacity(plan.steps);

    for index in 0..plan.steps {
        let released = tokio::select! {
            released = barriers.wait(index) => released,
            _ = shutdown.triggered() => {
                debug!("Blanking worker stopped before step {}", index);
                return Ok(steps);
            }
        };
        released.ok_or_else(|| DaqError::worker("blanking", format!("no barrier for step {index}")))?;
        let released_at = Instant::now();

        if !shutdown.sleep(plan.blind_wait).await {
            return Ok(steps);
        }

        blanker.unblank_beam().await?;
        let unblanked_at = Instant::now();

        if !shutdown.sleep(plan.unblanked_for).await {
            warn!("Blanking worker interrupted with the beam unblanked; re-blanking");
            blanker.blank_beam().await?;
            return Ok(steps);
        }

        blanker.blank_beam().await?;
        let blanked_at = Instant::now();

        debug!(
            step = index,
            unblank_after_ms = (unblanked_at - released_at).as_millis() as u64,
            unblanked_ms = (blanked_at - unblanked_at).as_millis() as u64,
            "Blanking step complete"
        );
        steps.push(BlankingStep {
            index,
            released_at,
            unblanked_at,
            blanked_at,
        });
    }

    Ok(steps)
}
