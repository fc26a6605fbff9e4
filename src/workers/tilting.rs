//! Tilting worker: sweeps the stage across one angular interval per exposure.
//!
//! Before the first step the stage is brought to the first bound if it is not
//! already there. Each step then waits for its barrier, sleeps through the
//! camera's blind interval, and issues one blocking move to the next bound at a
//! speed chosen so the move lasts about one exposure.

use crate::config::TimingConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::{StageSnapshot, TiltStage};
use crate::sync::{ShutdownListener, SyncBarriers};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Per-step parameters, handed to the worker by value.
#[derive(Debug, Clone)]
pub struct TiltPlan {
    /// N+1 tilt bounds in degrees
    pub bounds: Vec<f64>,
    /// N fractional speeds, one per interval
    pub speeds: Vec<f64>,
    /// Wait between barrier release and starting the move
    pub blind_wait: Duration,
    /// How close the stage has to be to `bounds[0]` to skip the initial move
    pub tolerance_deg: f64,
    /// Fractional speed for the initial move
    pub start_speed: f64,
}

impl TiltPlan {
    /// Build a plan from validated bounds and their fractional speeds.
    pub fn new(
        bounds: Vec<f64>,
        speeds: Vec<f64>,
        exposure_time: f64,
        timing: &TimingConfig,
    ) -> DaqResult<Self> {
        if bounds.len() != speeds.len() + 1 {
            return Err(DaqError::validation(
                "tilt_bounds",
                format!(
                    "{} bounds do not describe {} tilt intervals",
                    bounds.len(),
                    speeds.len()
                ),
            ));
        }
        Ok(Self {
            bounds,
            speeds,
            blind_wait: Duration::from_secs_f64(timing.tilt_blind_margin_s + exposure_time),
            tolerance_deg: timing.tilt_tolerance_deg,
            start_speed: timing.start_tilt_speed,
        })
    }

    /// Number of steps.
    pub fn steps(&self) -> usize {
        self.speeds.len()
    }
}

/// Timing of one tilt interval.
#[derive(Debug, Clone, Copy)]
pub struct TiltStep {
    /// Step index
    pub index: usize,
    /// Barrier release
    pub released_at: Instant,
    /// Move issued
    pub started_at: Instant,
    /// Move completed
    pub finished_at: Instant,
    /// Target bound
    pub target: f64,
    /// Stage state after the move
    pub snapshot: StageSnapshot,
}

/// Run the tilting loop. Returns the timing of every completed step.
pub async fn run_tilting<S: TiltStage + ?Sized>(
    stage: &S,
    plan: &TiltPlan,
    barriers: &SyncBarriers,
    mut shutdown: ShutdownListener,
) -> DaqResult<Vec<TiltStep>> {
    let mut steps = Vec::with_capacity(plan.steps());

    if let Some(&start) = plan.bounds.first() {
        let alpha = stage.stage_alpha().await?;
        if (alpha - start).abs() > plan.tolerance_deg {
            info!("Moving stage from {:.3} to start angle {:.3} deg", alpha, start);
            stage.tilt_to(start, plan.start_speed).await?;
        }
    }

    for (index, (&target, &speed)) in plan.bounds[1..].iter().zip(&plan.speeds).enumerate() {
        let released = tokio::select! {
            released = barriers.wait(index) => released,
            _ = shutdown.triggered() => {
                debug!("Tilting worker stopped before step {}", index);
                return Ok(steps);
            }
        };
        released.ok_or_else(|| DaqError::worker("tilting", format!("no barrier for step {index}")))?;
        let released_at = Instant::now();

        if !shutdown.sleep(plan.blind_wait).await {
            return Ok(steps);
        }

        let started_at = Instant::now();
        let snapshot = stage.tilt_to(target, speed).await?;
        let finished_at = Instant::now();

        debug!(
            step = index,
            target,
            speed,
            move_ms = (finished_at - started_at).as_millis() as u64,
            "Tilt step complete"
        );
        steps.push(TiltStep {
            index,
            released_at,
            started_at,
            finished_at,
            target,
            snapshot,
        });
    }

    Ok(steps)
}
