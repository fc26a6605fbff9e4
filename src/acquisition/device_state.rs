//! Shared instrument flags: beam blanker, column valve, viewing screen.
//!
//! A series starts by recording these flags and forcing the acquisition
//! configuration (beam blanked, valve open, screen retracted). It ends by
//! restoring whatever was recorded, or, after a cancellation, by putting the
//! instrument in a safe configuration instead.

use crate::error::DaqResult;
use crate::hardware::{BeamBlanker, ColumnValve, ScreenPosition, ValvePosition, ViewingScreen};
use tracing::{debug, error};

/// Flags recorded on entry to a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStateSnapshot {
    /// Beam was blanked
    pub beam_blanked: bool,
    /// Column valve position
    pub valve: ValvePosition,
    /// Viewing screen position
    pub screen: ScreenPosition,
}

impl DeviceStateSnapshot {
    /// Read the current flags without changing anything.
    pub async fn capture<D>(device: &D) -> DaqResult<Self>
    where
        D: BeamBlanker + ColumnValve + ViewingScreen + ?Sized,
    {
        Ok(Self {
            beam_blanked: device.beam_is_blank().await?,
            valve: device.column_valve_position().await?,
            screen: device.screen_position().await?,
        })
    }

    /// Force the acquisition configuration: blanked, open, retracted.
    pub async fn prepare<D>(&self, device: &D) -> DaqResult<()>
    where
        D: BeamBlanker + ColumnValve + ViewingScreen + ?Sized,
    {
        if !self.beam_blanked {
            device.blank_beam().await?;
        }
        if self.valve != ValvePosition::Open {
            device.open_column_valve().await?;
        }
        if self.screen != ScreenPosition::Retracted {
            device.retract_screen().await?;
        }
        debug!("Instrument prepared for acquisition (recorded {:?})", self);
        Ok(())
    }

    /// Capture then prepare. Restores the recorded flags if preparing fails.
    pub async fn capture_and_prepare<D>(device: &D) -> DaqResult<Self>
    where
        D: BeamBlanker + ColumnValve + ViewingScreen + ?Sized,
    {
        let snapshot = Self::capture(device).await?;
        if let Err(e) = snapshot.prepare(device).await {
            if let Err(restore_error) = snapshot.restore(device).await {
                error!("Failed to restore instrument flags: {}", restore_error);
            }
            return Err(e);
        }
        Ok(snapshot)
    }

    /// Restore the recorded flags: valve, then screen, then beam.
    ///
    /// Every flag is attempted; the first failure is returned.
    pub async fn restore<D>(&self, device: &D) -> DaqResult<()>
    where
        D: BeamBlanker + ColumnValve + ViewingScreen + ?Sized,
    {
        let valve = match self.valve {
            ValvePosition::Open => device.open_column_valve().await,
            ValvePosition::Closed => device.close_column_valve().await,
        };
        let screen = match self.screen {
            ScreenPosition::Inserted => device.insert_screen().await,
            ScreenPosition::Retracted => device.retract_screen().await,
        };
        let beam = if self.beam_blanked {
            device.blank_beam().await
        } else {
            device.unblank_beam().await
        };

        for (flag, result) in [("column valve", &valve), ("screen", &screen), ("beam", &beam)] {
            if let Err(e) = result {
                error!("Failed to restore {}: {}", flag, e);
            }
        }
        valve.and(screen).and(beam)
    }

    /// Blank the beam and optionally close the column valve.
    pub async fn make_safe<D>(device: &D, close_valve: bool) -> DaqResult<()>
    where
        D: BeamBlanker + ColumnValve + ?Sized,
    {
        let beam = device.blank_beam().await;
        if let Err(e) = &beam {
            error!("Failed to blank the beam: {}", e);
        }
        if close_valve {
            device.close_column_valve().await?;
        }
        beam
    }
}
