pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use policy::ControlPolicy;

use crate::forecast::{DayTracker, DayUpdate, ForecastController};
use crate::ml::{DriftDetector, OnlineRegressor};
use crate::modbus::{RegisterDevice, RegisterFrame};

/// Result of one poll
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The register block could not be read or decoded
    Unobservable,
    Observed {
        frame: RegisterFrame,
        connect: bool,
        /// Present when this poll crossed a day boundary
        day_update: Option<DayUpdate>,
        /// Whether the grid flag was written this poll
        wrote: bool,
    },
}

/// Controller side of the device protocol: polls the register block, drives
/// the forecaster on day boundaries and writes the grid command on change.
pub struct ControllerClient<M, D> {
    device: Arc<dyn RegisterDevice>,
    forecaster: ForecastController<M, D>,
    tracker: DayTracker,
    policy: ControlPolicy,
    capacity_kwh: f64,
    last_command: Option<bool>,
}

impl<M, D> ControllerClient<M, D>
where
    M: OnlineRegressor + Clone + 'static,
    D: DriftDetector,
{
    pub fn new(
        device: Arc<dyn RegisterDevice>,
        forecaster: ForecastController<M, D>,
        policy: ControlPolicy,
        capacity_kwh: f64,
    ) -> Self {
        Self {
            device,
            forecaster,
            tracker: DayTracker::new(),
            policy,
            capacity_kwh,
            last_command: None,
        }
    }

    pub fn forecaster(&self) -> &ForecastController<M, D> {
        &self.forecaster
    }

    pub fn last_command(&self) -> Option<bool> {
        self.last_command
    }

    /// One read/compute/write cycle. Device errors are logged and never returned.
    pub async fn tick(&mut self) -> TickOutcome {
        let frame = match self.device.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "register block unreadable, skipping tick");
                return TickOutcome::Unobservable;
            }
        };

        let day_update = self
            .tracker
            .observe(frame.date)
            .map(|transition| self.forecaster.on_day_boundary(transition));

        let soc_kwh = frame.soc_kwh(self.capacity_kwh);
        let forecast_kwh = self.forecaster.next_day_forecast();
        let connect = self
            .policy
            .should_connect(soc_kwh, forecast_kwh, frame.hour, self.capacity_kwh);

        let mut wrote = false;
        if self.last_command != Some(connect) {
            match self.device.write_grid_connected(connect).await {
                Ok(()) => {
                    info!(
                        connect,
                        soc_kwh,
                        forecast_kwh,
                        hour = frame.hour,
                        "grid command changed"
                    );
                    self.last_command = Some(connect);
                    wrote = true;
                }
                // Retried on the next poll since last_command is unchanged.
                Err(e) => warn!(error = %e, connect, "failed to write grid command"),
            }
        }

        debug!(
            date = %frame.date,
            hour = frame.hour,
            soc_percent = frame.soc_percent,
            demand_kw = frame.demand_kw,
            grid_connected = frame.grid_connected,
            forecast_kwh,
            "control tick"
        );

        TickOutcome::Observed {
            frame,
            connect,
            day_update,
            wrote,
        }
    }

    /// Poll until `shutdown` fires. Cancellation is honoured between ticks only.
    pub async fn run(
        &mut self,
        poll: Duration,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(?poll, ?retry_delay, "controller loop started");
        while !shutdown.is_cancelled() {
            let delay = match self.tick().await {
                TickOutcome::Unobservable => retry_delay,
                TickOutcome::Observed { .. } => poll,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            updates = self.forecaster.updates(),
            "controller loop stopping"
        );
        self.finish().await;
        Ok(())
    }

    /// Drain queued persistence writes and release the device.
    pub async fn finish(&mut self) {
        self.forecaster.flush().await;
        if let Err(e) = self.device.close().await {
            warn!(error = %e, "failed to close device connection");
        }
    }
}
