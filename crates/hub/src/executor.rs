//! Runs one irrigation cycle against the controller.
//!
//! Per zone: wait for the controller watchdog to drain, reset with
//! `endcycle`, then (for a non-zero duration) arm the watchdog and only
//! then open the valve, and wait for it to drain again.  The
//! `(schedule, date)` slot is claimed in the database before the first
//! message goes out, and `endcycle` is the last message on every exit path.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use time::Date;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::controller::{CycleLease, Sprinkler};
use crate::db::{now_unix, Claim, Db};
use crate::error::LinkError;
use crate::protocol::{Durations, Zone, ZONE_COUNT};
use crate::schedule::date_key;
use crate::state::{CyclePhase, SharedState};
use crate::weather::CancelReason;

/// How often the controller is polled while waiting for its watchdog.
pub const WATCHDOG_POLL: Duration = Duration::from_secs(15);

pub const STATUS_RUNNING: &str = "Running Cycle";
pub const STATUS_FINISHED: &str = "Finished Cycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Someone already claimed this slot today; nothing was sent.
    AlreadyClaimed,
}

pub struct CycleExecutor {
    db: Db,
    sprinkler: Sprinkler,
    shared: SharedState,
    poll_interval: Duration,
}

impl CycleExecutor {
    pub fn new(db: Db, sprinkler: Sprinkler, shared: SharedState) -> Self {
        Self {
            db,
            sprinkler,
            shared,
            poll_interval: WATCHDOG_POLL,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run_cycle(
        &self,
        schedule_id: i64,
        today: Date,
        durations: Durations,
    ) -> Result<CycleOutcome> {
        let date = date_key(today);

        let claim = self
            .db
            .record_cycle(schedule_id, &date, now_unix(), &durations)
            .await?;
        if claim == Claim::AlreadyClaimed {
            info!(schedule_id, %date, "cycle already claimed today, skipping");
            return Ok(CycleOutcome::AlreadyClaimed);
        }

        self.db.set_status(STATUS_RUNNING).await?;
        info!(schedule_id, %date, ?durations, "cycle started");
        self.shared
            .write()
            .await
            .record_cycle(format!("schedule {schedule_id} started {durations:?}"));

        let lease = self.sprinkler.lease().await;
        let driven = self.drive_zones(&lease, schedule_id, &durations).await;

        // Full shutoff, whatever happened above.
        let shutoff = lease.end_cycle().await;
        drop(lease);
        if matches!(&shutoff, Ok(st) if st.any_on()) {
            warn!(schedule_id, "controller still reports an open valve after endcycle");
        }
        self.shared.write().await.clear_progress();

        if let Err(e) = &driven {
            if let Err(shutoff_err) = &shutoff {
                error!(schedule_id, "final endcycle failed after cycle error: {shutoff_err}");
            }
            error!(schedule_id, "cycle aborted: {e:#}");
        }
        driven?;
        shutoff.context("final endcycle failed")?;

        self.db.set_status(STATUS_FINISHED).await?;
        info!(schedule_id, "cycle finished");
        self.shared
            .write()
            .await
            .record_cycle(format!("schedule {schedule_id} finished"));

        Ok(CycleOutcome::Completed)
    }

    /// Claim the slot for a weather-canceled cycle without touching the
    /// controller, so the window does not fire again today.
    pub async fn skip_cycle(
        &self,
        schedule_id: i64,
        today: Date,
        reason: CancelReason,
    ) -> Result<CycleOutcome> {
        let date = date_key(today);
        let zeroed: Durations = [0; ZONE_COUNT];
        let claim = self
            .db
            .record_cycle(schedule_id, &date, now_unix(), &zeroed)
            .await?;
        if claim == Claim::AlreadyClaimed {
            return Ok(CycleOutcome::AlreadyClaimed);
        }
        info!(schedule_id, %date, reason = reason.status_text(), "cycle canceled");
        Ok(CycleOutcome::Completed)
    }

    async fn drive_zones(
        &self,
        lease: &CycleLease,
        schedule_id: i64,
        durations: &Durations,
    ) -> Result<()> {
        for (zone, minutes) in Zone::all().zip(durations.iter().copied()) {
            self.progress(schedule_id, zone, CyclePhase::Waiting).await;
            self.wait_for_drain(lease).await?;
            lease.end_cycle().await?;

            if minutes > 0 {
                self.progress(schedule_id, zone, CyclePhase::Opening).await;
                let ms = u64::from(minutes) * 60_000;
                let armed = lease.arm_watchdog(ms).await?;
                if armed.cycle_ms_remaining == 0 {
                    bail!("controller did not arm its watchdog for zone {zone} (asked for {ms} ms)");
                }
                lease.zone_on(zone).await?;

                info!(schedule_id, zone = zone.number(), minutes, "zone on");
                {
                    let mut st = self.shared.write().await;
                    st.record_zone(zone, true);
                    st.set_progress(schedule_id, Some(zone), CyclePhase::Watering);
                }
            } else {
                debug!(schedule_id, zone = zone.number(), "zone has no time, skipping");
            }

            self.wait_for_drain(lease).await?;
            debug!(schedule_id, zone = zone.number(), "zone finished");
        }
        Ok(())
    }

    /// Poll until the controller reports no cycle time left.
    async fn wait_for_drain(&self, lease: &CycleLease) -> Result<(), LinkError> {
        loop {
            let st = lease.state().await?;
            if st.cycle_ms_remaining == 0 {
                return Ok(());
            }
            debug!(remaining_ms = st.cycle_ms_remaining, "waiting for controller watchdog");
            sleep(self.poll_interval).await;
        }
    }

    async fn progress(&self, schedule_id: i64, zone: Zone, phase: CyclePhase) {
        self.shared
            .write()
            .await
            .set_progress(schedule_id, Some(zone), phase);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
