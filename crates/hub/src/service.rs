//! The top-level control loop.
//!
//! One sequential loop: evaluate the schedule, gate on weather, run the
//! cycle inline.  Since the cycle blocks the loop, two cycles can never be
//! in flight at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::executor::{CycleExecutor, CycleOutcome};
use crate::recorder::Recorder;
use crate::schedule::LocalClock;
use crate::state::SharedState;
use crate::weather::{apply_weather_policy, CancelReason, WeatherSource};

/// Re-poll interval when no window is open.
pub const IDLE_SLEEP: Duration = Duration::from_secs(15 * 60);

/// Pause after a failed iteration before polling again.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Watered { schedule_id: i64 },
    Canceled { schedule_id: i64, reason: CancelReason },
    AlreadyRan { schedule_id: i64 },
    Idle,
}

pub struct Service {
    db: Db,
    executor: CycleExecutor,
    weather: Arc<dyn WeatherSource>,
    recorder: Arc<dyn Recorder>,
    shared: SharedState,
    clock: LocalClock,
}

impl Service {
    pub fn new(
        db: Db,
        executor: CycleExecutor,
        weather: Arc<dyn WeatherSource>,
        recorder: Arc<dyn Recorder>,
        shared: SharedState,
        clock: LocalClock,
    ) -> Self {
        Self {
            db,
            executor,
            weather,
            recorder,
            shared,
            clock,
        }
    }

    /// Wall-clock time in the garden's timezone.
    pub fn local_now(&self) -> OffsetDateTime {
        self.clock.local(OffsetDateTime::now_utc())
    }

    /// One loop iteration at `now` (local time).
    pub async fn tick(&self, now: OffsetDateTime) -> Result<Tick> {
        let Some(window) = self.db.find_active_window(now).await? else {
            if let Err(e) = self.recorder.snapshot().await {
                warn!("recorder snapshot failed: {e:#}");
            }
            return Ok(Tick::Idle);
        };
        let schedule_id = window.schedule_id;

        let conditions = self
            .weather
            .current_conditions()
            .await
            .context("weather lookup failed")?;
        let verdict = apply_weather_policy(window.durations, &conditions);
        debug!(schedule_id, ?conditions, durations = ?verdict.durations, "weather applied");

        if let Some(reason) = verdict.canceled {
            let outcome = self
                .executor
                .skip_cycle(schedule_id, window.date, reason)
                .await?;
            if outcome == CycleOutcome::AlreadyClaimed {
                return Ok(Tick::AlreadyRan { schedule_id });
            }
            self.db.set_status(reason.status_text()).await?;
            info!(
                schedule_id,
                wind_mph = conditions.wind_speed,
                humidity = conditions.humidity,
                rain = conditions.rain_amount,
                "{}",
                reason.status_text()
            );
            self.shared.write().await.record_weather(format!(
                "schedule {schedule_id}: {}",
                reason.status_text()
            ));
            return Ok(Tick::Canceled {
                schedule_id,
                reason,
            });
        }

        let outcome = self
            .executor
            .run_cycle(schedule_id, window.date, verdict.durations)
            .await?;
        Ok(match outcome {
            CycleOutcome::Completed => Tick::Watered { schedule_id },
            CycleOutcome::AlreadyClaimed => Tick::AlreadyRan { schedule_id },
        })
    }

    /// Poll forever.  A failed iteration is logged and never ends the loop.
    pub async fn run(&self) {
        info!(clock = ?self.clock, "irrigation service started");
        loop {
            match self.tick(self.local_now()).await {
                Ok(Tick::Idle) => sleep(IDLE_SLEEP).await,
                Ok(tick) => debug!(?tick, "service tick"),
                Err(e) => {
                    error!("service iteration failed: {e:#}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("service: {e:#}"));
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Sprinkler;
    use crate::executor::STATUS_FINISHED;
    use crate::protocol::Request;
    use crate::testing::{
        calm, memory_db, saturday_entry, test_shared, BrokenWeather, CountingRecorder,
        FakeActuator, StaticWeather,
    };
    use crate::weather::Conditions;
    use time::macros::datetime;

    const SATURDAY_5AM: OffsetDateTime = datetime!(2026-10-17 05:00 UTC);

    struct Rig {
        service: Service,
        fake: Arc<FakeActuator>,
        recorder: Arc<CountingRecorder>,
        db: Db,
    }

    async fn rig(weather: Arc<dyn WeatherSource>) -> Rig {
        let db = memory_db().await;
        db.upsert_schedule(&saturday_entry()).await.unwrap();
        let fake = Arc::new(FakeActuator::new());
        let recorder = Arc::new(CountingRecorder::default());
        let shared = test_shared();
        let executor = CycleExecutor::new(db.clone(), Sprinkler::new(fake.clone()), shared.clone())
            .with_poll_interval(Duration::from_millis(1));
        let service = Service::new(
            db.clone(),
            executor,
            weather,
            recorder.clone(),
            shared,
            LocalClock::new(time::UtcOffset::UTC, None),
        );
        Rig {
            service,
            fake,
            recorder,
            db,
        }
    }

    #[tokio::test]
    async fn calm_saturday_morning_waters_once() {
        let rig = rig(Arc::new(StaticWeather(calm()))).await;

        let tick = rig.service.tick(SATURDAY_5AM).await.unwrap();
        assert_eq!(tick, Tick::Watered { schedule_id: 1 });

        let sent = rig.fake.sent();
        let arms = sent
            .iter()
            .filter(|r| **r == Request::StartCycle { ms: 1_800_000 })
            .count();
        assert_eq!(arms, 2);
        assert_eq!(sent.last(), Some(&Request::EndCycle));
        assert_eq!(
            rig.db.get_status().await.unwrap().unwrap().text,
            STATUS_FINISHED
        );
        assert_eq!(rig.recorder.count(), 0);

        // Same window later that morning: already claimed, so idle.
        let again = rig.service.tick(datetime!(2026-10-17 05:30 UTC)).await.unwrap();
        assert_eq!(again, Tick::Idle);
        assert_eq!(rig.fake.sent().len(), sent.len());
        assert_eq!(rig.recorder.count(), 1);
    }

    #[tokio::test]
    async fn windy_morning_cancels_without_touching_valves() {
        let windy = Conditions {
            wind_speed: 15.0,
            ..calm()
        };
        let rig = rig(Arc::new(StaticWeather(windy))).await;

        let tick = rig.service.tick(SATURDAY_5AM).await.unwrap();

        assert_eq!(
            tick,
            Tick::Canceled {
                schedule_id: 1,
                reason: CancelReason::Wind
            }
        );
        assert!(rig.fake.sent().is_empty());
        assert_eq!(
            rig.db.get_status().await.unwrap().unwrap().text,
            "Canceled: Wind"
        );

        // The canceled window does not fire again today.
        assert_eq!(rig.service.tick(SATURDAY_5AM).await.unwrap(), Tick::Idle);
        assert!(rig.fake.sent().is_empty());
    }

    #[tokio::test]
    async fn outside_any_window_records_a_snapshot() {
        let rig = rig(Arc::new(StaticWeather(calm()))).await;

        let tick = rig.service.tick(datetime!(2026-10-18 05:00 UTC)).await.unwrap();

        assert_eq!(tick, Tick::Idle);
        assert_eq!(rig.recorder.count(), 1);
        assert!(rig.fake.sent().is_empty());
    }

    #[tokio::test]
    async fn weather_failure_leaves_window_unclaimed() {
        let rig = rig(Arc::new(BrokenWeather)).await;

        assert!(rig.service.tick(SATURDAY_5AM).await.is_err());

        assert!(rig.fake.sent().is_empty());
        assert!(rig
            .db
            .claimed_schedule_ids("2026-10-17")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn link_failure_surfaces_but_window_stays_claimed() {
        let db = memory_db().await;
        db.upsert_schedule(&saturday_entry()).await.unwrap();
        let fake = Arc::new(FakeActuator::new().failing_after(0));
        let shared = test_shared();
        let executor = CycleExecutor::new(db.clone(), Sprinkler::new(fake.clone()), shared.clone())
            .with_poll_interval(Duration::from_millis(1));
        let service = Service::new(
            db.clone(),
            executor,
            Arc::new(StaticWeather(calm())),
            Arc::new(CountingRecorder::default()),
            shared,
            LocalClock::new(time::UtcOffset::UTC, None),
        );

        assert!(service.tick(SATURDAY_5AM).await.is_err());
        assert_eq!(service.tick(SATURDAY_5AM).await.unwrap(), Tick::Idle);
    }
}
