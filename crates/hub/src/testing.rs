//! Test doubles shared by the module test suites.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::db::Db;
use crate::error::LinkError;
use crate::link::Actuator;
use crate::protocol::{ActuatorState, Request, ZONE_COUNT};
use crate::recorder::Recorder;
use crate::schedule::ScheduleEntry;
use crate::state::{SharedState, SystemState};
use crate::weather::{Conditions, WeatherSource};

// ---------------------------------------------------------------------------
// Scripted controller
// ---------------------------------------------------------------------------

/// In-memory controller.  An armed watchdog reports its milliseconds for
/// `drain_polls` status reads, then expires and closes every valve.
pub(crate) struct FakeActuator {
    inner: Mutex<Inner>,
    claim_check: Option<(Db, i64, String)>,
    claim_seen: Mutex<Option<bool>>,
}

struct Inner {
    sent: Vec<Request>,
    zones: [bool; ZONE_COUNT],
    remaining: u64,
    drain_polls: u32,
    polls_left: u32,
    fail_after: Option<usize>,
    watchdog_dead: bool,
}

impl FakeActuator {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sent: Vec::new(),
                zones: [false; ZONE_COUNT],
                remaining: 0,
                drain_polls: 1,
                polls_left: 0,
                fail_after: None,
                watchdog_dead: false,
            }),
            claim_check: None,
            claim_seen: Mutex::new(None),
        }
    }

    /// Every request after the first `n` fails with a transport error.
    pub(crate) fn failing_after(self, n: usize) -> Self {
        self.inner.lock().unwrap().fail_after = Some(n);
        self
    }

    /// `startcycle` is acknowledged but never arms the countdown.
    pub(crate) fn with_dead_watchdog(self) -> Self {
        self.inner.lock().unwrap().watchdog_dead = true;
        self
    }

    /// Pretend a previous cycle is still counting down.
    pub(crate) fn with_leftover_cycle(self, ms: u64, polls: u32) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remaining = ms;
            inner.polls_left = polls;
            inner.zones[0] = true;
        }
        self
    }

    /// Record whether `(schedule_id, date)` was already claimed in `db`
    /// when the first request arrived.
    pub(crate) fn with_claim_check(mut self, db: Db, schedule_id: i64, date: &str) -> Self {
        self.claim_check = Some((db, schedule_id, date.to_string()));
        self
    }

    pub(crate) fn sent(&self) -> Vec<Request> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub(crate) fn claim_seen_at_first_send(&self) -> Option<bool> {
        *self.claim_seen.lock().unwrap()
    }

    fn snapshot(inner: &Inner) -> ActuatorState {
        ActuatorState {
            zones: inner.zones,
            cycle_ms_remaining: inner.remaining,
        }
    }
}

#[async_trait]
impl Actuator for FakeActuator {
    async fn send(&self, request: Request) -> Result<ActuatorState, LinkError> {
        if let Some((db, schedule_id, date)) = &self.claim_check {
            let unseen = self.claim_seen.lock().unwrap().is_none();
            if unseen {
                let claimed = db
                    .claimed_schedule_ids(date)
                    .await
                    .map(|ids| ids.contains(schedule_id))
                    .unwrap_or(false);
                *self.claim_seen.lock().unwrap() = Some(claimed);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.sent.push(request);

        if let Some(n) = inner.fail_after {
            if inner.sent.len() > n {
                return Err(LinkError::Transient {
                    addr: "fake".into(),
                    attempts: 3,
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "fake outage"),
                });
            }
        }

        match request {
            Request::Status => {
                if inner.remaining > 0 {
                    if inner.polls_left == 0 {
                        inner.remaining = 0;
                        inner.zones = [false; ZONE_COUNT];
                    } else {
                        inner.polls_left -= 1;
                    }
                }
            }
            Request::ZoneControl { zone, on } => {
                inner.zones[usize::from(zone.number() - 1)] = on;
            }
            Request::StartCycle { .. } if inner.watchdog_dead => {}
            Request::StartCycle { ms } => {
                inner.remaining = ms;
                inner.polls_left = inner.drain_polls;
            }
            Request::EndCycle => {
                inner.remaining = 0;
                inner.zones = [false; ZONE_COUNT];
            }
        }

        Ok(Self::snapshot(&inner))
    }
}

// ---------------------------------------------------------------------------
// Weather + recorder
// ---------------------------------------------------------------------------

pub(crate) struct StaticWeather(pub(crate) Conditions);

#[async_trait]
impl WeatherSource for StaticWeather {
    async fn current_conditions(&self) -> Result<Conditions> {
        Ok(self.0)
    }
}

pub(crate) struct BrokenWeather;

#[async_trait]
impl WeatherSource for BrokenWeather {
    async fn current_conditions(&self) -> Result<Conditions> {
        Err(anyhow!("weather service unreachable"))
    }
}

#[derive(Default)]
pub(crate) struct CountingRecorder {
    pub(crate) snapshots: AtomicUsize,
}

#[async_trait]
impl Recorder for CountingRecorder {
    async fn snapshot(&self) -> Result<()> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CountingRecorder {
    pub(crate) fn count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) fn calm() -> Conditions {
    Conditions {
        wind_speed: 5.0,
        humidity: 40.0,
        rain_amount: 0.0,
        temperature: Some(68.0),
    }
}

/// Saturday 04:00-06:00, 30 minutes on zones 1 and 2.
pub(crate) fn saturday_entry() -> ScheduleEntry {
    ScheduleEntry {
        id: 1,
        day: 6,
        start_hour: 4,
        end_hour: 6,
        durations: [30, 30, 0, 0],
    }
}

pub(crate) async fn memory_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

pub(crate) fn test_shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}
