use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::protocol::Zone;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub cycle: Option<CycleProgress>,
    pub events: VecDeque<SystemEvent>,
}

/// Where the running cycle is, for the dashboard.
#[derive(Clone, Serialize)]
pub struct CycleProgress {
    pub schedule_id: i64,
    pub zone: Option<String>,
    pub phase: CyclePhase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    /// Waiting for the controller watchdog to drain.
    Waiting,
    /// Arming the watchdog and opening the valve.
    Opening,
    Watering,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Cycle,
    Zone,
    Weather,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub cycle: Option<CycleProgress>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            cycle: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_cycle(&mut self, detail: String) {
        self.push_event(EventKind::Cycle, detail);
    }

    /// Record a valve being driven by a cycle or a manual command.
    pub fn record_zone(&mut self, zone: Zone, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Zone, format!("{} set {state_str}", zone.key()));
    }

    pub fn record_weather(&mut self, detail: String) {
        self.push_event(EventKind::Weather, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_progress(&mut self, schedule_id: i64, zone: Option<Zone>, phase: CyclePhase) {
        self.cycle = Some(CycleProgress {
            schedule_id,
            zone: zone.map(|z| z.key()),
            phase,
        });
    }

    pub fn clear_progress(&mut self) {
        self.cycle = None;
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            cycle: self.cycle.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
