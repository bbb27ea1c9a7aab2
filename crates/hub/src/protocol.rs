//! Typed messages for the sprinkler controller's colon-delimited text
//! protocol.  Raw strings exist only between [`Request::encode`] and
//! [`ActuatorState::parse`]; everything past the link sees these types.
//!
//! ```text
//! status              -> "<z1>:<z2>:<z3>:<z4>:<cycle_ms_remaining>"
//! zone0<n>-<on|off>   -> status line
//! startcycle-<ms>     -> status line
//! endcycle            -> status line
//! ```

use std::fmt;

use serde::Serialize;

use crate::error::LinkError;

/// Number of valves wired to the controller.
pub const ZONE_COUNT: usize = 4;

/// Minutes of watering per zone, zone 1 first.
pub type Durations = [u32; ZONE_COUNT];

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

/// A valid zone number, 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Zone(u8);

impl Zone {
    pub fn new(number: u8) -> Option<Self> {
        if (1..=ZONE_COUNT as u8).contains(&number) {
            Some(Self(number))
        } else {
            None
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Zones in activation order.
    pub fn all() -> impl Iterator<Item = Zone> {
        (1..=ZONE_COUNT as u8).map(Zone)
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn key(self) -> String {
        format!("zone{}", self.0)
    }

    pub fn description(self) -> String {
        format!("ZONE {}", self.0)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Status,
    ZoneControl { zone: Zone, on: bool },
    /// Arm the controller-side watchdog for `ms` milliseconds.
    StartCycle { ms: u64 },
    /// Cancel the watchdog and force every zone off.
    EndCycle,
}

impl Request {
    pub fn encode(&self) -> String {
        match self {
            Self::Status => "status".to_string(),
            Self::ZoneControl { zone, on } => {
                format!("zone0{}-{}", zone.number(), if *on { "on" } else { "off" })
            }
            Self::StartCycle { ms } => format!("startcycle-{ms}"),
            Self::EndCycle => "endcycle".to_string(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Parse an "on"/"off" zone state (case-insensitive, trims whitespace).
pub fn parse_zone_state(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("unknown zone state '{other}' (use on/off)")),
    }
}

// ---------------------------------------------------------------------------
// Controller state
// ---------------------------------------------------------------------------

/// What the controller reported on its last reply.  Never cached: the
/// valves can change underneath us (manual override, watchdog expiry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    pub zones: [bool; ZONE_COUNT],
    pub cycle_ms_remaining: u64,
}

impl ActuatorState {
    pub fn parse(response: &str) -> Result<Self, LinkError> {
        let trimmed = response.trim();
        let fields: Vec<&str> = trimmed.split(':').collect();
        if fields.len() != ZONE_COUNT + 1 {
            return Err(LinkError::protocol(
                trimmed,
                format!("expected {} fields, got {}", ZONE_COUNT + 1, fields.len()),
            ));
        }

        let mut zones = [false; ZONE_COUNT];
        for (i, field) in fields[..ZONE_COUNT].iter().enumerate() {
            zones[i] = match field.trim() {
                "0" => false,
                "1" => true,
                other => {
                    return Err(LinkError::protocol(
                        trimmed,
                        format!("zone {} flag '{other}' is not 0 or 1", i + 1),
                    ))
                }
            };
        }

        let ms_field = fields[ZONE_COUNT].trim();
        let cycle_ms_remaining = ms_field.parse::<u64>().map_err(|_| {
            LinkError::protocol(trimmed, format!("cycle milliseconds '{ms_field}' is not a number"))
        })?;

        Ok(Self {
            zones,
            cycle_ms_remaining,
        })
    }

    pub fn is_on(&self, zone: Zone) -> bool {
        self.zones[zone.index()]
    }

    pub fn any_on(&self) -> bool {
        self.zones.iter().any(|z| *z)
    }

    pub fn to_report(&self) -> StateReport {
        let flag = |i: usize| u8::from(self.zones[i]);
        StateReport {
            zone1: flag(0),
            zone2: flag(1),
            zone3: flag(2),
            zone4: flag(3),
            cycle_milliseconds: self.cycle_ms_remaining,
        }
    }

    pub fn to_status(&self) -> StatusReport {
        StatusReport {
            cycle_milliseconds: self.cycle_ms_remaining,
            zones: Zone::all()
                .map(|zone| ZoneReport {
                    zone: zone.key(),
                    description: zone.description(),
                    status: if self.is_on(zone) { "on" } else { "off" },
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON shapes handed to callers
// ---------------------------------------------------------------------------

/// Raw controller state: one 0/1 flag per zone plus the watchdog.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateReport {
    pub zone1: u8,
    pub zone2: u8,
    pub zone3: u8,
    pub zone4: u8,
    pub cycle_milliseconds: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub cycle_milliseconds: u64,
    pub zones: Vec<ZoneReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ZoneReport {
    pub zone: String,
    pub description: String,
    pub status: &'static str,
}

// ===========================================================================
// Tests
// ===========================================================================
