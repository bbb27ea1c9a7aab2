//! Software stand-in for the sprinkler controller board.
//!
//! Four valves and a countdown watchdog.  When the countdown runs out every
//! valve is forced closed, whether or not anyone is still talking to us.
//! Expiry is evaluated lazily against the `now` passed to each request.

use std::time::{Duration, Instant};

pub const ZONE_COUNT: usize = 4;

/// Reply to anything we do not understand.
pub const ERROR_REPLY: &str = "error";

#[derive(Debug, Default)]
pub struct ControllerSim {
    zones: [bool; ZONE_COUNT],
    deadline: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Zone { index: usize, on: bool },
    StartCycle(u64),
    EndCycle,
}

fn parse(msg: &str) -> Option<Command> {
    let msg = msg.trim();
    match msg {
        "status" => return Some(Command::Status),
        "endcycle" => return Some(Command::EndCycle),
        _ => {}
    }

    if let Some(ms) = msg.strip_prefix("startcycle-") {
        return ms.parse().ok().map(Command::StartCycle);
    }

    // zone0<n>-<on|off>
    let rest = msg.strip_prefix("zone0")?;
    let (n, state) = rest.split_once('-')?;
    let n: usize = n.parse().ok()?;
    if !(1..=ZONE_COUNT).contains(&n) {
        return None;
    }
    let on = match state {
        "on" => true,
        "off" => false,
        _ => return None,
    };
    Some(Command::Zone { index: n - 1, on })
}

impl ControllerSim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one request and return the reply line.
    pub fn handle(&mut self, msg: &str, now: Instant) -> String {
        self.expire(now);

        match parse(msg) {
            Some(Command::Status) => {}
            Some(Command::Zone { index, on }) => self.zones[index] = on,
            Some(Command::StartCycle(0)) => self.deadline = None,
            Some(Command::StartCycle(ms)) => {
                self.deadline = Some(now + Duration::from_millis(ms));
            }
            Some(Command::EndCycle) => self.all_off(),
            None => return ERROR_REPLY.to_string(),
        }

        self.status_line(now)
    }

    fn expire(&mut self, now: Instant) {
        if matches!(self.deadline, Some(d) if now >= d) {
            tracing::info!("watchdog expired, closing all valves");
            self.all_off();
        }
    }

    fn all_off(&mut self) {
        self.zones = [false; ZONE_COUNT];
        self.deadline = None;
    }

    fn status_line(&self, now: Instant) -> String {
        let remaining = self
            .deadline
            .map(|d| d.saturating_duration_since(now).as_millis())
            .unwrap_or(0);
        let flags: Vec<&str> = self
            .zones
            .iter()
            .map(|on| if *on { "1" } else { "0" })
            .collect();
        format!("{}:{remaining}", flags.join(":"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
