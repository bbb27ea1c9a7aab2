//! Caller-facing sprinkler operations plus the exclusive cycle lease.
//!
//! A running cycle holds a [`CycleLease`] for its whole duration.  While it
//! is held, manual commands that could open a valve or re-arm the watchdog
//! are refused with [`ControlError::Busy`].  Reads and `endcycle` are always
//! let through: stopping water is never unsafe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::error::{ControlError, LinkError};
use crate::link::Actuator;
use crate::protocol::{ActuatorState, Request, StatusReport, Zone};

#[derive(Clone)]
pub struct Sprinkler {
    actuator: Arc<dyn Actuator>,
    lease: Arc<Mutex<()>>,
    /// Set only while a [`CycleLease`] exists, not while a manual command
    /// briefly holds the lock.
    cycle_running: Arc<AtomicBool>,
}

impl Sprinkler {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self {
            actuator,
            lease: Arc::new(Mutex::new(())),
            cycle_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current controller state, read fresh.
    pub async fn state(&self) -> Result<ActuatorState, LinkError> {
        self.actuator.send(Request::Status).await
    }

    pub async fn status(&self) -> Result<StatusReport, LinkError> {
        Ok(self.state().await?.to_status())
    }

    /// Manually switch one zone.
    pub async fn control(&self, zone: Zone, on: bool) -> Result<StatusReport, ControlError> {
        let _guard = self.lease.try_lock().map_err(|_| ControlError::Busy)?;
        info!(%zone, on, "manual zone command");
        let st = self
            .actuator
            .send(Request::ZoneControl { zone, on })
            .await?;
        Ok(st.to_status())
    }

    /// Manually arm the controller watchdog.
    pub async fn start_cycle(&self, ms: u64) -> Result<StatusReport, ControlError> {
        let _guard = self.lease.try_lock().map_err(|_| ControlError::Busy)?;
        info!(ms, "manual watchdog start");
        let st = self.actuator.send(Request::StartCycle { ms }).await?;
        Ok(st.to_status())
    }

    /// Stop everything.  Allowed even while a cycle holds the lease.
    pub async fn end_cycle(&self) -> Result<StatusReport, LinkError> {
        let st = self.actuator.send(Request::EndCycle).await?;
        Ok(st.to_status())
    }

    pub fn cycle_running(&self) -> bool {
        self.cycle_running.load(Ordering::SeqCst)
    }

    /// Wait for and take the exclusive lease.
    pub async fn lease(&self) -> CycleLease {
        let guard = Arc::clone(&self.lease).lock_owned().await;
        self.cycle_running.store(true, Ordering::SeqCst);
        CycleLease {
            _guard: guard,
            actuator: Arc::clone(&self.actuator),
            running: Arc::clone(&self.cycle_running),
        }
    }
}

/// Exclusive right to drive the valves.  Dropping it releases the
/// controller to manual commands again.
pub struct CycleLease {
    _guard: OwnedMutexGuard<()>,
    actuator: Arc<dyn Actuator>,
    running: Arc<AtomicBool>,
}

impl Drop for CycleLease {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl CycleLease {
    pub async fn state(&self) -> Result<ActuatorState, LinkError> {
        self.actuator.send(Request::Status).await
    }

    pub async fn end_cycle(&self) -> Result<ActuatorState, LinkError> {
        self.actuator.send(Request::EndCycle).await
    }

    pub async fn arm_watchdog(&self, ms: u64) -> Result<ActuatorState, LinkError> {
        self.actuator.send(Request::StartCycle { ms }).await
    }

    pub async fn zone_on(&self, zone: Zone) -> Result<ActuatorState, LinkError> {
        self.actuator
            .send(Request::ZoneControl { zone, on: true })
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
