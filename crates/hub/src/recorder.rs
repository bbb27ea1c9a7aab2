//! Idle-time telemetry: one `history` row per quiet service tick.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sysinfo::System;
use tracing::{debug, warn};

use crate::controller::Sprinkler;
use crate::db::{now_unix, Db, HistoryRow};
use crate::weather::WeatherSource;

#[async_trait]
pub trait Recorder: Send + Sync {
    async fn snapshot(&self) -> Result<()>;
}

pub struct HistoryRecorder {
    db: Db,
    sprinkler: Sprinkler,
    weather: Option<Arc<dyn WeatherSource>>,
}

impl HistoryRecorder {
    /// `weather` is `None` when no station is configured.
    pub fn new(db: Db, sprinkler: Sprinkler, weather: Option<Arc<dyn WeatherSource>>) -> Self {
        Self {
            db,
            sprinkler,
            weather,
        }
    }
}

#[async_trait]
impl Recorder for HistoryRecorder {
    /// Every source is best effort; only the insert itself can fail.
    async fn snapshot(&self) -> Result<()> {
        let mut row = HistoryRow {
            ts: now_unix(),
            load_one: Some(System::load_average().one),
            uptime_secs: Some(System::uptime()),
            ..HistoryRow::default()
        };

        match self.sprinkler.state().await {
            Ok(st) => {
                row.zones = Some(st.zones);
                row.cycle_ms_remaining = Some(st.cycle_ms_remaining);
            }
            Err(e) => warn!("recorder: controller state unavailable: {e}"),
        }

        if let Some(weather) = &self.weather {
            match weather.current_conditions().await {
                Ok(c) => row.weather = Some(c),
                Err(e) => warn!("recorder: weather unavailable: {e:#}"),
            }
        }

        self.db.insert_history(&row).await?;
        debug!(ts = row.ts, "history snapshot recorded");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{calm, memory_db, BrokenWeather, FakeActuator, StaticWeather};

    type Row = (Option<i64>, Option<i64>, Option<f64>, Option<i64>);

    async fn rows(db: &Db) -> Vec<Row> {
        sqlx::query_as(
            "SELECT irrigation_zone1, cycle_ms_remaining, outside_humidity, uptime_secs FROM history",
        )
        .fetch_all(db.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn snapshot_records_controller_and_weather() {
        let db = memory_db().await;
        let recorder = HistoryRecorder::new(
            db.clone(),
            Sprinkler::new(Arc::new(FakeActuator::new())),
            Some(Arc::new(StaticWeather(calm()))),
        );

        recorder.snapshot().await.unwrap();

        let rows = rows(&db).await;
        assert_eq!(rows.len(), 1);
        let (zone1, remaining, humidity, uptime) = rows[0];
        assert_eq!(zone1, Some(0));
        assert_eq!(remaining, Some(0));
        assert_eq!(humidity, Some(40.0));
        assert!(uptime.is_some());
    }

    #[tokio::test]
    async fn failing_sources_leave_columns_empty() {
        let db = memory_db().await;
        let recorder = HistoryRecorder::new(
            db.clone(),
            Sprinkler::new(Arc::new(FakeActuator::new().failing_after(0))),
            Some(Arc::new(BrokenWeather)),
        );

        recorder.snapshot().await.unwrap();

        let (zone1, remaining, humidity, _) = rows(&db).await[0];
        assert_eq!((zone1, remaining, humidity), (None, None, None));
    }

    #[tokio::test]
    async fn no_weather_station_records_no_weather() {
        let db = memory_db().await;
        let recorder = HistoryRecorder::new(
            db.clone(),
            Sprinkler::new(Arc::new(FakeActuator::new())),
            None,
        );

        recorder.snapshot().await.unwrap();
        assert_eq!(rows(&db).await[0].2, None);
    }
}
