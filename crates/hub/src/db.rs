use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use time::OffsetDateTime;

use crate::protocol::{Durations, ZONE_COUNT};
use crate::schedule::{self, ActiveWindow, ScheduleEntry};
use crate::weather::Conditions;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Outcome of trying to claim a (schedule, date) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// The slot already ran (or was canceled) today. Nothing to do.
    AlreadyClaimed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub id: i64,
    pub schedule_id: i64,
    pub date: String, // YYYY-MM-DD
    pub executed_at: i64,
    pub durations: Durations,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CycleStatus {
    pub text: String,
    pub updated_at: i64,
}

/// One idle-time telemetry row.  `None` means the source was unavailable.
#[derive(Debug, Clone, Default)]
pub struct HistoryRow {
    pub ts: i64,
    pub zones: Option<[bool; ZONE_COUNT]>,
    pub cycle_ms_remaining: Option<u64>,
    pub weather: Option<Conditions>,
    pub load_one: Option<f64>,
    pub uptime_secs: Option<u64>,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

type ScheduleRow = (i64, i64, i64, i64, i64, i64, i64, i64);
type CycleRow = (i64, i64, String, i64, i64, i64, i64, i64);

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Schedule
    // ----------------------------

    pub async fn upsert_schedule(&self, e: &ScheduleEntry) -> Result<()> {
        let [z1, z2, z3, z4] = e.durations.map(i64::from);
        sqlx::query(
            r#"
            INSERT INTO schedule (id, day, start_hour, end_hour, zone1, zone2, zone3, zone4, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(id) DO UPDATE SET
              active=1,
              day=excluded.day,
              start_hour=excluded.start_hour,
              end_hour=excluded.end_hour,
              zone1=excluded.zone1,
              zone2=excluded.zone2,
              zone3=excluded.zone3,
              zone4=excluded.zone4
            "#,
        )
        .bind(e.id)
        .bind(i64::from(e.day))
        .bind(i64::from(e.start_hour))
        .bind(i64::from(e.end_hour))
        .bind(z1)
        .bind(z2)
        .bind(z3)
        .bind(z4)
        .execute(&self.pool)
        .await
        .context("upsert_schedule failed")?;
        Ok(())
    }

    /// Deactivate every entry whose id is not in `keep`.  Returns how many
    /// entries were retired.
    pub async fn retire_schedules_except(&self, keep: &[i64]) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE schedule SET active = 0 WHERE active = 1");
        if !keep.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut ids = qb.separated(", ");
            for id in keep {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }
        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("retire_schedules_except failed")?;
        Ok(res.rows_affected())
    }

    /// All active entries, in configured (id) order.
    pub async fn load_schedule(&self) -> Result<Vec<ScheduleEntry>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT id, day, start_hour, end_hour, zone1, zone2, zone3, zone4
            FROM schedule
            WHERE active = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_schedule failed")?;

        Ok(rows
            .into_iter()
            .map(|(id, day, start, end, z1, z2, z3, z4)| ScheduleEntry {
                id,
                day: day as u8,
                start_hour: start as u8,
                end_hour: end as u8,
                durations: [z1, z2, z3, z4].map(|m| m as u32),
            })
            .collect())
    }

    /// Schedule ids that already have a cycle on `date` (YYYY-MM-DD).
    pub async fn claimed_schedule_ids(&self, date: &str) -> Result<HashSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT schedule_id FROM cycles WHERE cycle_date = ?")
            .bind(date)
            .fetch_all(&self.pool)
            .await
            .context("claimed_schedule_ids failed")?;
        Ok(ids.into_iter().collect())
    }

    /// Evaluate the schedule for `now` (local wall-clock time).
    pub async fn find_active_window(&self, now: OffsetDateTime) -> Result<Option<ActiveWindow>> {
        let entries = self.load_schedule().await?;
        let claimed = self
            .claimed_schedule_ids(&schedule::date_key(now.date()))
            .await?;
        Ok(schedule::find_active_window(now, &entries, &claimed))
    }

    // ----------------------------
    // Cycles
    // ----------------------------

    /// Claim `(schedule_id, date)`.  A second claim for the same pair is a
    /// no-op reported as [`Claim::AlreadyClaimed`].
    pub async fn record_cycle(
        &self,
        schedule_id: i64,
        date: &str,
        executed_at: i64,
        durations: &Durations,
    ) -> Result<Claim> {
        let [z1, z2, z3, z4] = durations.map(i64::from);
        let res = sqlx::query(
            r#"
            INSERT INTO cycles (schedule_id, cycle_date, executed_at, zone1, zone2, zone3, zone4)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(schedule_id, cycle_date) DO NOTHING
            "#,
        )
        .bind(schedule_id)
        .bind(date)
        .bind(executed_at)
        .bind(z1)
        .bind(z2)
        .bind(z3)
        .bind(z4)
        .execute(&self.pool)
        .await
        .with_context(|| format!("record_cycle failed schedule_id={schedule_id} date={date}"))?;

        Ok(if res.rows_affected() == 0 {
            Claim::AlreadyClaimed
        } else {
            Claim::Claimed
        })
    }

    /// Most recent cycles first.
    pub async fn load_cycles(&self, limit: i64) -> Result<Vec<CycleRecord>> {
        let rows: Vec<CycleRow> = sqlx::query_as(
            r#"
            SELECT id, schedule_id, cycle_date, executed_at, zone1, zone2, zone3, zone4
            FROM cycles
            ORDER BY executed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("load_cycles failed")?;

        Ok(rows
            .into_iter()
            .map(|(id, schedule_id, date, executed_at, z1, z2, z3, z4)| CycleRecord {
                id,
                schedule_id,
                date,
                executed_at,
                durations: [z1, z2, z3, z4].map(|m| m as u32),
            })
            .collect())
    }

    // ----------------------------
    // Cycle status (single row, overwritten)
    // ----------------------------

    pub async fn set_status(&self, text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cycle_status (id, status, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              status=excluded.status,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(text)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .context("set_status failed")?;
        Ok(())
    }

    pub async fn get_status(&self) -> Result<Option<CycleStatus>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT status, updated_at FROM cycle_status WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("get_status failed")?;
        Ok(row.map(|(text, updated_at)| CycleStatus { text, updated_at }))
    }

    // ----------------------------
    // Telemetry history
    // ----------------------------

    pub async fn insert_history(&self, row: &HistoryRow) -> Result<()> {
        let zone = |i: usize| row.zones.map(|z| i64::from(z[i]));
        sqlx::query(
            r#"
            INSERT INTO history (
              ts,
              irrigation_zone1, irrigation_zone2, irrigation_zone3, irrigation_zone4,
              cycle_ms_remaining,
              outside_temp, outside_humidity, rainfall, wind_speed,
              load_one, uptime_secs
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.ts)
        .bind(zone(0))
        .bind(zone(1))
        .bind(zone(2))
        .bind(zone(3))
        .bind(row.cycle_ms_remaining.map(|ms| ms as i64))
        .bind(row.weather.and_then(|w| w.temperature))
        .bind(row.weather.map(|w| w.humidity))
        .bind(row.weather.map(|w| w.rain_amount))
        .bind(row.weather.map(|w| w.wind_speed))
        .bind(row.load_one)
        .bind(row.uptime_secs.map(|s| s as i64))
        .execute(&self.pool)
        .await
        .context("insert_history failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
