//! TOML config file loading, validation, and database seeding for the
//! watering schedule.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use time::UtcOffset;

use crate::db::Db;
use crate::protocol::{Durations, ZONE_COUNT};
use crate::schedule::{DstRule, LocalClock, ScheduleEntry};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Standard (winter) offset of the garden's wall clock from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Summer-time rule, `"us"` or `"eu"`. Omit for a fixed offset.
    #[serde(default)]
    pub dst: Option<DstRule>,
    pub controller: ControllerEntry,
    #[serde(default)]
    pub weather: Option<WeatherEntry>,
    #[serde(default)]
    pub schedule: Vec<ScheduleConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ControllerEntry {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct WeatherEntry {
    pub station: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    pub id: i64,
    pub day: i64,
    pub start_hour: i64,
    pub end_hour: i64,
    /// Minutes per zone, zone 1 first.
    pub durations: Vec<i64>,
}

/// Longest a single zone may be scheduled for, in minutes.
const MAX_ZONE_MINUTES: i64 = 240;

/// Widest real-world UTC offset, in minutes.
const MAX_OFFSET_MINUTES: i32 = 18 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_weather(&mut errors);
        self.validate_schedule(&mut errors);

        if self.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            errors.push(format!(
                "utc_offset_minutes {} out of range [-{MAX_OFFSET_MINUTES}, {MAX_OFFSET_MINUTES}]",
                self.utc_offset_minutes
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        if self.controller.host.trim().is_empty() {
            errors.push("controller: host is empty".to_string());
        }
        if self.controller.port == 0 {
            errors.push("controller: port must be non-zero".to_string());
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let Some(w) = &self.weather else { return };
        if w.station.trim().is_empty() {
            errors.push("weather: station is empty".to_string());
        }
        if w.api_key.trim().is_empty() {
            errors.push("weather: api_key is empty".to_string());
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for s in &self.schedule {
            let ctx = format!("schedule {}", s.id);

            if !seen_ids.insert(s.id) {
                errors.push(format!("{ctx}: duplicate id"));
            }

            if !(0..=6).contains(&s.day) {
                errors.push(format!("{ctx}: day {} out of range [0, 6] (0 = Sunday)", s.day));
            }

            if !(0..=24).contains(&s.start_hour) || !(0..=24).contains(&s.end_hour) {
                errors.push(format!(
                    "{ctx}: hours {}..{} out of range [0, 24]",
                    s.start_hour, s.end_hour
                ));
            } else if s.start_hour >= s.end_hour {
                errors.push(format!(
                    "{ctx}: start_hour ({}) must be < end_hour ({})",
                    s.start_hour, s.end_hour
                ));
            }

            if s.durations.len() != ZONE_COUNT {
                errors.push(format!(
                    "{ctx}: expected {ZONE_COUNT} durations, got {}",
                    s.durations.len()
                ));
            }
            for (i, m) in s.durations.iter().enumerate() {
                if !(0..=MAX_ZONE_MINUTES).contains(m) {
                    errors.push(format!(
                        "{ctx}: zone {} duration {m} out of range [0, {MAX_ZONE_MINUTES}] minutes",
                        i + 1
                    ));
                }
            }
        }

        // ── Overlapping windows on the same day ─────────────────
        for (i, a) in self.schedule.iter().enumerate() {
            for b in &self.schedule[i + 1..] {
                if a.day == b.day && a.start_hour < b.end_hour && b.start_hour < a.end_hour {
                    errors.push(format!(
                        "schedule {} and schedule {} overlap on day {}",
                        a.id, b.id, a.day
                    ));
                }
            }
        }
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60)
            .with_context(|| format!("invalid utc_offset_minutes {}", self.utc_offset_minutes))
    }

    pub fn clock(&self) -> Result<LocalClock> {
        Ok(LocalClock::new(self.utc_offset()?, self.dst))
    }
}

impl ScheduleConfig {
    /// Only meaningful once the config has passed validation.
    fn to_entry(&self) -> Result<ScheduleEntry> {
        let mut durations: Durations = [0; ZONE_COUNT];
        for (slot, m) in durations.iter_mut().zip(&self.durations) {
            *slot = u32::try_from(*m)?;
        }
        Ok(ScheduleEntry {
            id: self.id,
            day: u8::try_from(self.day)?,
            start_hour: u8::try_from(self.start_hour)?,
            end_hour: u8::try_from(self.end_hour)?,
            durations,
        })
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Make the database schedule mirror the config: upsert every entry and
/// retire any entry the config no longer lists.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.schedule {
        let entry = s
            .to_entry()
            .with_context(|| format!("schedule {} has out-of-range values", s.id))?;
        db.upsert_schedule(&entry)
            .await
            .with_context(|| format!("failed to upsert schedule {}", s.id))?;
    }

    let keep: Vec<i64> = config.schedule.iter().map(|s| s.id).collect();
    let retired = db
        .retire_schedules_except(&keep)
        .await
        .context("failed to retire removed schedule entries")?;

    tracing::info!(schedule = config.schedule.len(), retired, "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_db;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_entry() -> ScheduleConfig {
        ScheduleConfig {
            id: 1,
            day: 6,
            start_hour: 4,
            end_hour: 6,
            durations: vec![30, 30, 0, 0],
        }
    }

    fn valid_config() -> Config {
        Config {
            utc_offset_minutes: 0,
            dst: None,
            controller: ControllerEntry {
                host: "192.168.1.50".into(),
                port: 8080,
            },
            weather: None,
            schedule: vec![valid_entry()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
utc_offset_minutes = -300

[controller]
host = "sprinkler.local"
port = 8080

[weather]
station = "4887398"
api_key = "abc123"

[[schedule]]
id = 1
day = 6
start_hour = 4
end_hour = 6
durations = [30, 30, 0, 0]

[[schedule]]
id = 2
day = 3
start_hour = 21
end_hour = 23
durations = [15, 15, 15, 15]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.utc_offset_minutes, -300);
        assert_eq!(config.controller.host, "sprinkler.local");
        assert_eq!(config.weather.as_ref().unwrap().station, "4887398");
        assert_eq!(config.schedule.len(), 2);
        assert_eq!(config.schedule[1].durations, vec![15, 15, 15, 15]);
    }

    #[test]
    fn example_config_targets_local_simulator() {
        let config: Config = toml::from_str(include_str!("../../../config.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.controller.host, "127.0.0.1");
        assert_eq!(config.controller.port, 8081);
        assert_ne!(config.controller.port, crate::web::DEFAULT_WEB_PORT);
        assert_eq!(config.dst, Some(DstRule::Us));
    }

    #[test]
    fn parse_without_weather_or_schedule() {
        let config: Config = toml::from_str("[controller]\nhost = \"h\"\nport = 1\n").unwrap();
        assert!(config.weather.is_none());
        assert!(config.schedule.is_empty());
        assert_eq!(config.utc_offset_minutes, 0);
    }

    #[test]
    fn parse_requires_controller() {
        assert!(toml::from_str::<Config>("").is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn back_to_back_windows_pass() {
        let mut cfg = valid_config();
        cfg.schedule.push(ScheduleConfig {
            id: 2,
            start_hour: 6,
            end_hour: 8,
            ..valid_entry()
        });
        cfg.validate().unwrap();
    }

    #[test]
    fn same_hours_on_different_days_pass() {
        let mut cfg = valid_config();
        cfg.schedule.push(ScheduleConfig {
            id: 2,
            day: 0,
            ..valid_entry()
        });
        cfg.validate().unwrap();
    }

    #[test]
    fn whole_day_window_passes() {
        let mut cfg = valid_config();
        cfg.schedule[0].start_hour = 0;
        cfg.schedule[0].end_hour = 24;
        cfg.validate().unwrap();
    }

    // -- Validation: controller / weather / offset -------------------------

    #[test]
    fn controller_empty_host_rejected() {
        let mut cfg = valid_config();
        cfg.controller.host = " ".into();
        assert_validation_err(&cfg, "host is empty");
    }

    #[test]
    fn controller_port_zero_rejected() {
        let mut cfg = valid_config();
        cfg.controller.port = 0;
        assert_validation_err(&cfg, "port must be non-zero");
    }

    #[test]
    fn weather_empty_api_key_rejected() {
        let mut cfg = valid_config();
        cfg.weather = Some(WeatherEntry {
            station: "123".into(),
            api_key: "".into(),
        });
        assert_validation_err(&cfg, "api_key is empty");
    }

    #[test]
    fn offset_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.utc_offset_minutes = 19 * 60;
        assert_validation_err(&cfg, "utc_offset_minutes");
    }

    #[test]
    fn offset_converts_to_utc_offset() {
        let mut cfg = valid_config();
        cfg.utc_offset_minutes = -330;
        let offset = cfg.utc_offset().unwrap();
        assert_eq!(offset.whole_minutes(), -330);
    }

    #[test]
    fn dst_rule_parses_and_shifts_clock() {
        let config: Config = toml::from_str(
            "utc_offset_minutes = -300\ndst = \"us\"\n[controller]\nhost = \"h\"\nport = 1\n",
        )
        .unwrap();
        assert_eq!(config.dst, Some(DstRule::Us));

        let clock = config.clock().unwrap();
        let july = time::macros::datetime!(2026-07-01 12:00 UTC);
        assert_eq!(clock.offset_at(july).whole_minutes(), -240);
    }

    #[test]
    fn unknown_dst_rule_rejected() {
        let parsed = toml::from_str::<Config>("dst = \"mars\"\n[controller]\nhost = \"h\"\nport = 1\n");
        assert!(parsed.is_err());
    }

    // -- Validation: schedule ----------------------------------------------

    #[test]
    fn schedule_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.push(ScheduleConfig {
            day: 2,
            ..valid_entry()
        });
        assert_validation_err(&cfg, "duplicate id");
    }

    #[test]
    fn schedule_day_seven_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].day = 7;
        assert_validation_err(&cfg, "day 7 out of range");
    }

    #[test]
    fn schedule_start_not_before_end_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].start_hour = 6;
        assert_validation_err(&cfg, "must be < end_hour");
    }

    #[test]
    fn schedule_hour_past_midnight_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].end_hour = 25;
        assert_validation_err(&cfg, "out of range [0, 24]");
    }

    #[test]
    fn schedule_wrong_duration_count_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].durations = vec![10, 10];
        assert_validation_err(&cfg, "expected 4 durations, got 2");
    }

    #[test]
    fn schedule_negative_duration_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].durations = vec![10, -1, 0, 0];
        assert_validation_err(&cfg, "zone 2 duration -1");
    }

    #[test]
    fn schedule_overlong_duration_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].durations = vec![0, 0, 0, 241];
        assert_validation_err(&cfg, "zone 4 duration 241");
    }

    #[test]
    fn schedule_overlap_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.push(ScheduleConfig {
            id: 2,
            start_hour: 5,
            end_hour: 9,
            ..valid_entry()
        });
        assert_validation_err(&cfg, "schedule 1 and schedule 2 overlap on day 6");
    }

    #[test]
    fn all_errors_reported_at_once() {
        let mut cfg = valid_config();
        cfg.controller.port = 0;
        cfg.schedule[0].day = 9;
        cfg.schedule[0].durations = vec![500, 0, 0, 0];
        assert_validation_err(&cfg, "3 errors");
    }

    // -- Apply --------------------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_schedule() {
        let db = memory_db().await;
        let mut cfg = valid_config();
        cfg.schedule.push(ScheduleConfig {
            id: 2,
            day: 3,
            start_hour: 21,
            end_hour: 23,
            durations: vec![15, 0, 15, 0],
        });

        apply(&cfg, &db).await.unwrap();

        let entries = db.load_schedule().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].durations, [15, 0, 15, 0]);
        assert_eq!(entries[0].day, 6);
    }

    #[tokio::test]
    async fn apply_twice_is_idempotent() {
        let db = memory_db().await;
        let cfg = valid_config();
        apply(&cfg, &db).await.unwrap();
        apply(&cfg, &db).await.unwrap();
        assert_eq!(db.load_schedule().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_retires_entries_dropped_from_config() {
        let db = memory_db().await;
        let mut cfg = valid_config();
        cfg.schedule.push(ScheduleConfig {
            id: 2,
            day: 0,
            start_hour: 4,
            end_hour: 6,
            durations: vec![10, 10, 10, 10],
        });
        apply(&cfg, &db).await.unwrap();

        let sunday = time::macros::datetime!(2026-10-18 05:00 UTC);
        let window = db.find_active_window(sunday).await.unwrap().unwrap();
        assert_eq!(window.schedule_id, 2);

        cfg.schedule.pop();
        apply(&cfg, &db).await.unwrap();

        let ids: Vec<i64> = db.load_schedule().await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
        assert!(db.find_active_window(sunday).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_empty_schedule_retires_everything() {
        let db = memory_db().await;
        let mut cfg = valid_config();
        apply(&cfg, &db).await.unwrap();

        cfg.schedule.clear();
        apply(&cfg, &db).await.unwrap();

        assert!(db.load_schedule().await.unwrap().is_empty());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load("/nonexistent/sprinkler-config.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
