//! Weather veto gate and the weather source behind it.
//!
//! The gate is all-or-nothing: one adverse reading zeroes the whole cycle.
//! Wind is checked before humidity, humidity before rain.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::Durations;

/// Above this wind speed (mph) the cycle is canceled.
pub const MAX_WIND_MPH: f64 = 10.0;

/// Above this relative humidity (%) the cycle is canceled.
pub const MAX_HUMIDITY_PCT: f64 = 90.0;

/// How long fetched conditions stay fresh.
pub const WEATHER_TTL: Duration = Duration::from_secs(15 * 60);

const OPENWEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Conditions {
    pub wind_speed: f64,
    pub humidity: f64,
    pub rain_amount: f64,
    pub temperature: Option<f64>,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Wind,
    Humidity,
    Rain,
}

impl CancelReason {
    pub fn status_text(self) -> &'static str {
        match self {
            Self::Wind => "Canceled: Wind",
            Self::Humidity => "Canceled: Humidity",
            Self::Rain => "Canceled: Rain",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherVerdict {
    pub durations: Durations,
    pub canceled: Option<CancelReason>,
}

pub fn apply_weather_policy(durations: Durations, conditions: &Conditions) -> WeatherVerdict {
    let canceled = if conditions.wind_speed > MAX_WIND_MPH {
        Some(CancelReason::Wind)
    } else if conditions.humidity > MAX_HUMIDITY_PCT {
        Some(CancelReason::Humidity)
    } else if conditions.rain_amount > 0.0 {
        Some(CancelReason::Rain)
    } else {
        None
    };

    WeatherVerdict {
        durations: if canceled.is_some() {
            [0; crate::protocol::ZONE_COUNT]
        } else {
            durations
        },
        canceled,
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current_conditions(&self) -> Result<Conditions>;
}

/// Used when no weather station is configured: never vetoes.
pub struct CalmWeather;

#[async_trait]
impl WeatherSource for CalmWeather {
    async fn current_conditions(&self) -> Result<Conditions> {
        Ok(Conditions::default())
    }
}

/// Last fetched conditions with an explicit time-to-live, checked on read.
pub struct WeatherCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Conditions)>>,
}

impl WeatherCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn fresh(&self, now: Instant) -> Option<Conditions> {
        let entry = self.entry.lock().ok()?;
        match *entry {
            Some((fetched_at, c)) if now.saturating_duration_since(fetched_at) < self.ttl => Some(c),
            _ => None,
        }
    }

    pub fn store(&self, now: Instant, conditions: Conditions) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = Some((now, conditions));
        }
    }
}

/// OpenWeatherMap current-conditions client, imperial units.
pub struct OpenWeather {
    http: reqwest::Client,
    station: String,
    api_key: String,
    cache: WeatherCache,
}

impl OpenWeather {
    pub fn new(station: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build weather http client")?;
        Ok(Self {
            http,
            station: station.to_string(),
            api_key: api_key.to_string(),
            cache: WeatherCache::new(WEATHER_TTL),
        })
    }

    async fn fetch(&self) -> Result<Conditions> {
        let body: OwmResponse = self
            .http
            .get(OPENWEATHER_URL)
            .query(&[
                ("id", self.station.as_str()),
                ("units", "imperial"),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("weather request failed")?
            .error_for_status()
            .context("weather service returned an error")?
            .json()
            .await
            .context("weather response is not the expected JSON")?;
        Ok(body.into_conditions())
    }
}

#[async_trait]
impl WeatherSource for OpenWeather {
    async fn current_conditions(&self) -> Result<Conditions> {
        if let Some(c) = self.cache.fresh(Instant::now()) {
            return Ok(c);
        }
        let c = self.fetch().await?;
        debug!(station = %self.station, ?c, "weather refreshed");
        self.cache.store(Instant::now(), c);
        Ok(c)
    }
}

// ---------------------------------------------------------------------------
// OpenWeatherMap payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    wind: OwmWind,
    #[serde(default)]
    rain: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: f64,
}

impl OwmResponse {
    fn into_conditions(self) -> Conditions {
        let rain_amount = self
            .rain
            .get("1h")
            .or_else(|| self.rain.get("3h"))
            .or_else(|| self.rain.values().next())
            .copied()
            .unwrap_or(0.0);
        Conditions {
            wind_speed: self.wind.speed,
            humidity: self.main.humidity,
            rain_amount,
            temperature: Some(self.main.temp),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
