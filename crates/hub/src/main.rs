mod config;
mod controller;
mod db;
mod error;
mod executor;
mod link;
mod protocol;
mod recorder;
mod schedule;
mod service;
mod state;
mod weather;
mod web;

#[cfg(test)]
mod testing;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use controller::Sprinkler;
use db::Db;
use executor::CycleExecutor;
use link::TcpLink;
use recorder::HistoryRecorder;
use service::Service;
use state::SystemState;
use weather::{CalmWeather, OpenWeather, WeatherSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed schedule) ─────────────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let clock = cfg.clock()?;

    // The database is the source of truth from here on.
    let entries = db.load_schedule().await?;
    if entries.is_empty() {
        warn!("no schedule entries configured; the service will only record history");
    }
    info!(schedule = entries.len(), ?clock, "db ready");

    // ── Controller ──────────────────────────────────────────────────
    let link = TcpLink::new(&cfg.controller.host, cfg.controller.port);
    info!(controller = link.addr(), "using sprinkler controller");
    let sprinkler = Sprinkler::new(Arc::new(link));

    // Fail-safe: whatever was left running before a restart is stopped.
    if let Err(e) = sprinkler.end_cycle().await {
        warn!("startup endcycle failed, controller may be offline: {e}");
    }

    // ── Weather ─────────────────────────────────────────────────────
    let (gate_weather, recorder_weather): (Arc<dyn WeatherSource>, Option<Arc<dyn WeatherSource>>) =
        match &cfg.weather {
            Some(w) => {
                let source: Arc<dyn WeatherSource> = Arc::new(OpenWeather::new(&w.station, &w.api_key)?);
                (source.clone(), Some(source))
            }
            None => {
                warn!("no [weather] section; cycles will never be canceled for weather");
                let calm: Arc<dyn WeatherSource> = Arc::new(CalmWeather);
                (calm, None)
            }
        };

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
        sprinkler: sprinkler.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Service loop ────────────────────────────────────────────────
    let recorder = HistoryRecorder::new(db.clone(), sprinkler.clone(), recorder_weather);
    let executor = CycleExecutor::new(db.clone(), sprinkler, Arc::clone(&shared));
    let service = Service::new(
        db,
        executor,
        gate_weather,
        Arc::new(recorder),
        shared,
        clock,
    );
    service.run().await;

    Ok(())
}
