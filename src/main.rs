// Transit kiosk backend
// Polls MBTA predictions for the configured stops and serves display-ready schedules
// to the kiosk browser view and the desktop tray window

use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use anyhow::Context;
use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod mbta;
mod schedule;

use config::{AppConfig, RouteConfig};
use mbta::MbtaClient;
use schedule::{fetch_snapshot_now, NormalizedRoute, Schedule, Snapshot, SnapshotError};

// ============================================================================
// Shared State
// ============================================================================

#[derive(Clone)]
struct AppState {
    feed: Arc<Mutex<FeedState>>,
    refresh: Arc<Notify>,
    timezone: Tz,
}

impl AppState {
    fn new(timezone: Tz) -> Self {
        AppState {
            feed: Arc::new(Mutex::new(FeedState::default())),
            refresh: Arc::new(Notify::new()),
            timezone,
        }
    }
}

/// Latest cycle result plus the last schedule that fetched cleanly.
#[derive(Debug, Default)]
struct FeedState {
    latest: Option<Snapshot>,
    last_good: Option<Schedule>,
    last_attempt: Option<i64>,
    last_success: Option<i64>,
}

impl FeedState {
    fn record(&mut self, snapshot: Snapshot, at: i64) {
        self.last_attempt = Some(at);
        if let Some(schedule) = snapshot.schedule() {
            self.last_good = Some(schedule.clone());
            self.last_success = Some(at);
        }
        self.latest = Some(snapshot);
    }
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: current_timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: current_timestamp(),
        }
    }
}

fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

fn format_timestamp(timestamp: i64, tz: Tz) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("Invalid timestamp: {}", timestamp),
    }
}

// ============================================================================
// Display Ordering
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum DisplayRow {
    Route(NormalizedRoute),
    Spacer,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum DisplayView {
    Loading,
    Ready {
        rows: Vec<DisplayRow>,
    },
    Error {
        error: SnapshotError,
        #[serde(skip_serializing_if = "Option::is_none")]
        stale: Option<Vec<DisplayRow>>,
    },
}

/// Before noon the morning bucket leads; afterwards the evening one does.
fn display_rows(schedule: &Schedule, local_hour: u32) -> Vec<DisplayRow> {
    let (first, second) = if local_hour < 12 {
        (&schedule.morning, &schedule.evening)
    } else {
        (&schedule.evening, &schedule.morning)
    };
    first
        .iter()
        .cloned()
        .map(DisplayRow::Route)
        .chain(std::iter::once(DisplayRow::Spacer))
        .chain(second.iter().cloned().map(DisplayRow::Route))
        .collect()
}

fn display_view(feed: &FeedState, local_hour: u32) -> DisplayView {
    match &feed.latest {
        None => DisplayView::Loading,
        Some(Snapshot::Ready(schedule)) => DisplayView::Ready {
            rows: display_rows(schedule, local_hour),
        },
        Some(Snapshot::Failed { error }) => DisplayView::Error {
            error: error.clone(),
            stale: feed
                .last_good
                .as_ref()
                .map(|schedule| display_rows(schedule, local_hour)),
        },
    }
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_snapshot(state: web::Data<AppState>) -> HttpResponse {
    match state.feed.lock() {
        Ok(feed) => match &feed.latest {
            Some(snapshot) => {
                debug!("Snapshot requested (error: {})", snapshot.is_error());
                HttpResponse::Ok().json(ApiResponse::success(snapshot))
            }
            None => HttpResponse::ServiceUnavailable()
                .json(ApiResponse::<Snapshot>::error("No data fetched yet".to_string())),
        },
        Err(e) => {
            error!("Failed to lock feed state: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<Snapshot>::error("Failed to retrieve snapshot".to_string()))
        }
    }
}

async fn get_display(state: web::Data<AppState>) -> HttpResponse {
    let local_hour = Utc::now().with_timezone(&state.timezone).hour();
    match state.feed.lock() {
        Ok(feed) => HttpResponse::Ok().json(ApiResponse::success(display_view(&feed, local_hour))),
        Err(e) => {
            error!("Failed to lock feed state: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<DisplayView>::error("Failed to retrieve display".to_string()))
        }
    }
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    info!("Manual refresh requested");
    state.refresh.notify_one();
    HttpResponse::Accepted().json(ApiResponse::success("Refresh scheduled"))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let (last_attempt, last_success) = match state.feed.lock() {
        Ok(feed) => (feed.last_attempt, feed.last_success),
        Err(_) => (None, None),
    };
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "transit-kiosk",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": current_timestamp(),
        "last_attempt": last_attempt,
        "last_success": last_success,
    }))
}

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/api")
            .route("/snapshot", web::get().to(get_snapshot))
            .route("/display", web::get().to(get_display))
            .route("/refresh", web::post().to(force_refresh)),
    );
}

// ============================================================================
// Background Task
// ============================================================================

/// Runs a cycle on every tick and on every manual refresh. A manual refresh
/// restarts the interval; an in-flight cycle always runs to completion.
async fn data_refresh_task(
    state: AppState,
    client: MbtaClient,
    routes: Arc<Vec<RouteConfig>>,
    every: Duration,
) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => debug!("Auto-refreshing predictions"),
            _ = state.refresh.notified() => {
                debug!("Running manual refresh");
                interval.reset();
            }
        }

        let snapshot = fetch_snapshot_now(&client, &routes).await;
        let at = current_timestamp();
        let failed = snapshot.is_error();
        match state.feed.lock() {
            Ok(mut feed) => feed.record(snapshot, at),
            Err(e) => {
                error!("Failed to lock feed state: {}", e);
                continue;
            }
        }
        if failed {
            warn!("Refresh failed at {}", format_timestamp(at, state.timezone));
        } else {
            info!("Refresh completed at {}", format_timestamp(at, state.timezone));
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: AppConfig, client: MbtaClient) -> std::io::Result<()> {
    let app_state = AppState::new(config.timezone);

    let refresh_state = app_state.clone();
    let routes = Arc::new(config.routes.clone());
    let every = config.refresh_interval;
    tokio::spawn(async move {
        data_refresh_task(refresh_state, client, routes, every).await;
    });

    info!("Server running on http://{}:{}", config.bind, config.port);
    info!("Auto-refresh every {}s", config.refresh_interval.as_secs());

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure_routes)
    })
    .bind((config.bind.as_str(), config.port))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let client = MbtaClient::new(&config.base_url, config.api_key.clone(), config.request_timeout)
        .context("failed to build HTTP client")?;
    info!(
        "Monitoring {} routes against {} ({})",
        config.routes.len(),
        config.base_url,
        if client.has_api_key() { "with API key" } else { "unauthenticated" }
    );

    actix_web::rt::System::new()
        .block_on(run_server(config, client))
        .context("server exited with error")
}
