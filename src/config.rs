// Process configuration and the static list of monitored routes

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::error::ConfigError;

pub const DEFAULT_ROUTES_PATH: &str = "resources/routes.config.json";
pub const DEFAULT_CREDENTIALS_PATH: &str = "resources/credentials.json";
pub const DEFAULT_BASE_URL: &str = "https://api-v3.mbta.com";
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REFRESH_SECS: u64 = 30;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::New_York;

/// One monitored stop + direction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub stop_id: String,
    pub direction: u8,
    pub wait_start: i64,
    pub wait_length: i64,
    pub morning: bool,
    /// Only keep predictions for this route id; a stop can serve several routes.
    #[serde(default, rename = "route", deserialize_with = "string_or_number")]
    pub route_filter: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "mbtaKey")]
    mbta_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub routes: Vec<RouteConfig>,
    pub api_key: Option<String>,
    pub base_url: String,
    pub bind: String,
    pub port: u16,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    pub timezone: Tz,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let routes_path = env::var("TRANSIT_KIOSK_ROUTES")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROUTES_PATH));
        let credentials_path = env::var("TRANSIT_KIOSK_CREDENTIALS")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_PATH));

        let routes = load_routes(&routes_path)?;
        if routes.is_empty() {
            warn!("No routes configured in {}", routes_path.display());
        } else {
            info!("Loaded {} routes from {}", routes.len(), routes_path.display());
        }

        let api_key = env::var("MBTA_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| load_api_key(&credentials_path));
        if api_key.is_none() {
            warn!("Missing API key, making calls without key");
        }

        let base_url = env::var("MBTA_API_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let bind = env::var("TRANSIT_KIOSK_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let port = env::var("TRANSIT_KIOSK_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let refresh_secs = env::var("TRANSIT_KIOSK_REFRESH_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_REFRESH_SECS);
        let timeout_secs = env::var("TRANSIT_KIOSK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let timezone = match env::var("TRANSIT_KIOSK_TIMEZONE") {
            Ok(name) => name
                .parse::<Tz>()
                .map_err(|e| ConfigError::Invalid(format!("unknown timezone {:?}: {}", name, e)))?,
            Err(_) => DEFAULT_TIMEZONE,
        };

        Ok(AppConfig {
            routes,
            api_key,
            base_url,
            bind,
            port,
            refresh_interval: Duration::from_secs(refresh_secs),
            request_timeout: Duration::from_secs(timeout_secs),
            timezone,
        })
    }
}

pub fn load_routes(path: &Path) -> Result<Vec<RouteConfig>, ConfigError> {
    let body = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_routes(&body).map_err(|e| match e {
        RoutesParseError::Json(source) => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        RoutesParseError::Invalid(reason) => ConfigError::Invalid(reason),
    })
}

enum RoutesParseError {
    Json(serde_json::Error),
    Invalid(String),
}

fn parse_routes(body: &str) -> Result<Vec<RouteConfig>, RoutesParseError> {
    let file: RoutesFile = serde_json::from_str(body).map_err(RoutesParseError::Json)?;
    validate_routes(&file.routes).map_err(RoutesParseError::Invalid)?;
    Ok(file.routes)
}

pub fn validate_routes(routes: &[RouteConfig]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for route in routes {
        if route.id.trim().is_empty() {
            return Err("route with empty id".to_string());
        }
        if route.stop_id.trim().is_empty() {
            return Err(format!("route {:?} has an empty stop_id", route.id));
        }
        if route.direction > 1 {
            return Err(format!(
                "route {:?} has direction {}, expected 0 or 1",
                route.id, route.direction
            ));
        }
        if !seen.insert(route.id.as_str()) {
            return Err(format!("duplicate route id {:?}", route.id));
        }
    }
    Ok(())
}

/// A missing or broken credentials file is not fatal; the caller logs and goes on without a key.
fn load_api_key(path: &Path) -> Option<String> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) => {
            warn!("Could not read credentials {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<CredentialsFile>(&body) {
        Ok(creds) => creds.mbta_key.filter(|k| !k.trim().is_empty()),
        Err(e) => {
            warn!("Could not parse credentials {}: {}", path.display(), e);
            None
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Str(s)) if s.is_empty() => None,
        Some(Raw::Str(s)) => Some(s),
        Some(Raw::Num(n)) => Some(n.to_string()),
        None => None,
    })
}
