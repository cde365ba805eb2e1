// Fetch/normalize/partition pipeline producing display-ready snapshots

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::RouteConfig;
use crate::error::{error_chain, Result, ScheduleError};
use crate::mbta::{
    select_arrivals, select_included, PredictionDocument, PredictionQuery, PredictionResource,
    PredictionSource,
};

pub const PREDICTIONS_LIMIT: usize = 4;
pub const MIN_ELIGIBLE_MINUTES: i64 = 1;
pub const MAX_ELIGIBLE_MINUTES: i64 = 60;
pub const PAST_ARRIVAL_MINUTES: i64 = 2;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRoute {
    pub id: String,
    pub stop_name: String,
    pub direction: String,
    pub color: String,
    pub text_color: String,
    pub morning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub arrival_mins: Vec<i64>,
    pub is_walkable: bool,
    #[serde(flatten)]
    pub diagnostics: RouteDiagnostics,
}

/// Kept for client-side debugging; not needed to render a route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDiagnostics {
    #[serde(rename = "_pastArrivalMins")]
    pub past_arrival_mins: Vec<i64>,
    #[serde(rename = "_predictions")]
    pub predictions: PredictionDocument,
    #[serde(rename = "_filtered")]
    pub filtered: FilteredPredictions,
}

/// The route-filtered records, shaped like a predictions document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilteredPredictions {
    pub data: Vec<PredictionResource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Schedule {
    pub morning: Vec<NormalizedRoute>,
    pub evening: Vec<NormalizedRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotError {
    pub message: String,
    pub stack: String,
}

/// Result of one cycle: either both buckets or an error marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    Ready(Schedule),
    Failed { error: SnapshotError },
}

impl Snapshot {
    pub fn from_error(err: &ScheduleError) -> Self {
        Snapshot::Failed {
            error: SnapshotError {
                message: err.to_string(),
                stack: error_chain(err),
            },
        }
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        match self {
            Snapshot::Ready(schedule) => Some(schedule),
            Snapshot::Failed { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Snapshot::Failed { .. })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Runs one cycle with `Utc::now()` captured once as the reference time.
pub async fn fetch_snapshot_now<S: PredictionSource>(source: &S, routes: &[RouteConfig]) -> Snapshot {
    fetch_snapshot(source, routes, Utc::now()).await
}

pub async fn fetch_snapshot<S: PredictionSource>(
    source: &S,
    routes: &[RouteConfig],
    now: DateTime<Utc>,
) -> Snapshot {
    debug!("Fetching predictions for {} routes", routes.len());
    match build_schedule(source, routes, now).await {
        Ok(schedule) => {
            info!(
                "Fetched live data: {} morning, {} evening",
                schedule.morning.len(),
                schedule.evening.len()
            );
            Snapshot::Ready(schedule)
        }
        Err(e) => {
            error!("Error during fetch: {}\n{}", e, error_chain(&e));
            Snapshot::from_error(&e)
        }
    }
}

async fn build_schedule<S: PredictionSource>(
    source: &S,
    routes: &[RouteConfig],
    now: DateTime<Utc>,
) -> Result<Schedule> {
    let raw = fetch_all(source, routes).await?;
    let normalized = routes
        .iter()
        .zip(raw)
        .map(|(route, doc)| {
            let doc = doc.ok_or_else(|| ScheduleError::MissingPredictionData {
                route: route.id.clone(),
            })?;
            normalize_route(route, doc, now)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(partition(normalized))
}

/// One request per route, all in flight at once. The first failure fails the batch.
/// Output is index-aligned with `routes`.
pub async fn fetch_all<S: PredictionSource>(
    source: &S,
    routes: &[RouteConfig],
) -> Result<Vec<Option<PredictionDocument>>> {
    if let Some(route) = routes.iter().find(|r| r.stop_id.trim().is_empty()) {
        return Err(ScheduleError::InvalidRoute {
            reason: format!("route {:?} has an empty stop id", route.id),
        });
    }

    try_join_all(routes.iter().map(|route| async move {
        let query = PredictionQuery::for_route(route);
        source
            .fetch_predictions(&query)
            .await
            .map_err(|source| ScheduleError::UpstreamRequestFailure {
                route: route.id.clone(),
                source,
            })
    }))
    .await
}

pub fn normalize_route(
    route: &RouteConfig,
    doc: PredictionDocument,
    now: DateTime<Utc>,
) -> Result<NormalizedRoute> {
    let records = doc.data.as_deref().ok_or_else(|| ScheduleError::MissingPredictionData {
        route: route.id.clone(),
    })?;

    let filtered: Vec<PredictionResource> = records
        .iter()
        .filter(|record| match &route.route_filter {
            Some(wanted) => record.route_id() == Some(wanted.as_str()),
            None => true,
        })
        .cloned()
        .collect();
    let arrivals = select_arrivals(&filtered, now);

    let malformed = |reason: &str| ScheduleError::MalformedResponse {
        route: route.id.clone(),
        reason: reason.to_string(),
    };
    let stop_name = select_included(&doc, "stop")
        .next()
        .ok_or_else(|| malformed("no included stop record"))?
        .name()
        .ok_or_else(|| malformed("included stop has no name"))?
        .to_string();
    let route_attrs = select_included(&doc, "route")
        .next()
        .ok_or_else(|| malformed("no included route record"))?
        .route_attributes()
        .map_err(|e| malformed(&format!("bad route attributes: {}", e)))?;

    let direction_idx = records.first().and_then(|r| r.attributes.direction_id);
    let direction = direction_label(
        &route_attrs.direction_destinations,
        &route_attrs.direction_names,
        direction_idx,
    );

    let arrival_mins = eligible_arrivals(&arrivals);
    let is_walkable = is_walkable(&arrival_mins, route.wait_start, route.wait_length);
    let past_arrival_mins = arrivals
        .iter()
        .copied()
        .filter(|m| *m <= PAST_ARRIVAL_MINUTES)
        .collect();

    Ok(NormalizedRoute {
        id: route.id.clone(),
        stop_name,
        direction,
        color: route_attrs.color.unwrap_or_default(),
        text_color: route_attrs.text_color.unwrap_or_default(),
        morning: route.morning,
        custom_name: route.custom_name.clone(),
        arrival_mins,
        is_walkable,
        diagnostics: RouteDiagnostics {
            past_arrival_mins,
            predictions: doc,
            filtered: FilteredPredictions { data: filtered },
        },
    })
}

/// Minutes in `[1, 60)`, first four, upstream order kept.
pub fn eligible_arrivals(arrivals: &[i64]) -> Vec<i64> {
    arrivals
        .iter()
        .copied()
        .filter(|m| (MIN_ELIGIBLE_MINUTES..MAX_ELIGIBLE_MINUTES).contains(m))
        .take(PREDICTIONS_LIMIT)
        .collect()
}

/// True iff some minute lies in `[wait_start, wait_start + wait_length]`.
pub fn is_walkable(arrival_mins: &[i64], wait_start: i64, wait_length: i64) -> bool {
    let window = wait_start..=wait_start.saturating_add(wait_length);
    arrival_mins.iter().any(|m| window.contains(m))
}

/// Destination label, then generic direction name, then `""`.
/// Empty strings and out-of-range or absent indexes count as no match.
pub fn direction_label(
    destinations: &[Option<String>],
    names: &[Option<String>],
    index: Option<i64>,
) -> String {
    let Some(idx) = index.and_then(|i| usize::try_from(i).ok()) else {
        return String::new();
    };
    [destinations, names]
        .iter()
        .filter_map(|table| table.get(idx)?.as_deref())
        .find(|label| !label.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Splits by the `morning` flag, keeping relative order in each bucket.
pub fn partition(routes: Vec<NormalizedRoute>) -> Schedule {
    let (morning, evening) = routes.into_iter().partition(|r| r.morning);
    Schedule { morning, evening }
}
