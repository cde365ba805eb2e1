// Client and JSON:API document model for the MBTA v3 predictions endpoint
// API reference: https://api-v3.mbta.com/docs/swagger/index.html
//
// Endpoint used:
// - Predictions: GET /predictions?filter[stop]=..&filter[direction_id]=..&sort=arrival_time&include=stop,route

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::RouteConfig;
use crate::error::UpstreamError;

// ============================================================================
// Document Model
// ============================================================================

/// One predictions response. `data` is `None` when the member is absent or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionDocument {
    #[serde(default)]
    pub data: Option<Vec<PredictionResource>>,
    #[serde(default)]
    pub included: Vec<IncludedResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResource {
    pub id: String,
    #[serde(default)]
    pub attributes: PredictionAttributes,
    #[serde(default)]
    pub relationships: Option<PredictionRelationships>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionAttributes {
    #[serde(default)]
    pub arrival_time: Option<String>,
    #[serde(default)]
    pub departure_time: Option<String>,
    #[serde(default)]
    pub direction_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRelationships {
    #[serde(default)]
    pub route: Option<Relationship>,
    #[serde(default)]
    pub stop: Option<Relationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub data: Option<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A related resource from the `included` side-table. Attributes differ per type,
/// so they stay untyped until a selector reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludedResource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RouteAttributes {
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub text_color: Option<String>,
    #[serde(default)]
    pub direction_destinations: Vec<Option<String>>,
    #[serde(default)]
    pub direction_names: Vec<Option<String>>,
}

impl PredictionResource {
    pub fn route_id(&self) -> Option<&str> {
        self.relationships
            .as_ref()?
            .route
            .as_ref()?
            .data
            .as_ref()
            .map(|r| r.id.as_str())
    }
}

impl IncludedResource {
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name")?.as_str()
    }

    pub fn route_attributes(&self) -> Result<RouteAttributes, serde_json::Error> {
        RouteAttributes::deserialize(&self.attributes)
    }
}

// ============================================================================
// Selectors
// ============================================================================

/// Minutes from `now` until each record's arrival, in record order.
/// Records without a parseable arrival time (e.g. departure-only first stops) are skipped.
pub fn select_arrivals(records: &[PredictionResource], now: DateTime<Utc>) -> Vec<i64> {
    records
        .iter()
        .filter_map(|record| {
            let raw = record.attributes.arrival_time.as_deref()?;
            match DateTime::parse_from_rfc3339(raw) {
                Ok(arrival) => Some(minutes_until(arrival.with_timezone(&Utc), now)),
                Err(e) => {
                    trace!("Skipping prediction {} with bad arrival_time {:?}: {}", record.id, raw, e);
                    None
                }
            }
        })
        .collect()
}

/// Whole minutes, rounded down, so a vehicle 30s away reads as 0.
pub fn minutes_until(arrival: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (arrival - now).num_seconds().div_euclid(60)
}

pub fn select_included<'a>(doc: &'a PredictionDocument, kind: &'a str) -> impl Iterator<Item = &'a IncludedResource> + 'a {
    doc.included.iter().filter(move |r| r.kind == kind)
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionQuery {
    pub stop: String,
    pub direction_id: u8,
    pub sort: &'static str,
    pub include: &'static [&'static str],
}

impl PredictionQuery {
    pub fn for_route(route: &RouteConfig) -> Self {
        PredictionQuery {
            stop: route.stop_id.clone(),
            direction_id: route.direction,
            sort: "arrival_time",
            include: &["stop", "route"],
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("filter[stop]", self.stop.clone()),
            ("filter[direction_id]", self.direction_id.to_string()),
            ("sort", self.sort.to_string()),
            ("include", self.include.join(",")),
        ]
    }
}

/// Anything that can answer a predictions query. `Ok(None)` means the upstream
/// answered but carried no payload.
pub trait PredictionSource: Send + Sync {
    fn fetch_predictions(
        &self,
        query: &PredictionQuery,
    ) -> impl Future<Output = Result<Option<PredictionDocument>, UpstreamError>> + Send;
}

#[derive(Debug, Clone)]
pub struct MbtaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl MbtaClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(MbtaClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl PredictionSource for MbtaClient {
    async fn fetch_predictions(
        &self,
        query: &PredictionQuery,
    ) -> Result<Option<PredictionDocument>, UpstreamError> {
        let url = format!("{}/predictions", self.base_url);

        let mut request = self
            .http
            .get(&url)
            .header("accept", "application/vnd.api+json")
            .query(&query.params());
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await?;
        debug!("Fetched {} bytes of predictions for stop {}", body.len(), query.stop);
        parse_document(&body)
    }
}

/// A `null` body, or one without `data`, decodes to `None`.
pub fn parse_document(body: &[u8]) -> Result<Option<PredictionDocument>, UpstreamError> {
    let doc: Option<PredictionDocument> = serde_json::from_slice(body)?;
    Ok(doc.filter(|d| d.data.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::dev::ServerHandle;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 13, 0, 0).unwrap()
    }

    fn record(id: &str, arrival: Option<&str>) -> PredictionResource {
        serde_json::from_value(json!({
            "id": id,
            "type": "prediction",
            "attributes": { "arrival_time": arrival, "direction_id": 0 }
        }))
        .unwrap()
    }

    #[test]
    fn test_select_arrivals_converts_and_skips_missing() {
        let records = vec![
            record("a", Some("2024-03-04T08:01:00-05:00")),
            record("b", None),
            record("c", Some("2024-03-04T08:15:30-05:00")),
            record("d", Some("2024-03-04T07:59:30-05:00")),
            record("e", Some("not a time")),
        ];
        assert_eq!(select_arrivals(&records, now()), vec![1, 15, -1]);
    }

    #[test]
    fn test_minutes_until_rounds_down() {
        let n = now();
        assert_eq!(minutes_until(n + chrono::Duration::seconds(59), n), 0);
        assert_eq!(minutes_until(n + chrono::Duration::seconds(60), n), 1);
        assert_eq!(minutes_until(n - chrono::Duration::seconds(1), n), -1);
    }

    #[test]
    fn test_select_included_by_type() {
        let doc: PredictionDocument = serde_json::from_value(json!({
            "data": [],
            "included": [
                { "id": "77", "type": "route", "attributes": { "color": "FFC72C" } },
                { "id": "2168", "type": "stop", "attributes": { "name": "Mass Ave @ Beech St" } },
            ]
        }))
        .unwrap();

        let stops: Vec<_> = select_included(&doc, "stop").collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].name(), Some("Mass Ave @ Beech St"));

        let route = select_included(&doc, "route").next().unwrap().route_attributes().unwrap();
        assert_eq!(route.color.as_deref(), Some("FFC72C"));
        assert!(route.direction_names.is_empty());
        assert_eq!(select_included(&doc, "trip").count(), 0);
    }

    #[test]
    fn test_route_id_from_relationships() {
        let with: PredictionResource = serde_json::from_value(json!({
            "id": "p1",
            "relationships": { "route": { "data": { "id": "Red", "type": "route" } } }
        }))
        .unwrap();
        assert_eq!(with.route_id(), Some("Red"));
        assert_eq!(record("p2", None).route_id(), None);
    }

    #[test]
    fn test_parse_document_null_and_missing_data() {
        assert_eq!(parse_document(b"null").unwrap(), None);
        assert_eq!(parse_document(br#"{"included": []}"#).unwrap(), None);
        assert!(parse_document(br#"{"data": []}"#).unwrap().is_some());
        assert!(matches!(parse_document(b"<html>"), Err(UpstreamError::Decode(_))));
    }

    #[test]
    fn test_query_params() {
        let route: RouteConfig = serde_json::from_value(json!({
            "id": "red-am", "stop_id": "place-davis", "direction": 1,
            "wait_start": 5, "wait_length": 3, "morning": true
        }))
        .unwrap();
        let params = PredictionQuery::for_route(&route).params();
        assert_eq!(
            params,
            vec![
                ("filter[stop]", "place-davis".to_string()),
                ("filter[direction_id]", "1".to_string()),
                ("sort", "arrival_time".to_string()),
                ("include", "stop,route".to_string()),
            ]
        );
    }

    /// Stands in for the predictions endpoint. Stop "busy" is rate limited, stop "empty"
    /// answers `null`; anything else echoes the request back as an included resource.
    async fn fake_predictions(req: HttpRequest, query: web::Query<HashMap<String, String>>) -> HttpResponse {
        let stop = query.get("filter[stop]").cloned().unwrap_or_default();
        match stop.as_str() {
            "busy" => HttpResponse::TooManyRequests().finish(),
            "empty" => HttpResponse::Ok().content_type("application/vnd.api+json").body("null"),
            _ => {
                let header = |name: &str| {
                    req.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from)
                };
                HttpResponse::Ok().json(json!({
                    "data": [],
                    "included": [{
                        "id": "echo",
                        "type": "echo",
                        "attributes": {
                            "accept": header("accept"),
                            "api_key": header("x-api-key"),
                            "query": query.into_inner(),
                        }
                    }]
                }))
            }
        }
    }

    fn start_upstream() -> std::io::Result<(String, ServerHandle)> {
        let server = HttpServer::new(|| App::new().route("/predictions", web::get().to(fake_predictions)))
            .workers(1)
            .bind(("127.0.0.1", 0))?;
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        Ok((format!("http://{}", addr), handle))
    }

    fn query_for(stop: &str) -> PredictionQuery {
        PredictionQuery {
            stop: stop.to_string(),
            direction_id: 1,
            sort: "arrival_time",
            include: &["stop", "route"],
        }
    }

    #[actix_web::test]
    async fn test_client_sends_query_and_headers() {
        let (base, handle) = start_upstream().unwrap();

        let keyed = MbtaClient::new(&format!("{}/", base), Some("secret".to_string()), Duration::from_secs(5)).unwrap();
        let doc = keyed.fetch_predictions(&query_for("place-davis")).await.unwrap().expect("document");
        let echo = &select_included(&doc, "echo").next().unwrap().attributes;
        assert_eq!(echo["accept"], "application/vnd.api+json");
        assert_eq!(echo["api_key"], "secret");
        assert_eq!(echo["query"]["filter[stop]"], "place-davis");
        assert_eq!(echo["query"]["filter[direction_id]"], "1");
        assert_eq!(echo["query"]["sort"], "arrival_time");
        assert_eq!(echo["query"]["include"], "stop,route");

        let anonymous = MbtaClient::new(&base, None, Duration::from_secs(5)).unwrap();
        let doc = anonymous.fetch_predictions(&query_for("place-davis")).await.unwrap().expect("document");
        let echo = &select_included(&doc, "echo").next().unwrap().attributes;
        assert!(echo["api_key"].is_null());

        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_client_maps_rate_limit_and_null_body() {
        let (base, handle) = start_upstream().unwrap();
        let client = MbtaClient::new(&base, None, Duration::from_secs(5)).unwrap();

        let err = client.fetch_predictions(&query_for("busy")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 429 }));

        let doc = client.fetch_predictions(&query_for("empty")).await.unwrap();
        assert_eq!(doc, None);

        handle.stop(true).await;
    }
}
