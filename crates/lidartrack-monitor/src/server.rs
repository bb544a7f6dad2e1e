//! [`MonitorServer`] – JSON monitoring endpoint on `axum`.
//!
//! Handlers only read the latest [`SnapshotReader`] snapshot, so a slow
//! client never holds up the frame pipeline.

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::handler::Handler;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use axum::{Json, Router};
use lidartrack_middleware::stats::now_ns;
use lidartrack_runtime::SnapshotReader;
use lidartrack_types::{LidarError, TrackObservation};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Default TCP port for the monitoring endpoint.
pub const DEFAULT_PORT: u16 = 8080;

// ---------------------------------------------------------------------------
// MonitorServer
// ---------------------------------------------------------------------------

pub struct MonitorServer {
    reader: SnapshotReader,
    port: u16,
}

impl MonitorServer {
    pub fn new(reader: SnapshotReader) -> Self {
        Self {
            reader,
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// [`LidarError::Transport`] when the listener cannot bind or the server
    /// fails.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), LidarError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LidarError::Transport(format!("monitor bind error on {addr}: {e}")))?;
        serve(listener, self.reader, shutdown).await
    }
}

/// Serve [`router`] on an already bound listener until `shutdown` is set or
/// its sender goes away.
pub async fn serve(
    listener: TcpListener,
    reader: SnapshotReader,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LidarError> {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "monitor listening");
    axum::serve(listener, router(reader))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| LidarError::Transport(format!("monitor server error: {e}")))?;
    info!("monitor stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(reader: SnapshotReader) -> Router {
    Router::new()
        .route("/api/lidar/health", read_only(health))
        .route("/api/lidar/foreground", read_only(foreground))
        .route("/api/lidar/tracks", read_only(tracks))
        .route("/api/lidar/tracks/:track_id/history", read_only(history))
        .route("/api/lidar/clusters", read_only(clusters))
        .route("/api/lidar/counters", read_only(counters))
        .fallback(unknown_route)
        .with_state(reader)
}

/// `GET` only; other methods get a JSON 405.
fn read_only<H, T>(handler: H) -> MethodRouter<SnapshotReader>
where
    H: Handler<T, SnapshotReader>,
    T: 'static,
{
    get(handler).fallback(method_not_allowed)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    #[error("unknown route")]
    UnknownRoute,
    #[error("unknown track")]
    UnknownTrack,
    #[error("only GET is supported")]
    MethodNotAllowed,
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        match self {
            Self::UnknownRoute | Self::UnknownTrack => (StatusCode::NOT_FOUND, body).into_response(),
            Self::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET")], body).into_response()
            }
        }
    }
}

async fn unknown_route() -> MonitorError {
    MonitorError::UnknownRoute
}

async fn method_not_allowed() -> MonitorError {
    MonitorError::MethodNotAllowed
}

async fn health(State(reader): State<SnapshotReader>) -> impl IntoResponse {
    Json(reader.health(now_ns()))
}

async fn foreground(State(reader): State<SnapshotReader>) -> impl IntoResponse {
    Json(reader.foreground())
}

async fn tracks(State(reader): State<SnapshotReader>) -> impl IntoResponse {
    Json(reader.tracks())
}

async fn clusters(State(reader): State<SnapshotReader>) -> impl IntoResponse {
    Json(reader.clusters())
}

async fn counters(State(reader): State<SnapshotReader>) -> impl IntoResponse {
    Json(reader.counters())
}

/// Raw `stride` so a bad value falls back to 1 instead of a 400.
#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    stride: Option<String>,
}

async fn history(
    State(reader): State<SnapshotReader>,
    Path(track_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<TrackObservation>>, MonitorError> {
    let id = track_id.parse::<Uuid>().map_err(|_| MonitorError::UnknownTrack)?;
    let history = reader.history(&id).ok_or(MonitorError::UnknownTrack)?;
    Ok(Json(downsample(&history, stride(query.stride.as_deref()))))
}

/// Parsed `stride`; absent, zero or unparsable means 1.
pub fn stride(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

/// Every `stride`-th record, always ending with the most recent one.
pub fn downsample(history: &[TrackObservation], stride: usize) -> Vec<TrackObservation> {
    let stride = stride.max(1);
    let mut out: Vec<TrackObservation> = history.iter().step_by(stride).cloned().collect();
    if let Some(last) = history.last()
        && (history.len() - 1) % stride != 0
    {
        out.push(last.clone());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, Request};
    use lidartrack_middleware::IngestStats;
    use lidartrack_runtime::PipelineSnapshot;
    use lidartrack_types::{ForegroundDiagnostics, TrackSnapshot};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    fn observation(track_id: Uuid, i: i64) -> TrackObservation {
        TrackObservation {
            track_id,
            pose_id: "cal-1".into(),
            unix_nanos: i * 100_000_000,
            x: i as f64,
            y: 0.0,
            vx: 10.0,
            vy: 0.0,
            speed_mps: 10.0,
            heading_rad: 0.0,
            bbox_l: 4.0,
            bbox_w: 2.0,
            bbox_h: 1.5,
            points_count: 80,
            height_p95: 1.4,
            intensity_mean: 30.0,
        }
    }

    fn reader() -> (Uuid, watch::Sender<Arc<PipelineSnapshot>>, SnapshotReader) {
        let id = Uuid::new_v4();
        let history: Vec<_> = (0..10).map(|i| observation(id, i)).collect();
        let snapshot = PipelineSnapshot {
            sensor_id: "lidar-01".into(),
            frames_per_sec: 10.0,
            foreground: ForegroundDiagnostics {
                foreground_points: 80,
                background_points: 11_000,
                bins_frozen: 64,
            },
            tracks: vec![TrackSnapshot {
                track_id: id,
                sensor_id: "lidar-01".into(),
                world_frame: "site".into(),
                pose_id: "cal-1".into(),
                unix_nanos: 900_000_000,
                x: 9.0,
                speed_mps: 10.0,
                ..TrackSnapshot::default()
            }],
            histories: HashMap::from([(id, Arc::new(history))]),
            ..PipelineSnapshot::default()
        };
        let (tx, rx) = watch::channel(Arc::new(snapshot));
        (id, tx, SnapshotReader::new(rx, Arc::new(IngestStats::default()), 1_000_000_000))
    }

    async fn send(reader: &SnapshotReader, method: Method, uri: &str) -> (StatusCode, HeaderMap, Value) {
        let response = router(reader.clone())
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(reader: &SnapshotReader, uri: &str) -> (StatusCode, Value) {
        let (status, _, body) = send(reader, Method::GET, uri).await;
        (status, body)
    }

    #[test]
    fn default_port_is_8080() {
        let (_, _tx, r) = reader();
        assert_eq!(MonitorServer::new(r.clone()).port(), DEFAULT_PORT);
        assert_eq!(MonitorServer::new(r).with_port(9999).port(), 9999);
    }

    #[tokio::test]
    async fn health_route() {
        let (_, _tx, r) = reader();
        let (status, v) = get_json(&r, "/api/lidar/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["udp_active"], false);
        assert_eq!(v["bg_bins_frozen"], 64);
        assert_eq!(v["tracks_live"], 1);
    }

    #[tokio::test]
    async fn tracks_and_foreground_routes() {
        let (id, _tx, r) = reader();
        let (_, tracks) = get_json(&r, "/api/lidar/tracks").await;
        assert_eq!(tracks.as_array().unwrap().len(), 1);
        assert_eq!(tracks[0]["track_id"], id.to_string());
        let (_, fg) = get_json(&r, "/api/lidar/foreground").await;
        assert_eq!(fg["foreground_points"], 80);
        let (_, counters) = get_json(&r, "/api/lidar/counters").await;
        assert_eq!(counters["pipeline"]["frames_processed"], 0);
        assert_eq!(counters["ingest"]["packets_received"], 0);
        let (_, clusters) = get_json(&r, "/api/lidar/clusters").await;
        assert!(clusters.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_with_stride_keeps_last() {
        let (id, _tx, r) = reader();
        let xs = |v: Value| -> Vec<f64> {
            v.as_array().unwrap().iter().map(|o| o["x"].as_f64().unwrap()).collect()
        };

        let (status, body) = get_json(&r, &format!("/api/lidar/tracks/{id}/history?stride=4")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(xs(body), vec![0.0, 4.0, 8.0, 9.0]);

        // Percent-encoded value decodes to the same stride.
        let (_, body) = get_json(&r, &format!("/api/lidar/tracks/{id}/history?stride=%34")).await;
        assert_eq!(xs(body), vec![0.0, 4.0, 8.0, 9.0]);

        let (_, full) = get_json(&r, &format!("/api/lidar/tracks/{id}/history")).await;
        assert_eq!(full.as_array().unwrap().len(), 10);
        let (status, garbage) = get_json(&r, &format!("/api/lidar/tracks/{id}/history?stride=abc")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(garbage.as_array().unwrap().len(), 10);
    }

    #[test]
    fn stride_parsing() {
        assert_eq!(stride(None), 1);
        assert_eq!(stride(Some("0")), 1);
        assert_eq!(stride(Some("-3")), 1);
        assert_eq!(stride(Some("5")), 5);
    }

    #[test]
    fn downsample_edges() {
        let id = Uuid::new_v4();
        assert!(downsample(&[], 3).is_empty());
        let h: Vec<_> = (0..7).map(|i| observation(id, i)).collect();
        // Last index already on the stride: no duplicate.
        let xs: Vec<f64> = downsample(&h, 3).iter().map(|o| o.x).collect();
        assert_eq!(xs, vec![0.0, 3.0, 6.0]);
        assert_eq!(downsample(&h, 0).len(), 7);
        assert_eq!(downsample(&h[..1], 5).len(), 1);
    }

    #[tokio::test]
    async fn unknown_routes_and_tracks_are_404() {
        let (_, _tx, r) = reader();
        assert_eq!(get_json(&r, "/").await.0, StatusCode::NOT_FOUND);
        let (status, body) = get_json(&r, "/api/lidar/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown route");

        let (status, body) = get_json(&r, &format!("/api/lidar/tracks/{}/history", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown track");
        assert_eq!(
            get_json(&r, "/api/lidar/tracks/not-a-uuid/history").await.0,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn non_get_is_405() {
        let (_, _tx, r) = reader();
        let (status, headers, body) = send(&r, Method::POST, "/api/lidar/tracks").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(headers[header::ALLOW].to_str().unwrap().contains("GET"));
        assert_eq!(body["error"], "only GET is supported");
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let (_, _tx, r) = reader();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, r, stop_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /api/lidar/health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.to_ascii_lowercase().contains("content-type: application/json"));
        let (_, json_body) = raw.split_once("\r\n\r\n").unwrap();
        let v: Value = serde_json::from_str(json_body).unwrap();
        assert_eq!(v["frames_per_sec"], 10.0);

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
