use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::backend::CommandWriter;
use crate::commands::{Command, CommandError, Dispatcher};
use crate::scheduler::{WatchdogEvent, WatchdogHandle};
use crate::state::{Sample, SharedState};

const INDEX_HTML: &str = include_str!("ui/index.html");

const CSV_HEADER: &str = "Timestamp,Temperature (C),Humidity (%)\n";

pub struct AppState<W> {
    pub shared: SharedState,
    pub watchdog: WatchdogHandle,
    pub dispatcher: Arc<Dispatcher<W>>,
}

impl<W> Clone for AppState<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            watchdog: self.watchdog.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<W>(state: AppState<W>) -> Router
where
    W: CommandWriter + Clone + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status::<W>))
        .route("/api/online", get(api_online::<W>))
        .route("/api/command/{action}", post(api_command::<W>))
        .route("/api/visibility", post(api_visibility::<W>))
        .route("/api/export.csv", get(api_export_csv::<W>))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

/// Polls may carry the tab's id and visibility; each one renews that
/// tab's viewer lease.
#[derive(Deserialize)]
struct StatusQuery {
    client: Option<u64>,
    visible: Option<bool>,
}

async fn api_status<W>(
    State(state): State<AppState<W>>,
    Query(q): Query<StatusQuery>,
) -> impl IntoResponse {
    if let Some(client) = q.client {
        state
            .watchdog
            .send(WatchdogEvent::Visibility {
                client,
                visible: q.visible.unwrap_or(true),
            })
            .await;
    }
    let st = state.shared.read().await;
    Json(st.to_status())
}

/// Cheap check that skips the view model and reads the published verdict.
async fn api_online<W>(State(state): State<AppState<W>>) -> impl IntoResponse {
    Json(serde_json::json!({ "online": state.watchdog.is_online() }))
}

async fn api_command<W>(
    State(state): State<AppState<W>>,
    Path(action): Path<String>,
) -> Response
where
    W: CommandWriter + Clone + 'static,
{
    let result = match action.parse::<Command>() {
        Ok(command) => state.dispatcher.dispatch(command).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => (StatusCode::ACCEPTED, "ok").into_response(),
        Err(e) => (command_status(&e), e.to_string()).into_response(),
    }
}

fn command_status(err: &CommandError) -> StatusCode {
    match err {
        CommandError::Unknown(_) => StatusCode::BAD_REQUEST,
        CommandError::DeviceOffline => StatusCode::CONFLICT,
        CommandError::Write(_) => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Deserialize)]
struct VisibilityReq {
    #[serde(default)]
    client: u64,
    visible: bool,
}

async fn api_visibility<W>(
    State(state): State<AppState<W>>,
    Json(req): Json<VisibilityReq>,
) -> StatusCode {
    state
        .watchdog
        .send(WatchdogEvent::Visibility {
            client: req.client,
            visible: req.visible,
        })
        .await;
    StatusCode::NO_CONTENT
}

async fn api_export_csv<W>(State(state): State<AppState<W>>) -> Response {
    let body = {
        let st = state.shared.read().await;
        render_csv(st.history.iter())
    };
    let filename = format!(
        "attachment; filename=\"sensor_data_{}.csv\"",
        OffsetDateTime::now_utc().date()
    );
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, filename),
        ],
        body,
    )
        .into_response()
}

fn render_csv<'a>(samples: impl Iterator<Item = &'a Sample>) -> String {
    let mut out = String::from(CSV_HEADER);
    for s in samples {
        let ts = s.ts.format(&Rfc3339).unwrap_or_default();
        let _ = writeln!(
            out,
            "{ts},{},{}",
            csv_reading(s.temperature),
            csv_reading(s.moisture)
        );
    }
    out
}

fn csv_reading(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<W>(state: AppState<W>, port: u16) -> Result<()>
where
    W: CommandWriter + Clone + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web ui listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SensorMsg;
    use crate::publisher::{ControlSurface, Verdict};
    use crate::state::DashboardState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct FakeWriter {
        writes: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl CommandWriter for FakeWriter {
        async fn write_action(&self, action: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("broker unavailable");
            }
            self.writes.lock().unwrap().push(action.to_string());
            Ok(())
        }
    }

    struct Harness {
        app: Router,
        shared: SharedState,
        writer: FakeWriter,
        events: mpsc::Receiver<WatchdogEvent>,
    }

    fn harness(writer: FakeWriter) -> Harness {
        let shared = DashboardState::shared();
        let (watchdog, events) = WatchdogHandle::detached();
        let dispatcher = Arc::new(Dispatcher::new(
            writer.clone(),
            Arc::clone(&shared),
            Duration::from_millis(900),
        ));
        let app = router(AppState {
            shared: Arc::clone(&shared),
            watchdog,
            dispatcher,
        });
        Harness {
            app,
            shared,
            writer,
            events,
        }
    }

    async fn go_online(shared: &SharedState) {
        let mut st = shared.write().await;
        st.verdict = Verdict::Online;
        st.unlock_controls();
    }

    async fn body_string(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index_serves_html() {
        let h = harness(FakeWriter::default());
        let resp = h
            .app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(ct.starts_with("text/html"));
    }

    #[tokio::test]
    async fn status_reports_pending_and_locked() {
        let h = harness(FakeWriter::default());
        let resp = h
            .app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["verdict"], "pending");
        assert_eq!(json["online"], false);
        assert_eq!(json["controls_locked"], true);
    }

    #[tokio::test]
    async fn online_endpoint_reads_published_verdict() {
        let h = harness(FakeWriter::default());
        let resp = h
            .app
            .oneshot(Request::get("/api/online").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["online"], false);
    }

    #[tokio::test]
    async fn command_rejected_while_offline() {
        let h = harness(FakeWriter::default());
        let resp = h.app.oneshot(post_empty("/api/command/start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(h.writer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_accepted_while_online() {
        let h = harness(FakeWriter::default());
        go_online(&h.shared).await;
        let resp = h.app.oneshot(post_empty("/api/command/reboot")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(h.writer.writes.lock().unwrap().first().map(String::as_str), Some("reboot"));
        assert!(h.shared.read().await.controls_locked);
    }

    #[tokio::test]
    async fn unknown_command_is_bad_request() {
        let h = harness(FakeWriter::default());
        go_online(&h.shared).await;
        let resp = h.app.oneshot(post_empty("/api/command/explode")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("explode"));
    }

    #[tokio::test]
    async fn write_failure_is_bad_gateway() {
        let h = harness(FakeWriter {
            fail: true,
            ..FakeWriter::default()
        });
        go_online(&h.shared).await;
        let resp = h.app.oneshot(post_empty("/api/command/stop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(!h.shared.read().await.controls_locked);
    }

    #[tokio::test]
    async fn visibility_is_forwarded_to_watchdog() {
        let mut h = harness(FakeWriter::default());
        let req = Request::post("/api/visibility")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"client":3,"visible":false}"#))
            .unwrap();
        let resp = h.app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            h.events.recv().await,
            Some(WatchdogEvent::Visibility {
                client: 3,
                visible: false
            })
        );
    }

    #[tokio::test]
    async fn status_poll_renews_viewer_lease() {
        let mut h = harness(FakeWriter::default());
        let resp = h
            .app
            .clone()
            .oneshot(
                Request::get("/api/status?client=5&visible=false")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            h.events.recv().await,
            Some(WatchdogEvent::Visibility {
                client: 5,
                visible: false
            })
        );

        // anonymous polls hold no lease
        let resp = h
            .app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn visibility_rejects_bad_body() {
        let h = harness(FakeWriter::default());
        let req = Request::post("/api/visibility")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"visible":"maybe"}"#))
            .unwrap();
        let resp = h.app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn export_csv_lists_history() {
        let h = harness(FakeWriter::default());
        {
            let mut st = h.shared.write().await;
            st.record_sensors(SensorMsg {
                temperature: Some(21.5),
                moisture: Some(40.0),
            });
            st.record_sensors(SensorMsg {
                temperature: None,
                moisture: Some(41.0),
            });
        }
        let resp = h
            .app
            .oneshot(Request::get("/api/export.csv").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("sensor_data_"));
        assert!(disposition.ends_with(".csv\""));

        let body = body_string(resp).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "Timestamp,Temperature (C),Humidity (%)");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(",21.5,40"));
        assert!(lines[2].ends_with(",,41"));
    }
}
