//! Accessory server.
//!
//! Publishes an [`AccessorySet`] over HTTP using the HAP-IP resource layout:
//!
//! - `GET /accessories` returns the attribute database
//! - `GET /characteristics?id=<aid>.<iid>,...` reads values
//! - `PUT /characteristics` forwards writes to the dispatch loop
//!
//! Writes never touch the accessory values; they become
//! [`AccessoryCommand`]s and the values follow the device state reported
//! back on the bus.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AccessoryCommand, AccessoryError, AccessorySet, BridgeStore, CharacteristicChange,
    CharacteristicKind,
};
use crate::config::HomekitConfig;

const HAP_JSON: &str = "application/hap+json";

const STATUS_OK: i32 = 0;
const STATUS_COMMUNICATION_FAILURE: i32 = -70402;
const STATUS_READ_ONLY: i32 = -70404;
const STATUS_WRITE_ONLY: i32 = -70405;
const STATUS_NOT_FOUND: i32 = -70409;
const STATUS_INVALID_VALUE: i32 = -70410;

/// Something that can publish an accessory set to controllers.
///
/// At most one set is published at a time: the caller stops the running
/// instance before starting the next one.
pub trait AccessoryTransport: Send + Sync + 'static {
    /// Handle to a running publication.
    type Running: Send + 'static;

    /// Start publishing `set`.
    fn start(
        &self,
        set: AccessorySet,
    ) -> impl Future<Output = Result<Self::Running, AccessoryError>> + Send;

    /// Stop a running publication and wait until it has fully stopped.
    fn stop(
        &self,
        running: Self::Running,
    ) -> impl Future<Output = Result<(), AccessoryError>> + Send;
}

/// Settings of the HTTP accessory server.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub listen: SocketAddr,
    /// Setup code, recorded with the stored bridge data. Not checked.
    pub pin: String,
    pub storage_path: PathBuf,
}

impl From<&HomekitConfig> for HttpTransportConfig {
    fn from(config: &HomekitConfig) -> Self {
        Self {
            listen: config.listen,
            pin: config.pin.clone(),
            storage_path: config.storage_path.clone(),
        }
    }
}

/// Accessory transport serving HAP-style JSON over HTTP.
///
/// The server does no pairing: requests are not authenticated and the
/// setup code is only written to `bridge.json` in the storage directory,
/// where a pairing front end can pick it up.
#[derive(Debug)]
pub struct HttpAccessoryTransport {
    config: HttpTransportConfig,
    store: BridgeStore,
    commands: mpsc::UnboundedSender<AccessoryCommand>,
}

impl HttpAccessoryTransport {
    pub fn new(
        config: HttpTransportConfig,
        commands: mpsc::UnboundedSender<AccessoryCommand>,
    ) -> Self {
        let store = BridgeStore::new(config.storage_path.clone());
        Self {
            config,
            store,
            commands,
        }
    }
}

/// A running accessory server.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    config_number: u32,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config_number(&self) -> u32 {
        self.config_number
    }
}

impl AccessoryTransport for HttpAccessoryTransport {
    type Running = RunningServer;

    async fn start(&self, set: AccessorySet) -> Result<RunningServer, AccessoryError> {
        let stored = self.store.bump(&self.config.pin)?;

        let addr = self.config.listen;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| AccessoryError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| AccessoryError::Bind { addr, source })?;

        let accessories = set.len();
        let router = create_router(AppState {
            set: Arc::new(set),
            commands: self.commands.clone(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(
            addr = %local_addr,
            accessories,
            config_number = stored.config_number,
            "Accessory server started"
        );

        Ok(RunningServer {
            local_addr,
            config_number: stored.config_number,
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn stop(&self, running: RunningServer) -> Result<(), AccessoryError> {
        let addr = running.local_addr;
        let _ = running.shutdown.send(());

        match running.task.await {
            Ok(Ok(())) => {
                info!(addr = %addr, "Accessory server stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(AccessoryError::Task(e.to_string())),
            Err(e) => Err(AccessoryError::Task(e.to_string())),
        }
    }
}

/// State shared across handlers.
#[derive(Clone)]
struct AppState {
    set: Arc<AccessorySet>,
    commands: mpsc::UnboundedSender<AccessoryCommand>,
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accessories", get(accessories_handler))
        .route(
            "/characteristics",
            get(read_characteristics_handler).put(write_characteristics_handler),
        )
        .with_state(state)
}

fn hap_json(status: StatusCode, body: &impl Serialize) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, [(CONTENT_TYPE, HAP_JSON)], bytes).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn accessories_handler(State(state): State<AppState>) -> Response {
    hap_json(
        StatusCode::OK,
        &serde_json::json!({ "accessories": state.set.describe() }),
    )
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    id: String,
}

#[derive(Debug, Serialize)]
struct CharacteristicResult {
    aid: u64,
    iid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<i32>,
}

#[derive(Debug, Serialize)]
struct CharacteristicResults {
    characteristics: Vec<CharacteristicResult>,
}

impl CharacteristicResults {
    /// 200/204 when everything succeeded, 207 with per-entry status
    /// otherwise.
    fn respond(mut self, success: StatusCode) -> Response {
        let failed = self
            .characteristics
            .iter()
            .any(|c| c.status.is_some_and(|s| s != STATUS_OK));

        if !failed {
            if success == StatusCode::NO_CONTENT {
                return StatusCode::NO_CONTENT.into_response();
            }
            for entry in &mut self.characteristics {
                entry.status = None;
            }
            return hap_json(success, &self);
        }

        for entry in &mut self.characteristics {
            entry.status.get_or_insert(STATUS_OK);
        }
        hap_json(StatusCode::MULTI_STATUS, &self)
    }
}

fn parse_id(id: &str) -> Option<(u64, u64)> {
    let (aid, iid) = id.trim().split_once('.')?;
    Some((aid.parse().ok()?, iid.parse().ok()?))
}

async fn read_characteristics_handler(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let mut ids = Vec::new();
    for id in query.id.split(',') {
        match parse_id(id) {
            Some(id) => ids.push(id),
            None => return StatusCode::BAD_REQUEST.into_response(),
        }
    }

    let characteristics = ids
        .into_iter()
        .map(|(aid, iid)| {
            let kind = CharacteristicKind::from_iid(iid);
            let result = |value: Option<Value>, status: i32| CharacteristicResult {
                aid,
                iid,
                value,
                status: Some(status),
            };
            match (state.set.get(aid), kind) {
                (Some(accessory), Some(kind)) if accessory.has_characteristic(kind) => {
                    match accessory.read(kind) {
                        Some(value) => result(Some(value), STATUS_OK),
                        None => result(None, STATUS_WRITE_ONLY),
                    }
                }
                _ => result(None, STATUS_NOT_FOUND),
            }
        })
        .collect();

    CharacteristicResults { characteristics }.respond(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    characteristics: Vec<WriteEntry>,
}

#[derive(Debug, Deserialize)]
struct WriteEntry {
    aid: u64,
    iid: u64,
    #[serde(default)]
    value: Option<Value>,
}

async fn write_characteristics_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request: WriteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed characteristics write");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let characteristics = request
        .characteristics
        .into_iter()
        .map(|entry| {
            let status = write_one(&state, &entry);
            CharacteristicResult {
                aid: entry.aid,
                iid: entry.iid,
                value: None,
                status: Some(status),
            }
        })
        .collect();

    CharacteristicResults { characteristics }.respond(StatusCode::NO_CONTENT)
}

fn write_one(state: &AppState, entry: &WriteEntry) -> i32 {
    let Some(accessory) = state.set.get(entry.aid) else {
        return STATUS_NOT_FOUND;
    };
    let Some(kind) = CharacteristicKind::from_iid(entry.iid) else {
        return STATUS_NOT_FOUND;
    };
    if !accessory.has_characteristic(kind) {
        return STATUS_NOT_FOUND;
    }
    // Event registration only; notifications are not sent.
    let Some(value) = &entry.value else {
        return STATUS_OK;
    };

    if kind == CharacteristicKind::Identify {
        info!(accessory = %accessory.info().name, "Identify requested");
        return STATUS_OK;
    }
    if !kind.is_writable() {
        return STATUS_READ_ONLY;
    }
    let Some(change) = CharacteristicChange::from_value(kind, value) else {
        return STATUS_INVALID_VALUE;
    };

    let command = AccessoryCommand {
        accessory: Arc::clone(accessory),
        change,
    };
    match state.commands.send(command) {
        Ok(()) => STATUS_OK,
        Err(_) => {
            warn!(accessory = %accessory.info().name, "Dispatch loop gone, dropping write");
            STATUS_COMMUNICATION_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{Accessory, AccessoryInfo, BRIDGE_AID};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_set() -> AccessorySet {
        let bridge = Arc::new(Accessory::bridge(AccessoryInfo {
            name: "Bridge".to_string(),
            ..AccessoryInfo::default()
        }));
        let lamp = Arc::new(Accessory::lightbulb(AccessoryInfo {
            name: "lamp".to_string(),
            serial_number: "0x0000000000000002".to_string(),
            id: 2,
            ..AccessoryInfo::default()
        }));
        lamp.set_on(true);
        lamp.set_brightness(40);
        AccessorySet::new(bridge, vec![lamp])
    }

    fn make_router() -> (Router, mpsc::UnboundedReceiver<AccessoryCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = create_router(AppState {
            set: Arc::new(make_set()),
            commands: tx,
        });
        (router, rx)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put(body: &str) -> Request<Body> {
        Request::put("/characteristics")
            .header(CONTENT_TYPE, HAP_JSON)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_accessories_endpoint() {
        let (router, _rx) = make_router();
        let response = router
            .oneshot(Request::get("/accessories").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), HAP_JSON);

        let json = body_json(response).await;
        let accessories = json["accessories"].as_array().unwrap();
        assert_eq!(accessories.len(), 2);
        assert_eq!(accessories[0]["aid"], BRIDGE_AID);
        assert_eq!(accessories[1]["services"][1]["characteristics"][0]["value"], true);
    }

    #[tokio::test]
    async fn test_read_characteristics() {
        let (router, _rx) = make_router();
        let response = router
            .oneshot(
                Request::get("/characteristics?id=2.9,2.10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["characteristics"][0]["value"], true);
        assert_eq!(json["characteristics"][1]["value"], 40);
        assert!(json["characteristics"][0].get("status").is_none());
    }

    #[tokio::test]
    async fn test_read_unknown_characteristic() {
        let (router, _rx) = make_router();
        let response = router
            .oneshot(
                Request::get("/characteristics?id=1.9,2.5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
        let json = body_json(response).await;
        assert_eq!(json["characteristics"][0]["status"], STATUS_NOT_FOUND);
        assert_eq!(json["characteristics"][1]["status"], STATUS_OK);
        assert_eq!(json["characteristics"][1]["value"], "lamp");
    }

    #[tokio::test]
    async fn test_write_forwards_command_without_changing_value() {
        let (router, mut rx) = make_router();
        let response = router
            .oneshot(put(r#"{"characteristics":[{"aid":2,"iid":9,"value":false}]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let command = rx.recv().await.unwrap();
        assert_eq!(command.change, CharacteristicChange::On(false));
        assert_eq!(command.accessory.info().name, "lamp");
        // Local value only follows reported state.
        assert!(command.accessory.values().on);
    }

    #[tokio::test]
    async fn test_write_rejections() {
        let (router, mut rx) = make_router();
        let response = router
            .oneshot(put(
                r#"{"characteristics":[
                    {"aid":2,"iid":5,"value":"renamed"},
                    {"aid":2,"iid":10,"value":500},
                    {"aid":9,"iid":9,"value":true}
                ]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
        let json = body_json(response).await;
        assert_eq!(json["characteristics"][0]["status"], STATUS_READ_ONLY);
        assert_eq!(json["characteristics"][1]["status"], STATUS_INVALID_VALUE);
        assert_eq!(json["characteristics"][2]["status"], STATUS_NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_write() {
        let (router, _rx) = make_router();
        let response = router.oneshot(put("{ nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = HttpAccessoryTransport::new(
            HttpTransportConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                pin: "11223399".to_string(),
                storage_path: dir.path().join("db"),
            },
            tx,
        );

        let running = transport.start(make_set()).await.unwrap();
        assert_eq!(running.config_number(), 1);
        assert_ne!(running.local_addr().port(), 0);
        transport.stop(running).await.unwrap();

        let running = transport.start(make_set()).await.unwrap();
        assert_eq!(running.config_number(), 2);
        transport.stop(running).await.unwrap();

        // The setup code is recorded for pairing front ends.
        let stored = BridgeStore::new(dir.path().join("db")).load().unwrap().unwrap();
        assert_eq!(stored.pin, "11223399");
        assert_eq!(stored.config_number, 2);
    }
}
