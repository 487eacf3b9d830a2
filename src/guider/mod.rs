//! The Guider Client: a long-lived TCP session to a guiding daemon speaking
//! newline-delimited JSON, modeled on the wire idiom of `ipc::client::DaemonClient`
//! and `ipc::listener` (`tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader}`
//! framing a `\n`-terminated JSON line) but upgraded from taskdaemon's
//! request/response-only Unix socket to a duplex session carrying both RPC
//! responses and out-of-band events, per `original_source`'s PHD2 client
//! (`phd2_client.hpp`'s id-keyed pending-call table and settle-done callback).
//!
//! The spec describes dedicated reader and writer threads; this is encoded
//! here as a single supervisor task using `tokio::select!` over the socket's
//! read half and the outgoing-write channel, which gives the same duplex,
//! non-blocking behavior without splitting the pending-RPC table's ownership
//! across two tasks. See DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub recv_buffer_size: usize,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4400,
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
            recv_buffer_size: 64 * 1024,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuiderState {
    Stopped,
    Looping,
    Calibrating,
    Guiding,
    Settling,
    Paused,
    LostStar,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct GuideStar {
    pub x: f64,
    pub y: f64,
    pub snr: f64,
    pub mass: f64,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct GuideStats {
    pub rms_ra: f64,
    pub rms_dec: f64,
    pub rms_total: f64,
    pub peak_ra: f64,
    pub peak_dec: f64,
    pub samples: u64,
    pub snr: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CalibrationInfo {
    pub complete: bool,
}

/// Snapshot of the client's derived state, read under a lock that is never
/// held across an await point; updates never block event intake.
#[derive(Debug, Clone, Serialize)]
pub struct GuiderSnapshot {
    pub state: GuiderState,
    pub last_star: Option<GuideStar>,
    pub last_stats: Option<GuideStats>,
    pub settling: bool,
    pub calibration: CalibrationInfo,
}

impl Default for GuiderSnapshot {
    fn default() -> Self {
        Self {
            state: GuiderState::Stopped,
            last_star: None,
            last_stats: None,
            settling: false,
            calibration: CalibrationInfo::default(),
        }
    }
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<CoreResult<Value>>>>;
type SettleSlot = Mutex<Option<oneshot::Sender<CoreResult<bool>>>>;

/// A connected session to a guiding daemon.
pub struct GuiderClient {
    config: ConnectionConfig,
    write_tx: mpsc::Sender<String>,
    pending: Arc<PendingTable>,
    settle: Arc<SettleSlot>,
    snapshot: Arc<RwLock<GuiderSnapshot>>,
    session: Arc<Mutex<SessionState>>,
    next_id: Arc<AtomicU64>,
    _supervisor: JoinHandle<()>,
}

impl GuiderClient {
    /// Dial the configured host and start the supervisor task. `bus`, when
    /// given, receives `guider.state` (connection transitions) and
    /// `guider.event` (every parsed event) publications.
    pub async fn connect(config: ConnectionConfig, bus: Option<MessageBus>) -> CoreResult<Self> {
        debug!(host = %config.host, port = config.port, "GuiderClient::connect: called");
        let pending: Arc<PendingTable> = Arc::new(Mutex::new(HashMap::new()));
        let settle: Arc<SettleSlot> = Arc::new(Mutex::new(None));
        let snapshot = Arc::new(RwLock::new(GuiderSnapshot::default()));
        let session = Arc::new(Mutex::new(SessionState::Disconnected));
        let next_id = Arc::new(AtomicU64::new(1));

        let (write_tx, write_rx) = mpsc::channel::<String>(256);

        let first_connect = dial(&config).await?;
        *session.lock().await = SessionState::Connected;

        let supervisor = tokio::spawn(supervise(
            config.clone(),
            first_connect,
            write_rx,
            pending.clone(),
            settle.clone(),
            snapshot.clone(),
            session.clone(),
            bus,
        ));

        Ok(Self {
            config,
            write_tx,
            pending,
            settle,
            snapshot,
            session,
            next_id,
            _supervisor: supervisor,
        })
    }

    pub async fn state(&self) -> SessionState {
        *self.session.lock().await
    }

    pub async fn snapshot(&self) -> GuiderSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Issue an RPC call and await its response, bounded by `rpc_timeout`.
    /// A timeout cancels the pending completion without affecting the
    /// connection; a late response for a canceled id is dropped silently by
    /// the supervisor's lookup miss.
    pub async fn call(&self, method: impl Into<String>, params: Value) -> CoreResult<Value> {
        let method = method.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%method, id, "GuiderClient::call: called");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = serde_json::json!({ "method": method, "params": params, "id": id });
        let line = serde_json::to_string(&request).map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
        self.write_tx
            .send(line)
            .await
            .map_err(|_| CoreError::ConnectionLost("write channel closed".into()))?;

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::ConnectionLost(format!("RPC '{method}' dropped"))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CoreError::Timeout(format!("RPC '{method}' timed out")))
            }
        }
    }

    /// Begin guiding. At most one settle operation may be outstanding; a
    /// concurrent call fails with `InvalidState` (Scenario S4).
    pub async fn start_guiding(&self, params: Value, recalibrate: bool) -> CoreResult<bool> {
        self.run_settling_operation(
            "guide",
            serde_json::json!({ "settle": params, "recalibrate": recalibrate }),
        )
        .await
    }

    pub async fn dither(&self, params: Value) -> CoreResult<bool> {
        self.run_settling_operation("dither", params).await
    }

    async fn run_settling_operation(&self, method: &str, params: Value) -> CoreResult<bool> {
        debug!(%method, "GuiderClient::run_settling_operation: called");
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.settle.lock().await;
            if guard.is_some() {
                return Err(CoreError::InvalidState("a settle operation is already in progress".into()));
            }
            *guard = Some(tx);
        }

        if let Err(e) = self.call(method, params).await {
            self.settle.lock().await.take();
            return Err(e);
        }

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::ConnectionLost("settle completion dropped".into())),
            Err(_) => {
                self.settle.lock().await.take();
                Err(CoreError::Timeout(format!("settle via '{method}' timed out")))
            }
        }
    }
}

async fn dial(config: &ConnectionConfig) -> CoreResult<TcpStream> {
    tokio::time::timeout(config.connect_timeout, TcpStream::connect((config.host.as_str(), config.port)))
        .await
        .map_err(|_| CoreError::Timeout("guider connect timed out".into()))?
        .map_err(|e| CoreError::ConnectionLost(format!("guider connect failed: {e}")))
}

fn publish(bus: &Option<MessageBus>, topic: &str, payload: Value) {
    if let Some(bus) = bus {
        let bus = bus.clone();
        let topic = topic.to_string();
        tokio::spawn(async move { bus.publish(topic, payload).await });
    }
}

async fn fail_all_outstanding(pending: &PendingTable, settle: &SettleSlot, reason: &str) {
    let mut pending_guard = pending.lock().await;
    for (_, tx) in pending_guard.drain() {
        let _ = tx.send(Err(CoreError::ConnectionLost(reason.to_string())));
    }
    drop(pending_guard);
    if let Some(tx) = settle.lock().await.take() {
        let _ = tx.send(Err(CoreError::ConnectionLost(reason.to_string())));
    }
}

/// Owns the socket for the lifetime of one connection attempt, running a
/// duplex read/write loop; on disconnect, reconnects per `auto_reconnect`
/// before returning.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    config: ConnectionConfig,
    mut stream: TcpStream,
    mut write_rx: mpsc::Receiver<String>,
    pending: Arc<PendingTable>,
    settle: Arc<SettleSlot>,
    snapshot: Arc<RwLock<GuiderSnapshot>>,
    session: Arc<Mutex<SessionState>>,
    bus: Option<MessageBus>,
) {
    let mut attempts = 0u32;
    loop {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            tokio::select! {
                biased;
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            handle_line(&line, &pending, &settle, &snapshot, &bus).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "GuiderClient: read error");
                            break;
                        }
                    }
                }
                outgoing = write_rx.recv() => {
                    match outgoing {
                        Some(mut line) => {
                            line.push('\n');
                            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                                warn!(error = %e, "GuiderClient: write error");
                                break;
                            }
                        }
                        None => return,
                    }
                }
            }
        }

        fail_all_outstanding(&pending, &settle, "guider connection lost").await;

        if !config.auto_reconnect || attempts >= config.max_reconnect_attempts {
            *session.lock().await = SessionState::Error;
            publish(&bus, "guider.state", serde_json::json!({ "state": "Error" }));
            return;
        }

        *session.lock().await = SessionState::Reconnecting;
        publish(&bus, "guider.state", serde_json::json!({ "state": "Reconnecting", "attempt": attempts + 1 }));
        tokio::time::sleep(config.reconnect_delay).await;

        match dial(&config).await {
            Ok(new_stream) => {
                stream = new_stream;
                attempts = 0;
                *session.lock().await = SessionState::Connected;
                publish(&bus, "guider.state", serde_json::json!({ "state": "Connected" }));
            }
            Err(e) => {
                attempts += 1;
                warn!(error = %e, attempts, "GuiderClient: reconnect attempt failed");
            }
        }
    }
}

async fn handle_line(
    line: &str,
    pending: &PendingTable,
    settle: &SettleSlot,
    snapshot: &RwLock<GuiderSnapshot>,
    bus: &Option<MessageBus>,
) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, %line, "GuiderClient: malformed line from guider");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let result = if let Some(error) = value.get("error") {
                let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown").to_string();
                Err(CoreError::HandlerFailed(message))
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(result);
        }
        return;
    }

    let Some(event) = value.get("Event").and_then(Value::as_str) else {
        return;
    };
    publish(bus, "guider.event", value.clone());

    match event {
        "AppState" => {
            if let Some(state) = value.get("State").and_then(Value::as_str).and_then(parse_state) {
                snapshot.write().await.state = state;
                publish(bus, "guider.state", serde_json::json!({ "state": format!("{state:?}") }));
            }
        }
        "GuideStep" => {
            let mut guard = snapshot.write().await;
            guard.last_star = Some(GuideStar {
                x: value.get("StarX").and_then(Value::as_f64).unwrap_or_default(),
                y: value.get("StarY").and_then(Value::as_f64).unwrap_or_default(),
                snr: value.get("SNR").and_then(Value::as_f64).unwrap_or_default(),
                mass: value.get("Mass").and_then(Value::as_f64).unwrap_or_default(),
                valid: true,
            });
            guard.last_stats = Some(GuideStats {
                rms_ra: value.get("RADistanceRaw").and_then(Value::as_f64).unwrap_or_default(),
                rms_dec: value.get("DECDistanceRaw").and_then(Value::as_f64).unwrap_or_default(),
                rms_total: 0.0,
                peak_ra: 0.0,
                peak_dec: 0.0,
                samples: guard.last_stats.map(|s| s.samples + 1).unwrap_or(1),
                snr: value.get("SNR").and_then(Value::as_f64).unwrap_or_default(),
            });
        }
        "SettleBegin" => {
            snapshot.write().await.settling = true;
        }
        "SettleDone" => {
            snapshot.write().await.settling = false;
            let status = value.get("Status").and_then(Value::as_i64).unwrap_or(1);
            if let Some(tx) = settle.lock().await.take() {
                let _ = tx.send(Ok(status == 0));
            }
        }
        "StarLost" => {
            let mut guard = snapshot.write().await;
            guard.state = GuiderState::LostStar;
            guard.last_star = None;
        }
        "CalibrationComplete" => {
            snapshot.write().await.calibration.complete = true;
        }
        "StartGuiding" => snapshot.write().await.state = GuiderState::Guiding,
        "GuidingStopped" => snapshot.write().await.state = GuiderState::Stopped,
        "Paused" => snapshot.write().await.state = GuiderState::Paused,
        "Resumed" => snapshot.write().await.state = GuiderState::Guiding,
        other => debug!(event = other, "GuiderClient: unhandled event type"),
    }
}

fn parse_state(s: &str) -> Option<GuiderState> {
    match s {
        "Stopped" => Some(GuiderState::Stopped),
        "Looping" => Some(GuiderState::Looping),
        "Calibrating" => Some(GuiderState::Calibrating),
        "Guiding" => Some(GuiderState::Guiding),
        "Settling" => Some(GuiderState::Settling),
        "Paused" => Some(GuiderState::Paused),
        "LostStar" => Some(GuiderState::LostStar),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_server() -> (String, u16, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (addr.ip().to_string(), addr.port(), listener)
    }

    #[tokio::test]
    async fn scenario_s3_settle_completes_successfully() {
        let (host, port, listener) = fake_server().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let request = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&request).unwrap();
            let id = req["id"].as_u64().unwrap();
            write_half
                .write_all(format!("{{\"result\":0,\"id\":{id}}}\n").as_bytes())
                .await
                .unwrap();
            write_half
                .write_all(b"{\"Event\":\"SettleDone\",\"Status\":0}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = GuiderClient::connect(
            ConnectionConfig {
                host,
                port,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        let settled = client.start_guiding(serde_json::json!({"pixels": 1.5}), false).await.unwrap();
        assert!(settled);
    }

    #[tokio::test]
    async fn scenario_s4_concurrent_settle_is_invalid_state() {
        let (host, port, listener) = fake_server().await;
        tokio::spawn(async move {
            // Accept and never respond; the first settle stays outstanding.
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await
        });

        let client = GuiderClient::connect(
            ConnectionConfig {
                host,
                port,
                rpc_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        let (first, second) = tokio::join!(
            client.start_guiding(serde_json::json!({}), false),
            client.start_guiding(serde_json::json!({}), false),
        );

        // Exactly one of the two concurrent settle attempts must be rejected
        // as a collision; which one depends on scheduling, not semantics.
        let results = [first, second];
        let invalid_state_count = results
            .iter()
            .filter(|r| matches!(r, Err(CoreError::InvalidState(_))))
            .count();
        assert_eq!(invalid_state_count, 1);
    }

    #[tokio::test]
    async fn app_state_event_updates_snapshot() {
        let (host, port, listener) = fake_server().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (_read_half, mut write_half) = socket.into_split();
            write_half.write_all(b"{\"Event\":\"AppState\",\"State\":\"Guiding\"}\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = GuiderClient::connect(
            ConnectionConfig {
                host,
                port,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let snapshot = client.snapshot().await;
        assert_eq!(snapshot.state, GuiderState::Guiding);
    }

    #[test]
    fn connection_config_has_sane_defaults() {
        let config = ConnectionConfig::default();
        assert!(config.auto_reconnect);
        assert!(config.max_reconnect_attempts > 0);
    }
}
