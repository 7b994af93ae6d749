use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{Result, SchedulerError};
use crate::executor::protocol::{
    exit_disposition, BuildSpec, WsMessage, CLOSE_INTERNAL_ERROR, CLOSE_INVALID_PAYLOAD,
    CLOSE_NORMAL,
};

const CANCEL_CAPACITY: usize = 16;

/// WebSocket server running one build at a time on a node.
pub struct BuildServer {
    state: BuildState,
}

#[derive(Clone)]
struct BuildState {
    config: Arc<ExecutorConfig>,
    /// Single-flight guard: idle (false) or running (true). Taken with a
    /// compare-exchange before any protocol work, so the second arrival is
    /// the one rejected and the accepted connection is never disturbed.
    active: Arc<AtomicBool>,
    cancel_tx: broadcast::Sender<Uuid>,
}

/// Releases the single-flight slot on every exit path.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BuildServer {
    pub fn new(config: ExecutorConfig) -> Self {
        let (cancel_tx, _) = broadcast::channel(CANCEL_CAPACITY);
        Self {
            state: BuildState {
                config: Arc::new(config),
                active: Arc::new(AtomicBool::new(false)),
                cancel_tx,
            },
        }
    }

    /// Out-of-band cancellation input: send the job id to terminate it.
    pub fn cancel_sender(&self) -> broadcast::Sender<Uuid> {
        self.state.cancel_tx.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/build", get(ws_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.state.config.listen_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| SchedulerError::Internal(format!("Failed to bind {addr}: {e}")))?;
        tracing::info!(%addr, "Starting build executor server");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))
    }
}

async fn ws_handler(State(state): State<BuildState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: BuildState) {
    if state
        .active
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // This connection never owned the slot; do not release it on return.
        send_msg(&mut socket, &WsMessage::already_running()).await;
        close_with(&mut socket, CLOSE_INTERNAL_ERROR).await;
        return;
    }
    let _guard = FlightGuard(state.active.clone());

    // First text frame must be the job specification.
    let spec = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(_) => {
                        send_msg(&mut socket, &WsMessage::failed("Not a valid JSON")).await;
                        close_with(&mut socket, CLOSE_INVALID_PAYLOAD).await;
                        return;
                    }
                };
                let spec = serde_json::from_value::<BuildSpec>(value)
                    .ok()
                    .filter(|spec| spec.validate().is_ok());
                match spec {
                    Some(spec) => break spec,
                    None => {
                        send_msg(&mut socket, &WsMessage::failed("JSON schema is not valid."))
                            .await;
                        close_with(&mut socket, CLOSE_INVALID_PAYLOAD).await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Build connection failed before job submission");
                return;
            }
        }
    };

    run_build(&mut socket, spec, &state).await;
}

async fn run_build(socket: &mut WebSocket, spec: BuildSpec, state: &BuildState) {
    // Subscribed before the child exists so a cancel arriving during spawn
    // is buffered rather than lost.
    let mut cancel_rx = state.cancel_tx.subscribe();

    tracing::info!(job_id = %spec.id, builder_id = %spec.builder_id, "Start Building");
    send_msg(socket, &WsMessage::starting("Start Building")).await;

    let spec_json = match serde_json::to_string(&spec) {
        Ok(json) => json,
        Err(e) => {
            send_msg(
                socket,
                &WsMessage::failed(format!("Failed to encode job specification: {e}")),
            )
            .await;
            close_with(socket, CLOSE_INTERNAL_ERROR).await;
            return;
        }
    };

    let mut child = match Command::new(&state.config.build_program)
        .arg("--json")
        .arg(&spec_json)
        .stdout(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            send_msg(
                socket,
                &WsMessage::failed(format!("Failed to start build process: {e}")),
            )
            .await;
            close_with(socket, CLOSE_INTERNAL_ERROR).await;
            return;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        let _ = child.start_kill();
        send_msg(socket, &WsMessage::failed("Failed to capture build output")).await;
        close_with(socket, CLOSE_INTERNAL_ERROR).await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    // Live tail: forward each non-empty stdout line as it arrives. The
    // cancel branch and the natural-exit path are mutually exclusive by
    // construction; only one terminal message is ever sent.
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        tracing::debug!(stdout = %line, "[STDOUT]");
                        if !send_msg(socket, &WsMessage::stdout_line(line)).await {
                            // Consumer is gone; stop the build.
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read build output");
                        break;
                    }
                }
            }
            cancel = cancel_rx.recv() => {
                if let Ok(job_id) = cancel {
                    if job_id == spec.id {
                        tracing::info!(%job_id, "Build canceled, terminating build process");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        send_msg(socket, &WsMessage::canceled()).await;
                        close_with(socket, CLOSE_NORMAL).await;
                        return;
                    }
                }
            }
        }
    }

    // stdout is closed but the process may still run; cancels must keep
    // working until it is reaped.
    let exit_code = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reap build process");
                        None
                    }
                };
            }
            cancel = cancel_rx.recv() => {
                if matches!(cancel, Ok(job_id) if job_id == spec.id) {
                    tracing::info!(job_id = %spec.id, "Build canceled, terminating build process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    send_msg(socket, &WsMessage::canceled()).await;
                    close_with(socket, CLOSE_NORMAL).await;
                    return;
                }
            }
        }
    };
    let disposition = exit_disposition(exit_code, &spec.build_options.command);
    send_msg(socket, &disposition.message).await;
    close_with(socket, disposition.close_code).await;
}

/// Serialize and send one protocol message, logging it the way the build
/// driver output is logged. Returns false when the connection is gone.
async fn send_msg(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    if let Some(error) = &msg.error {
        tracing::error!(%error, "Build message");
    } else if let Some(text) = &msg.msg {
        tracing::debug!(msg = %text, "Build message");
    }
    let payload = match serde_json::to_string(msg) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize protocol message");
            return false;
        }
    };
    socket.send(Message::Text(payload)).await.is_ok()
}

async fn close_with(socket: &mut WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}
