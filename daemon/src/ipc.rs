//! Unix-socket IPC server
//!
//! Lets the terminal front end attach to a running daemon. The wire
//! format is newline-delimited JSON (see `shared::ipc`): request/response
//! pairs correlated by a client-chosen id, plus pushed `probe_result`
//! messages on connections that subscribed. Writes to a connection are
//! serialized through a per-connection mutex so a push never interleaves
//! with a response.
//!
//! Overflow policy: the façade drops a connection whose socket stops
//! accepting writes; the client is expected to reconnect.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use shared::ipc::{
    msg, GetHistoryRequest, GetStatsRequest, HistoryResponse, IpcDataPoint, Request, Response,
    StatsResponse, TargetsResponse,
};

use crate::collector::Collector;

/// IPC server state shared across the accept, reader and push tasks.
pub struct IpcServer {
    socket_path: PathBuf,
    collector: Arc<Collector>,
    clients: Arc<RwLock<HashMap<u64, Arc<ClientConn>>>>,
    next_client_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// One connected client
struct ClientConn {
    id: u64,
    writer: Mutex<OwnedWriteHalf>,
    subscribed: AtomicBool,
}

impl ClientConn {
    /// Serialize and send one message; the per-connection lock keeps
    /// concurrent senders from interleaving lines.
    async fn send(&self, response: &Response) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(response).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, collector: Arc<Collector>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        IpcServer {
            socket_path,
            collector,
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_id: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the socket and start serving. Fails when the socket cannot
    /// be bound (callers treat that as fatal at startup).
    pub async fn start(self: Arc<Self>) -> shared::Result<()> {
        // A stale file from a crashed daemon would make bind fail
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!(
                    "failed to remove existing socket {}",
                    self.socket_path.display()
                )
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!("failed to listen on socket {}", self.socket_path.display())
        })?;

        // The socket's permissions are the IPC trust boundary
        if let Err(e) = std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(0o660),
        ) {
            warn!("failed to set socket permissions: {}", e);
        }

        info!(socket = %self.socket_path.display(), "IPC server listening");

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(&self).push_loop()));
        tasks.push(tokio::spawn(Arc::clone(&self).accept_loop(listener)));
        Ok(())
    }

    /// Stop accepting, close every connection, wait for all tasks and
    /// unlink the socket file.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());

        // Dropping the write halves closes the connections, which ends
        // the per-connection reader tasks
        self.clients.write().await.clear();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("IPC task ended abnormally: {}", e);
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove socket file: {}", e);
            }
        }
        info!("IPC server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut readers = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        readers.push(tokio::spawn(async move {
                            server.handle_connection(stream).await;
                        }));
                    }
                    Err(e) => {
                        warn!("IPC accept error: {}", e);
                    }
                }
            }
            // Forget finished readers so the list stays small
            readers.retain(|handle| !handle.is_finished());
        }

        for reader in readers {
            let _ = reader.await;
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let client = Arc::new(ClientConn {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(write_half),
            subscribed: AtomicBool::new(false),
        });

        self.clients
            .write()
            .await
            .insert(client.id, Arc::clone(&client));
        debug!(client = client.id, "IPC client connected");

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut lines =
            BufReader::with_capacity(shared::ipc::MAX_MESSAGE_SIZE, read_half).lines();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&client, &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(client = client.id, "IPC read error: {}", e);
                        break;
                    }
                }
            }
        }

        self.clients.write().await.remove(&client.id);
        debug!(client = client.id, "IPC client disconnected");
    }

    async fn handle_line(&self, client: &Arc<ClientConn>, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        // Protocol errors answer on the same connection and keep reading
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let id = extract_id(line);
                self.reply(client, &Response::error(id, format!("invalid request: {}", e)))
                    .await;
                return;
            }
        };

        let response = self.handle_request(client, request);
        self.reply(client, &response).await;
    }

    fn handle_request(&self, client: &Arc<ClientConn>, request: Request) -> Response {
        let id = request.id.clone();
        match request.kind.as_str() {
            msg::SUBSCRIBE => {
                client.subscribed.store(true, Ordering::Relaxed);
                Response::ok(id)
            }
            msg::UNSUBSCRIBE => {
                client.subscribed.store(false, Ordering::Relaxed);
                Response::ok(id)
            }
            msg::GET_TARGETS => {
                let payload = TargetsResponse {
                    targets: self.collector.get_targets(),
                };
                match Response::with_data(id.clone(), msg::TARGETS, &payload) {
                    Ok(response) => response,
                    Err(e) => Response::error(id, format!("failed to encode targets: {}", e)),
                }
            }
            msg::GET_STATS => {
                let stats_req: GetStatsRequest =
                    match serde_json::from_value(request.data.unwrap_or_default()) {
                        Ok(req) => req,
                        Err(e) => {
                            return Response::error(id, format!("invalid get_stats request: {}", e))
                        }
                    };

                let payload = StatsResponse {
                    stats: self.collector.get_stats(&stats_req.target),
                    target: stats_req.target,
                };
                match Response::with_data(id.clone(), msg::STATS, &payload) {
                    Ok(response) => response,
                    Err(e) => Response::error(id, format!("failed to encode stats: {}", e)),
                }
            }
            msg::GET_HISTORY => {
                let hist_req: GetHistoryRequest =
                    match serde_json::from_value(request.data.unwrap_or_default()) {
                        Ok(req) => req,
                        Err(e) => {
                            return Response::error(
                                id,
                                format!("invalid get_history request: {}", e),
                            )
                        }
                    };

                match self
                    .collector
                    .fetch_history(&hist_req.target, hist_req.from, hist_req.to)
                {
                    Ok(points) => {
                        let payload = HistoryResponse {
                            target: hist_req.target,
                            data_points: points.into_iter().map(IpcDataPoint::from).collect(),
                        };
                        match Response::with_data(id.clone(), msg::HISTORY, &payload) {
                            Ok(response) => response,
                            Err(e) => {
                                Response::error(id, format!("failed to encode history: {}", e))
                            }
                        }
                    }
                    Err(e) => Response::error(id, format!("failed to fetch history: {}", e)),
                }
            }
            other => Response::error(id, format!("unknown request type: {}", other)),
        }
    }

    async fn reply(&self, client: &Arc<ClientConn>, response: &Response) {
        if let Err(e) = client.send(response).await {
            debug!(client = client.id, "IPC write failed, dropping client: {}", e);
            self.clients.write().await.remove(&client.id);
        }
    }

    /// Forward collector results to every subscribed connection. A
    /// connection whose write fails is dropped.
    async fn push_loop(self: Arc<Self>) {
        let mut subscription = self.collector.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let result = tokio::select! {
                _ = shutdown_rx.recv() => return,
                result = subscription.recv() => match result {
                    Some(result) => result,
                    None => return, // collector shut down
                }
            };

            let response = match Response::with_data(None, msg::PROBE_RESULT, &result) {
                Ok(response) => response,
                Err(e) => {
                    warn!("failed to encode probe result: {}", e);
                    continue;
                }
            };

            let subscribed: Vec<Arc<ClientConn>> = {
                let clients = self.clients.read().await;
                clients
                    .values()
                    .filter(|c| c.subscribed.load(Ordering::Relaxed))
                    .cloned()
                    .collect()
            };

            for client in subscribed {
                self.reply(&client, &response).await;
            }
        }
    }
}

/// Best-effort id recovery from a line that failed envelope parsing, so
/// the error response still correlates when the id survived.
fn extract_id(line: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_str()
        .map(|s| s.to_string())
}
