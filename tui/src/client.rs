//! IPC client for attaching to a running daemon
//!
//! One reader task demultiplexes everything arriving on the socket:
//! responses are routed to their waiting caller by request id, pushed
//! `probe_result` messages land in a bounded results queue. Request
//! helpers time out after five seconds (ten for history); a timed-out
//! request's slot is removed immediately so a late response is simply
//! discarded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use chrono::{DateTime, Utc};
use shared::config::Target;
use shared::ipc::{
    msg, GetHistoryRequest, GetStatsRequest, HistoryResponse, Request, Response, StatsResponse,
    TargetsResponse,
};
use shared::metrics::{BurstResult, DataPoint, Stats};

/// Timeout for stats/targets/subscribe requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// History responses can be large; give them longer
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);
/// Queue depth for pushed probe results
const RESULTS_BUFFER: usize = 100;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

/// A connection to the daemon's IPC socket.
pub struct IpcClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    results: tokio::sync::Mutex<mpsc::Receiver<BurstResult>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl IpcClient {
    /// Connect to the daemon socket and start the reader task.
    pub async fn connect(socket_path: &Path) -> Result<IpcClient> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to daemon at {}", socket_path.display()))?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (results_tx, results_rx) = mpsc::channel(RESULTS_BUFFER);

        let reader_task = tokio::spawn(read_loop(
            BufReader::with_capacity(shared::ipc::MAX_MESSAGE_SIZE, read_half),
            Arc::clone(&pending),
            results_tx,
        ));

        Ok(IpcClient {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            results: tokio::sync::Mutex::new(results_rx),
            reader_task,
        })
    }

    /// Toggle `probe_result` pushes on.
    pub async fn subscribe(&self) -> Result<()> {
        let response = self
            .request(msg::SUBSCRIBE, None, REQUEST_TIMEOUT)
            .await
            .context("subscribe failed")?;
        expect_kind(&response, msg::OK)?;
        Ok(())
    }

    /// Toggle `probe_result` pushes off.
    pub async fn unsubscribe(&self) -> Result<()> {
        let response = self
            .request(msg::UNSUBSCRIBE, None, REQUEST_TIMEOUT)
            .await
            .context("unsubscribe failed")?;
        expect_kind(&response, msg::OK)?;
        Ok(())
    }

    /// Next pushed probe result; `None` once the connection closed.
    pub async fn next_result(&self) -> Option<BurstResult> {
        self.results.lock().await.recv().await
    }

    /// Fetch the daemon's target list.
    pub async fn get_targets(&self) -> Result<Vec<Target>> {
        let response = self
            .request(msg::GET_TARGETS, None, REQUEST_TIMEOUT)
            .await
            .context("get targets failed")?;
        expect_kind(&response, msg::TARGETS)?;

        let payload: TargetsResponse =
            serde_json::from_value(response.data.unwrap_or_default())
                .context("malformed targets response")?;
        Ok(payload.targets)
    }

    /// Fetch live statistics for one target.
    pub async fn get_stats(&self, target: &str) -> Result<Stats> {
        let data = serde_json::to_value(GetStatsRequest {
            target: target.to_string(),
        })?;
        let response = self
            .request(msg::GET_STATS, Some(data), REQUEST_TIMEOUT)
            .await
            .context("get stats failed")?;
        expect_kind(&response, msg::STATS)?;

        let payload: StatsResponse = serde_json::from_value(response.data.unwrap_or_default())
            .context("malformed stats response")?;
        Ok(payload.stats)
    }

    /// Fetch archived data points for a target over `[from, to]`.
    pub async fn get_history(
        &self,
        target: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>> {
        let data = serde_json::to_value(GetHistoryRequest {
            target: target.to_string(),
            from,
            to,
        })?;
        let response = self
            .request(msg::GET_HISTORY, Some(data), HISTORY_TIMEOUT)
            .await
            .context("get history failed")?;
        expect_kind(&response, msg::HISTORY)?;

        let payload: HistoryResponse = serde_json::from_value(response.data.unwrap_or_default())
            .context("malformed history response")?;
        Ok(payload.data_points.into_iter().map(DataPoint::from).collect())
    }

    /// Close the connection; the reader task ends with it.
    pub async fn close(self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        // The daemon closes its side on EOF; don't wait on a peer that
        // might not
        self.reader_task.abort();
        let _ = self.reader_task.await;
    }

    /// Send a request and wait for the response with the matching id.
    async fn request(
        &self,
        kind: &str,
        data: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<Response> {
        let id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        let request = Request {
            id: Some(id.clone()),
            kind: kind.to_string(),
            data,
        };
        if let Err(e) = self.send(&request).await {
            self.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.kind == msg::ERROR {
                    bail!(
                        "{}",
                        response.error.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
                Ok(response)
            }
            Ok(Err(_)) => {
                // Reader task gone: the connection is dead
                self.forget(&id);
                bail!("connection to daemon lost")
            }
            Err(_) => {
                // Remove the slot so a late response is discarded
                self.forget(&id);
                bail!("request timed out after {:?}", timeout)
            }
        }
    }

    async fn send(&self, request: &Request) -> Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

/// Demultiplex everything the daemon sends.
async fn read_loop(
    mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    pending: PendingMap,
    results_tx: mpsc::Sender<BurstResult>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("IPC read error: {}", e);
                break;
            }
        }

        let response: Response = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(e) => {
                debug!("ignoring malformed message from daemon: {}", e);
                continue;
            }
        };

        if response.kind == msg::PROBE_RESULT {
            if let Some(data) = response.data {
                match serde_json::from_value::<BurstResult>(data) {
                    // Queue full: drop the push, live data is replaceable
                    Ok(result) => {
                        let _ = results_tx.try_send(result);
                    }
                    Err(e) => debug!("ignoring malformed probe result: {}", e),
                }
            }
            continue;
        }

        if let Some(id) = &response.id {
            // Route while holding the map lock: a caller that timed out
            // concurrently has already removed its slot, and we must not
            // send into a slot it is about to remove.
            let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = pending.remove(id) {
                let _ = tx.send(response);
            }
            // No slot: the caller gave up; discard the late response
        }
    }

    // Dropping the pending senders wakes every waiter with an error
    pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

fn expect_kind(response: &Response, kind: &str) -> Result<()> {
    if response.kind != kind {
        return Err(anyhow!("unexpected response type: {}", response.kind));
    }
    Ok(())
}

/// Random hex request id, unique per in-flight request.
fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
