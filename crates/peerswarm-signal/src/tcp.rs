//! JSON-RPC 2.0 over TCP, one JSON document per line.
//!
//! Either side may send requests. Responses are matched to outstanding
//! calls by `id`; requests without an `id` are notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use peerswarm_protocol::{RpcError, RpcFrame, RpcRequest, RpcResponse};

use crate::rpc::{RpcConnector, RpcEvent, RpcTransport};
use crate::SignalError;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, RpcError>>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens TCP channels to `host:port` rendezvous servers.
#[derive(Debug, Clone, Default)]
pub struct TcpRpcConnector;

impl TcpRpcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RpcConnector for TcpRpcConnector {
    async fn connect(
        &self,
        host: &str,
        events: mpsc::UnboundedSender<RpcEvent>,
    ) -> Result<Arc<dyn RpcTransport>, SignalError> {
        let stream = TcpStream::connect(host)
            .await
            .map_err(|e| SignalError::Connect(format!("{}: {}", host, e)))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        tracing::debug!(host = %host, "TCP signal channel open");

        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let _ = events.send(RpcEvent::Connected);

        let reader_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            writer.clone(),
            pending.clone(),
            events,
        ));

        Ok(Arc::new(TcpRpcTransport {
            writer,
            pending,
            reader_task,
        }))
    }
}

struct TcpRpcTransport {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: Pending,
    reader_task: JoinHandle<()>,
}

async fn write_line<T: serde::Serialize>(
    writer: &tokio::sync::Mutex<OwnedWriteHalf>,
    frame: &T,
) -> Result<(), SignalError> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl RpcTransport for TcpRpcTransport {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SignalError> {
        let request = RpcRequest::new(method, params);
        let id = request.id.clone().unwrap_or_default();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);

        if let Err(e) = write_line(&self.writer, &request).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SignalError::ChannelClosed),
        }
    }

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), SignalError> {
        write_line(&self.writer, &RpcRequest::notification(method, params)).await
    }

    async fn close(&self) {
        self.reader_task.abort();
        lock(&self.pending).clear();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for TcpRpcTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: Pending,
    events: mpsc::UnboundedSender<RpcEvent>,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_line(&line, &writer, &pending, &events);
            }
            Ok(None) => {
                tracing::debug!("TCP signal channel closed by server");
                let _ = events.send(RpcEvent::Disconnected);
                break;
            }
            Err(e) => {
                let _ = events.send(RpcEvent::Error(e.to_string()));
                break;
            }
        }
    }
    // Outstanding calls resolve with ChannelClosed.
    lock(&pending).clear();
}

fn dispatch_line(
    line: &str,
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: &Pending,
    events: &mpsc::UnboundedSender<RpcEvent>,
) {
    let frame: RpcFrame = match serde_json::from_str(line) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid JSON-RPC frame from signal server");
            return;
        }
    };

    match frame {
        RpcFrame::Response(response) => {
            let Some(id) = response.id.clone() else {
                tracing::debug!("Response without id ignored");
                return;
            };
            let Some(tx) = lock(pending).remove(&id) else {
                tracing::debug!(id = %id, "Response for unknown call ignored");
                return;
            };
            let result = match response.error {
                Some(error) => Err(error),
                None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
            };
            let _ = tx.send(result);
        }
        RpcFrame::Request(request) if request.is_notification() => {
            let _ = events.send(RpcEvent::Notification {
                method: request.method,
                params: request.params,
            });
        }
        RpcFrame::Request(request) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let id = request.id.clone();
            let _ = events.send(RpcEvent::Request {
                method: request.method,
                params: request.params,
                reply: reply_tx,
            });
            let writer = writer.clone();
            tokio::spawn(async move {
                let response = match reply_rx.await {
                    Ok(Ok(result)) => RpcResponse::success(id, result),
                    Ok(Err(e)) => RpcResponse::error(id, e.code, e.message),
                    Err(_) => RpcResponse::error(id, -32603, "Request dropped".into()),
                };
                if let Err(e) = write_line(&writer, &response).await {
                    tracing::warn!(error = %e, "Failed to answer signal server request");
                }
            });
        }
    }
}
