//! Framed RPC over the plugin's stdio.
//!
//! One JSON object per line in each direction. Requests carry a u64
//! id; responses echo it, so concurrent calls multiplex over the
//! single connection. The framing works over any byte stream, which
//! lets tests drive it through an in-memory duplex pipe.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use super::ShoesError;

/// RPC methods the plugin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Add,
    Delete,
}

/// A request frame, one per line on the plugin's stdin.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: Method,
    pub params: serde_json::Value,
}

/// A response frame, one per line on the plugin's stdout.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ErrorFrame>,
}

/// Error payload inside a response frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub kind: ErrorFrameKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFrameKind {
    Transient,
    Permanent,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, ShoesError>>>>>;

/// Caller-side handle to one plugin connection.
///
/// Cheap to clone; all clones share the pending map and the writer.
/// When the connection dies (plugin exit, broken pipe), every
/// in-flight and future call on this handle fails with
/// [`ShoesError::PluginCrashed`].
#[derive(Clone)]
pub struct ConnectionHandle {
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
    outbound: mpsc::Sender<RequestFrame>,
}

impl ConnectionHandle {
    /// Issues a call and waits for the matching response frame.
    pub async fn call(
        &self,
        method: Method,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ShoesError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = RequestFrame { id, method, params };
        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ShoesError::PluginCrashed);
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped: the connection tore down mid-call.
            Err(_) => Err(ShoesError::PluginCrashed),
        }
    }
}

/// Spawns reader/writer tasks over the plugin's byte streams and
/// returns the caller handle.
pub fn connect<R, W>(reader: R, writer: W) -> ConnectionHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RequestFrame>(64);

    // Writer task: serialise frames onto the stream, one per line.
    let writer_pending = pending.clone();
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = outbound_rx.recv().await {
            let mut line = match serde_json::to_vec(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "unserialisable plugin request");
                    fail_pending_id(&writer_pending, frame.id).await;
                    continue;
                }
            };
            line.push(b'\n');
            if writer.write_all(&line).await.is_err() || writer.flush().await.is_err() {
                fail_pending_id(&writer_pending, frame.id).await;
                break;
            }
        }
    });

    // Reader task: dispatch response frames to waiting callers. EOF or
    // a read error means the plugin is gone; every pending call fails.
    let reader_pending = pending.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ResponseFrame>(&line) {
                        Ok(frame) => dispatch(&reader_pending, frame).await,
                        Err(e) => {
                            debug!(error = %e, "undecodable plugin frame, skipping");
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        let mut pending = reader_pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ShoesError::PluginCrashed));
        }
    });

    ConnectionHandle {
        next_id: Arc::new(AtomicU64::new(1)),
        pending,
        outbound: outbound_tx,
    }
}

async fn dispatch(pending: &PendingMap, frame: ResponseFrame) {
    let Some(tx) = pending.lock().await.remove(&frame.id) else {
        debug!(id = frame.id, "response frame for unknown request id");
        return;
    };
    let outcome = match (frame.result, frame.error) {
        (_, Some(error)) => Err(match error.kind {
            ErrorFrameKind::Transient => ShoesError::Transient(error.message),
            ErrorFrameKind::Permanent => ShoesError::Permanent(error.message),
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(serde_json::Value::Null),
    };
    let _ = tx.send(outcome);
}

async fn fail_pending_id(pending: &PendingMap, id: u64) {
    if let Some(tx) = pending.lock().await.remove(&id) {
        let _ = tx.send(Err(ShoesError::PluginCrashed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    /// Spawns a scripted peer that answers every request with
    /// `respond(frame)`.
    fn scripted_peer<F>(
        peer: tokio::io::DuplexStream,
        respond: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(RequestFrame) -> Option<ResponseFrame> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(peer);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: RequestFrame = serde_json::from_str(&line).unwrap();
                if let Some(response) = respond(request) {
                    let mut out = serde_json::to_vec(&response).unwrap();
                    out.push(b'\n');
                    write.write_all(&out).await.unwrap();
                }
            }
        })
    }

    #[tokio::test]
    async fn call_roundtrips_result() {
        let (ours, theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let handle = connect(read, write);
        let _peer = scripted_peer(theirs, |request| {
            assert_eq!(request.method, Method::Add);
            Some(ResponseFrame {
                id: request.id,
                result: Some(serde_json::json!({"cloud_id": "i-001"})),
                error: None,
            })
        });

        let result = handle
            .call(Method::Add, serde_json::json!({"uuid": "u1"}))
            .await
            .unwrap();
        assert_eq!(result["cloud_id"], "i-001");
    }

    #[tokio::test]
    async fn error_frames_map_to_error_kinds() {
        let (ours, theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let handle = connect(read, write);
        let _peer = scripted_peer(theirs, |request| {
            Some(ResponseFrame {
                id: request.id,
                result: None,
                error: Some(ErrorFrame {
                    kind: ErrorFrameKind::Permanent,
                    message: "quota exceeded".to_string(),
                }),
            })
        });

        let err = handle
            .call(Method::Delete, serde_json::json!({"cloud_id": "i-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ShoesError::Permanent(m) if m == "quota exceeded"));
    }

    #[tokio::test]
    async fn concurrent_calls_multiplex_by_id() {
        let (ours, theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let handle = connect(read, write);
        // Echo the request id back in the result so we can check routing.
        let _peer = scripted_peer(theirs, |request| {
            Some(ResponseFrame {
                id: request.id,
                result: Some(serde_json::json!({"echo": request.params})),
                error: None,
            })
        });

        let mut handles = Vec::new();
        for n in 0..16 {
            let handle = handle.clone();
            handles.push(tokio::spawn(async move {
                let result = handle
                    .call(Method::Add, serde_json::json!({"n": n}))
                    .await
                    .unwrap();
                assert_eq!(result["echo"]["n"], n);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn peer_disconnect_fails_in_flight_calls() {
        let (ours, theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let handle = connect(read, write);
        // Peer reads the request, then hangs up without replying.
        let _peer = tokio::spawn(async move {
            let (peer_read, _peer_write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(peer_read).lines();
            let _ = lines.next_line().await;
            // Dropping both halves closes the pipe.
        });

        let err = handle
            .call(Method::Add, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ShoesError::PluginCrashed));
    }

    #[tokio::test]
    async fn empty_result_is_null() {
        let (ours, theirs) = duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let handle = connect(read, write);
        let _peer = scripted_peer(theirs, |request| {
            Some(ResponseFrame {
                id: request.id,
                result: None,
                error: None,
            })
        });

        let result = handle
            .call(Method::Delete, serde_json::json!({"cloud_id": "i-1"}))
            .await
            .unwrap();
        assert!(result.is_null());
    }
}
