//! Line-delimited JSON-RPC 2.0 over a byte stream (typically a child process's stdio).
//!
//! One request object per line goes out through [`RpcConnection::request`]; one object
//! per line comes back and is classified by [`RpcMessage::parse`]. Responses resolve the
//! matching pending request; notifications and bare envelopes are forwarded as events.

mod process;

pub use process::{CommandSpec, RpcSupervisor, SupervisorOptions};

use crate::error::ChannelError;
use crate::exec::truncate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

/// One decoded output line.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Reply to a request we sent: `Ok(result)` or `Err(error object)`.
    Response { id: u64, outcome: Result<Value, Value> },
    /// Server-initiated call without an id (e.g. signal-cli's `receive`).
    Notification { method: String, params: Value },
    /// Bare `{"envelope": ...}` emitted by protocol variants without notification wrapping.
    RawEvent { envelope: Value },
    Unrecognized(Value),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    id: Option<Value>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
    envelope: Option<Value>,
}

impl RpcMessage {
    /// Decode one line. Errors only when the line is not JSON or has ill-typed fields.
    pub fn parse(line: &str) -> Result<RpcMessage, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if !value.is_object() {
            return Ok(RpcMessage::Unrecognized(value));
        }
        let frame: RawFrame = serde_json::from_value(value.clone())?;
        if let Some(method) = frame.method {
            return Ok(RpcMessage::Notification {
                method,
                params: frame.params.unwrap_or(Value::Null),
            });
        }
        if let Some(id) = frame.id.as_ref().and_then(Value::as_u64) {
            let outcome = match frame.error {
                Some(err) => Err(err),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            return Ok(RpcMessage::Response { id, outcome });
        }
        if let Some(envelope) = frame.envelope {
            return Ok(RpcMessage::RawEvent { envelope });
        }
        Ok(RpcMessage::Unrecognized(value))
    }

    /// The inbound event payload carried by a notification or raw event.
    pub fn into_event(self) -> Option<Value> {
        match self {
            RpcMessage::Notification { mut params, .. } => {
                let envelope = params
                    .as_object_mut()
                    .and_then(|p| p.remove("envelope"));
                Some(envelope.unwrap_or(params))
            }
            RpcMessage::RawEvent { envelope } => Some(envelope),
            _ => None,
        }
    }
}

type Completion = oneshot::Sender<Result<Value, ChannelError>>;

struct PendingRequest {
    created_at: Instant,
    completion: Completion,
}

/// Requests written but not yet answered, keyed by id. Owned by one connection.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: u64) -> oneshot::Receiver<Result<Value, ChannelError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                completion: tx,
            },
        );
        rx
    }

    /// Complete request `id`. Returns false when no such request is pending (already timed
    /// out, or never sent), in which case the response is dropped.
    pub fn resolve(&self, id: u64, outcome: Result<Value, Value>) -> bool {
        let Some(req) = self.lock().remove(&id) else {
            return false;
        };
        log::trace!("rpc request {} answered after {:?}", id, req.created_at.elapsed());
        let _ = req.completion.send(outcome.map_err(ChannelError::Rpc));
        true
    }

    fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every pending request at once. Returns how many there were.
    pub fn fail_all(&self, make_error: impl Fn() -> ChannelError) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, r)| r).collect();
        let n = drained.len();
        for req in drained {
            let _ = req.completion.send(Err(make_error()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write side of a JSON-RPC session. Ids start at 1 and increase for the lifetime of the connection.
pub struct RpcConnection<W> {
    writer: tokio::sync::Mutex<W>,
    pending: PendingTable,
    next_id: AtomicU64,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin + Send> RpcConnection<W> {
    pub fn new(writer: W, timeout: Duration) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            pending: PendingTable::default(),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Send one request and wait for its response, up to the connection's timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            method,
            params: &params,
            id,
        })?;
        line.push('\n');

        let rx = self.pending.register(id);
        let written = {
            let mut w = self.writer.lock().await;
            match w.write_all(line.as_bytes()).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.remove(id);
            return Err(ChannelError::connection(format!("rpc write failed: {}", e)));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChannelError::ProcessExited(
                "rpc connection dropped".to_string(),
            )),
            Err(_) => {
                self.pending.remove(id);
                Err(ChannelError::Timeout {
                    id,
                    after: self.timeout,
                })
            }
        }
    }

    /// Shut down the write half (closes the child's stdin).
    pub async fn close(&self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

/// Read output lines until EOF, resolving responses against `pending` and forwarding
/// event payloads to `events`. Malformed lines are logged and skipped. A full `events`
/// queue stops reading, so backpressure reaches the writer of the stream.
pub async fn read_frames<R>(
    name: &str,
    reader: R,
    pending: &PendingTable,
    events: &mpsc::Sender<Value>,
) -> Result<(), ChannelError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg = match RpcMessage::parse(line) {
            Ok(m) => m,
            Err(_) => {
                log::debug!("{}: non-JSON output: {}", name, truncate(line, 200));
                continue;
            }
        };
        match msg {
            RpcMessage::Response { id, outcome } => {
                if !pending.resolve(id, outcome) {
                    log::debug!("{}: discarding response for unknown request {}", name, id);
                }
            }
            RpcMessage::Unrecognized(v) => {
                log::debug!("{}: unhandled output: {}", name, truncate(&v.to_string(), 200));
            }
            event => {
                if let Some(payload) = event.into_event() {
                    if events.send(payload).await.is_err() {
                        log::debug!("{}: event handler gone, stopping reader", name);
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{duplex, BufReader, DuplexStream};

    #[test]
    fn parse_response_and_error() {
        assert_eq!(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","result":{"timestamp":5},"id":3}"#).unwrap(),
            RpcMessage::Response {
                id: 3,
                outcome: Ok(json!({"timestamp": 5}))
            }
        );
        assert_eq!(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","error":{"code":-1,"message":"nope"},"id":4}"#)
                .unwrap(),
            RpcMessage::Response {
                id: 4,
                outcome: Err(json!({"code": -1, "message": "nope"}))
            }
        );
    }

    #[test]
    fn parse_notification_unwraps_envelope() {
        let msg = RpcMessage::parse(
            r#"{"jsonrpc":"2.0","method":"receive","params":{"envelope":{"source":"+1"},"account":"+2"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, RpcMessage::Notification { ref method, .. } if method == "receive"));
        assert_eq!(msg.into_event(), Some(json!({"source": "+1"})));

        let bare = RpcMessage::parse(r#"{"method":"receive","params":{"source":"+1"}}"#).unwrap();
        assert_eq!(bare.into_event(), Some(json!({"source": "+1"})));
    }

    #[test]
    fn parse_raw_envelope_and_unknown_shapes() {
        let raw = RpcMessage::parse(r#"{"envelope":{"source":"+1","timestamp":9}}"#).unwrap();
        assert_eq!(
            raw,
            RpcMessage::RawEvent {
                envelope: json!({"source": "+1", "timestamp": 9})
            }
        );
        assert!(matches!(
            RpcMessage::parse(r#"{"hello":"world"}"#).unwrap(),
            RpcMessage::Unrecognized(_)
        ));
        assert!(matches!(
            RpcMessage::parse("[1,2]").unwrap(),
            RpcMessage::Unrecognized(_)
        ));
        assert!(RpcMessage::parse("INFO starting daemon").is_err());
    }

    /// A connection whose output is looped through a scripted fake server.
    struct Harness {
        conn: Arc<RpcConnection<DuplexStream>>,
        server_in: tokio::io::Lines<BufReader<DuplexStream>>,
        server_out: DuplexStream,
        reader: tokio::task::JoinHandle<Result<(), ChannelError>>,
        events: mpsc::Receiver<Value>,
    }

    fn harness(timeout: Duration) -> Harness {
        let (client_w, server_r) = duplex(64 * 1024);
        let (server_w, client_r) = duplex(64 * 1024);
        let conn = Arc::new(RpcConnection::new(client_w, timeout));
        let (tx, events) = mpsc::channel(16);
        let reader_conn = conn.clone();
        let reader = tokio::spawn(async move {
            read_frames("test", BufReader::new(client_r), reader_conn.pending(), &tx).await
        });
        Harness {
            conn,
            server_in: BufReader::new(server_r).lines(),
            server_out: server_w,
            reader,
            events,
        }
    }

    async fn reply(out: &mut DuplexStream, id: u64, result: Value) {
        let line = format!("{}\n", json!({"jsonrpc": "2.0", "result": result, "id": id}));
        out.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn request_is_correlated_with_response() {
        let mut h = harness(Duration::from_secs(5));
        let conn = h.conn.clone();
        let call = tokio::spawn(async move { conn.request("send", json!({"message": "hi"})).await });

        let line = h.server_in.next_line().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["method"], "send");
        assert_eq!(req["params"]["message"], "hi");
        assert_eq!(req["id"], 1);

        reply(&mut h.server_out, 1, json!({"timestamp": 42})).await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"timestamp": 42}));
        assert!(h.conn.pending().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_never_interleave() {
        let mut h = harness(Duration::from_secs(5));
        let mut calls = Vec::new();
        for i in 0..20 {
            let conn = h.conn.clone();
            let text = format!("message {} {}", i, "x".repeat(2000));
            calls.push(tokio::spawn(async move {
                let r = conn.request("send", json!({ "message": text })).await;
                (i, r)
            }));
        }

        let mut ids = Vec::new();
        for _ in 0..20 {
            let line = h.server_in.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).expect("each line is one whole request");
            ids.push(req["id"].as_u64().unwrap());
        }
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, (1..=20).collect::<Vec<_>>());

        // answer in reverse order; each caller still gets its own result
        for id in ids.iter().rev() {
            reply(&mut h.server_out, *id, json!({ "echo": id })).await;
        }
        for call in calls {
            let (_, r) = call.await.unwrap();
            assert!(r.unwrap()["echo"].is_u64());
        }
    }

    #[tokio::test]
    async fn error_response_fails_only_that_request() {
        let mut h = harness(Duration::from_secs(5));
        let conn = h.conn.clone();
        let call = tokio::spawn(async move { conn.request("send", json!({})).await });
        h.server_in.next_line().await.unwrap().unwrap();
        h.server_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"error\":{\"message\":\"unregistered user\"},\"id\":1}\n")
            .await
            .unwrap();
        match call.await.unwrap() {
            Err(ChannelError::Rpc(e)) => assert_eq!(e["message"], "unregistered user"),
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_discarded() {
        let mut h = harness(Duration::from_secs(30));
        let err = h.conn.request("send", json!({})).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { id: 1, .. }));
        assert!(h.conn.pending().is_empty());

        // the late answer for id 1 must not be matched to the next request (id 2)
        h.server_in.next_line().await.unwrap().unwrap();
        reply(&mut h.server_out, 1, json!("late")).await;

        let conn = h.conn.clone();
        let next = tokio::spawn(async move { conn.request("send", json!({})).await });
        let line = h.server_in.next_line().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["id"], 2);
        reply(&mut h.server_out, 2, json!("fresh")).await;
        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
        assert!(!h.conn.pending().resolve(1, Ok(json!("again"))));
    }

    #[tokio::test]
    async fn events_are_forwarded_and_garbage_skipped() {
        let mut h = harness(Duration::from_secs(5));
        h.server_out
            .write_all(
                b"not json at all\n\
                  {\"jsonrpc\":\"2.0\",\"method\":\"receive\",\"params\":{\"envelope\":{\"source\":\"+1\"}}}\n\
                  {\"something\":\"else\"}\n\
                  {\"envelope\":{\"source\":\"+2\"}}\n",
            )
            .await
            .unwrap();
        assert_eq!(h.events.recv().await.unwrap(), json!({"source": "+1"}));
        assert_eq!(h.events.recv().await.unwrap(), json!({"source": "+2"}));
    }

    #[tokio::test]
    async fn eof_ends_reader_and_fail_all_releases_callers() {
        let mut h = harness(Duration::from_secs(60));
        let conn = h.conn.clone();
        let call = tokio::spawn(async move { conn.request("send", json!({})).await });
        h.server_in.next_line().await.unwrap().unwrap();
        drop(h.server_out);

        h.reader.await.unwrap().unwrap();
        let failed = h
            .conn
            .pending()
            .fail_all(|| ChannelError::ProcessExited("signal-cli process exited".into()));
        assert_eq!(failed, 1);
        assert!(matches!(
            call.await.unwrap(),
            Err(ChannelError::ProcessExited(_))
        ));
    }
}
