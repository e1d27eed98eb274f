//! JSON-RPC connection to one DevTools page target.
//!
//! Commands carry a sequential id and park a oneshot sender in the pending
//! map; the reader task completes it when the matching response arrives.
//! Messages without an id are events and go to the event channel in arrival
//! order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::{CdpError, Result};

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

#[derive(Debug, Serialize)]
struct Request<'a> {
	id: u64,
	method: &'a str,
	params: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
	code: i64,
	message: String,
}

/// Incoming frame: a response when `id` is present, an event otherwise.
#[derive(Debug, Deserialize)]
struct Incoming {
	id: Option<u64>,
	result: Option<Value>,
	error: Option<ErrorPayload>,
	method: Option<String>,
	#[serde(default)]
	params: Value,
}

/// Protocol event such as `Network.responseReceived`.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
	pub method: String,
	pub params: Value,
}

pub type EventStream = mpsc::UnboundedReceiver<CdpEvent>;

pub struct CdpConnection {
	last_id: AtomicU64,
	pending: Pending,
	writer: tokio::sync::Mutex<SplitSink<Socket, Message>>,
	timeout: Duration,
	reader: tokio::task::JoinHandle<()>,
}

impl CdpConnection {
	/// Connects to `ws_url` and starts the reader task.
	pub async fn connect(ws_url: &str) -> Result<(Arc<Self>, EventStream)> {
		let (socket, _) = tokio_tungstenite::connect_async(ws_url).await?;
		debug!(target = "slotwatch.cdp", url = ws_url, "devtools connected");
		let (writer, reader) = socket.split();
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), events_tx));

		let connection = Arc::new(Self {
			last_id: AtomicU64::new(0),
			pending,
			writer: tokio::sync::Mutex::new(writer),
			timeout: COMMAND_TIMEOUT,
			reader,
		});
		Ok((connection, events_rx))
	}

	/// Sends one command and waits for its result.
	pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
		let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);

		let frame = serde_json::to_string(&Request { id, method, params })?;
		trace!(target = "slotwatch.cdp", id, method, "send");
		if let Err(err) = self.writer.lock().await.send(Message::Text(frame)).await {
			self.pending.lock().remove(&id);
			return Err(err.into());
		}

		match tokio::time::timeout(self.timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(CdpError::ConnectionClosed),
			Err(_) => {
				self.pending.lock().remove(&id);
				Err(CdpError::Timeout {
					method: method.to_string(),
					secs: self.timeout.as_secs(),
				})
			}
		}
	}

	pub fn is_closed(&self) -> bool {
		self.reader.is_finished()
	}

	pub async fn close(&self) {
		let _ = self.writer.lock().await.close().await;
		self.reader.abort();
	}
}

impl Drop for CdpConnection {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

async fn read_loop(mut reader: SplitStream<Socket>, pending: Pending, events: mpsc::UnboundedSender<CdpEvent>) {
	while let Some(frame) = reader.next().await {
		let text = match frame {
			Ok(Message::Text(text)) => text,
			Ok(Message::Close(_)) => break,
			Ok(_) => continue,
			Err(err) => {
				warn!(target = "slotwatch.cdp", error = %err, "devtools socket error");
				break;
			}
		};
		match serde_json::from_str::<Incoming>(&text) {
			Ok(incoming) => dispatch(incoming, &pending, &events),
			Err(err) => debug!(target = "slotwatch.cdp", error = %err, "unparseable devtools frame"),
		}
	}

	debug!(target = "slotwatch.cdp", "devtools reader stopped");
	// Dropping the senders fails every outstanding command with ConnectionClosed.
	pending.lock().clear();
}

fn dispatch(incoming: Incoming, pending: &Pending, events: &mpsc::UnboundedSender<CdpEvent>) {
	match (incoming.id, incoming.method) {
		(Some(id), _) => {
			let Some(callback) = pending.lock().remove(&id) else {
				trace!(target = "slotwatch.cdp", id, "response for unknown command");
				return;
			};
			let result = match incoming.error {
				Some(error) => Err(CdpError::Protocol {
					code: error.code,
					message: error.message,
				}),
				None => Ok(incoming.result.unwrap_or(Value::Null)),
			};
			let _ = callback.send(result);
		}
		(None, Some(method)) => {
			let _ = events.send(CdpEvent {
				method,
				params: incoming.params,
			});
		}
		(None, None) => {}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn parse(raw: Value) -> Incoming {
		serde_json::from_value(raw).unwrap()
	}

	#[tokio::test]
	async fn responses_complete_the_matching_command() {
		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let (events_tx, _events_rx) = mpsc::unbounded_channel();
		let (tx1, rx1) = oneshot::channel();
		let (tx2, rx2) = oneshot::channel();
		pending.lock().insert(1, tx1);
		pending.lock().insert(2, tx2);

		dispatch(parse(json!({"id": 2, "result": {"value": "second"}})), &pending, &events_tx);
		dispatch(parse(json!({"id": 1, "error": {"code": -32000, "message": "No node"}})), &pending, &events_tx);

		assert_eq!(rx2.await.unwrap().unwrap(), json!({"value": "second"}));
		assert!(matches!(rx1.await.unwrap(), Err(CdpError::Protocol { code: -32000, .. })));
		assert!(pending.lock().is_empty());
	}

	#[tokio::test]
	async fn frames_without_id_are_events() {
		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let (events_tx, mut events_rx) = mpsc::unbounded_channel();

		dispatch(
			parse(json!({"method": "Network.loadingFinished", "params": {"requestId": "7"}})),
			&pending,
			&events_tx,
		);

		let event = events_rx.recv().await.unwrap();
		assert_eq!(event.method, "Network.loadingFinished");
		assert_eq!(event.params["requestId"], "7");
	}

	#[test]
	fn unknown_response_ids_are_dropped() {
		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let (events_tx, _events_rx) = mpsc::unbounded_channel();
		dispatch(parse(json!({"id": 99, "result": {}})), &pending, &events_tx);
		assert!(pending.lock().is_empty());
	}
}
