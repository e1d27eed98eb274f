//! Telegram delivery against a local HTTP endpoint.

use chrono::NaiveDate;
use serde_json::Value;
use slotwatch::config::TelegramSettings;
use slotwatch::notify::{Deliver, Event};
use slotwatch_cli::telegram::TelegramDelivery;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

async fn read_request(stream: &mut TcpStream) -> String {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	loop {
		let n = stream.read(&mut chunk).await.unwrap();
		if n == 0 {
			break;
		}
		buf.extend_from_slice(&chunk[..n]);
		let text = String::from_utf8_lossy(&buf).to_string();
		if let Some(split) = text.find("\r\n\r\n") {
			let length = text[..split]
				.to_ascii_lowercase()
				.lines()
				.find_map(|line| line.strip_prefix("content-length:").map(|v| v.trim().to_string()))
				.and_then(|v| v.parse::<usize>().ok())
				.unwrap_or(0);
			if buf.len() >= split + 4 + length {
				break;
			}
		}
	}
	String::from_utf8(buf).unwrap()
}

/// Answers one request with `status` and hands back the raw request.
async fn endpoint(status: &'static str) -> (String, JoinHandle<String>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let server = tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.unwrap();
		let request = read_request(&mut stream).await;
		let body = "{\"ok\":true}";
		let response = format!(
			"HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
			body.len()
		);
		stream.write_all(response.as_bytes()).await.unwrap();
		request
	});
	(format!("http://{addr}"), server)
}

fn settings() -> TelegramSettings {
	TelegramSettings {
		bot_token: "123:abc".into(),
		chat_id: "42".into(),
	}
}

#[tokio::test]
async fn posts_event_message_to_the_chat() {
	let (base, server) = endpoint("200 OK").await;
	let delivery = TelegramDelivery::new(settings()).with_api_base(base);
	let event = Event::SlotDetected {
		date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
	};

	delivery.deliver(&event).await.unwrap();

	let request = server.await.unwrap();
	assert!(request.starts_with("POST /bot123:abc/sendMessage "), "{request}");
	let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
	let json: Value = serde_json::from_str(body).unwrap();
	assert_eq!(json["chat_id"], "42");
	assert_eq!(json["text"], "Slot detected on 2026-02-10");
}

#[tokio::test]
async fn rejected_delivery_is_an_error() {
	let (base, server) = endpoint("401 Unauthorized").await;
	let delivery = TelegramDelivery::new(settings()).with_api_base(base);
	let event = Event::SlotDetected {
		date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
	};

	let err = delivery.deliver(&event).await.unwrap_err();
	assert!(err.to_string().contains("401"), "{err}");
	server.await.unwrap();
}
