//! Telegram Bot API delivery.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use slotwatch::config::TelegramSettings;
use slotwatch::notify::{Deliver, Event};
use slotwatch::{Error, Result};

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TelegramDelivery {
	client: reqwest::Client,
	settings: TelegramSettings,
	api_base: String,
}

impl TelegramDelivery {
	pub fn new(settings: TelegramSettings) -> Self {
		Self {
			client: reqwest::Client::new(),
			settings,
			api_base: API_BASE.to_string(),
		}
	}

	pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
		self.api_base = api_base.into();
		self
	}

	fn endpoint(&self) -> String {
		format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.settings.bot_token)
	}
}

#[async_trait]
impl Deliver for TelegramDelivery {
	async fn deliver(&self, event: &Event) -> Result<()> {
		let body = json!({
			"chat_id": self.settings.chat_id,
			"text": event.message(),
			"disable_web_page_preview": true,
		});
		// reqwest errors embed the URL, which carries the bot token.
		let response = self
			.client
			.post(self.endpoint())
			.timeout(SEND_TIMEOUT)
			.json(&body)
			.send()
			.await
			.map_err(|err| Error::Driver(format!("telegram request failed: {}", err.without_url())))?;
		let status = response.status();
		if !status.is_success() {
			return Err(Error::Driver(format!("telegram answered {status}")));
		}
		Ok(())
	}
}
