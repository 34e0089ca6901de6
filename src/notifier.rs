// src/notifier.rs
//
// Chat notification channel. Only the "send message" capability is used;
// delivery is fire-and-forget from the pipeline's point of view.

use std::time::Duration;
use tracing::{error, info, warn};

pub trait Notifier: Send + Sync {
    /// Deliver `text` to the linked chat. Returns whether the send
    /// succeeded; the caller decides what a failure means.
    fn send(&self, chat_id: &str, text: &str) -> bool;
}

pub struct TelegramNotifier {
    token: String,
    client: reqwest::blocking::Client,
}

impl TelegramNotifier {
    pub fn new(token: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self { token, client }
    }
}

impl Notifier for TelegramNotifier {
    fn send(&self, chat_id: &str, text: &str) -> bool {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": escape_markdown_v2(text),
            "parse_mode": "MarkdownV2",
        });

        match self.client.post(&url).json(&payload).send() {
            Ok(resp) => {
                let status = resp.status();
                let ok = resp
                    .json::<serde_json::Value>()
                    .map(|body| body["ok"].as_bool().unwrap_or(false))
                    .unwrap_or(false);
                if ok {
                    info!("Telegram message delivered to chat {}", chat_id);
                } else {
                    warn!(
                        "Telegram API rejected message for chat {} (status {})",
                        chat_id, status
                    );
                }
                ok
            }
            Err(e) => {
                error!("Failed to reach Telegram for chat {}: {}", chat_id, e);
                false
            }
        }
    }
}

/// Stand-in when no bot token is configured: every send fails, so the
/// pipeline keeps running and only the notifications are missing.
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn send(&self, chat_id: &str, _text: &str) -> bool {
        warn!(
            "Notifications are disabled (no bot token), dropping message for chat {}",
            chat_id
        );
        false
    }
}

/// Escape for Telegram MarkdownV2, which treats most punctuation as markup.
fn escape_markdown_v2(text: &str) -> String {
    const ESCAPED: &str = r"_*[]()~`>#+-=|{}.!";
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ESCAPED.contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_markdown_v2() {
        assert_eq!(
            escape_markdown_v2("Moved 50.0px in 0.45s!"),
            "Moved 50\\.0px in 0\\.45s\\!"
        );
        assert_eq!(escape_markdown_v2("plain text"), "plain text");
    }
}
