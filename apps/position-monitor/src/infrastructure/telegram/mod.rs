//! Notification Sinks
//!
//! `TelegramSink` delivers rendered notifications to a chat through the
//! Bot API. `LogSink` writes them to the log when no chat is configured.

use async_trait::async_trait;
use teloxide::prelude::*;

use crate::application::ports::NotificationSink;
use crate::infrastructure::config::TelegramSettings;

/// Telegram's per-message limit, counted in UTF-16 code units.
pub const MAX_MESSAGE_UNITS: usize = 4096;

/// Delivers notifications to a single Telegram chat.
pub struct TelegramSink {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramSink {
    /// Create a sink for the configured bot and chat.
    #[must_use]
    pub fn new(settings: &TelegramSettings) -> Self {
        Self {
            bot: Bot::new(settings.bot_token.clone()),
            chat_id: ChatId(settings.chat_id),
        }
    }
}

impl std::fmt::Debug for TelegramSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSink")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn deliver(&self, text: &str) {
        for chunk in split_message(text, MAX_MESSAGE_UNITS) {
            if let Err(e) = self.bot.send_message(self.chat_id, chunk).await {
                tracing::error!(error = %e, "Failed to send Telegram message");
                return;
            }
        }
        tracing::debug!("Sent Telegram message");
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, text: &str) {
        tracing::info!(target: "position_monitor::notifications", "{text}");
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Split `text` into consecutive chunks of at most `limit` UTF-16 code
/// units, never inside a character.
fn split_message(text: &str, limit: usize) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut units = 0;
        let mut end = rest.len();
        for (idx, ch) in rest.char_indices() {
            units += ch.len_utf16();
            if units > limit {
                end = idx;
                break;
            }
        }
        if end == 0 {
            // A single character wider than the limit still has to go out.
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("", 0 ; "empty")]
    #[test_case("short", 1 ; "under limit")]
    fn chunk_counts(text: &str, expected: usize) {
        assert_eq!(split_message(text, MAX_MESSAGE_UNITS).len(), expected);
    }

    #[test]
    fn long_messages_split_at_limit() {
        let text = "a".repeat(MAX_MESSAGE_UNITS * 2 + 10);

        let chunks = split_message(&text, MAX_MESSAGE_UNITS);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_MESSAGE_UNITS);
        assert_eq!(chunks[2].len(), 10);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn splits_on_char_boundaries() {
        let text = "📈".repeat(5);

        let chunks = split_message(&text, 4);

        assert_eq!(chunks, vec!["📈📈", "📈📈", "📈"]);
    }

    #[test]
    fn emoji_heavy_messages_fit_the_utf16_limit() {
        let text = format!("a{}", "📉".repeat(3000));

        let chunks = split_message(&text, MAX_MESSAGE_UNITS);

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.encode_utf16().count() <= MAX_MESSAGE_UNITS));
        assert_eq!(chunks[0].encode_utf16().count(), MAX_MESSAGE_UNITS - 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn character_wider_than_limit_is_sent_alone() {
        assert_eq!(split_message("📈x", 1), vec!["📈", "x"]);
    }

    #[tokio::test]
    async fn log_sink_accepts_messages() {
        let sink = LogSink;
        sink.deliver("hello").await;
        assert_eq!(sink.name(), "log");
    }
}
