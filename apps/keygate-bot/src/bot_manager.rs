use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio::sync::Mutex;
use tracing::warn;

/// Outbound user messaging, as seen by the reconciliation engine.
/// Messages are MarkdownV2; callers escape their own text.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, tg_id: i64, text: &str) -> Result<()>;
}

/// Holds the bot instance once the dispatcher is up. Webhook-driven
/// notifications can fire before the bot is initialised; those are
/// logged and dropped rather than failing the reconciliation.
pub struct BotManager {
    bot: Mutex<Option<Bot>>,
}

impl BotManager {
    pub fn new() -> Self {
        Self { bot: Mutex::new(None) }
    }

    pub async fn set_bot(&self, bot: Bot) {
        let mut guard = self.bot.lock().await;
        *guard = Some(bot);
    }
}

impl Default for BotManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for BotManager {
    async fn send_message(&self, tg_id: i64, text: &str) -> Result<()> {
        let guard = self.bot.lock().await;
        match guard.as_ref() {
            Some(bot) => {
                bot.send_message(ChatId(tg_id), text)
                    .parse_mode(ParseMode::MarkdownV2)
                    .await?;
                Ok(())
            }
            None => {
                warn!("Bot is not initialised yet, dropping message to {}", tg_id);
                Ok(())
            }
        }
    }
}
