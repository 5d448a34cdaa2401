//! Chat command loop.
//!
//! Long-polls the bot API and maps commands onto the subscriber registry:
//! `/start` subscribes, `/stop` unsubscribes, `/status` reports the
//! scheduler state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::scheduler::SchedulerStatus;
use crate::shutdown::ShutdownSignal;
use crate::subscribers::{StoreError, SubscriberId, SubscriberRegistry};
use crate::telegram::TelegramClient;

const LONG_POLL: Duration = Duration::from_secs(25);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Help,
}

impl Command {
    /// Parse a message. Non-command text yields None.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let word = word.strip_prefix('/')?;
        // Group chats address commands as /cmd@botname.
        let name = word.split('@').next().unwrap_or(word);

        Some(match name.to_ascii_lowercase().as_str() {
            "start" | "subscribe" => Self::Start,
            "stop" | "unsubscribe" => Self::Stop,
            "status" => Self::Status,
            _ => Self::Help,
        })
    }
}

/// Subscriber command handler and update loop.
pub struct CommandBot {
    client: Arc<TelegramClient>,
    registry: Arc<SubscriberRegistry>,
    status: watch::Receiver<SchedulerStatus>,
    shutdown: ShutdownSignal,
}

impl CommandBot {
    pub fn new(
        client: Arc<TelegramClient>,
        registry: Arc<SubscriberRegistry>,
        status: watch::Receiver<SchedulerStatus>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            client,
            registry,
            status,
            shutdown,
        }
    }

    /// Poll for updates until shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting bot command loop");
        let mut offset = 0i64;

        loop {
            let polled = tokio::select! {
                polled = self.client.get_updates(offset, LONG_POLL) => polled,
                _ = self.shutdown.cancelled() => break,
            };

            let updates = match polled {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Failed to poll updates");
                    if self.shutdown.sleep(ERROR_BACKOFF).await {
                        break;
                    }
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);

                let Some(message) = update.message else {
                    continue;
                };
                let Some(command) = message.text.as_deref().and_then(Command::parse) else {
                    continue;
                };

                let chat = SubscriberId(message.chat.id);
                let reply = match handle_command(&self.registry, &self.status, chat, command).await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(subscriber = %chat, error = %e, "Failed to update subscriber store");
                        "Something went wrong, please try again later.".to_string()
                    }
                };

                if let Err(e) = self.client.send_message(chat.0, &reply).await {
                    debug!(subscriber = %chat, error = %e, "Failed to send reply");
                }
            }
        }

        info!("Bot command loop stopped");
        Ok(())
    }
}

/// Apply `command` for `chat` and build the reply.
pub async fn handle_command(
    registry: &SubscriberRegistry,
    status: &watch::Receiver<SchedulerStatus>,
    chat: SubscriberId,
    command: Command,
) -> Result<String, StoreError> {
    let reply = match command {
        Command::Start => {
            if registry.subscribe(chat).await? {
                info!(subscriber = %chat, "Subscribed");
                concat!(
                    "Subscribed. You will get a message whenever the available slots change.\n",
                    "Send /stop to unsubscribe."
                )
                .to_string()
            } else {
                "You are already subscribed. Send /stop to unsubscribe.".to_string()
            }
        }
        Command::Stop => {
            if registry.unsubscribe(chat).await? {
                info!(subscriber = %chat, "Unsubscribed");
                "Unsubscribed. Send /start to subscribe again.".to_string()
            } else {
                "You are not subscribed. Send /start to subscribe.".to_string()
            }
        }
        Command::Status => {
            let current = status.borrow().clone();
            let last_success = current
                .last_success
                .map(|t| t.format("%d.%m.%Y %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            let subscribed = if registry.contains(chat).await {
                "yes"
            } else {
                "no"
            };
            format!(
                "<b>Monitor status</b>\nCycles run: {}\nLast successful cycle: {}\n\
                 Subscribers: {}\nYou are subscribed: {}",
                current.cycle_count,
                last_success,
                registry.len().await,
                subscribed
            )
        }
        Command::Help => concat!(
            "Commands:\n",
            "/start - subscribe to slot updates\n",
            "/stop - unsubscribe\n",
            "/status - monitor status"
        )
        .to_string(),
    };

    Ok(reply)
}
