use crate::config;
use chatterbox::message::{Dispatcher, Message};
use log::{debug, error, info};
use tokio::sync::mpsc::Receiver;

/// A container transitioned to "update available" during a refresh cycle.
#[derive(Debug)]
pub struct UpdateEvent {
    pub container: String,
    pub image: String,
    pub description: String,
}

pub fn setup_dispatcher(config: Option<&config::Dispatcher>) -> Dispatcher {
    let slack = config
        .and_then(|dispatcher| dispatcher.slack.as_ref())
        .map(|slack| {
            info!("Using Slack dispatcher");
            chatterbox::dispatcher::slack::Slack {
                webhook_url: slack.webhook.clone(),
                channel: slack.channel.clone(),
            }
        });
    let telegram = config
        .and_then(|dispatcher| dispatcher.telegram.as_ref())
        .map(|telegram| {
            info!("Using Telegram dispatcher");
            chatterbox::dispatcher::telegram::Telegram {
                bot_token: telegram.token.clone(),
                chat_id: telegram.chat.clone(),
            }
        });
    let sender = chatterbox::dispatcher::Sender {
        slack,
        telegram,
        email: None,
    };

    Dispatcher::new(sender)
}

pub async fn start_notification_handler(mut rx: Receiver<UpdateEvent>, dispatcher: Dispatcher) {
    while let Some(event) = rx.recv().await {
        debug!("dispatching update notification for {}", event.container);
        let body = format!(
            "update available for {} ({})\n{}",
            event.container, event.image, event.description
        );
        let message = Message::new_now("update available", body);
        _ = dispatcher
            .dispatch(&message)
            .await
            .inspect_err(|e| error!("failed to dispatch message: {e}"));
    }
}
