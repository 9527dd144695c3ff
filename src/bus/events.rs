//! Bus event loop
//!
//! Single consumer of [`BusEvent`]s: replies go to the [`ReplyDispatcher`],
//! everything else to the generic message callback.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::ReplyDispatcher;
use crate::presence;
use crate::topic::TopicScheme;

use super::BusEvent;

/// Callback for non-reply messages: `(topic, payload)`
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub struct BusEventLoop {
    topics: TopicScheme,
    dispatcher: Arc<ReplyDispatcher>,
    on_generic_message: MessageCallback,
}

impl BusEventLoop {
    /// Event loop with the presence logger as generic callback
    pub fn new(topics: TopicScheme, dispatcher: Arc<ReplyDispatcher>) -> Self {
        let presence_topics = topics.clone();
        let on_generic_message: MessageCallback = Arc::new(move |topic: &str, payload: &[u8]| {
            presence::handle_message(&presence_topics, topic, payload);
        });

        Self {
            topics,
            dispatcher,
            on_generic_message,
        }
    }

    /// Replace the generic message callback
    pub fn with_generic_callback(mut self, callback: MessageCallback) -> Self {
        self.on_generic_message = callback;
        self
    }

    /// Handle one event
    pub async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Connected => {
                info!("Bus connected");
            }
            BusEvent::Disconnected { reason } => {
                warn!(reason = %reason, "Bus disconnected");
            }
            BusEvent::Message { topic, payload } => match self.topics.reply_unit(&topic) {
                Some(unit) => {
                    debug!(unit = %unit, topic = %topic, bytes = payload.len(), "Reply received");
                    // Failures are logged by the dispatcher
                    let _ = self.dispatcher.dispatch(unit, &payload).await;
                }
                None => (self.on_generic_message)(topic.as_str(), &payload[..]),
            },
        }
    }

    /// Consume events until every sender is gone
    pub async fn run(self, mut events: mpsc::Receiver<BusEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Bus event channel closed");
    }

    pub fn spawn(self, events: mpsc::Receiver<BusEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }
}
