//! In-process event bus.
//!
//! A single-process master has no broker to reach; this bus fans events out
//! over a broadcast channel while keeping the subject-pattern subscription
//! surface of the `EventBus` port.

use async_trait::async_trait;
use futures::{future, StreamExt};
use kiln_core::events::Event;
use kiln_core::ports::{EventBus, EventStream};
use kiln_core::Result;
use tokio::sync::broadcast;

pub struct LocalEventBus {
    tx: broadcast::Sender<Event>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |item: &Result<Event>| {
            let keep = match item {
                Ok(event) => subject_matches(&pattern, &event.subject()),
                Err(_) => true,
            };
            future::ready(keep)
        });

        Ok(Box::pin(stream))
    }
}

/// Subject pattern matching: `*` matches one token, `>` matches one or more
/// trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
