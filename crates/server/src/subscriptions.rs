//! In-process record of topic subscriptions.
//!
//! Clients subscribe with a header of parameters. The registry keys each
//! subscription by its `topic` parameter and remembers which identities
//! hold it, so an application can fan a message out to every subscriber.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use protocol::Header;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::requests::SubscribeRequest;

/// Header field naming the topic of a subscription.
pub const TOPIC_PARAM: &str = "topic";

/// A subscribed identity, as `(service, username)`.
pub type Subscriber = (String, String);

/// Topic subscriptions, applied from [`SubscribeRequest`]s.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: DashMap<String, BTreeSet<Subscriber>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one request. Returns false if it was ignored.
    ///
    /// Requests without a topic parameter are ignored.
    pub fn apply(&self, req: &SubscribeRequest) -> bool {
        let Some(topic) = topic_of(&req.params) else {
            tracing::debug!(
                service = %req.service,
                username = %req.username,
                "subscription without topic ignored"
            );
            return false;
        };
        let who = (req.service.clone(), req.username.clone());
        if req.subscribe {
            self.topics.entry(topic.to_string()).or_default().insert(who);
        } else {
            if let Some(mut subs) = self.topics.get_mut(topic) {
                subs.remove(&who);
            }
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
        tracing::debug!(
            service = %req.service,
            username = %req.username,
            topic,
            subscribe = req.subscribe,
            "subscription updated"
        );
        true
    }

    /// Identities subscribed to `topic`, in sorted order.
    pub fn subscribers(&self, topic: &str) -> Vec<Subscriber> {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str, service: &str, username: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subs| subs.contains(&(service.to_string(), username.to_string())))
    }

    /// Consumes subscription requests until the queue closes or `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SubscribeRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => {
                        self.apply(&req);
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("subscription registry stopped");
    }
}

fn topic_of(params: &Header) -> Option<&str> {
    params
        .get(TOPIC_PARAM)
        .map(String::as_str)
        .filter(|topic| !topic.is_empty())
}
