//! Delivery of messages to online connections.
//!
//! The router keeps every live [`ServerConn`] indexed by identity. A message
//! addressed to an identity is first stored in the cache, then sent to each
//! of that identity's connections. Clients that miss it while offline pick it
//! up later with a retrieval command.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use msgcache::MessageCache;
use protocol::{Header, Message, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conn::ServerConn;
use crate::requests::ForwardRequest;

type Identity = (String, String);

/// Outcome of delivering one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Id the message was cached under.
    pub id: String,
    /// Connections the message (or its digest) was written to.
    pub sent: usize,
    /// Whether any receiving connection was visible.
    pub any_visible: bool,
}

/// Routes messages to the connections of an identity.
pub struct ForwardRouter {
    cache: Arc<dyn MessageCache>,
    conns: DashMap<Identity, Vec<Arc<ServerConn>>>,
}

impl ForwardRouter {
    pub fn new(cache: Arc<dyn MessageCache>) -> Self {
        Self {
            cache,
            conns: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn MessageCache> {
        &self.cache
    }

    /// Adds a connection to the routing table.
    pub fn register(&self, conn: Arc<ServerConn>) {
        let key = (conn.service().to_string(), conn.username().to_string());
        tracing::debug!(service = %key.0, username = %key.1, "registering connection");
        self.conns.entry(key).or_default().push(conn);
    }

    /// Removes a connection. Returns false if it was not registered.
    pub fn unregister(&self, conn: &Arc<ServerConn>) -> bool {
        let key = (conn.service().to_string(), conn.username().to_string());
        let mut removed = false;
        if let Some(mut entry) = self.conns.get_mut(&key) {
            let before = entry.len();
            entry.retain(|c| !Arc::ptr_eq(c, conn));
            removed = entry.len() != before;
        }
        self.conns.remove_if(&key, |_, list| list.is_empty());
        removed
    }

    /// Live connections of an identity.
    pub fn connections(&self, service: &str, username: &str) -> Vec<Arc<ServerConn>> {
        self.conns
            .get(&(service.to_string(), username.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Number of live connections across all identities.
    pub fn connection_count(&self) -> usize {
        self.conns.iter().map(|entry| entry.value().len()).sum()
    }

    /// Caches `msg` for an identity and sends it to each of its connections.
    ///
    /// A failed write is logged and does not affect other connections; the
    /// cached copy stays available either way.
    pub async fn deliver(
        &self,
        service: &str,
        username: &str,
        msg: &Message,
        extra: Option<&Header>,
        ttl: Duration,
    ) -> Result<Delivery> {
        let id = self.cache.cache_message(service, username, msg, ttl).await?;
        let mut delivery = Delivery {
            id,
            sent: 0,
            any_visible: false,
        };

        // Clone the list so no map shard is locked across writes.
        for conn in self.connections(service, username) {
            delivery.any_visible |= conn.visible();
            match conn.send_message(msg, extra, ttl, &delivery.id).await {
                Ok(()) => delivery.sent += 1,
                Err(e) => {
                    tracing::warn!(service, username, error = %e, "failed to deliver message");
                }
            }
        }

        tracing::debug!(
            service,
            username,
            id = %delivery.id,
            sent = delivery.sent,
            "message delivered"
        );
        Ok(delivery)
    }

    /// Delivers a forward request to its receiver.
    pub async fn handle_forward(&self, req: ForwardRequest) -> Result<Delivery> {
        self.deliver(&req.receiver_service, &req.receiver, &req.message, None, req.ttl)
            .await
    }

    /// Consumes forward requests until the queue closes or `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ForwardRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            let req = tokio::select! {
                _ = shutdown.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            let (service, receiver) = (req.receiver_service.clone(), req.receiver.clone());
            if let Err(e) = self.handle_forward(req).await {
                tracing::warn!(
                    service = %service,
                    receiver = %receiver,
                    error = %e,
                    "forward failed"
                );
            }
        }
        tracing::debug!("forward router stopped");
    }
}

impl std::fmt::Debug for ForwardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardRouter")
            .field("identities", &self.conns.len())
            .finish_non_exhaustive()
    }
}
