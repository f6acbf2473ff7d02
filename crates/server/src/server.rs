//! Server assembly.
//!
//! [`Server`] ties the pieces together: it authenticates incoming streams,
//! wraps each in a [`ServerConn`], registers it with the [`ForwardRouter`]
//! and drives its read loop until the client goes away. Forward and
//! subscription requests flow through two bounded queues consumed by
//! background workers started with [`Server::spawn_workers`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use msgcache::MessageCache;
use protocol::{accept, Authenticator, ProtocolError, ServerKey, ServerPublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conn::ServerConn;
use crate::requests::{ForwardRequest, IncomingMessage, SubscribeRequest};
use crate::router::ForwardRouter;
use crate::settings::{ConnSettings, DEFAULT_COMPRESS_THRESHOLD, DEFAULT_DIGEST_THRESHOLD};
use crate::subscriptions::SubscriptionRegistry;

/// Capacity of the forward and subscription request queues.
pub const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// Default deadline for key exchange plus authentication.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables of a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub handshake_timeout: Duration,
    pub digest_threshold: i32,
    pub compress_threshold: i32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            digest_threshold: DEFAULT_DIGEST_THRESHOLD,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }
}

/// A push-message server.
pub struct Server {
    key: ServerKey,
    auth: Arc<dyn Authenticator>,
    cache: Arc<dyn MessageCache>,
    router: Arc<ForwardRouter>,
    subscriptions: Arc<SubscriptionRegistry>,
    options: ServerOptions,
    forward_tx: mpsc::Sender<ForwardRequest>,
    subscribe_tx: mpsc::Sender<SubscribeRequest>,
    forward_rx: Mutex<Option<mpsc::Receiver<ForwardRequest>>>,
    subscribe_rx: Mutex<Option<mpsc::Receiver<SubscribeRequest>>>,
    incoming_tx: Option<mpsc::Sender<IncomingMessage>>,
}

impl Server {
    pub fn new(
        key: ServerKey,
        auth: Arc<dyn Authenticator>,
        cache: Arc<dyn MessageCache>,
        options: ServerOptions,
    ) -> Self {
        let (forward_tx, forward_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        Self {
            key,
            auth,
            router: Arc::new(ForwardRouter::new(Arc::clone(&cache))),
            cache,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            options,
            forward_tx,
            subscribe_tx,
            forward_rx: Mutex::new(Some(forward_rx)),
            subscribe_rx: Mutex::new(Some(subscribe_rx)),
            incoming_tx: None,
        }
    }

    /// Routes messages clients send to the server into `tx`.
    ///
    /// Without it such messages are logged and dropped.
    pub fn with_incoming(mut self, tx: mpsc::Sender<IncomingMessage>) -> Self {
        self.incoming_tx = Some(tx);
        self
    }

    pub fn public_key(&self) -> ServerPublicKey {
        self.key.public_key()
    }

    pub fn router(&self) -> &Arc<ForwardRouter> {
        &self.router
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn cache(&self) -> &Arc<dyn MessageCache> {
        &self.cache
    }

    /// Starts the forward and subscription workers.
    ///
    /// Only the first call starts anything; later calls return no handles.
    pub fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let forward_rx = self
            .forward_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = forward_rx {
            handles.push(tokio::spawn(
                Arc::clone(&self.router).run(rx, shutdown.clone()),
            ));
        }
        let subscribe_rx = self
            .subscribe_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = subscribe_rx {
            handles.push(tokio::spawn(
                Arc::clone(&self.subscriptions).run(rx, shutdown.clone()),
            ));
        }
        handles
    }

    /// Accepts TCP connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                server
                    .handle_stream(stream, &peer.to_string(), shutdown)
                    .await;
            });
        }
        tracing::info!("stopped accepting connections");
        Ok(())
    }

    /// Runs one connection from handshake to close.
    pub async fn handle_stream<S>(&self, stream: S, peer: &str, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = match accept(
            stream,
            &self.key,
            self.auth.as_ref(),
            self.options.handshake_timeout,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(peer, error = %e, "connection rejected");
                return;
            }
        };

        let conn = Arc::new(ServerConn::with_settings(
            conn,
            ConnSettings::new(
                self.options.digest_threshold,
                self.options.compress_threshold,
            ),
        ));
        conn.set_message_cache(Arc::clone(&self.cache));
        conn.set_forward_request_channel(self.forward_tx.clone());
        conn.set_subscribe_request_channel(self.subscribe_tx.clone());

        tracing::info!(
            peer,
            service = conn.service(),
            username = conn.username(),
            "client connected"
        );
        self.router.register(Arc::clone(&conn));

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.read_loop(&conn) => {}
        }

        self.router.unregister(&conn);
        conn.close().await;
        tracing::info!(
            peer,
            service = conn.service(),
            username = conn.username(),
            "client disconnected"
        );
    }

    async fn read_loop(&self, conn: &ServerConn) {
        loop {
            let message = match conn.read_message().await {
                Ok(message) => message,
                Err(ProtocolError::ConnectionClosed(_)) => return,
                Err(e) => {
                    tracing::warn!(
                        service = conn.service(),
                        username = conn.username(),
                        error = %e,
                        "connection error"
                    );
                    return;
                }
            };
            let incoming = IncomingMessage {
                service: conn.service().to_string(),
                username: conn.username().to_string(),
                message,
            };
            match &self.incoming_tx {
                Some(tx) => {
                    if tx.send(incoming).await.is_err() {
                        tracing::warn!("incoming message queue closed");
                        return;
                    }
                }
                None => {
                    tracing::debug!(
                        service = conn.service(),
                        username = conn.username(),
                        size = incoming.message.size(),
                        "dropping message sent to server"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
