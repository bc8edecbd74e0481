//! Multiplexes tagged handlers over shared connections.
//!
//! One [`ConnectionManager`] exists per endpoint, created by the first
//! subscription to it and torn down when the last [`Subscription`] for
//! it is dropped. Inbound messages are dispatched by a per-endpoint task
//! in transport order to every handler registered for the message's
//! [`EventTag`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;
use crate::events::ConnectionEvent;
use crate::messages::{EventTag, ServerMessage};
use crate::transport::Connector;

/// Callback invoked for every matching inbound message.
pub type Handler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Routes inbound messages to handlers keyed by `(endpoint, tag)`.
///
/// Cheap to clone; clones share the same endpoints and handlers.
#[derive(Clone)]
pub struct SubscriptionRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    base_config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    endpoints: Mutex<HashMap<String, EndpointEntry>>,
    next_id: AtomicU64,
}

struct EndpointEntry {
    connection: Arc<ConnectionManager>,
    handlers: Vec<HandlerEntry>,
    dispatcher: CancellationToken,
}

struct HandlerEntry {
    id: u64,
    tag: EventTag,
    handler: Handler,
    active: Arc<AtomicBool>,
}

/// Handle for one registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    router: Arc<RouterInner>,
    endpoint: String,
    id: u64,
    tag: EventTag,
    active: Arc<AtomicBool>,
}

impl SubscriptionRouter {
    /// `base_config` is cloned for every endpoint with only the URL replaced.
    pub fn new(base_config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                base_config,
                connector,
                endpoints: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for messages tagged `tag` on `endpoint`.
    ///
    /// The first subscription to an endpoint opens its connection.
    pub fn subscribe<F>(&self, endpoint: &str, tag: EventTag, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let entry = HandlerEntry {
            id,
            tag,
            handler: Arc::new(handler),
            active: Arc::clone(&active),
        };

        let mut endpoints = self.inner.lock_endpoints();
        match endpoints.get_mut(endpoint) {
            Some(existing) => existing.handlers.push(entry),
            None => {
                let connection = Arc::new(ConnectionManager::new(
                    self.inner.base_config.for_endpoint(endpoint),
                    Arc::clone(&self.inner.connector),
                ));
                let dispatcher = CancellationToken::new();

                // Subscribe to events before connecting so nothing is missed.
                tokio::spawn(dispatch_loop(
                    Arc::downgrade(&self.inner),
                    endpoint.to_string(),
                    connection.subscribe(),
                    dispatcher.clone(),
                ));
                connection.connect();

                tracing::info!(endpoint = %endpoint, "Opened endpoint for first subscription");
                endpoints.insert(
                    endpoint.to_string(),
                    EndpointEntry {
                        connection,
                        handlers: vec![entry],
                        dispatcher,
                    },
                );
            }
        }
        drop(endpoints);

        tracing::debug!(endpoint = %endpoint, tag = %tag, handler_id = id, "Handler subscribed");

        Subscription {
            router: Arc::clone(&self.inner),
            endpoint: endpoint.to_string(),
            id,
            tag,
            active,
        }
    }

    /// The live connection for `endpoint`, if anything is subscribed to it.
    pub fn connection(&self, endpoint: &str) -> Option<Arc<ConnectionManager>> {
        self.inner
            .lock_endpoints()
            .get(endpoint)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Number of endpoints with at least one handler.
    pub fn endpoint_count(&self) -> usize {
        self.inner.lock_endpoints().len()
    }

    /// Number of handlers registered on `endpoint`.
    pub fn handler_count(&self, endpoint: &str) -> usize {
        self.inner
            .lock_endpoints()
            .get(endpoint)
            .map_or(0, |entry| entry.handlers.len())
    }
}

impl RouterInner {
    fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<String, EndpointEntry>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_handler(&self, endpoint: &str, id: u64) {
        let mut endpoints = self.lock_endpoints();
        let Some(entry) = endpoints.get_mut(endpoint) else {
            return;
        };
        entry.handlers.retain(|h| h.id != id);
        if !entry.handlers.is_empty() {
            return;
        }

        if let Some(entry) = endpoints.remove(endpoint) {
            drop(endpoints);
            entry.dispatcher.cancel();
            entry.connection.close();
            tracing::info!(endpoint = %endpoint, "Last handler gone, closing endpoint");
        }
    }

    /// Invoke every active handler for the message's tag, in
    /// registration order.
    fn dispatch(&self, endpoint: &str, message: &ServerMessage) {
        let tag = message.tag();
        let targets: Vec<(Handler, Arc<AtomicBool>)> = match self.lock_endpoints().get(endpoint) {
            Some(entry) => entry
                .handlers
                .iter()
                .filter(|h| h.tag == tag)
                .map(|h| (Arc::clone(&h.handler), Arc::clone(&h.active)))
                .collect(),
            None => return,
        };

        for (handler, active) in targets {
            // Re-checked per call: an earlier handler may have unsubscribed this one.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (*handler)(message))).is_err() {
                tracing::error!(endpoint = %endpoint, tag = %tag, "Handler panicked");
            }
        }
    }
}

async fn dispatch_loop(
    router: Weak<RouterInner>,
    endpoint: String,
    mut events: broadcast::Receiver<ConnectionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Message(message)) => {
                let Some(router) = router.upgrade() else {
                    break;
                };
                router.dispatch(&endpoint, &message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(endpoint = %endpoint, skipped, "Dispatcher lagged, messages dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!(endpoint = %endpoint, "Dispatcher stopped");
}

impl Subscription {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery immediately. Idempotent.
    ///
    /// Takes effect for messages already being dispatched, too.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.router.remove_handler(&self.endpoint, self.id);
            tracing::debug!(endpoint = %self.endpoint, tag = %self.tag, handler_id = self.id, "Handler unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("endpoint", &self.endpoint)
            .field("tag", &self.tag)
            .field("active", &self.is_active())
            .finish()
    }
}
