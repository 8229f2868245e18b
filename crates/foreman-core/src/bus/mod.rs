//! In-process event bus: ordered pub/sub fan-out plus typed
//! request/response.
//!
//! `emit` awaits every subscriber in subscription order, so one handler is
//! on the critical path at a time; a handler may emit further events
//! re-entrantly because the registry lock is never held across handler
//! execution. `request` routes to the single responder registered for the
//! query kind, bounded by a timeout.

mod event;

pub use event::{Event, EventKind, Query, QueryKind, QueryReply};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, warn};

use foreman_db::{Error, Result};

type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type QueryResponder = Arc<dyn Fn(Query) -> BoxFuture<'static, Result<QueryReply>> + Send + Sync>;

/// Handle returned by `subscribe`, used for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Bus limits and timeouts.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Timeout applied to every `request` call.
    pub request_timeout: Duration,
    /// Cap on subscribers for a single event kind.
    pub max_subscribers_per_event: usize,
    /// Cap on total live subscriptions.
    pub max_subscriptions: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_subscribers_per_event: 16,
            max_subscriptions: 256,
        }
    }
}

struct Registry {
    next_id: u64,
    total: usize,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
    responders: HashMap<QueryKind, QueryResponder>,
}

pub struct EventBus {
    config: BusConfig,
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry {
                next_id: 1,
                total: 0,
                subscribers: HashMap::new(),
                responders: HashMap::new(),
            }),
        }
    }

    /// Register a handler for an event kind. Handlers run in subscription
    /// order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().expect("bus registry poisoned");

        if registry.total >= self.config.max_subscriptions {
            return Err(Error::system(format!(
                "subscription cap of {} reached",
                self.config.max_subscriptions
            )));
        }
        let per_kind = registry.subscribers.get(&kind).map_or(0, Vec::len);
        if per_kind >= self.config.max_subscribers_per_event {
            return Err(Error::system(format!(
                "subscriber cap of {} reached for {kind:?}",
                self.config.max_subscribers_per_event
            )));
        }

        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.total += 1;
        registry
            .subscribers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        for handlers in registry.subscribers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sub_id, _)| *sub_id == id) {
                handlers.remove(pos);
                registry.total -= 1;
                return true;
            }
        }
        false
    }

    /// Register the single responder for a query kind.
    pub fn respond<F>(&self, kind: QueryKind, responder: F) -> Result<()>
    where
        F: Fn(Query) -> BoxFuture<'static, Result<QueryReply>> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        if registry.responders.contains_key(&kind) {
            return Err(Error::system(format!(
                "responder already registered for {kind:?}"
            )));
        }
        registry.responders.insert(kind, Arc::new(responder));
        Ok(())
    }

    /// Fan the event out to every subscriber of its kind, awaiting each in
    /// subscription order. A failing handler is logged and later handlers
    /// still run; the first error is returned to the emitter.
    pub async fn emit(&self, event: Event) -> Result<()> {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, EventHandler)> = {
            let registry = self.registry.lock().expect("bus registry poisoned");
            registry.subscribers.get(&kind).cloned().unwrap_or_default()
        };

        debug!(event = ?kind, subscribers = handlers.len(), "emit");

        let mut first_error: Option<Error> = None;
        for (id, handler) in handlers {
            if let Err(err) = handler(event.clone()).await {
                error!(event = ?kind, subscription = id.0, error = %err, "event handler failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Deliver the query to its responder and return the reply, bounded by
    /// the configured timeout.
    pub async fn request(&self, query: Query) -> Result<QueryReply> {
        let kind = query.kind();
        let responder = {
            let registry = self.registry.lock().expect("bus registry poisoned");
            registry.responders.get(&kind).cloned()
        }
        .ok_or_else(|| Error::system(format!("no responder registered for {kind:?}")))?;

        match tokio::time::timeout(self.config.request_timeout, responder(query)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(query = ?kind, timeout = ?self.config.request_timeout, "request timed out");
                Err(Error::system(format!(
                    "request {kind:?} timed out after {:?}",
                    self.config.request_timeout
                )))
            }
        }
    }

    /// Number of live subscriptions across all event kinds.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().expect("bus registry poisoned").total
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
