//! Subscription and handler registries.
//!
//! Both registries are plain single-owner state: the connection actor owns
//! them and every read or write runs on its task, in mailbox order.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, error};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::enums::{FrameKind, Service, ServiceState};
use crate::models::ServiceMessage;

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// A stream of messages delivered to a channel callback.
pub struct TypedStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> TypedStream<T> {
    /// Wait for the next message; `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for TypedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A registered message callback.
///
/// Identity for removal is the callback itself: clones of one `Callback`
/// compare equal through [`Callback::same`], separately built ones never do.
pub enum Callback<T> {
    /// Runs inline on the actor task. Keep it short.
    Sync(Arc<dyn Fn(&T) + Send + Sync>),
    /// Each invocation spawns the returned future; it is not awaited.
    Async(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>),
    /// Forwards messages to a [`TypedStream`]; dropped once the stream is.
    Channel(mpsc::UnboundedSender<T>),
}

impl<T: Clone + Send + 'static> Callback<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Callback::Async(Arc::new(move |msg| f(msg).boxed()))
    }

    /// A channel callback and the stream it feeds.
    pub fn channel() -> (Self, TypedStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Callback::Channel(tx), TypedStream { rx })
    }

    pub fn invoke(&self, msg: &T) {
        match self {
            Callback::Sync(f) => f(msg),
            Callback::Async(f) => {
                tokio::spawn(f(msg.clone()));
            }
            Callback::Channel(tx) => {
                let _ = tx.send(msg.clone());
            }
        }
    }
}

impl<T> Callback<T> {
    /// True for a channel whose stream has been dropped.
    pub fn is_closed(&self) -> bool {
        matches!(self, Callback::Channel(tx) if tx.is_closed())
    }

    pub fn same(&self, other: &Callback<T>) -> bool {
        match (self, other) {
            (Callback::Sync(a), Callback::Sync(b)) => Arc::ptr_eq(a, b),
            (Callback::Async(a), Callback::Async(b)) => Arc::ptr_eq(a, b),
            (Callback::Channel(a), Callback::Channel(b)) => a.same_channel(b),
            _ => false,
        }
    }
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Callback::Sync(f) => Callback::Sync(Arc::clone(f)),
            Callback::Async(f) => Callback::Async(Arc::clone(f)),
            Callback::Channel(tx) => Callback::Channel(tx.clone()),
        }
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => f.write_str("Callback::Sync"),
            Callback::Async(_) => f.write_str("Callback::Async"),
            Callback::Channel(_) => f.write_str("Callback::Channel"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription registry
// ---------------------------------------------------------------------------

/// Per-service acknowledgement state.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    services: HashMap<Service, ServiceState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a service as requested. Leaves an existing entry untouched.
    pub fn mark_requested(&mut self, service: &Service) {
        if !self.services.contains_key(service) {
            debug!("registry.requested service={service}");
            self.services.insert(service.clone(), ServiceState::Acked);
        }
    }

    pub fn mark_active(&mut self, service: &Service) {
        debug!("registry.subscribed service={service}");
        self.services.insert(service.clone(), ServiceState::Subscribed);
    }

    /// Stop tracking a service. `failure` carries the content of a rejected
    /// SUBS acknowledgement. Returns whether the service was tracked.
    pub fn remove(&mut self, service: &Service, failure: Option<&Value>) -> bool {
        let removed = self.services.remove(service).is_some();
        match failure {
            Some(content) => error!("registry.subscribe_failed service={service} content={content}"),
            None if removed => debug!("registry.removed service={service}"),
            None => debug!("registry.remove_absent service={service}"),
        }
        removed
    }

    /// True if the service is tracked in any state.
    pub fn is_subscribed(&self, service: &Service) -> bool {
        self.services.contains_key(service)
    }

    pub fn state(&self, service: &Service) -> Option<ServiceState> {
        self.services.get(service).copied()
    }

    pub fn clear(&mut self) {
        debug!("registry.cleared services={}", self.services.len());
        self.services.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.keys()
    }
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Callbacks keyed by frame kind and service, in registration order.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(FrameKind, Service), Vec<Callback<ServiceMessage>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: FrameKind, service: Service, callback: Callback<ServiceMessage>) {
        debug!("handlers.add kind={kind} service={service} callback={callback:?}");
        self.handlers.entry((kind, service)).or_default().push(callback);
    }

    /// Remove one registration of `callback`. Absent callbacks are logged and ignored.
    pub fn remove(&mut self, kind: FrameKind, service: &Service, callback: &Callback<ServiceMessage>) {
        let key = (kind, service.clone());
        let position = self
            .handlers
            .get(&key)
            .and_then(|list| list.iter().position(|cb| cb.same(callback)));
        match position {
            Some(index) => {
                if let Some(list) = self.handlers.get_mut(&key) {
                    list.remove(index);
                    if list.is_empty() {
                        self.handlers.remove(&key);
                    }
                }
                debug!("handlers.remove kind={kind} service={service}");
            }
            None => debug!("handlers.remove_absent kind={kind} service={service}"),
        }
    }

    pub fn has(&self, kind: FrameKind, service: &Service, callback: &Callback<ServiceMessage>) -> bool {
        self.handlers
            .get(&(kind, service.clone()))
            .is_some_and(|list| list.iter().any(|cb| cb.same(callback)))
    }

    /// Number of callbacks registered for a key.
    pub fn count(&self, kind: FrameKind, service: &Service) -> usize {
        self.handlers
            .get(&(kind, service.clone()))
            .map_or(0, Vec::len)
    }

    /// Invoke every callback registered for the message's service. Closed
    /// channel callbacks are pruned first. Returns how many were invoked.
    pub fn dispatch(&mut self, kind: FrameKind, msg: &ServiceMessage) -> usize {
        let Some(service) = msg.service.clone() else {
            return 0;
        };
        let key = (kind, service);
        let Some(list) = self.handlers.get_mut(&key) else {
            return 0;
        };
        list.retain(|cb| !cb.is_closed());
        for callback in list.iter() {
            callback.invoke(msg);
        }
        let invoked = list.len();
        if list.is_empty() {
            self.handlers.remove(&key);
        }
        invoked
    }
}
