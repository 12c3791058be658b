//! High-level streaming client.
//!
//! `StreamingClient` is the entry point for SDK users. It owns the handle
//! side of the connection actor: operations become messages on a channel
//! and replies come back on oneshots, so the client can be shared across
//! tasks and called from plain threads through the `*_blocking` variants.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::api::TdApi;
use crate::config::StreamConfig;
use crate::connection::{ActorLinks, ClientOp, ConnectionManager, ConnectionState};
use crate::enums::{FrameKind, Service, ServiceState};
use crate::errors::TdError;
use crate::models::{Credentials, Frame, ServiceMessage, ServiceRequest, UserPrincipals};
use crate::registry::{Callback, TypedStream};
use crate::services::{RequestTemplate, StreamingServices};

/// Actor half held until the stream is opened.
struct PendingActor {
    ops: mpsc::UnboundedReceiver<ClientOp>,
    state: watch::Sender<ConnectionState>,
    on_message: Option<Callback<Frame>>,
    on_restart: Option<Callback<()>>,
}

/// A running actor: its terminal result and the thread hosting it, if any.
struct Worker {
    done: oneshot::Receiver<Result<(), TdError>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Worker {
    async fn finish(self) -> Result<(), TdError> {
        let result = self.done.await.unwrap_or(Err(TdError::StreamClosed));
        if let Some(thread) = self.thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        result
    }

    fn finish_blocking(self) -> Result<(), TdError> {
        let result = self.done.blocking_recv().unwrap_or(Err(TdError::StreamClosed));
        if let Some(thread) = self.thread {
            let _ = thread.join();
        }
        result
    }
}

/// The streaming client.
pub struct StreamingClient {
    url: String,
    credentials: Credentials,
    template: RequestTemplate,
    config: StreamConfig,
    ops: mpsc::UnboundedSender<ClientOp>,
    state: watch::Receiver<ConnectionState>,
    restarted: Arc<AtomicBool>,
    cancel: CancellationToken,
    pending: Mutex<Option<PendingActor>>,
    worker: Mutex<Option<Worker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamingClient {
    /// Create a client from already fetched user principals.
    pub fn new(principals: UserPrincipals, config: StreamConfig) -> Result<Self, TdError> {
        let credentials = Credentials::from_principals(&principals)?;
        let template = RequestTemplate::from_principals(&principals)?;
        let url = match &config.url_override {
            Some(url) => url.clone(),
            None => principals.socket_url()?,
        };

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            url,
            credentials,
            template,
            config,
            ops: ops_tx,
            state: state_rx,
            restarted: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            pending: Mutex::new(Some(PendingActor {
                ops: ops_rx,
                state: state_tx,
                on_message: None,
                on_restart: None,
            })),
            worker: Mutex::new(None),
        })
    }

    /// Fetch user principals through the REST client, then create the client.
    pub async fn from_api(api: &TdApi, config: StreamConfig) -> Result<Self, TdError> {
        let principals = api.get_user_principals().await?;
        Self::new(principals, config)
    }

    fn pending_mut(&mut self) -> Option<&mut PendingActor> {
        self.pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
    }

    /// Receive every decoded frame before handler dispatch.
    pub fn on_message(mut self, callback: Callback<Frame>) -> Self {
        if let Some(pending) = self.pending_mut() {
            pending.on_message = Some(callback);
        }
        self
    }

    /// Called once after each successful stream restart. Async callbacks are
    /// spawned and not awaited.
    pub fn on_stream_restarted(mut self, callback: Callback<()>) -> Self {
        if let Some(pending) = self.pending_mut() {
            pending.on_restart = Some(callback);
        }
        self
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the connection actor.
    ///
    /// Runs on the current tokio runtime when called from inside one,
    /// otherwise on a dedicated background thread with its own runtime.
    pub fn open_stream(&self) -> Result<(), TdError> {
        match Handle::try_current() {
            Ok(handle) => self.open_stream_on(&handle),
            Err(_) => self.open_on_thread(),
        }
    }

    /// Start the connection actor on an externally managed runtime.
    pub fn open_stream_on(&self, handle: &Handle) -> Result<(), TdError> {
        let manager = self.take_manager()?;
        let (done_tx, done_rx) = oneshot::channel();
        handle.spawn(async move {
            let _ = done_tx.send(manager.run().await);
        });
        info!("client.open_stream url={} runtime=shared", self.url);
        *lock(&self.worker) = Some(Worker {
            done: done_rx,
            thread: None,
        });
        Ok(())
    }

    fn open_on_thread(&self) -> Result<(), TdError> {
        let manager = self.take_manager()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TdError::Other(format!("failed to build stream runtime: {e}")))?;
        let (done_tx, done_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("td-stream".into())
            .spawn(move || {
                let result = runtime.block_on(manager.run());
                let _ = done_tx.send(result);
            })
            .map_err(|e| TdError::Other(format!("failed to spawn stream thread: {e}")))?;
        info!("client.open_stream url={} runtime=thread", self.url);
        *lock(&self.worker) = Some(Worker {
            done: done_rx,
            thread: Some(thread),
        });
        Ok(())
    }

    fn take_manager(&self) -> Result<ConnectionManager, TdError> {
        let pending = lock(&self.pending)
            .take()
            .ok_or(TdError::StreamAlreadyOpen)?;
        Ok(ConnectionManager::new(
            self.url.clone(),
            self.credentials.clone(),
            self.config.clone(),
            ActorLinks {
                ops: pending.ops,
                cancel: self.cancel.clone(),
                state: pending.state,
                restarted: Arc::clone(&self.restarted),
                on_message: pending.on_message,
                on_restart: pending.on_restart,
            },
        ))
    }

    /// Wait for the actor to finish and return its terminal result.
    pub async fn join(&self) -> Result<(), TdError> {
        let worker = lock(&self.worker).take();
        match worker {
            Some(worker) => worker.finish().await,
            None => Err(TdError::StreamClosed),
        }
    }

    /// Cancel the actor, close the socket and wait for it to finish.
    ///
    /// When another task is already in [`join`](Self::join), this waits for
    /// the actor to publish [`ConnectionState::Closed`] and the terminal
    /// result goes to that task.
    pub async fn shutdown(&self) -> Result<(), TdError> {
        debug!("client.shutdown");
        self.cancel.cancel();
        let worker = lock(&self.worker).take();
        match worker {
            Some(worker) => worker.finish().await,
            None => {
                self.wait_closed().await;
                Ok(())
            }
        }
    }

    async fn wait_closed(&self) {
        if lock(&self.pending).is_some() {
            // Never opened.
            return;
        }
        let mut state = self.state.clone();
        // An error means the actor dropped its sender, so it is gone too.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// [`shutdown`](Self::shutdown) for callers outside any runtime.
    ///
    /// Returns right after cancelling when another caller holds the worker
    /// through [`join`](Self::join).
    pub fn shutdown_blocking(&self) -> Result<(), TdError> {
        debug!("client.shutdown_blocking");
        self.cancel.cancel();
        let worker = lock(&self.worker).take();
        match worker {
            Some(worker) => worker.finish_blocking(),
            None => Ok(()),
        }
    }

    /// Resolve once login succeeded; fails if the stream closes first.
    pub async fn wait_until_logged_in(&self) -> Result<(), TdError> {
        let mut state = self.state.clone();
        let reached = *state
            .wait_for(|s| s.is_logged_in() || *s == ConnectionState::Closed)
            .await
            .map_err(|_| TdError::StreamClosed)?;
        if reached.is_logged_in() {
            Ok(())
        } else {
            Err(TdError::StreamClosed)
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel of state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True once the stream has been restarted at least once.
    pub fn is_stream_restarted(&self) -> bool {
        self.restarted.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn template(&self) -> &RequestTemplate {
        &self.template
    }

    pub fn services(&self) -> StreamingServices<'_> {
        StreamingServices::new(self)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn send_op(&self, op: ClientOp) -> Result<(), TdError> {
        self.ops.send(op).map_err(|_| TdError::StreamClosed)
    }

    /// Queue a request. Resolves with its request id once the client is
    /// logged in and the request has been accepted.
    pub async fn enqueue(&self, request: ServiceRequest) -> Result<u64, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::Enqueue { request, reply })?;
        rx.await.map_err(|_| TdError::StreamClosed)
    }

    /// [`enqueue`](Self::enqueue) for threads outside any runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn enqueue_blocking(&self, request: ServiceRequest) -> Result<u64, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::Enqueue { request, reply })?;
        rx.blocking_recv().map_err(|_| TdError::StreamClosed)
    }

    /// True if the service is tracked, requested or acknowledged.
    pub async fn is_subscribed(&self, service: &Service) -> Result<bool, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::IsSubscribed {
            service: service.clone(),
            reply,
        })?;
        rx.await.map_err(|_| TdError::StreamClosed)
    }

    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn is_subscribed_blocking(&self, service: &Service) -> Result<bool, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::IsSubscribed {
            service: service.clone(),
            reply,
        })?;
        rx.blocking_recv().map_err(|_| TdError::StreamClosed)
    }

    pub async fn subscription_state(
        &self,
        service: &Service,
    ) -> Result<Option<ServiceState>, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::ServiceState {
            service: service.clone(),
            reply,
        })?;
        rx.await.map_err(|_| TdError::StreamClosed)
    }

    pub fn add_handler(
        &self,
        kind: FrameKind,
        service: impl Into<Service>,
        callback: Callback<ServiceMessage>,
    ) -> Result<(), TdError> {
        self.send_op(ClientOp::AddHandler {
            kind,
            service: service.into(),
            callback,
        })
    }

    /// Remove a handler. Removing one that was never added is a no-op.
    pub fn remove_handler(
        &self,
        kind: FrameKind,
        service: impl Into<Service>,
        callback: &Callback<ServiceMessage>,
    ) -> Result<(), TdError> {
        self.send_op(ClientOp::RemoveHandler {
            kind,
            service: service.into(),
            callback: callback.clone(),
        })
    }

    pub async fn has_handler(
        &self,
        kind: FrameKind,
        service: impl Into<Service>,
        callback: &Callback<ServiceMessage>,
    ) -> Result<bool, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::HasHandler {
            kind,
            service: service.into(),
            callback: callback.clone(),
            reply,
        })?;
        rx.await.map_err(|_| TdError::StreamClosed)
    }

    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn has_handler_blocking(
        &self,
        kind: FrameKind,
        service: impl Into<Service>,
        callback: &Callback<ServiceMessage>,
    ) -> Result<bool, TdError> {
        let (reply, rx) = oneshot::channel();
        self.send_op(ClientOp::HasHandler {
            kind,
            service: service.into(),
            callback: callback.clone(),
            reply,
        })?;
        rx.blocking_recv().map_err(|_| TdError::StreamClosed)
    }

    /// Register a channel handler and return its stream. Dropping the
    /// stream unregisters the handler on the next matching message.
    pub fn stream(
        &self,
        kind: FrameKind,
        service: impl Into<Service>,
    ) -> Result<TypedStream<ServiceMessage>, TdError> {
        let (callback, stream) = Callback::channel();
        self.add_handler(kind, service, callback)?;
        Ok(stream)
    }
}
