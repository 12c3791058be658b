//! Connection manager: the actor that owns the streamer socket.
//!
//! One task runs [`ConnectionManager::run`]. It holds the socket, the
//! request queue and both registries, and serves facade operations from a
//! channel between socket reads and flush ticks, so no state is shared.
//!
//! Lifecycle:
//! - connect, send ADMIN/LOGIN, wait for the acknowledgement
//! - receive frames, update subscription state, dispatch handlers
//! - flush queued requests every `flush_interval` while logged in
//! - on a closed transport, wait for demand and reconnect with backoff
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::codec;
use crate::config::StreamConfig;
use crate::enums::{Command, FrameKind, Service, ServiceState};
use crate::errors::TdError;
use crate::models::{Credentials, Frame, RequestBatch, ServiceMessage, ServiceRequest};
use crate::queue::RequestQueue;
use crate::registry::{Callback, HandlerRegistry, SubscriptionRegistry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// ADMIN notify text sent when the server stops streaming for lack of subscriptions.
pub const EMPTY_SUBSCRIPTION_MSG: &str = "Stop streaming due to empty subscription";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingLogin,
    LoggedIn,
    Receiving,
    Restarting,
    ShuttingDown,
    Closed,
}

impl ConnectionState {
    /// True once login succeeded and until the session is lost.
    pub fn is_logged_in(&self) -> bool {
        matches!(self, ConnectionState::LoggedIn | ConnectionState::Receiving)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::ShuttingDown | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingLogin => "awaiting_login",
            ConnectionState::LoggedIn => "logged_in",
            ConnectionState::Receiving => "receiving",
            ConnectionState::Restarting => "restarting",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Operations the facade hands to the actor.
pub(crate) enum ClientOp {
    Enqueue {
        request: ServiceRequest,
        reply: oneshot::Sender<u64>,
    },
    AddHandler {
        kind: FrameKind,
        service: Service,
        callback: Callback<ServiceMessage>,
    },
    RemoveHandler {
        kind: FrameKind,
        service: Service,
        callback: Callback<ServiceMessage>,
    },
    HasHandler {
        kind: FrameKind,
        service: Service,
        callback: Callback<ServiceMessage>,
        reply: oneshot::Sender<bool>,
    },
    IsSubscribed {
        service: Service,
        reply: oneshot::Sender<bool>,
    },
    ServiceState {
        service: Service,
        reply: oneshot::Sender<Option<ServiceState>>,
    },
}

/// Channels and callbacks connecting the actor to its facade.
pub(crate) struct ActorLinks {
    pub(crate) ops: mpsc::UnboundedReceiver<ClientOp>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) restarted: Arc<AtomicBool>,
    pub(crate) on_message: Option<Callback<Frame>>,
    pub(crate) on_restart: Option<Callback<()>>,
}

enum Inbound {
    Text(String),
    Closed(String),
    Fatal(TdError),
}

/// Whether a processed frame ended the server-side session.
#[derive(Debug, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Ended,
}

pub(crate) struct ConnectionManager {
    url: String,
    config: StreamConfig,
    credentials: Credentials,
    links: ActorLinks,
    socket: Option<WsStream>,
    queue: RequestQueue,
    subscriptions: SubscriptionRegistry,
    handlers: HandlerRegistry,
    parked: VecDeque<(ServiceRequest, oneshot::Sender<u64>)>,
    last_requests: BTreeMap<Service, ServiceRequest>,
    logged_in: bool,
    backoff: Backoff,
}

impl ConnectionManager {
    pub(crate) fn new(
        url: String,
        credentials: Credentials,
        config: StreamConfig,
        links: ActorLinks,
    ) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            url,
            config,
            credentials,
            links,
            socket: None,
            queue: RequestQueue::new(),
            subscriptions: SubscriptionRegistry::new(),
            handlers: HandlerRegistry::new(),
            parked: VecDeque::new(),
            last_requests: BTreeMap::new(),
            logged_in: false,
            backoff,
        }
    }

    /// Run until shutdown or a fatal error. Shutdown is reported as `Ok`.
    pub(crate) async fn run(mut self) -> Result<(), TdError> {
        let result = match self.drive().await {
            Err(TdError::Shutdown) => Ok(()),
            other => other,
        };

        self.set_state(ConnectionState::ShuttingDown);
        if let Some(mut socket) = self.socket.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await.is_err() {
                debug!("stream.close timeout");
            }
        }
        // Dropping the reply senders fails every parked enqueue.
        let parked = self.parked.len();
        self.parked.clear();
        self.set_state(ConnectionState::Closed);

        match &result {
            Ok(()) => info!("stream.closed parked_dropped={parked}"),
            Err(e) => error!("stream.terminated error={e} parked_dropped={parked}"),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), TdError> {
        self.connect(false).await?;
        self.set_state(ConnectionState::Receiving);

        let mut flush = tokio::time::interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.links.cancel.cancelled() => return Err(TdError::Shutdown),
                op = self.links.ops.recv() => self.serve(op)?,
                _ = flush.tick() => self.flush().await?,
                inbound = next_frame(&mut self.socket) => self.on_inbound(inbound).await?,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connect + login
    // -----------------------------------------------------------------------

    async fn connect(&mut self, is_restart: bool) -> Result<(), TdError> {
        let result = self.handshake(is_restart).await;
        if result.is_err() {
            self.socket = None;
            self.logged_in = false;
        }
        result
    }

    async fn handshake(&mut self, is_restart: bool) -> Result<(), TdError> {
        self.set_state(ConnectionState::Connecting);
        self.logged_in = false;
        info!("stream.connect url={} restart={is_restart}", self.url);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);
        let connecting =
            tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(ws_config), false);
        let (socket, _) = tokio::select! {
            _ = self.links.cancel.cancelled() => return Err(TdError::Shutdown),
            connected = connecting => connected?,
        };
        self.socket = Some(socket);

        self.subscriptions.clear();
        self.subscriptions.mark_requested(&Service::Admin);
        self.track_queued();
        self.set_state(ConnectionState::AwaitingLogin);

        let login = self.login_request();
        let request_id = login.request_id;
        self.send_batch(&RequestBatch {
            requests: vec![login],
        })
        .await?;
        debug!("stream.login sent requestid={request_id}");

        let deadline = tokio::time::sleep(self.config.login_timeout);
        tokio::pin!(deadline);

        loop {
            let inbound = tokio::select! {
                _ = self.links.cancel.cancelled() => return Err(TdError::Shutdown),
                _ = &mut deadline => return Err(TdError::LoginTimeout),
                op = self.links.ops.recv() => {
                    self.serve(op)?;
                    continue;
                }
                inbound = next_frame(&mut self.socket) => inbound,
            };

            let text = match inbound {
                Inbound::Text(text) => text,
                Inbound::Closed(reason) => return Err(TdError::ConnectionClosed(reason)),
                Inbound::Fatal(err) => return Err(err),
            };
            let Some(frame) = self.decode(&text) else {
                continue;
            };

            let ack = frame.login_ack().map(|ack| {
                (
                    ack.code().unwrap_or(-1),
                    ack.msg().unwrap_or_default().to_string(),
                )
            });
            match ack {
                Some((0, _)) => {
                    self.on_login(is_restart);
                    self.process_frame(&frame);
                    return Ok(());
                }
                Some((code, message)) => {
                    error!("stream.login rejected code={code} msg={message}");
                    return Err(TdError::LoginRejected { code, message });
                }
                None => {
                    self.process_frame(&frame);
                }
            }
        }
    }

    fn login_request(&mut self) -> ServiceRequest {
        let mut request = ServiceRequest::new(
            Service::Admin,
            Command::Login,
            &self.credentials.userid,
            &self.credentials.appid,
        )
        .with_param("credential", self.credentials.to_query())
        .with_param("token", self.credentials.token.clone())
        .with_param("version", "1.0");
        self.queue.assign_id(&mut request);
        request
    }

    fn on_login(&mut self, is_restart: bool) {
        self.subscriptions.mark_active(&Service::Admin);
        self.logged_in = true;
        self.set_state(ConnectionState::LoggedIn);
        info!(
            "stream.logged_in restart={is_restart} parked={}",
            self.parked.len()
        );

        if is_restart && self.config.resubscribe_on_restart {
            let replay: Vec<ServiceRequest> = self.last_requests.values().cloned().collect();
            for request in replay {
                let id = self.accept(request);
                debug!("stream.resubscribe requestid={id}");
            }
        }

        while let Some((request, reply)) = self.parked.pop_front() {
            let id = self.accept(request);
            let _ = reply.send(id);
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn serve(&mut self, op: Option<ClientOp>) -> Result<(), TdError> {
        match op {
            Some(op) => {
                self.handle_op(op);
                Ok(())
            }
            // Every facade handle is gone.
            None => Err(TdError::Shutdown),
        }
    }

    fn handle_op(&mut self, op: ClientOp) {
        match op {
            ClientOp::Enqueue { request, reply } => {
                if self.logged_in {
                    let id = self.accept(request);
                    let _ = reply.send(id);
                } else {
                    debug!(
                        "stream.enqueue parked service={} command={}",
                        request.service, request.command
                    );
                    self.parked.push_back((request, reply));
                }
            }
            ClientOp::AddHandler {
                kind,
                service,
                callback,
            } => self.handlers.add(kind, service, callback),
            ClientOp::RemoveHandler {
                kind,
                service,
                callback,
            } => self.handlers.remove(kind, &service, &callback),
            ClientOp::HasHandler {
                kind,
                service,
                callback,
                reply,
            } => {
                let _ = reply.send(self.handlers.has(kind, &service, &callback));
            }
            ClientOp::IsSubscribed { service, reply } => {
                let _ = reply.send(self.subscriptions.is_subscribed(&service));
            }
            ClientOp::ServiceState { service, reply } => {
                let _ = reply.send(self.subscriptions.state(&service));
            }
        }
    }

    /// Queue a request and update subscription tracking. Returns its id.
    fn accept(&mut self, request: ServiceRequest) -> u64 {
        let service = request.service.clone();
        let command = request.command;
        if command == Command::Unsubs {
            self.subscriptions.remove(&service, None);
            self.last_requests.remove(&service);
        } else {
            self.subscriptions.mark_requested(&service);
            if command.is_subscribing() {
                self.last_requests.insert(service.clone(), request.clone());
            }
        }
        let id = self.queue.push(request);
        debug!("stream.enqueue service={service} command={command} requestid={id}");
        id
    }

    /// Mark services of accepted but unflushed requests as requested again
    /// after the registry was cleared.
    fn track_queued(&mut self) {
        for request in self.queue.pending() {
            if request.command != Command::Unsubs {
                self.subscriptions.mark_requested(&request.service);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    async fn flush(&mut self) -> Result<(), TdError> {
        if !self.logged_in || self.socket.is_none() {
            return Ok(());
        }
        let Some(batch) = self.queue.drain() else {
            return Ok(());
        };

        match self.send_batch(&batch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_closed() => {
                warn!("stream.flush send_failed requests={} error={e}", batch.len());
                self.socket = None;
                self.logged_in = false;
                self.restart().await?;
                for request in &batch.requests {
                    if request.command != Command::Unsubs {
                        self.subscriptions.mark_requested(&request.service);
                    }
                }
                if let Err(e) = self.send_batch(&batch).await {
                    error!("stream.flush dropped requests={} error={e}", batch.len());
                }
                Ok(())
            }
            Err(e) => {
                error!("stream.flush dropped requests={} error={e}", batch.len());
                Ok(())
            }
        }
    }

    async fn send_batch(&mut self, batch: &RequestBatch) -> Result<(), TdError> {
        let encoded = codec::encode(batch, self.config.log_sent_messages)?;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| TdError::ConnectionClosed("not connected".into()))?;
        socket.send(WsMsg::Text(encoded.wire.clone())).await?;
        if self.config.log_sent_messages {
            debug!("stream.send frame={}", encoded.loggable());
        } else {
            debug!("stream.send requests={} bytes={}", batch.len(), encoded.wire.len());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    async fn on_inbound(&mut self, inbound: Inbound) -> Result<(), TdError> {
        match inbound {
            Inbound::Text(text) => {
                let Some(frame) = self.decode(&text) else {
                    return Ok(());
                };
                if self.process_frame(&frame) == SessionStatus::Ended {
                    self.logged_in = false;
                    if let Some(mut socket) = self.socket.take() {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await;
                    }
                    self.restart().await?;
                }
                Ok(())
            }
            Inbound::Closed(reason) => {
                warn!("stream.connection_closed reason={reason}");
                self.socket = None;
                self.logged_in = false;
                self.restart().await
            }
            Inbound::Fatal(err) => {
                error!("stream.receive_failed error={err}");
                Err(err)
            }
        }
    }

    fn decode(&self, text: &str) -> Option<Frame> {
        if self.config.log_received_messages {
            debug!("stream.recv frame={text}");
        }
        match codec::decode(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("stream.decode_failed error={e} len={}", text.len());
                None
            }
        }
    }

    /// Apply a frame to subscription state, then hand it to callbacks.
    fn process_frame(&mut self, frame: &Frame) -> SessionStatus {
        let mut status = SessionStatus::Active;

        for msg in &frame.notify {
            if msg.service != Some(Service::Admin) {
                continue;
            }
            if let Some(text) = msg.msg() {
                info!("stream.admin_notify msg={text}");
                if text == EMPTY_SUBSCRIPTION_MSG {
                    self.subscriptions.clear();
                    self.track_queued();
                    self.logged_in = false;
                    status = SessionStatus::Ended;
                }
            }
        }

        for kind in [FrameKind::Response, FrameKind::Snapshot] {
            for msg in frame.messages(kind) {
                if self.process_ack(msg) == SessionStatus::Ended {
                    status = SessionStatus::Ended;
                }
            }
        }

        if let Some(callback) = &self.links.on_message {
            callback.invoke(frame);
        }

        for kind in FrameKind::ALL {
            for msg in frame.messages(kind) {
                self.handlers.dispatch(kind, msg);
            }
        }
        status
    }

    fn process_ack(&mut self, msg: &ServiceMessage) -> SessionStatus {
        let (Some(service), Some(command)) = (msg.service.clone(), msg.command) else {
            return SessionStatus::Active;
        };
        match command {
            Command::Subs => match msg.code() {
                Some(0) => self.subscriptions.mark_active(&service),
                Some(_) => {
                    self.subscriptions.remove(&service, msg.content.as_ref());
                    self.last_requests.remove(&service);
                }
                None => {}
            },
            Command::Get => self.subscriptions.mark_active(&service),
            Command::Unsubs => {
                self.subscriptions.remove(&service, None);
            }
            Command::Logout if service == Service::Admin => {
                info!("stream.logged_out");
                self.subscriptions.clear();
                self.track_queued();
                self.logged_in = false;
                return SessionStatus::Ended;
            }
            _ => {}
        }
        SessionStatus::Active
    }

    // -----------------------------------------------------------------------
    // Restart
    // -----------------------------------------------------------------------

    async fn restart(&mut self) -> Result<(), TdError> {
        if self.socket.is_some() {
            return Ok(());
        }
        self.set_state(ConnectionState::Restarting);
        self.wait_for_demand().await?;
        self.backoff.reset();

        loop {
            match self.connect(true).await {
                Ok(()) => {
                    self.links.restarted.store(true, Ordering::SeqCst);
                    info!("stream.restarted failed_attempts={}", self.backoff.attempts());
                    if let Some(callback) = &self.links.on_restart {
                        callback.invoke(&());
                    }
                    self.set_state(ConnectionState::Receiving);
                    return Ok(());
                }
                Err(TdError::Shutdown) => return Err(TdError::Shutdown),
                Err(e) => {
                    let Some(delay) = self.backoff.next_delay() else {
                        let attempts = self.backoff.attempts() + 1;
                        let elapsed = self.backoff.elapsed();
                        error!("stream.restart_exhausted attempts={attempts} elapsed={elapsed:?} error={e}");
                        return Err(TdError::ReconnectExhausted { attempts, elapsed });
                    };
                    warn!("stream.restart_failed error={e} retry_in={delay:?}");
                    self.set_state(ConnectionState::Restarting);
                    self.idle(delay).await?;
                }
            }
        }
    }

    fn has_demand(&self) -> bool {
        !self.subscriptions.is_empty() || !self.parked.is_empty() || !self.queue.is_empty()
    }

    /// Block until something wants the stream: a tracked service, a queued
    /// request or a parked request.
    async fn wait_for_demand(&mut self) -> Result<(), TdError> {
        if !self.has_demand() {
            info!("stream.restart waiting for a new request");
        }
        while !self.has_demand() {
            tokio::select! {
                _ = self.links.cancel.cancelled() => return Err(TdError::Shutdown),
                op = self.links.ops.recv() => self.serve(op)?,
            }
        }
        Ok(())
    }

    /// Sleep for `delay` while still serving operations.
    async fn idle(&mut self, delay: Duration) -> Result<(), TdError> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.links.cancel.cancelled() => return Err(TdError::Shutdown),
                _ = &mut sleep => return Ok(()),
                op = self.links.ops.recv() => self.serve(op)?,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.links.state.send_replace(state);
        if previous != state {
            debug!("stream.state from={previous} to={state}");
        }
    }
}

/// Next data frame from the socket. Pends forever while disconnected.
async fn next_frame(socket: &mut Option<WsStream>) -> Inbound {
    let Some(ws) = socket.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match ws.next().await {
            Some(Ok(WsMsg::Text(text))) => return Inbound::Text(text),
            Some(Ok(WsMsg::Binary(bytes))) => {
                return Inbound::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(Ok(WsMsg::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "close frame".into());
                return Inbound::Closed(reason);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let err = TdError::from(e);
                return if err.is_connection_closed() {
                    Inbound::Closed(err.to_string())
                } else {
                    Inbound::Fatal(err)
                };
            }
            None => return Inbound::Closed("stream ended".into()),
        }
    }
}
