/// Integration tests for the streaming client using a mock streamer.
///
/// The mock accepts WebSocket connections, acknowledges ADMIN/LOGIN and
/// subscription requests, records every request it receives, and lets a test
/// push frames or drop the current connection.
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{accept_async, WebSocketStream};

use td_sdk::schema::{decoded, LevelOneEquity};
use td_sdk::*;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Mock streamer
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct MockOptions {
    /// Code returned for ADMIN/LOGIN; `None` never answers.
    login_code: Option<i64>,
    /// Stop listening once this many connections have been served.
    accept_limit: Option<usize>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            login_code: Some(0),
            accept_limit: None,
        }
    }
}

enum Control {
    Send(Value),
    Close,
}

struct MockTd {
    url: String,
    requests: mpsc::UnboundedReceiver<(usize, Value)>,
    control: Arc<Mutex<Option<mpsc::UnboundedSender<Control>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockTd {
    async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let control = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));

        let current = Arc::clone(&control);
        let count = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = count.fetch_add(1, Ordering::SeqCst) + 1;
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
                *current.lock().await = Some(ctl_tx);
                let session = tokio::spawn(serve_connection(
                    conn,
                    ws,
                    ctl_rx,
                    req_tx.clone(),
                    options.login_code,
                ));
                if options.accept_limit == Some(conn) {
                    let _ = session.await;
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{addr}"),
            requests: req_rx,
            control,
            connections,
        }
    }

    async fn push(&self, frame: Value) {
        if let Some(tx) = self.control.lock().await.as_ref() {
            let _ = tx.send(Control::Send(frame));
        }
    }

    async fn drop_connection(&self) {
        if let Some(tx) = self.control.lock().await.as_ref() {
            let _ = tx.send(Control::Close);
        }
    }

    /// Next request received on any connection, with its connection number.
    async fn next_request(&mut self) -> (usize, Value) {
        tokio::time::timeout(WAIT, self.requests.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("mock server stopped")
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    conn: usize,
    ws: WebSocketStream<TcpStream>,
    mut control: mpsc::UnboundedReceiver<Control>,
    requests: mpsc::UnboundedSender<(usize, Value)>,
    login_code: Option<i64>,
) {
    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            ctl = control.recv() => match ctl {
                Some(Control::Send(frame)) => {
                    let _ = sink.send(WsMsg::Text(frame.to_string())).await;
                }
                Some(Control::Close) | None => {
                    let _ = sink.send(WsMsg::Close(None)).await;
                    break;
                }
            },
            msg = source.next() => match msg {
                Some(Ok(WsMsg::Text(text))) => {
                    let batch: Value = serde_json::from_str(&text).unwrap();
                    let list = batch["requests"].as_array().cloned().unwrap_or_default();
                    for request in list {
                        let _ = requests.send((conn, request.clone()));
                        if let Some(reply) = acknowledge(&request, login_code) {
                            let _ = sink.send(WsMsg::Text(reply.to_string())).await;
                        }
                    }
                }
                Some(Ok(WsMsg::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn acknowledge(request: &Value, login_code: Option<i64>) -> Option<Value> {
    let service = request["service"].as_str()?;
    let command = request["command"].as_str()?;
    let code = match command {
        "LOGIN" => login_code?,
        "SUBS" | "ADD" | "UNSUBS" => 0,
        _ => return None,
    };
    let msg = if code == 0 { "ok" } else { "Login denied" };
    Some(json!({
        "response": [{
            "service": service,
            "requestid": request["requestid"].to_string(),
            "command": command,
            "timestamp": 1_615_817_702_000_i64,
            "content": {"code": code, "msg": msg}
        }]
    }))
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn principals() -> UserPrincipals {
    serde_json::from_value(json!({
        "userId": "trader1",
        "accounts": [{
            "accountId": "123456789",
            "company": "AMER",
            "segment": "AMER",
            "accountCdDomainId": "A000000012345678",
            "displayName": "trader1"
        }],
        "streamerInfo": {
            "streamerSocketUrl": "streamer-ws.tdameritrade.com",
            "token": "streamer-token",
            "tokenTimestamp": "2021-03-15T14:15:02+0000",
            "userGroup": "ACCT",
            "accessLevel": "ACCT",
            "acl": "AKBPHK",
            "appId": "appid1"
        },
        "streamerSubscriptionKeys": {"keys": [{"key": "subkey-1"}]}
    }))
    .unwrap()
}

fn test_config() -> StreamConfig {
    StreamConfig {
        flush_interval: Duration::from_millis(10),
        login_timeout: Duration::from_secs(5),
        ..StreamConfig::default()
    }
}

fn client_for(mock: &MockTd, config: StreamConfig) -> StreamingClient {
    StreamingClient::new(principals(), config.with_url(&mock.url)).unwrap()
}

fn quote_frame(symbol: &str, bid: f64) -> Value {
    json!({
        "data": [{
            "service": "QUOTE",
            "timestamp": 1_615_817_702_500_i64,
            "command": "SUBS",
            "content": [{"key": symbol, "1": bid, "2": bid + 0.1, "3": bid + 0.05}]
        }]
    })
}

async fn wait_for_subscription(
    client: &StreamingClient,
    service: Service,
    expected: Option<ServiceState>,
) {
    for _ in 0..500 {
        if client.subscription_state(&service).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{service} never reached {expected:?}");
}

async fn wait_for_state(client: &StreamingClient, state: ConnectionState) {
    let mut changes = client.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_login_is_first_request_with_id_zero() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    let (conn, login) = mock.next_request().await;
    assert_eq!(conn, 1);
    assert_eq!(login["service"], "ADMIN");
    assert_eq!(login["command"], "LOGIN");
    assert_eq!(login["requestid"], 0);
    assert_eq!(login["account"], "123456789");
    assert_eq!(login["source"], "appid1");
    assert_eq!(login["parameters"]["token"], "streamer-token");
    assert_eq!(login["parameters"]["version"], "1.0");

    let credential = login["parameters"]["credential"].as_str().unwrap();
    assert!(credential.starts_with("userid=123456789&token=streamer-token&company=AMER"));
    assert!(credential.contains("&authorized=Y&timestamp=1615817702000&"));
    assert!(credential.ends_with("&appid=appid1&acl=AKBPHK"));

    client.wait_until_logged_in().await.unwrap();
    assert!(client.state().is_logged_in());
    assert_eq!(
        client.subscription_state(&Service::Admin).await.unwrap(),
        Some(ServiceState::Subscribed)
    );

    client.shutdown().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_login_rejected_terminates_stream() {
    let mock = MockTd::start(MockOptions {
        login_code: Some(3),
        ..MockOptions::default()
    })
    .await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    let err = client.join().await.unwrap_err();
    match err {
        TdError::LoginRejected { code, message } => {
            assert_eq!(code, 3);
            assert_eq!(message, "Login denied");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.wait_until_logged_in().await.is_err());
}

#[tokio::test]
async fn test_login_timeout_terminates_stream() {
    let mock = MockTd::start(MockOptions {
        login_code: None,
        ..MockOptions::default()
    })
    .await;
    let config = StreamConfig {
        login_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let client = client_for(&mock, config);
    client.open_stream().unwrap();

    let err = client.join().await.unwrap_err();
    assert!(matches!(err, TdError::LoginTimeout));
}

#[tokio::test]
async fn test_second_open_fails() {
    let mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();
    assert!(matches!(
        client.open_stream(),
        Err(TdError::StreamAlreadyOpen)
    ));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_on_message_sees_login_frame() {
    let mock = MockTd::start(MockOptions::default()).await;
    let (callback, mut frames) = Callback::channel();
    let client = client_for(&mock, test_config()).on_message(callback);
    client.open_stream().unwrap();

    let frame = tokio::time::timeout(WAIT, frames.next())
        .await
        .unwrap()
        .unwrap();
    let ack = frame.login_ack().expect("login ack");
    assert_eq!(ack.code(), Some(0));
    assert_eq!(ack.request_id.as_deref(), Some("0"));

    client.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Requests and subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_requests_enqueued_before_login_flush_in_order() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    let template = client.template().clone();
    let quotes = template
        .level_one(LevelOneService::Equity, &["AAPL"], &["0", "1"])
        .unwrap();
    let trades = template
        .timesale(TimesaleService::Equity, &["MSFT"], &["0"])
        .unwrap();
    let (a, b) =
        futures_util::future::join(client.enqueue(quotes), client.enqueue(trades)).await;
    let (a, b) = (a.unwrap(), b.unwrap());
    let mut ids = [a, b];
    ids.sort_unstable();
    assert_eq!(ids, [1, 2]);

    let (_, login) = mock.next_request().await;
    assert_eq!(login["command"], "LOGIN");

    let (_, first) = mock.next_request().await;
    let (_, second) = mock.next_request().await;
    assert_eq!(first["requestid"], 1);
    assert_eq!(second["requestid"], 2);

    let quote = if first["service"] == "QUOTE" { &first } else { &second };
    assert_eq!(quote["requestid"], a);
    assert_eq!(quote["parameters"]["keys"], "AAPL");
    assert_eq!(quote["parameters"]["fields"], "0,1");
    assert_eq!(quote["account"], "123456789");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subs_ack_marks_service_subscribed() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    let id = client
        .services()
        .level_one_quotes(&["AAPL", "MSFT"], None)
        .await
        .unwrap();
    assert_eq!(id, 1);
    assert!(client.is_subscribed(&Service::Quote).await.unwrap());

    let _login = mock.next_request().await;
    let (_, subs) = mock.next_request().await;
    assert_eq!(subs["service"], "QUOTE");
    assert_eq!(subs["command"], "SUBS");
    assert_eq!(subs["parameters"]["keys"], "AAPL,MSFT");
    assert!(subs["parameters"]["fields"]
        .as_str()
        .unwrap()
        .starts_with("0,1,2,3"));

    wait_for_subscription(&client, Service::Quote, Some(ServiceState::Subscribed)).await;
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_subscription_is_removed() {
    let mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    client
        .services()
        .news_headline(&["AAPL"], None)
        .await
        .unwrap();
    wait_for_subscription(&client, Service::NewsHeadline, Some(ServiceState::Subscribed)).await;

    mock.push(json!({
        "response": [{
            "service": "NEWS_HEADLINE",
            "requestid": "1",
            "command": "SUBS",
            "timestamp": 1_615_817_702_000_i64,
            "content": {"code": 11, "msg": "Service not available"}
        }]
    }))
    .await;
    wait_for_subscription(&client, Service::NewsHeadline, None).await;

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_ack_marks_chart_history_subscribed() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    let range = ChartHistoryRange::Period(ChartFuturesPeriod::OneDay);
    let id = client
        .services()
        .futures_chart_history("/ES", ChartFuturesFrequency::FiveMinute, range)
        .await
        .unwrap();
    let _login = mock.next_request().await;
    let (_, get) = mock.next_request().await;
    assert_eq!(get["command"], "GET");
    assert_eq!(
        client
            .subscription_state(&Service::ChartHistoryFutures)
            .await
            .unwrap(),
        Some(ServiceState::Acked)
    );

    mock.push(json!({
        "snapshot": [{
            "service": "CHART_HISTORY_FUTURES",
            "requestid": id.to_string(),
            "command": "GET",
            "timestamp": 1_615_817_702_000_i64,
            "content": [{"key": "/ES", "0": id.to_string(), "1": 0, "2": 0, "3": []}]
        }]
    }))
    .await;
    wait_for_subscription(
        &client,
        Service::ChartHistoryFutures,
        Some(ServiceState::Subscribed),
    )
    .await;

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chart_switches_to_add_when_tracked() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();

    let services = client.services();
    services.equity_chart_minute_ohlcv(&["SPY"]).await.unwrap();
    services.equity_chart_minute_ohlcv(&["QQQ"]).await.unwrap();

    let _login = mock.next_request().await;
    let (_, first) = mock.next_request().await;
    let (_, second) = mock.next_request().await;
    assert_eq!(first["service"], "CHART_EQUITY");
    assert_eq!(first["command"], "SUBS");
    assert_eq!(second["command"], "ADD");
    assert_eq!(second["parameters"]["keys"], "QQQ");
    assert_eq!(second["parameters"]["fields"], "0,1,2,3,4,5,6,7,8");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_only_when_tracked() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();

    let services = client.services();
    assert_eq!(services.unsubscribe(Service::Quote).await.unwrap(), None);

    services.level_one_quotes(&["AAPL"], None).await.unwrap();
    wait_for_subscription(&client, Service::Quote, Some(ServiceState::Subscribed)).await;

    let id = services
        .unsubscribe_level_one(LevelOneService::Equity)
        .await
        .unwrap();
    assert_eq!(id, Some(2));
    assert!(!client.is_subscribed(&Service::Quote).await.unwrap());

    let _login = mock.next_request().await;
    let (_, subs) = mock.next_request().await;
    let (_, unsubs) = mock.next_request().await;
    assert_eq!(subs["command"], "SUBS");
    assert_eq!(unsubs["service"], "QUOTE");
    assert_eq!(unsubs["command"], "UNSUBS");
    assert_eq!(unsubs["requestid"], 2);

    client.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handlers_dispatch_in_registration_order_and_remove() {
    let mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let typed = {
        let seen = Arc::clone(&seen);
        decoded(move |_, quotes: Vec<LevelOneEquity>| {
            seen.lock().unwrap().extend(quotes);
        })
    };
    let (channel, mut stream) = Callback::channel();
    client
        .add_handler(FrameKind::Data, Service::Quote, typed.clone())
        .unwrap();
    client
        .add_handler(FrameKind::Data, Service::Quote, channel.clone())
        .unwrap();
    assert!(client
        .has_handler(FrameKind::Data, Service::Quote, &channel)
        .await
        .unwrap());
    assert!(!client
        .has_handler(FrameKind::Notify, Service::Quote, &channel)
        .await
        .unwrap());

    mock.push(quote_frame("AAPL", 101.5)).await;
    let msg = tokio::time::timeout(WAIT, stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.service, Some(Service::Quote));
    assert_eq!(msg.content_items().len(), 1);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbol, "AAPL");
        assert_eq!(seen[0].bid_price, Some(101.5));
    }

    client
        .remove_handler(FrameKind::Data, Service::Quote, &typed)
        .unwrap();
    // Removing again is a no-op.
    client
        .remove_handler(FrameKind::Data, Service::Quote, &typed)
        .unwrap();
    assert!(!client
        .has_handler(FrameKind::Data, Service::Quote, &typed)
        .await
        .unwrap());

    mock.push(quote_frame("MSFT", 250.0)).await;
    let msg = tokio::time::timeout(WAIT, stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.content_items()[0]["key"], "MSFT");
    assert_eq!(seen.lock().unwrap().len(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_stream_is_pruned() {
    let mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();

    let (channel, stream) = Callback::channel();
    client
        .add_handler(FrameKind::Data, Service::Quote, channel.clone())
        .unwrap();
    assert!(client
        .has_handler(FrameKind::Data, Service::Quote, &channel)
        .await
        .unwrap());
    drop(stream);

    mock.push(quote_frame("AAPL", 1.0)).await;
    let mut pruned = false;
    for _ in 0..500 {
        if !client
            .has_handler(FrameKind::Data, Service::Quote, &channel)
            .await
            .unwrap()
        {
            pruned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(pruned);

    client.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Session loss and restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_subscription_notify_then_relogin_on_demand() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();
    let (_, login) = mock.next_request().await;
    assert_eq!(login["requestid"], 0);

    mock.push(json!({
        "notify": [{
            "service": "ADMIN",
            "timestamp": 1_615_817_702_000_i64,
            "content": {"code": 30, "msg": "Stop streaming due to empty subscription"}
        }]
    }))
    .await;
    wait_for_state(&client, ConnectionState::Restarting).await;
    assert!(!client.is_subscribed(&Service::Admin).await.unwrap());
    assert_eq!(mock.connections(), 1);

    let id = client
        .services()
        .level_one_quotes(&["SPY"], None)
        .await
        .unwrap();
    assert_eq!(id, 2);

    let (conn, relogin) = mock.next_request().await;
    assert_eq!(conn, 2);
    assert_eq!(relogin["command"], "LOGIN");
    assert_eq!(relogin["requestid"], 1);
    let (conn, subs) = mock.next_request().await;
    assert_eq!(conn, 2);
    assert_eq!(subs["service"], "QUOTE");
    assert_eq!(subs["requestid"], 2);
    assert!(client.is_stream_restarted());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_request_survives_empty_subscription_notify() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let config = StreamConfig {
        flush_interval: Duration::from_secs(2),
        ..test_config()
    };
    let client = client_for(&mock, config);
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();
    let (_, login) = mock.next_request().await;
    assert_eq!(login["requestid"], 0);

    // Accepted but not yet flushed when the server ends the session.
    let id = client
        .services()
        .level_one_quotes(&["SPY"], None)
        .await
        .unwrap();
    assert_eq!(id, 1);
    mock.push(json!({
        "notify": [{
            "service": "ADMIN",
            "timestamp": 1_615_817_702_000_i64,
            "content": {"code": 30, "msg": "Stop streaming due to empty subscription"}
        }]
    }))
    .await;

    let (conn, relogin) = mock.next_request().await;
    assert_eq!(conn, 2);
    assert_eq!(relogin["command"], "LOGIN");
    assert_eq!(relogin["requestid"], 2);
    assert!(client.is_subscribed(&Service::Quote).await.unwrap());

    let (conn, subs) = mock.next_request().await;
    assert_eq!(conn, 2);
    assert_eq!(subs["service"], "QUOTE");
    assert_eq!(subs["requestid"], 1);
    wait_for_subscription(&client, Service::Quote, Some(ServiceState::Subscribed)).await;

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_drop_and_fires_restart_callback_once() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let restarts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&restarts);
    let client =
        client_for(&mock, test_config()).on_stream_restarted(Callback::new_async(move |_: ()| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();
    assert!(!client.is_stream_restarted());
    let (conn, _) = mock.next_request().await;
    assert_eq!(conn, 1);

    mock.drop_connection().await;

    let (conn, login) = mock.next_request().await;
    assert_eq!(conn, 2);
    assert_eq!(login["command"], "LOGIN");
    assert_eq!(login["requestid"], 1);

    for _ in 0..500 {
        if restarts.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(restarts.load(Ordering::SeqCst), 1);
    assert!(client.is_stream_restarted());
    assert_eq!(mock.connections(), 2);
    assert!(client.state().is_logged_in());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_on_restart_replays_last_request() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let config = StreamConfig {
        resubscribe_on_restart: true,
        ..test_config()
    };
    let client = client_for(&mock, config);
    client.open_stream().unwrap();

    client
        .services()
        .level_one_quotes(&["AAPL"], Some(&["0", "1", "2"]))
        .await
        .unwrap();
    wait_for_subscription(&client, Service::Quote, Some(ServiceState::Subscribed)).await;
    let _login = mock.next_request().await;
    let _subs = mock.next_request().await;

    mock.drop_connection().await;

    let (conn, login) = mock.next_request().await;
    assert_eq!((conn, login["command"].as_str()), (2, Some("LOGIN")));
    let (conn, replay) = mock.next_request().await;
    assert_eq!(conn, 2);
    assert_eq!(replay["service"], "QUOTE");
    assert_eq!(replay["command"], "SUBS");
    assert_eq!(replay["requestid"], 3);
    assert_eq!(replay["parameters"]["keys"], "AAPL");
    assert_eq!(replay["parameters"]["fields"], "0,1,2");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_gives_up_after_backoff_ceiling() {
    let mock = MockTd::start(MockOptions {
        accept_limit: Some(1),
        ..MockOptions::default()
    })
    .await;
    let config = StreamConfig {
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            factor: 2,
            max_delay: Duration::from_millis(40),
            max_elapsed: Duration::from_millis(50),
        },
        ..test_config()
    };
    let client = client_for(&mock, config);
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();

    mock.drop_connection().await;

    let err = tokio::time::timeout(WAIT, client.join())
        .await
        .expect("stream kept retrying")
        .unwrap_err();
    match err {
        TdError::ReconnectExhausted { attempts, elapsed } => {
            assert_eq!(attempts, 4);
            assert_eq!(elapsed, Duration::from_millis(70));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.state(), ConnectionState::Closed);
}

// ---------------------------------------------------------------------------
// Shutdown and blocking use
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_fails_parked_requests() {
    let mut mock = MockTd::start(MockOptions {
        login_code: None,
        ..MockOptions::default()
    })
    .await;
    let client = client_for(&mock, test_config());
    client.open_stream().unwrap();
    let _login = mock.next_request().await;

    let enqueue = client.enqueue(client.template().logout());
    tokio::pin!(enqueue);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut enqueue)
            .await
            .is_err(),
        "request should wait for login"
    );

    client.shutdown().await.unwrap();
    assert!(matches!(enqueue.await, Err(TdError::StreamClosed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.enqueue(client.template().logout()).await,
        Err(TdError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_shutdown_waits_for_close_while_another_task_joins() {
    let mock = MockTd::start(MockOptions::default()).await;
    let client = Arc::new(client_for(&mock, test_config()));
    client.open_stream().unwrap();
    client.wait_until_logged_in().await.unwrap();

    let joiner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.join().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.shutdown().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(joiner.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_api_from_plain_thread() {
    let mut mock = MockTd::start(MockOptions::default()).await;
    let client = Arc::new(client_for(&mock, test_config()));

    let worker = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || {
            client.open_stream().unwrap();
            let request = client
                .template()
                .level_one(LevelOneService::Equity, &["IBM"], &["0", "1"])
                .unwrap();
            let id = client.enqueue_blocking(request).unwrap();
            let tracked = client.is_subscribed_blocking(&Service::Quote).unwrap();
            let (channel, _stream) = Callback::channel();
            client
                .add_handler(FrameKind::Data, Service::Quote, channel.clone())
                .unwrap();
            let has = client
                .has_handler_blocking(FrameKind::Data, Service::Quote, &channel)
                .unwrap();
            (id, tracked, has)
        })
    };
    let (id, tracked, has) = tokio::task::spawn_blocking(move || worker.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, 1);
    assert!(tracked);
    assert!(has);

    let _login = mock.next_request().await;
    let (_, subs) = mock.next_request().await;
    assert_eq!(subs["parameters"]["keys"], "IBM");

    let closer = Arc::clone(&client);
    tokio::task::spawn_blocking(move || closer.shutdown_blocking())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}
