//! TD Ameritrade streaming SDK for Rust.
//!
//! A client for the TD Ameritrade streamer: one WebSocket connection that
//! logs in, batches subscription requests, tracks which services are live
//! and dispatches incoming frames to callbacks registered per message kind
//! and service. Dropped connections are restarted with exponential backoff.
//!
//! # What This SDK Provides
//!
//! - Streaming facade: [`StreamingClient`]
//! - Per-service request builders: [`services::StreamingServices`]
//! - User principals lookup over REST: [`api::TdApi`]
//! - Typed records for market data: [`schema`]
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use td_sdk::{Callback, FrameKind, Service, StreamConfig, StreamingClient, TdApi};
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), td_sdk::TdError> {
//!     let api = TdApi::with_token("access-token");
//!     let client = StreamingClient::from_api(&api, StreamConfig::default()).await?;
//!     client.open_stream()?;
//!
//!     let mut quotes = client.stream(FrameKind::Data, Service::Quote)?;
//!     client.services().level_one_quotes(&["AAPL", "MSFT"], None).await?;
//!
//!     while let Some(msg) = quotes.next().await {
//!         println!("{:?}", msg.content);
//!     }
//!     client.shutdown().await
//! }
//! ```
//!
//! # Typed Handlers
//!
//! ```rust,no_run
//! use td_sdk::schema::{decoded, LevelOneEquity};
//! use td_sdk::{Callback, FrameKind, Service, StreamConfig, StreamingClient, TdApi};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), td_sdk::TdError> {
//!     let api = TdApi::with_token("access-token");
//!     let client = StreamingClient::from_api(&api, StreamConfig::default())
//!         .await?
//!         .on_stream_restarted(Callback::new(|_: &()| println!("stream restarted")));
//!     client.open_stream()?;
//!
//!     let handler = decoded(|_, quotes: Vec<LevelOneEquity>| {
//!         for quote in quotes {
//!             println!("{} bid={:?} ask={:?}", quote.symbol, quote.bid_price, quote.ask_price);
//!         }
//!     });
//!     client.add_handler(FrameKind::Data, Service::Quote, handler)?;
//!     client.services().level_one_quotes(&["SPY"], None).await?;
//!
//!     client.join().await
//! }
//! ```
//!
//! # Logging
//!
//! This crate emits logs through the [`log`](https://docs.rs/log/) facade and
//! installs no logger. Credentials are never logged. Sent batches are logged
//! at debug level in redacted form when [`StreamConfig::log_sent_messages`]
//! is set, received frames when [`StreamConfig::log_received_messages`] is.
//!
//! # Errors
//!
//! All fallible operations return [`TdError`]. A dropped connection is not
//! an error for callers: it shows up as [`ConnectionState::Restarting`] and
//! the restart callback. The actor's terminal error, such as
//! [`TdError::ReconnectExhausted`], is returned by [`StreamingClient::join`].
pub mod api;
pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod enums;
pub mod errors;
pub mod models;
pub mod queue;
pub mod registry;
pub mod schema;
pub mod services;

// Re-export primary types for convenience.
pub use api::{StaticToken, TdApi, TokenProvider};
pub use backoff::BackoffConfig;
pub use client::StreamingClient;
pub use config::{ApiConfig, StreamConfig};
pub use connection::ConnectionState;
pub use enums::*;
pub use errors::TdError;
pub use models::{
    Credentials, Frame, RequestBatch, ServiceMessage, ServiceRequest, UserPrincipals,
};
pub use registry::{Callback, TypedStream};
pub use services::{ChartHistoryRange, RequestTemplate, StreamingServices};
