//! Typed records for streamed market data.
//!
//! Streamer content is keyed by numeric field ids (`"1"`, `"2"`, ...) with
//! the symbol under `"key"`. Each record maps the ids it models to named
//! fields and keeps the rest in `extra`.
use std::any::type_name;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::enums::Service;
use crate::errors::TdError;
use crate::models::ServiceMessage;
use crate::registry::Callback;

/// A record type decoded from the `content` of a service message.
pub trait StreamRecord: Sized + Send + 'static {
    /// Field ids requested by default when subscribing.
    const FIELDS: &'static [&'static str];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError>;
}

/// Decode every content entry of `msg` with serde.
pub fn decode_content<R: DeserializeOwned>(msg: &ServiceMessage) -> Result<Vec<R>, TdError> {
    msg.content_items()
        .iter()
        .map(|item| {
            R::deserialize(item).map_err(|e| {
                TdError::DecodeError(format!("{}: {e}", type_name::<R>()))
            })
        })
        .collect()
}

/// Build a handler callback that decodes each message into `R` before
/// calling `f`. Messages that fail to decode are logged and skipped.
pub fn decoded<R, F>(f: F) -> Callback<ServiceMessage>
where
    R: StreamRecord,
    F: Fn(&ServiceMessage, Vec<R>) + Send + Sync + 'static,
{
    Callback::new(move |msg: &ServiceMessage| match R::from_message(msg) {
        Ok(records) => f(msg, records),
        Err(e) => warn!(
            "schema.decode_failed record={} service={:?} error={e}",
            type_name::<R>(),
            msg.service
        ),
    })
}

fn deserialize_optional_string_or_number<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(v) => Ok(Some(v.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Default field sets
// ---------------------------------------------------------------------------

pub const LEVEL_ONE_OPTION_FIELDS: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16",
    "17", "18", "19", "20", "21", "22", "23", "24", "25", "26", "27", "28", "29", "30", "31",
    "32", "33", "34", "35", "36", "37", "38", "39", "40", "41",
];

pub const LEVEL_ONE_FUTURES_FIELDS: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16",
    "17", "18", "19", "20", "21", "22", "23", "24", "25", "26", "27", "28", "29", "30", "31",
    "32", "33", "34", "35",
];

/// Futures options share the futures field layout.
pub const LEVEL_ONE_FUTURES_OPTIONS_FIELDS: &[&str] = LEVEL_ONE_FUTURES_FIELDS;

pub const LEVEL_ONE_FOREX_FIELDS: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16",
    "17", "18", "19", "20", "21", "22", "23", "24", "25", "26", "27", "28", "29",
];

// ---------------------------------------------------------------------------
// Level one
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelOneEquity {
    #[serde(rename = "key")]
    pub symbol: String,
    #[serde(rename = "1", default)]
    pub bid_price: Option<f64>,
    #[serde(rename = "2", default)]
    pub ask_price: Option<f64>,
    #[serde(rename = "3", default)]
    pub last_price: Option<f64>,
    #[serde(rename = "4", default)]
    pub bid_size: Option<f64>,
    #[serde(rename = "5", default)]
    pub ask_size: Option<f64>,
    #[serde(rename = "8", default)]
    pub total_volume: Option<i64>,
    #[serde(rename = "9", default)]
    pub last_size: Option<f64>,
    /// Seconds since midnight EST.
    #[serde(rename = "10", default)]
    pub trade_time: Option<i64>,
    #[serde(rename = "11", default)]
    pub quote_time: Option<i64>,
    #[serde(rename = "12", default)]
    pub high_price: Option<f64>,
    #[serde(rename = "13", default)]
    pub low_price: Option<f64>,
    /// Previous day's close.
    #[serde(rename = "15", default)]
    pub close_price: Option<f64>,
    #[serde(rename = "25", default)]
    pub description: Option<String>,
    #[serde(rename = "28", default)]
    pub open_price: Option<f64>,
    #[serde(rename = "29", default)]
    pub net_change: Option<f64>,
    #[serde(rename = "49", default)]
    pub mark: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamRecord for LevelOneEquity {
    const FIELDS: &'static [&'static str] = &[
        "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15",
        "16", "17", "18", "19", "20", "21", "22", "23", "24", "25", "26", "27", "28", "29", "30",
        "31", "32", "33", "34", "35", "36", "37", "38", "39", "40", "41", "42", "43", "44", "45",
        "46", "47", "48", "49", "50", "51", "52",
    ];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

// ---------------------------------------------------------------------------
// Time and sales / news
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timesale {
    #[serde(rename = "key")]
    pub symbol: String,
    /// Trade time, epoch milliseconds.
    #[serde(rename = "1", default)]
    pub timestamp: Option<i64>,
    #[serde(rename = "2", default)]
    pub price: Option<f64>,
    #[serde(rename = "3", default)]
    pub volume: Option<f64>,
    #[serde(rename = "4", default)]
    pub last_size: Option<f64>,
    #[serde(default)]
    pub seq: Option<i64>,
}

impl StreamRecord for Timesale {
    const FIELDS: &'static [&'static str] = &["0", "1", "2", "3", "4"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsHeadline {
    #[serde(rename = "key")]
    pub symbol: String,
    #[serde(rename = "1", default)]
    pub error_code: Option<i64>,
    #[serde(rename = "2", default)]
    pub timestamp: Option<i64>,
    #[serde(rename = "3", default)]
    pub headline_id: Option<String>,
    #[serde(rename = "4", default)]
    pub status: Option<String>,
    #[serde(rename = "5", default)]
    pub headline: Option<String>,
    #[serde(rename = "6", default)]
    pub story_id: Option<String>,
    #[serde(rename = "7", default)]
    pub keyword_count: Option<i64>,
    #[serde(rename = "8", default)]
    pub keyword_array: Option<String>,
    #[serde(rename = "9", default)]
    pub is_hot: Option<bool>,
    #[serde(rename = "10", default)]
    pub story_source: Option<String>,
    #[serde(default)]
    pub seq: Option<i64>,
}

impl StreamRecord for NewsHeadline {
    const FIELDS: &'static [&'static str] =
        &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

// ---------------------------------------------------------------------------
// Charts
// ---------------------------------------------------------------------------

/// One minute bar from CHART_EQUITY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartEquity {
    #[serde(rename = "key")]
    pub symbol: String,
    #[serde(rename = "1", default)]
    pub open: Option<f64>,
    #[serde(rename = "2", default)]
    pub high: Option<f64>,
    #[serde(rename = "3", default)]
    pub low: Option<f64>,
    #[serde(rename = "4", default)]
    pub close: Option<f64>,
    #[serde(rename = "5", default)]
    pub volume: Option<f64>,
    #[serde(rename = "6", default)]
    pub sequence: Option<i64>,
    #[serde(rename = "7", default)]
    pub chart_time: Option<i64>,
    #[serde(rename = "8", default)]
    pub chart_day: Option<i64>,
}

impl StreamRecord for ChartEquity {
    const FIELDS: &'static [&'static str] = &["0", "1", "2", "3", "4", "5", "6", "7", "8"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

/// One minute bar from CHART_FUTURES or CHART_OPTIONS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartFuturesOrOptions {
    #[serde(rename = "key")]
    pub symbol: String,
    #[serde(rename = "1", default)]
    pub chart_time: Option<i64>,
    #[serde(rename = "2", default)]
    pub open: Option<f64>,
    #[serde(rename = "3", default)]
    pub high: Option<f64>,
    #[serde(rename = "4", default)]
    pub low: Option<f64>,
    #[serde(rename = "5", default)]
    pub close: Option<f64>,
    #[serde(rename = "6", default)]
    pub volume: Option<f64>,
}

impl StreamRecord for ChartFuturesOrOptions {
    const FIELDS: &'static [&'static str] = &["0", "1", "2", "3", "4", "5", "6"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartHistoryBar {
    #[serde(rename = "0")]
    pub timestamp: i64,
    #[serde(rename = "1")]
    pub open: f64,
    #[serde(rename = "2")]
    pub high: f64,
    #[serde(rename = "3")]
    pub low: f64,
    #[serde(rename = "4")]
    pub close: f64,
    #[serde(rename = "5")]
    pub volume: f64,
}

/// A CHART_HISTORY_FUTURES snapshot: every bar for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartHistorySnapshot {
    #[serde(rename = "key")]
    pub symbol: String,
    #[serde(
        rename = "0",
        default,
        deserialize_with = "deserialize_optional_string_or_number"
    )]
    pub request_id: Option<String>,
    #[serde(rename = "3", default)]
    pub bars: Vec<ChartHistoryBar>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamRecord for ChartHistorySnapshot {
    const FIELDS: &'static [&'static str] = &["0", "1", "2", "3"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

// ---------------------------------------------------------------------------
// Level two
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEntry {
    #[serde(rename = "0")]
    pub exchange: String,
    #[serde(rename = "1")]
    pub volume: f64,
    #[serde(rename = "2")]
    pub sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(rename = "0")]
    pub price: f64,
    #[serde(rename = "1")]
    pub total_volume: f64,
    #[serde(rename = "2")]
    pub exchange_count: i64,
    #[serde(rename = "3", default)]
    pub exchanges: Vec<ExchangeEntry>,
}

/// Order book snapshot from any of the `*_BOOK` services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTwoBook {
    #[serde(rename = "key")]
    pub symbol: String,
    #[serde(rename = "1", default)]
    pub timestamp: Option<i64>,
    #[serde(rename = "2", default)]
    pub bids: Vec<PriceLevel>,
    #[serde(rename = "3", default)]
    pub asks: Vec<PriceLevel>,
}

impl StreamRecord for LevelTwoBook {
    const FIELDS: &'static [&'static str] = &["0", "1", "2", "3"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        decode_content(msg)
    }
}

// ---------------------------------------------------------------------------
// Actives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ActivesSymbol {
    pub symbol: String,
    pub volume: i64,
    /// Share of the venue's total volume.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivesGroup {
    pub group_number: String,
    pub num_entries: String,
    pub total_volume: i64,
    pub symbols: Vec<ActivesSymbol>,
}

/// Most-active ranking for one venue and duration.
///
/// Field `"1"` is a `;` separated record whose last two sections are the
/// by-trades and by-shares groups, each `:` separated.
#[derive(Debug, Clone, PartialEq)]
pub struct Actives {
    pub key: String,
    pub group_id: String,
    pub sample_duration: i64,
    pub start_time: String,
    pub display_time: String,
    pub num_groups: i64,
    pub trades: ActivesGroup,
    pub shares: ActivesGroup,
}

fn parse_num<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, TdError> {
    raw.trim()
        .parse()
        .map_err(|_| TdError::DecodeError(format!("actives {what}: {raw:?}")))
}

fn parse_actives_group(raw: &str) -> Result<ActivesGroup, TdError> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() < 3 {
        return Err(TdError::DecodeError(format!("actives group: {raw:?}")));
    }
    let symbols = parts[3..]
        .chunks(3)
        .filter(|chunk| chunk.len() == 3)
        .map(|chunk| {
            Ok(ActivesSymbol {
                symbol: chunk[0].to_string(),
                volume: parse_num(chunk[1], "volume")?,
                percent: parse_num(chunk[2], "percent")?,
            })
        })
        .collect::<Result<Vec<_>, TdError>>()?;
    Ok(ActivesGroup {
        group_number: parts[0].to_string(),
        num_entries: parts[1].to_string(),
        total_volume: parse_num(parts[2], "total volume")?,
        symbols,
    })
}

impl Actives {
    /// Parse the raw `"1"` field. Returns `None` for an empty payload.
    pub fn parse(key: &str, raw: &str) -> Result<Option<Self>, TdError> {
        if raw.is_empty() {
            return Ok(None);
        }
        let sections: Vec<&str> = raw.split(';').collect();
        if sections.len() < 5 {
            return Err(TdError::DecodeError(format!("actives header: {raw:?}")));
        }
        let num_groups: i64 = parse_num(sections[4], "group count")?;
        let first = if num_groups == 2 { 5 } else { 9 };
        let (Some(trades), Some(shares)) = (sections.get(first), sections.get(first + 1)) else {
            return Err(TdError::DecodeError(format!("actives groups missing: {raw:?}")));
        };

        Ok(Some(Self {
            key: key.to_string(),
            group_id: sections[0].to_string(),
            sample_duration: parse_num(sections[1], "sample duration")?,
            start_time: sections[2].to_string(),
            display_time: sections[3].to_string(),
            num_groups,
            trades: parse_actives_group(trades)?,
            shares: parse_actives_group(shares)?,
        }))
    }
}

impl StreamRecord for Actives {
    const FIELDS: &'static [&'static str] = &["1"];

    fn from_message(msg: &ServiceMessage) -> Result<Vec<Self>, TdError> {
        let mut out = Vec::new();
        for item in msg.content_items() {
            let key = item.get("key").and_then(Value::as_str).unwrap_or_default();
            let raw = item.get("1").and_then(Value::as_str).unwrap_or_default();
            if let Some(actives) = Actives::parse(key, raw)? {
                out.push(actives);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tagged union
// ---------------------------------------------------------------------------

/// Message content resolved to the record type of its service.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketData {
    LevelOneEquity(Vec<LevelOneEquity>),
    Timesale(Vec<Timesale>),
    NewsHeadline(Vec<NewsHeadline>),
    ChartEquity(Vec<ChartEquity>),
    ChartFuturesOrOptions(Vec<ChartFuturesOrOptions>),
    ChartHistory(Vec<ChartHistorySnapshot>),
    LevelTwoBook(Vec<LevelTwoBook>),
    Actives(Vec<Actives>),
    /// Services without a typed record.
    Raw(Vec<Value>),
}

impl MarketData {
    pub fn decode(msg: &ServiceMessage) -> Result<Self, TdError> {
        let Some(service) = &msg.service else {
            return Ok(MarketData::Raw(msg.content_items().to_vec()));
        };
        let data = match service {
            Service::Quote => MarketData::LevelOneEquity(LevelOneEquity::from_message(msg)?),
            Service::TimesaleEquity
            | Service::TimesaleForex
            | Service::TimesaleFutures
            | Service::TimesaleOptions => MarketData::Timesale(Timesale::from_message(msg)?),
            Service::NewsHeadline => MarketData::NewsHeadline(NewsHeadline::from_message(msg)?),
            Service::ChartEquity => MarketData::ChartEquity(ChartEquity::from_message(msg)?),
            Service::ChartFutures | Service::ChartOptions => {
                MarketData::ChartFuturesOrOptions(ChartFuturesOrOptions::from_message(msg)?)
            }
            Service::ChartHistoryFutures => {
                MarketData::ChartHistory(ChartHistorySnapshot::from_message(msg)?)
            }
            Service::ListedBook
            | Service::OptionsBook
            | Service::NasdaqBook
            | Service::FuturesBook
            | Service::ForexBook
            | Service::FuturesOptionsBook => {
                MarketData::LevelTwoBook(LevelTwoBook::from_message(msg)?)
            }
            Service::ActivesNasdaq
            | Service::ActivesNyse
            | Service::ActivesOptions
            | Service::ActivesOtcbb => MarketData::Actives(Actives::from_message(msg)?),
            _ => MarketData::Raw(msg.content_items().to_vec()),
        };
        Ok(data)
    }

    pub fn len(&self) -> usize {
        match self {
            MarketData::LevelOneEquity(v) => v.len(),
            MarketData::Timesale(v) => v.len(),
            MarketData::NewsHeadline(v) => v.len(),
            MarketData::ChartEquity(v) => v.len(),
            MarketData::ChartFuturesOrOptions(v) => v.len(),
            MarketData::ChartHistory(v) => v.len(),
            MarketData::LevelTwoBook(v) => v.len(),
            MarketData::Actives(v) => v.len(),
            MarketData::Raw(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
