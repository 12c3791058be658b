//! Protocol enumerations: services, commands, frame kinds and the
//! value sets accepted by the request builders.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TdError;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A streaming service, keyed by its wire name.
///
/// Names the SDK does not know are kept verbatim in [`Service::Other`] so
/// they can still be routed to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Service {
    Admin,
    AccountActivity,
    ActivesNasdaq,
    ActivesNyse,
    ActivesOptions,
    ActivesOtcbb,
    ChartEquity,
    ChartFutures,
    ChartOptions,
    ChartHistoryFutures,
    Quote,
    Option,
    LevelOneFutures,
    LevelOneForex,
    LevelOneFuturesOptions,
    ListedBook,
    OptionsBook,
    NasdaqBook,
    FuturesBook,
    ForexBook,
    FuturesOptionsBook,
    NewsHeadline,
    TimesaleEquity,
    TimesaleForex,
    TimesaleFutures,
    TimesaleOptions,
    Other(String),
}

impl Service {
    pub fn as_str(&self) -> &str {
        match self {
            Service::Admin => "ADMIN",
            Service::AccountActivity => "ACCT_ACTIVITY",
            Service::ActivesNasdaq => "ACTIVES_NASDAQ",
            Service::ActivesNyse => "ACTIVES_NYSE",
            Service::ActivesOptions => "ACTIVES_OPTIONS",
            Service::ActivesOtcbb => "ACTIVES_OTCBB",
            Service::ChartEquity => "CHART_EQUITY",
            Service::ChartFutures => "CHART_FUTURES",
            Service::ChartOptions => "CHART_OPTIONS",
            Service::ChartHistoryFutures => "CHART_HISTORY_FUTURES",
            Service::Quote => "QUOTE",
            Service::Option => "OPTION",
            Service::LevelOneFutures => "LEVELONE_FUTURES",
            Service::LevelOneForex => "LEVELONE_FOREX",
            Service::LevelOneFuturesOptions => "LEVELONE_FUTURES_OPTIONS",
            Service::ListedBook => "LISTED_BOOK",
            Service::OptionsBook => "OPTIONS_BOOK",
            Service::NasdaqBook => "NASDAQ_BOOK",
            Service::FuturesBook => "FUTURES_BOOK",
            Service::ForexBook => "FOREX_BOOK",
            Service::FuturesOptionsBook => "FUTURES_OPTIONS_BOOK",
            Service::NewsHeadline => "NEWS_HEADLINE",
            Service::TimesaleEquity => "TIMESALE_EQUITY",
            Service::TimesaleForex => "TIMESALE_FOREX",
            Service::TimesaleFutures => "TIMESALE_FUTURES",
            Service::TimesaleOptions => "TIMESALE_OPTIONS",
            Service::Other(name) => name,
        }
    }

    /// Returns true for services the SDK knows by name.
    pub fn is_known(&self) -> bool {
        !matches!(self, Service::Other(_))
    }
}

impl From<&str> for Service {
    fn from(name: &str) -> Self {
        match name {
            "ADMIN" => Service::Admin,
            "ACCT_ACTIVITY" => Service::AccountActivity,
            "ACTIVES_NASDAQ" => Service::ActivesNasdaq,
            "ACTIVES_NYSE" => Service::ActivesNyse,
            "ACTIVES_OPTIONS" => Service::ActivesOptions,
            "ACTIVES_OTCBB" => Service::ActivesOtcbb,
            "CHART_EQUITY" => Service::ChartEquity,
            "CHART_FUTURES" => Service::ChartFutures,
            "CHART_OPTIONS" => Service::ChartOptions,
            "CHART_HISTORY_FUTURES" => Service::ChartHistoryFutures,
            "QUOTE" => Service::Quote,
            "OPTION" => Service::Option,
            "LEVELONE_FUTURES" => Service::LevelOneFutures,
            "LEVELONE_FOREX" => Service::LevelOneForex,
            "LEVELONE_FUTURES_OPTIONS" => Service::LevelOneFuturesOptions,
            "LISTED_BOOK" => Service::ListedBook,
            "OPTIONS_BOOK" => Service::OptionsBook,
            "NASDAQ_BOOK" => Service::NasdaqBook,
            "FUTURES_BOOK" => Service::FuturesBook,
            "FOREX_BOOK" => Service::ForexBook,
            "FUTURES_OPTIONS_BOOK" => Service::FuturesOptionsBook,
            "NEWS_HEADLINE" => Service::NewsHeadline,
            "TIMESALE_EQUITY" => Service::TimesaleEquity,
            "TIMESALE_FOREX" => Service::TimesaleForex,
            "TIMESALE_FUTURES" => Service::TimesaleFutures,
            "TIMESALE_OPTIONS" => Service::TimesaleOptions,
            other => Service::Other(other.to_string()),
        }
    }
}

impl From<String> for Service {
    fn from(name: String) -> Self {
        match Service::from(name.as_str()) {
            Service::Other(_) => Service::Other(name),
            known => known,
        }
    }
}

impl From<Service> for String {
    fn from(service: Service) -> Self {
        match service {
            Service::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defines a service family: a closed subset of [`Service`] used to
/// validate builder input.
macro_rules! service_family {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $service:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl From<$name> for Service {
            fn from(value: $name) -> Self {
                match value {
                    $($name::$variant => Service::$service),+
                }
            }
        }
    };
}

service_family!(
    /// Level one quote services.
    LevelOneService {
        Equity => Quote,
        Options => Option,
        Futures => LevelOneFutures,
        Forex => LevelOneForex,
        FuturesOptions => LevelOneFuturesOptions,
    }
);

service_family!(
    /// Level two order book services.
    LevelTwoService {
        Equity => ListedBook,
        Options => OptionsBook,
        Nasdaq => NasdaqBook,
        Futures => FuturesBook,
        Forex => ForexBook,
        FuturesOptions => FuturesOptionsBook,
    }
);

service_family!(
    /// Time and sales services.
    TimesaleService {
        Equity => TimesaleEquity,
        Forex => TimesaleForex,
        Futures => TimesaleFutures,
        Options => TimesaleOptions,
    }
);

service_family!(
    /// Minute chart services.
    ChartService {
        Equity => ChartEquity,
        Futures => ChartFutures,
        Options => ChartOptions,
    }
);

service_family!(
    /// Chart history snapshot services.
    ChartHistoryService {
        Futures => ChartHistoryFutures,
    }
);

service_family!(
    /// Most-active instrument services.
    ActivesService {
        Nasdaq => ActivesNasdaq,
        Nyse => ActivesNyse,
        Options => ActivesOptions,
        Otcbb => ActivesOtcbb,
    }
);

// ---------------------------------------------------------------------------
// Command / frame kind / state
// ---------------------------------------------------------------------------

/// A command sent against a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Login,
    Logout,
    Qos,
    Subs,
    Add,
    Unsubs,
    Get,
    View,
    Stream,
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Login => "LOGIN",
            Command::Logout => "LOGOUT",
            Command::Qos => "QOS",
            Command::Subs => "SUBS",
            Command::Add => "ADD",
            Command::Unsubs => "UNSUBS",
            Command::Get => "GET",
            Command::View => "VIEW",
            Command::Stream => "STREAM",
            Command::Unknown => "UNKNOWN",
        }
    }

    /// Commands that open or extend a subscription.
    pub fn is_subscribing(&self) -> bool {
        matches!(self, Command::Subs | Command::Add | Command::Get)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level key of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameKind {
    Response,
    Data,
    Notify,
    Snapshot,
}

impl FrameKind {
    /// Every kind, in dispatch order.
    pub const ALL: [FrameKind; 4] = [
        FrameKind::Response,
        FrameKind::Data,
        FrameKind::Notify,
        FrameKind::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Response => "response",
            FrameKind::Data => "data",
            FrameKind::Notify => "notify",
            FrameKind::Snapshot => "snapshot",
        }
    }
}

impl FromStr for FrameKind {
    type Err = TdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "response" => Ok(FrameKind::Response),
            "data" => Ok(FrameKind::Data),
            "notify" => Ok(FrameKind::Notify),
            "snapshot" => Ok(FrameKind::Snapshot),
            other => Err(TdError::InvalidRequest(format!("unknown frame kind: {other}"))),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgement state of a tracked service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// A request was sent; no acknowledgement yet.
    Acked,
    /// The server acknowledged the subscription.
    Subscribed,
}

// ---------------------------------------------------------------------------
// Builder value sets
// ---------------------------------------------------------------------------

/// Quality of service level, fastest (`Express`) to slowest (`Delayed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    Express,
    RealTime,
    Fast,
    Moderate,
    Slow,
    Delayed,
}

impl QosLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QosLevel::Express => "0",
            QosLevel::RealTime => "1",
            QosLevel::Fast => "2",
            QosLevel::Moderate => "3",
            QosLevel::Slow => "4",
            QosLevel::Delayed => "5",
        }
    }
}

/// Venue for the actives services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivesVenue {
    Nasdaq,
    Nyse,
    Otcbb,
    Calls,
    Puts,
    Options,
    CallsDesc,
    PutsDesc,
    OptionsDesc,
}

impl ActivesVenue {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivesVenue::Nasdaq => "NASDAQ",
            ActivesVenue::Nyse => "NYSE",
            ActivesVenue::Otcbb => "OTCBB",
            ActivesVenue::Calls => "CALLS",
            ActivesVenue::Puts => "PUTS",
            ActivesVenue::Options => "OPTS",
            ActivesVenue::CallsDesc => "CALLS-DESC",
            ActivesVenue::PutsDesc => "PUTS-DESC",
            ActivesVenue::OptionsDesc => "OPTS-DESC",
        }
    }
}

/// Look-back window for the actives services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivesDuration {
    All,
    SixtySeconds,
    ThreeHundredSeconds,
    SixHundredSeconds,
    EighteenHundredSeconds,
    ThirtySixHundredSeconds,
}

impl ActivesDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivesDuration::All => "ALL",
            ActivesDuration::SixtySeconds => "60",
            ActivesDuration::ThreeHundredSeconds => "300",
            ActivesDuration::SixHundredSeconds => "600",
            ActivesDuration::EighteenHundredSeconds => "1800",
            ActivesDuration::ThirtySixHundredSeconds => "3600",
        }
    }
}

/// Bar frequency for futures chart history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartFuturesFrequency {
    OneMinute,
    FiveMinute,
    TenMinute,
    ThirtyMinute,
    OneHour,
    OneDay,
    OneWeek,
    OneMonth,
}

impl ChartFuturesFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartFuturesFrequency::OneMinute => "m1",
            ChartFuturesFrequency::FiveMinute => "m5",
            ChartFuturesFrequency::TenMinute => "m10",
            ChartFuturesFrequency::ThirtyMinute => "m30",
            ChartFuturesFrequency::OneHour => "h1",
            ChartFuturesFrequency::OneDay => "d1",
            ChartFuturesFrequency::OneWeek => "w1",
            ChartFuturesFrequency::OneMonth => "n1",
        }
    }
}

/// Look-back period for futures chart history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartFuturesPeriod {
    OneDay,
    FiveDay,
    FourWeeks,
    TenMonths,
    OneYear,
    TenYear,
}

impl ChartFuturesPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartFuturesPeriod::OneDay => "d1",
            ChartFuturesPeriod::FiveDay => "d5",
            ChartFuturesPeriod::FourWeeks => "w4",
            ChartFuturesPeriod::TenMonths => "n10",
            ChartFuturesPeriod::OneYear => "y1",
            ChartFuturesPeriod::TenYear => "y10",
        }
    }
}
