//! Per-service request builders.
//!
//! [`RequestTemplate`] builds [`ServiceRequest`]s without touching the
//! network. [`StreamingServices`] pairs it with a [`StreamingClient`] and
//! enqueues what it builds.
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::client::StreamingClient;
use crate::enums::{
    ActivesDuration, ActivesService, ActivesVenue, ChartFuturesFrequency, ChartFuturesPeriod,
    ChartHistoryService, ChartService, Command, LevelOneService, LevelTwoService, QosLevel,
    Service, TimesaleService,
};
use crate::errors::TdError;
use crate::models::{ServiceRequest, UserPrincipals};
use crate::schema::{
    ChartEquity, ChartFuturesOrOptions, LevelOneEquity, LevelTwoBook, NewsHeadline, StreamRecord,
    Timesale, LEVEL_ONE_FOREX_FIELDS, LEVEL_ONE_FUTURES_FIELDS, LEVEL_ONE_FUTURES_OPTIONS_FIELDS,
    LEVEL_ONE_OPTION_FIELDS,
};

/// Time range for a chart history request: a named period or explicit bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartHistoryRange {
    Period(ChartFuturesPeriod),
    Between {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl ChartHistoryRange {
    /// Validate the loose form: exactly one of `period` or a full `(start, end)` pair.
    pub fn from_parts(
        period: Option<ChartFuturesPeriod>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, TdError> {
        match (period, start, end) {
            (Some(period), None, None) => Ok(ChartHistoryRange::Period(period)),
            (None, Some(start), Some(end)) => {
                if start > end {
                    return Err(TdError::InvalidRequest(format!(
                        "chart history start {start} is after end {end}"
                    )));
                }
                Ok(ChartHistoryRange::Between { start, end })
            }
            (None, None, None) => Err(TdError::InvalidRequest(
                "chart history needs a period or a start and end time".into(),
            )),
            (Some(_), _, _) => Err(TdError::InvalidRequest(
                "chart history period cannot be combined with start/end time".into(),
            )),
            (None, _, _) => Err(TdError::InvalidRequest(
                "chart history needs both start and end time".into(),
            )),
        }
    }
}

fn join(values: &[&str]) -> String {
    values.join(",")
}

fn require_symbols(service: &Service, symbols: &[&str]) -> Result<(), TdError> {
    if symbols.is_empty() || symbols.iter().any(|s| s.trim().is_empty()) {
        return Err(TdError::InvalidRequest(format!(
            "{service} requires at least one non-empty symbol"
        )));
    }
    Ok(())
}

/// Account and source shared by every request of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    pub account: String,
    pub source: String,
    /// First streamer subscription key, needed only by account activity.
    pub subscription_key: Option<String>,
}

impl RequestTemplate {
    pub fn new(account: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            source: source.into(),
            subscription_key: None,
        }
    }

    pub fn from_principals(principals: &UserPrincipals) -> Result<Self, TdError> {
        Ok(Self {
            account: principals.primary_account()?.account_id.clone(),
            source: principals.streamer()?.app_id.clone(),
            subscription_key: principals.subscription_key().ok().map(str::to_string),
        })
    }

    /// A bare request with no parameters.
    pub fn request(&self, service: impl Into<Service>, command: Command) -> ServiceRequest {
        ServiceRequest::new(service, command, &self.account, &self.source)
    }

    /// A keyed request with `keys` and `fields` parameters.
    pub fn subscription(
        &self,
        service: impl Into<Service>,
        command: Command,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<ServiceRequest, TdError> {
        let service = service.into();
        require_symbols(&service, symbols)?;
        Ok(self
            .request(service, command)
            .with_param("keys", join(symbols))
            .with_param("fields", join(fields)))
    }

    pub fn logout(&self) -> ServiceRequest {
        self.request(Service::Admin, Command::Logout)
    }

    pub fn quality_of_service(&self, level: QosLevel) -> ServiceRequest {
        self.request(Service::Admin, Command::Qos)
            .with_param("qoslevel", level.as_str())
    }

    pub fn account_activity(&self) -> Result<ServiceRequest, TdError> {
        let key = self
            .subscription_key
            .as_deref()
            .ok_or_else(|| TdError::MissingPrincipals("streamerSubscriptionKeys".into()))?;
        self.subscription(
            Service::AccountActivity,
            Command::Subs,
            &[key],
            &["0", "1", "2", "3"],
        )
    }

    pub fn actives(
        &self,
        service: ActivesService,
        venue: ActivesVenue,
        duration: ActivesDuration,
    ) -> ServiceRequest {
        self.request(service, Command::Subs)
            .with_param("keys", format!("{}-{}", venue.as_str(), duration.as_str()))
            .with_param("fields", "1")
    }

    /// Minute chart subscription. `tracked` selects ADD over SUBS.
    pub fn chart(
        &self,
        service: ChartService,
        symbols: &[&str],
        fields: &[&str],
        tracked: bool,
    ) -> Result<ServiceRequest, TdError> {
        let command = if tracked { Command::Add } else { Command::Subs };
        self.subscription(service, command, symbols, fields)
    }

    /// Chart history snapshot for one symbol. `tracked` selects ADD over GET.
    pub fn chart_history(
        &self,
        service: ChartHistoryService,
        symbol: &str,
        frequency: ChartFuturesFrequency,
        range: ChartHistoryRange,
        tracked: bool,
    ) -> Result<ServiceRequest, TdError> {
        let service = Service::from(service);
        if symbol.trim().is_empty() || symbol.contains(',') {
            return Err(TdError::InvalidRequest(format!(
                "{service} accepts exactly one symbol, got {symbol:?}"
            )));
        }
        let command = if tracked { Command::Add } else { Command::Get };
        let request = self
            .request(service, command)
            .with_param("frequency", frequency.as_str())
            .with_param("symbol", symbol);
        Ok(match range {
            ChartHistoryRange::Period(period) => request.with_param("period", period.as_str()),
            ChartHistoryRange::Between { start, end } => request
                .with_param("START_TIME", Value::from(start.timestamp_millis()))
                .with_param("END_TIME", Value::from(end.timestamp_millis())),
        })
    }

    pub fn level_one(
        &self,
        service: LevelOneService,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<ServiceRequest, TdError> {
        self.subscription(service, Command::Subs, symbols, fields)
    }

    pub fn level_two(
        &self,
        service: LevelTwoService,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<ServiceRequest, TdError> {
        self.subscription(service, Command::Subs, symbols, fields)
    }

    pub fn timesale(
        &self,
        service: TimesaleService,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<ServiceRequest, TdError> {
        self.subscription(service, Command::Subs, symbols, fields)
    }

    pub fn news_headline(
        &self,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<ServiceRequest, TdError> {
        self.subscription(Service::NewsHeadline, Command::Subs, symbols, fields)
    }

    pub fn unsubscribe(&self, service: impl Into<Service>) -> ServiceRequest {
        self.request(service, Command::Unsubs)
    }
}

/// Service builders bound to a running client.
///
/// Every method enqueues one request and returns its request id once the
/// client is logged in.
pub struct StreamingServices<'a> {
    client: &'a StreamingClient,
}

impl<'a> StreamingServices<'a> {
    pub(crate) fn new(client: &'a StreamingClient) -> Self {
        Self { client }
    }

    fn template(&self) -> &RequestTemplate {
        self.client.template()
    }

    // -----------------------------------------------------------------------
    // ADMIN / account
    // -----------------------------------------------------------------------

    pub async fn logout(&self) -> Result<u64, TdError> {
        self.client.enqueue(self.template().logout()).await
    }

    pub async fn quality_of_service(&self, level: QosLevel) -> Result<u64, TdError> {
        self.client
            .enqueue(self.template().quality_of_service(level))
            .await
    }

    pub async fn account_activity(&self) -> Result<u64, TdError> {
        self.client
            .enqueue(self.template().account_activity()?)
            .await
    }

    pub async fn actives(
        &self,
        service: ActivesService,
        venue: ActivesVenue,
        duration: ActivesDuration,
    ) -> Result<u64, TdError> {
        self.client
            .enqueue(self.template().actives(service, venue, duration))
            .await
    }

    // -----------------------------------------------------------------------
    // Charts
    // -----------------------------------------------------------------------

    pub async fn chart(
        &self,
        service: ChartService,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<u64, TdError> {
        let tracked = self.client.is_subscribed(&Service::from(service)).await?;
        let request = self.template().chart(service, symbols, fields, tracked)?;
        self.client.enqueue(request).await
    }

    pub async fn equity_chart_minute_ohlcv(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.chart(ChartService::Equity, symbols, ChartEquity::FIELDS)
            .await
    }

    pub async fn futures_chart_minute_ohlcv(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.chart(ChartService::Futures, symbols, ChartFuturesOrOptions::FIELDS)
            .await
    }

    pub async fn options_chart_minute_ohlcv(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.chart(ChartService::Options, symbols, ChartFuturesOrOptions::FIELDS)
            .await
    }

    pub async fn chart_history(
        &self,
        service: ChartHistoryService,
        symbol: &str,
        frequency: ChartFuturesFrequency,
        range: ChartHistoryRange,
    ) -> Result<u64, TdError> {
        let tracked = self.client.is_subscribed(&Service::from(service)).await?;
        let request = self
            .template()
            .chart_history(service, symbol, frequency, range, tracked)?;
        self.client.enqueue(request).await
    }

    pub async fn futures_chart_history(
        &self,
        symbol: &str,
        frequency: ChartFuturesFrequency,
        range: ChartHistoryRange,
    ) -> Result<u64, TdError> {
        self.chart_history(ChartHistoryService::Futures, symbol, frequency, range)
            .await
    }

    // -----------------------------------------------------------------------
    // Level one
    // -----------------------------------------------------------------------

    async fn level_one(
        &self,
        service: LevelOneService,
        symbols: &[&str],
        fields: &[&str],
    ) -> Result<u64, TdError> {
        let request = self.template().level_one(service, symbols, fields)?;
        self.client.enqueue(request).await
    }

    /// Level one equity quotes. `None` requests every field.
    pub async fn level_one_quotes(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_one(
            LevelOneService::Equity,
            symbols,
            fields.unwrap_or(LevelOneEquity::FIELDS),
        )
        .await
    }

    pub async fn level_one_options(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_one(
            LevelOneService::Options,
            symbols,
            fields.unwrap_or(LEVEL_ONE_OPTION_FIELDS),
        )
        .await
    }

    pub async fn level_one_futures(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_one(
            LevelOneService::Futures,
            symbols,
            fields.unwrap_or(LEVEL_ONE_FUTURES_FIELDS),
        )
        .await
    }

    pub async fn level_one_forex(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_one(
            LevelOneService::Forex,
            symbols,
            fields.unwrap_or(LEVEL_ONE_FOREX_FIELDS),
        )
        .await
    }

    pub async fn level_one_futures_options(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_one(
            LevelOneService::FuturesOptions,
            symbols,
            fields.unwrap_or(LEVEL_ONE_FUTURES_OPTIONS_FIELDS),
        )
        .await
    }

    pub async fn news_headline(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        let request = self
            .template()
            .news_headline(symbols, fields.unwrap_or(NewsHeadline::FIELDS))?;
        self.client.enqueue(request).await
    }

    // -----------------------------------------------------------------------
    // Level two
    // -----------------------------------------------------------------------

    async fn level_two(
        &self,
        service: LevelTwoService,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        let request = self.template().level_two(
            service,
            symbols,
            fields.unwrap_or(LevelTwoBook::FIELDS),
        )?;
        self.client.enqueue(request).await
    }

    pub async fn level_two_quotes(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_two(LevelTwoService::Equity, symbols, fields).await
    }

    pub async fn level_two_options(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_two(LevelTwoService::Options, symbols, fields).await
    }

    pub async fn level_two_nasdaq(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_two(LevelTwoService::Nasdaq, symbols, fields).await
    }

    pub async fn level_two_futures(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_two(LevelTwoService::Futures, symbols, fields).await
    }

    pub async fn level_two_futures_options(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_two(LevelTwoService::FuturesOptions, symbols, fields)
            .await
    }

    pub async fn level_two_forex(
        &self,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        self.level_two(LevelTwoService::Forex, symbols, fields).await
    }

    // -----------------------------------------------------------------------
    // Time and sales
    // -----------------------------------------------------------------------

    pub async fn timesale(
        &self,
        service: TimesaleService,
        symbols: &[&str],
        fields: Option<&[&str]>,
    ) -> Result<u64, TdError> {
        let request =
            self.template()
                .timesale(service, symbols, fields.unwrap_or(Timesale::FIELDS))?;
        self.client.enqueue(request).await
    }

    pub async fn equity_timesale(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.timesale(TimesaleService::Equity, symbols, None).await
    }

    pub async fn forex_timesale(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.timesale(TimesaleService::Forex, symbols, None).await
    }

    pub async fn futures_timesale(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.timesale(TimesaleService::Futures, symbols, None).await
    }

    pub async fn options_timesale(&self, symbols: &[&str]) -> Result<u64, TdError> {
        self.timesale(TimesaleService::Options, symbols, None).await
    }

    // -----------------------------------------------------------------------
    // Unsubscribe
    // -----------------------------------------------------------------------

    /// Send UNSUBS for `service` if it is tracked; `None` when it is not.
    pub async fn unsubscribe(
        &self,
        service: impl Into<Service>,
    ) -> Result<Option<u64>, TdError> {
        let service = service.into();
        if !self.client.is_subscribed(&service).await? {
            return Ok(None);
        }
        let id = self
            .client
            .enqueue(self.template().unsubscribe(service))
            .await?;
        Ok(Some(id))
    }

    pub async fn unsubscribe_level_one(
        &self,
        service: LevelOneService,
    ) -> Result<Option<u64>, TdError> {
        self.unsubscribe(service).await
    }

    pub async fn unsubscribe_level_two(
        &self,
        service: LevelTwoService,
    ) -> Result<Option<u64>, TdError> {
        self.unsubscribe(service).await
    }

    pub async fn unsubscribe_chart(&self, service: ChartService) -> Result<Option<u64>, TdError> {
        self.unsubscribe(service).await
    }

    pub async fn unsubscribe_chart_history(
        &self,
        service: ChartHistoryService,
    ) -> Result<Option<u64>, TdError> {
        self.unsubscribe(service).await
    }

    pub async fn unsubscribe_timesale(
        &self,
        service: TimesaleService,
    ) -> Result<Option<u64>, TdError> {
        self.unsubscribe(service).await
    }

    pub async fn unsubscribe_actives(
        &self,
        service: ActivesService,
    ) -> Result<Option<u64>, TdError> {
        self.unsubscribe(service).await
    }

    pub async fn unsubscribe_news_headline(&self) -> Result<Option<u64>, TdError> {
        self.unsubscribe(Service::NewsHeadline).await
    }

    pub async fn unsubscribe_account_activity(&self) -> Result<Option<u64>, TdError> {
        self.unsubscribe(Service::AccountActivity).await
    }
}
