use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::config::ExchangeConfig;
use crate::error::{EngineError, Result};
use crate::feed::{MarketDataSource, TickSource};
use crate::models::{Bar, Tick};

pub const OKX_API_BASE: &str = "https://www.okx.com";
/// Page size limit of the candles endpoint
const MAX_CANDLES_PER_REQUEST: usize = 300;
const MAX_TRADES_PER_REQUEST: usize = 100;
/// Trade ids remembered for deduplication
const SEEN_TRADE_CAPACITY: usize = 2048;

// Type alias for the rate limiter to simplify signatures
type OkxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Envelope of every OKX v5 REST response
#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Entry of `/api/v5/market/trades`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxTrade {
    pub inst_id: String,
    pub trade_id: String,
    pub px: String,
    pub sz: String,
    pub side: String,
    pub ts: String,
}

impl OkxTrade {
    fn to_tick(&self) -> anyhow::Result<Tick> {
        Ok(Tick::new(
            parse_millis(&self.ts)?,
            Decimal::from_str(&self.px).with_context(|| format!("bad price {}", self.px))?,
            Decimal::from_str(&self.sz).with_context(|| format!("bad size {}", self.sz))?,
        ))
    }
}

/// OKX public market data client with rate limiting
///
/// Cloneable; clones share the HTTP client and the rate limiter.
#[derive(Clone)]
pub struct OkxClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<OkxRateLimiter>,
    trade_poll: Duration,
}

impl OkxClient {
    pub fn new(base_url: impl Into<String>, requests_per_second: u32) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let rps = NonZeroU32::new(requests_per_second)
            .ok_or_else(|| anyhow!("requests_per_second must be positive"))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter,
            trade_poll: Duration::from_millis(500),
        })
    }

    pub fn from_config(config: &ExchangeConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.base_url.clone(), config.requests_per_second)?
            .with_trade_poll(Duration::from_millis(config.trade_poll_ms)))
    }

    pub fn with_trade_poll(mut self, interval: Duration) -> Self {
        self.trade_poll = interval;
        self
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<Vec<T>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("OKX {} returned {}: {}", path, status, body);
        }

        let envelope: OkxResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))?;

        if envelope.code != "0" {
            bail!("OKX error code {}: {}", envelope.code, envelope.msg);
        }
        Ok(envelope.data)
    }

    /// One page of candles older than `after` (exclusive), newest first
    pub async fn get_candles(
        &self,
        instrument: &str,
        bar: &str,
        limit: usize,
        after: Option<i64>,
    ) -> anyhow::Result<Vec<Vec<String>>> {
        let mut query = vec![
            ("instId", instrument.to_string()),
            ("bar", bar.to_string()),
            ("limit", limit.min(MAX_CANDLES_PER_REQUEST).to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        self.get("/api/v5/market/candles", &query).await
    }

    /// Most recent `lookback` confirmed candles, oldest first
    pub async fn get_confirmed_bars(
        &self,
        instrument: &str,
        bar: &str,
        lookback: usize,
    ) -> anyhow::Result<Vec<Bar>> {
        let mut bars = Vec::with_capacity(lookback);
        let mut after = None;

        while bars.len() < lookback {
            // One extra row on the first page covers the unconfirmed live candle
            let wanted = lookback - bars.len() + usize::from(after.is_none());
            let page = self.get_candles(instrument, bar, wanted, after).await?;
            if page.is_empty() {
                break;
            }

            let mut oldest = None;
            for row in &page {
                let (bar, confirmed) = parse_candle(row)?;
                oldest = Some(bar.timestamp.timestamp_millis());
                if confirmed && bars.len() < lookback {
                    bars.push(bar);
                }
            }
            after = oldest;

            if page.len() < wanted.min(MAX_CANDLES_PER_REQUEST) {
                break;
            }
        }

        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        Ok(bars)
    }

    /// Latest public trades, newest first as OKX returns them
    pub async fn get_trades(&self, instrument: &str, limit: usize) -> anyhow::Result<Vec<OkxTrade>> {
        let query = [
            ("instId", instrument.to_string()),
            ("limit", limit.min(MAX_TRADES_PER_REQUEST).to_string()),
        ];
        self.get("/api/v5/market/trades", &query).await
    }
}

/// OKX `bar` parameter for a bar length
pub fn bar_label(bar_size: chrono::Duration) -> Option<&'static str> {
    match bar_size.num_seconds() {
        60 => Some("1m"),
        180 => Some("3m"),
        300 => Some("5m"),
        900 => Some("15m"),
        1800 => Some("30m"),
        3600 => Some("1H"),
        7200 => Some("2H"),
        14400 => Some("4H"),
        86400 => Some("1Dutc"),
        _ => None,
    }
}

fn parse_millis(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let ms: i64 = raw.parse().with_context(|| format!("bad timestamp {}", raw))?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
fn parse_candle(row: &[String]) -> anyhow::Result<(Bar, bool)> {
    if row.len() < 6 {
        bail!("candle row has {} fields", row.len());
    }
    let num = |i: usize| {
        Decimal::from_str(&row[i]).with_context(|| format!("bad candle field {}", row[i]))
    };
    let bar = Bar {
        timestamp: parse_millis(&row[0])?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    };
    // Rows without the confirm column come from history endpoints and are final
    let confirmed = row.get(8).map_or(true, |c| c == "1");
    Ok((bar, confirmed))
}

/// Ticks from the newest page not emitted before, oldest first
fn fresh_ticks(
    trades: &[OkxTrade],
    seen: &mut HashSet<String>,
    order: &mut VecDeque<String>,
) -> Vec<Tick> {
    let mut fresh: Vec<(Tick, &str)> = trades
        .iter()
        .filter(|t| !seen.contains(&t.trade_id))
        .filter_map(|t| match t.to_tick() {
            Ok(tick) => Some((tick, t.trade_id.as_str())),
            Err(e) => {
                tracing::warn!("Skipping malformed trade {}: {}", t.trade_id, e);
                None
            }
        })
        .collect();
    fresh.sort_by(|a, b| a.0.timestamp.cmp(&b.0.timestamp));

    for (_, id) in &fresh {
        seen.insert(id.to_string());
        order.push_back(id.to_string());
        while order.len() > SEEN_TRADE_CAPACITY {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }
    }

    fresh.into_iter().map(|(tick, _)| tick).collect()
}

#[async_trait]
impl MarketDataSource for OkxClient {
    async fn fetch_bars(
        &self,
        instrument: &str,
        bar_size: chrono::Duration,
        lookback: usize,
    ) -> Result<Vec<Bar>> {
        let label = bar_label(bar_size).ok_or_else(|| {
            EngineError::InvalidConfig(format!(
                "unsupported bar size {}s",
                bar_size.num_seconds()
            ))
        })?;
        self.get_confirmed_bars(instrument, label, lookback)
            .await
            .map_err(|e| EngineError::FeedDisconnected(format!("{:#}", e)))
    }
}

#[async_trait]
impl TickSource for OkxClient {
    async fn subscribe_ticks(
        &self,
        instrument: &str,
        sink: mpsc::Sender<Tick>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let mut order = VecDeque::new();
        let mut last_emitted: Option<DateTime<Utc>> = None;
        let mut interval = tokio::time::interval(self.trade_poll);

        tracing::info!(instrument = %instrument, "Polling OKX trades");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return Ok(()),
            }

            let trades = self
                .get_trades(instrument, MAX_TRADES_PER_REQUEST)
                .await
                .map_err(|e| EngineError::FeedDisconnected(format!("{:#}", e)))?;

            for tick in fresh_ticks(&trades, &mut seen, &mut order) {
                if last_emitted.is_some_and(|last| tick.timestamp < last) {
                    continue;
                }
                last_emitted = Some(tick.timestamp);
                if sink.send(tick).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
