//! Market data feed for persona prompts and paper trading.
//!
//! [`CoinGeckoFeed`] pulls a coin snapshot over HTTP and keeps a short
//! in-memory cache; a failed fetch falls back to the stale cached value.
//! [`StaticFeed`] serves fixed numbers for tests and offline runs.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const COINGECKO_API: &str = "https://api.coingecko.com/api/v3";
const CACHE_TTL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

static VOLUME_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+\s*(b|m|k)\s*(volume|vol)|volume").unwrap());
static PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\.?\d*%").unwrap());

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("market request failed: {0}")]
    Request(String),

    #[error("market API returned {status}")]
    Status { status: u16 },

    #[error("malformed market payload: {0}")]
    Parse(String),

    #[error("no price available for {0}")]
    Unavailable(String),
}

/// Point-in-time market numbers for one asset (USD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub price: f64,
    pub price_change_pct_24h: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    #[serde(default)]
    pub ath: f64,
    #[serde(default)]
    pub ath_change_pct: f64,
    /// RFC 3339
    pub last_updated: String,
}

impl MarketSnapshot {
    /// High-low range as a percentage of price.
    pub fn volatility_pct(&self) -> f64 {
        if self.price <= 0.0 || self.high_24h <= 0.0 || self.low_24h <= 0.0 {
            return 0.0;
        }
        (self.high_24h - self.low_24h) / self.price * 100.0
    }

    pub fn volume_to_market_cap(&self) -> f64 {
        if self.market_cap > 0.0 {
            self.volume_24h / self.market_cap
        } else {
            0.0
        }
    }

    /// `price action, volume profile, volatility` labels.
    pub fn profile(&self) -> (&'static str, &'static str, &'static str) {
        let change = self.price_change_pct_24h;
        let action = if change > 10.0 {
            "strong_up"
        } else if change > 3.0 {
            "up"
        } else if change < -10.0 {
            "strong_down"
        } else if change < -3.0 {
            "down"
        } else {
            "neutral"
        };
        let ratio = self.volume_to_market_cap();
        let volume = if ratio > 0.15 {
            "high"
        } else if ratio < 0.05 {
            "low"
        } else {
            "normal"
        };
        let vol = self.volatility_pct();
        let volatility = if vol > 8.0 {
            "high"
        } else if vol < 3.0 {
            "low"
        } else {
            "normal"
        };
        (action, volume, volatility)
    }
}

/// Source of market snapshots.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, asset: &str) -> Result<MarketSnapshot, MarketError>;

    async fn price(&self, asset: &str) -> Result<f64, MarketError> {
        let snap = self.snapshot(asset).await?;
        if snap.price > 0.0 {
            Ok(snap.price)
        } else {
            Err(MarketError::Unavailable(asset.to_string()))
        }
    }
}

pub type SharedFeed = Arc<dyn MarketFeed>;

/// CoinGecko coin id for a ticker; unknown tickers map to bitcoin.
pub fn coin_id(asset: &str) -> &'static str {
    let ticker = asset.trim().to_ascii_uppercase();
    match ticker.strip_suffix("/USD").unwrap_or(&ticker) {
        "ETH" => "ethereum",
        "SOL" => "solana",
        _ => "bitcoin",
    }
}

#[derive(Deserialize)]
struct CoinResponse {
    market_data: CoinMarketData,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct UsdValue {
    usd: Option<f64>,
}

#[derive(Deserialize)]
struct CoinMarketData {
    #[serde(default)]
    current_price: UsdValue,
    #[serde(default)]
    price_change_percentage_24h: Option<f64>,
    #[serde(default)]
    total_volume: UsdValue,
    #[serde(default)]
    market_cap: UsdValue,
    #[serde(default)]
    high_24h: UsdValue,
    #[serde(default)]
    low_24h: UsdValue,
    #[serde(default)]
    ath: UsdValue,
    #[serde(default)]
    ath_change_percentage: UsdValue,
    #[serde(default)]
    last_updated: Option<String>,
}

impl From<CoinMarketData> for MarketSnapshot {
    fn from(md: CoinMarketData) -> Self {
        Self {
            price: md.current_price.usd.unwrap_or(0.0),
            price_change_pct_24h: md.price_change_percentage_24h.unwrap_or(0.0),
            volume_24h: md.total_volume.usd.unwrap_or(0.0),
            market_cap: md.market_cap.usd.unwrap_or(0.0),
            high_24h: md.high_24h.usd.unwrap_or(0.0),
            low_24h: md.low_24h.usd.unwrap_or(0.0),
            ath: md.ath.usd.unwrap_or(0.0),
            ath_change_pct: md.ath_change_percentage.usd.unwrap_or(0.0),
            last_updated: md
                .last_updated
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// CoinGecko-backed feed with a 60 s cache.
pub struct CoinGeckoFeed {
    client: reqwest::Client,
    api_base: String,
    cache: Mutex<HashMap<&'static str, (Instant, MarketSnapshot)>>,
}

impl CoinGeckoFeed {
    pub fn new() -> Self {
        Self::with_base(COINGECKO_API)
    }

    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, id: &str) -> Result<MarketSnapshot, MarketError> {
        let url = format!(
            "{}/coins/{id}?localization=false&tickers=false&market_data=true&community_data=false&developer_data=false&sparkline=false",
            self.api_base
        );
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| MarketError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MarketError::Status {
                status: response.status().as_u16(),
            });
        }

        let body: CoinResponse = response
            .json()
            .await
            .map_err(|e| MarketError::Parse(e.to_string()))?;
        Ok(body.market_data.into())
    }
}

impl Default for CoinGeckoFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketFeed for CoinGeckoFeed {
    async fn snapshot(&self, asset: &str) -> Result<MarketSnapshot, MarketError> {
        let id = coin_id(asset);
        if let Some((at, snap)) = self.cache.lock().await.get(id) {
            if at.elapsed() < CACHE_TTL {
                return Ok(snap.clone());
            }
        }

        match self.fetch(id).await {
            Ok(snap) => {
                debug!(coin = id, price = snap.price, "market snapshot fetched");
                self.cache
                    .lock()
                    .await
                    .insert(id, (Instant::now(), snap.clone()));
                Ok(snap)
            }
            Err(e) => match self.cache.lock().await.get(id) {
                Some((_, stale)) => {
                    warn!(coin = id, error = %e, "market fetch failed, serving stale snapshot");
                    Ok(stale.clone())
                }
                None => Err(e),
            },
        }
    }
}

/// Fixed prices, keyed by coin id.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    snapshots: HashMap<&'static str, MarketSnapshot>,
}

impl StaticFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot with only the price filled in.
    pub fn with_price(mut self, asset: &str, price: f64) -> Self {
        self.snapshots.insert(
            coin_id(asset),
            MarketSnapshot {
                price,
                price_change_pct_24h: 0.0,
                volume_24h: 0.0,
                market_cap: 0.0,
                high_24h: price,
                low_24h: price,
                ath: price,
                ath_change_pct: 0.0,
                last_updated: chrono::Utc::now().to_rfc3339(),
            },
        );
        self
    }

    pub fn with_snapshot(mut self, asset: &str, snapshot: MarketSnapshot) -> Self {
        self.snapshots.insert(coin_id(asset), snapshot);
        self
    }
}

#[async_trait]
impl MarketFeed for StaticFeed {
    async fn snapshot(&self, asset: &str) -> Result<MarketSnapshot, MarketError> {
        self.snapshots
            .get(coin_id(asset))
            .cloned()
            .ok_or_else(|| MarketError::Unavailable(asset.to_string()))
    }
}

fn group_thousands(whole: u64) -> String {
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Price with thousands separators; more decimals for small prices.
pub fn format_price(price: f64) -> String {
    if price >= 1.0 {
        let cents = (price * 100.0).round() as u64;
        format!("{}.{:02}", group_thousands(cents / 100), cents % 100)
    } else {
        format!("{price:.4}")
    }
}

/// `1.23B` / `4.50M` / `7.00K` style.
pub fn format_large(n: f64) -> String {
    if n >= 1e9 {
        format!("{:.2}B", n / 1e9)
    } else if n >= 1e6 {
        format!("{:.2}M", n / 1e6)
    } else if n >= 1e3 {
        format!("{:.2}K", n / 1e3)
    } else {
        format!("{n:.2}")
    }
}

/// Market block appended to persona system prompts.
pub fn format_for_prompt(snap: &MarketSnapshot, asset: &str) -> String {
    let (action, volume, volatility) = snap.profile();
    let sign = if snap.price_change_pct_24h >= 0.0 { "+" } else { "" };
    let arrow = if snap.price_change_pct_24h >= 0.0 { "📈" } else { "📉" };
    let mut lines = vec![
        format!("=== CURRENT MARKET DATA ({asset}) ==="),
        format!(
            "Price: ${} ({sign}{:.2}% 24h) {arrow}",
            format_price(snap.price),
            snap.price_change_pct_24h
        ),
        format!("24h Volume: ${}", format_large(snap.volume_24h)),
        format!("Market Cap: ${}", format_large(snap.market_cap)),
        format!(
            "24h Range: ${} - ${}",
            format_price(snap.low_24h),
            format_price(snap.high_24h)
        ),
        format!("Volatility: {:.2}% (24h range)", snap.volatility_pct()),
        format!("Volume/Market Cap: {:.3}", snap.volume_to_market_cap()),
    ];
    if snap.ath > 0.0 {
        lines.push(format!(
            "ATH: ${} ({:.1}% from ATH)",
            format_price(snap.ath),
            snap.ath_change_pct
        ));
    }
    lines.push(format!(
        "Market Profile: {action} price, {volume} volume, {volatility} volatility"
    ));
    lines.push(format!("Last Updated: {}", snap.last_updated));
    lines.push("=== END MARKET DATA ===".to_string());
    lines.join("\n")
}

/// Which market figures a message cites: `price`, `volume`, `percentage_change`.
pub fn detect_refs(content: &str, snap: &MarketSnapshot) -> Vec<String> {
    let mut refs = Vec::new();
    let rounded = format!("{:.0}", snap.price);
    let thousands = format!("${}k", (snap.price / 1000.0).floor() as i64);
    if content.contains(&rounded) || content.to_ascii_lowercase().contains(&thousands) {
        refs.push("price".to_string());
    }
    if VOLUME_MENTION.is_match(content) {
        refs.push("volume".to_string());
    }
    if PERCENT.is_match(content) {
        refs.push("percentage_change".to_string());
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap() -> MarketSnapshot {
        MarketSnapshot {
            price: 64_250.4,
            price_change_pct_24h: -2.5,
            volume_24h: 25_000_000_000.0,
            market_cap: 1_260_000_000_000.0,
            high_24h: 66_000.0,
            low_24h: 63_000.0,
            ath: 73_750.0,
            ath_change_pct: -12.9,
            last_updated: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_coin_id_mapping() {
        assert_eq!(coin_id("BTC"), "bitcoin");
        assert_eq!(coin_id("eth/usd"), "ethereum");
        assert_eq!(coin_id("SOL"), "solana");
        assert_eq!(coin_id("DOGE"), "bitcoin");
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_price(64_250.4), "64,250.40");
        assert_eq!(format_price(1.5), "1.50");
        assert_eq!(format_price(0.123456), "0.1235");
        assert_eq!(format_large(25_000_000_000.0), "25.00B");
        assert_eq!(format_large(4_500_000.0), "4.50M");
        assert_eq!(format_large(12.0), "12.00");
    }

    #[test]
    fn test_prompt_block() {
        let block = format_for_prompt(&snap(), "BTC");
        assert!(block.starts_with("=== CURRENT MARKET DATA (BTC) ==="));
        assert!(block.contains("Price: $64,250.40 (-2.50% 24h)"));
        assert!(block.contains("24h Range: $63,000.00 - $66,000.00"));
        assert!(block.contains("Market Profile: neutral price, low volume, normal volatility"));
        assert!(block.ends_with("=== END MARKET DATA ==="));
    }

    #[test]
    fn test_detect_refs() {
        let s = snap();
        assert_eq!(detect_refs("we're at $64k and dumping 3%", &s), vec!["price", "percentage_change"]);
        assert_eq!(detect_refs("64250 is the line, 25B vol", &s), vec!["price", "volume"]);
        assert!(detect_refs("vibes only", &s).is_empty());
    }

    #[tokio::test]
    async fn test_static_feed() {
        let feed = StaticFeed::new().with_price("BTC", 50_000.0);
        assert_eq!(feed.price("BTC/USD").await.unwrap(), 50_000.0);
        assert!(matches!(feed.price("ETH").await, Err(MarketError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_coingecko_without_cache_errors_offline() {
        let feed = CoinGeckoFeed::with_base("http://127.0.0.1:9");
        assert!(feed.snapshot("BTC").await.is_err());
    }
}
