//! Paper trading on council verdicts.
//!
//! A `CONSENSUS_REACHED` buy opens a long and a sell opens a short, sized
//! in USD at the current market price. Trades live in KV as one JSON list.
//! An opposite verdict closes the positions it contradicts.


use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::council::{DetailedConsensus, Signal};
use crate::events::{SharedEventBus, VaultEvent};
use crate::kv::{KvError, KvExt, SharedKv};
use crate::market::{MarketError, SharedFeed};

pub const TRADES_KEY: &str = "trading:trades";
pub const DEFAULT_POSITION_SIZE: f64 = 1000.0;

#[derive(Debug, Error)]
pub enum TradingError {
    #[error(transparent)]
    Store(#[from] KvError),

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error("trade not found: {0}")]
    NotFound(String),

    #[error("trade already closed: {0}")]
    AlreadyClosed(String),

    #[error("consensus threshold not met for trade execution")]
    ThresholdNotMet,
}

pub type TradingResult<T> = Result<T, TradingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub asset: String,
    pub direction: TradeDirection,
    pub entry_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    /// Notional in USD
    pub size: f64,
    pub entry_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<i64>,
    pub status: TradeStatus,
    pub signal: Signal,
    /// "4/5" or "5/5"
    pub consensus_strength: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_percentage: Option<f64>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Whether `signal` contradicts this position.
    pub fn reversed_by(&self, signal: Signal) -> bool {
        matches!(
            (self.direction, signal),
            (TradeDirection::Long, Signal::Sell) | (TradeDirection::Short, Signal::Buy)
        )
    }
}

/// USD profit of a position closed at `exit`.
pub fn pnl(direction: TradeDirection, entry: f64, exit: f64, size: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    match direction {
        TradeDirection::Long => (exit - entry) * size / entry,
        TradeDirection::Short => (entry - exit) * size / entry,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioMetrics {
    pub total_trades: usize,
    pub open_trades: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl: f64,
    /// Percent of closed trades with positive pnl
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

impl PortfolioMetrics {
    pub fn from_trades(trades: &[Trade]) -> Self {
        let closed: Vec<f64> = trades
            .iter()
            .filter(|t| !t.is_open())
            .map(|t| t.pnl.unwrap_or(0.0))
            .collect();
        let wins: Vec<f64> = closed.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = closed.iter().copied().filter(|p| *p <= 0.0).collect();

        let mean = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };

        Self {
            total_trades: trades.len(),
            open_trades: trades.len() - closed.len(),
            closed_trades: closed.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            total_pnl: closed.iter().sum(),
            win_rate: if closed.is_empty() {
                0.0
            } else {
                wins.len() as f64 / closed.len() as f64 * 100.0
            },
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
        }
    }
}

/// A verdict worth trading: four or more agreeing on buy or sell.
pub fn should_execute(detailed: &DetailedConsensus) -> bool {
    detailed.reached() && matches!(detailed.consensus_signal, Some(Signal::Buy | Signal::Sell))
}

pub struct PaperTrader {
    kv: SharedKv,
    market: SharedFeed,
    bus: SharedEventBus,
    position_size: f64,
    // serialises read-modify-write of the trade list
    write_lock: Mutex<()>,
}

impl PaperTrader {
    pub fn new(kv: SharedKv, market: SharedFeed, bus: SharedEventBus) -> Self {
        Self {
            kv,
            market,
            bus,
            position_size: DEFAULT_POSITION_SIZE,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_position_size(mut self, size: f64) -> Self {
        self.position_size = size;
        self
    }

    pub async fn trades(&self) -> TradingResult<Vec<Trade>> {
        Ok(self.kv.get_json(TRADES_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, trades: &[Trade]) -> TradingResult<()> {
        self.kv.set_json(TRADES_KEY, &trades, None).await?;
        Ok(())
    }

    pub async fn metrics(&self) -> TradingResult<PortfolioMetrics> {
        Ok(PortfolioMetrics::from_trades(&self.trades().await?))
    }

    /// Open a position from a council verdict at the current price.
    pub async fn execute(
        &self,
        detailed: &DetailedConsensus,
        asset: &str,
        now: i64,
    ) -> TradingResult<Trade> {
        let signal = match detailed.consensus_signal {
            Some(signal) if should_execute(detailed) => signal,
            _ => return Err(TradingError::ThresholdNotMet),
        };
        let price = self.market.price(asset).await?;

        let trade = Trade {
            id: crate::make_id("trade", now, &mut rand::thread_rng()),
            asset: asset.to_string(),
            direction: if signal == Signal::Buy {
                TradeDirection::Long
            } else {
                TradeDirection::Short
            },
            entry_price: price,
            exit_price: None,
            size: self.position_size,
            entry_time: now,
            exit_time: None,
            status: TradeStatus::Open,
            signal,
            consensus_strength: detailed
                .consensus_strength
                .clone()
                .unwrap_or_else(|| "4/5".to_string()),
            pnl: None,
            pnl_percentage: None,
        };

        {
            let _guard = self.write_lock.lock().await;
            let mut trades = self.trades().await?;
            trades.push(trade.clone());
            self.save(&trades).await?;
        }

        info!(
            id = %trade.id,
            asset,
            direction = ?trade.direction,
            entry = trade.entry_price,
            size = trade.size,
            "Paper trade opened"
        );
        self.bus.publish(VaultEvent::TradeOpened(trade.clone()));
        Ok(trade)
    }

    /// Close an open trade at `exit_price`, or the market price when `None`.
    pub async fn close(&self, id: &str, exit_price: Option<f64>, now: i64) -> TradingResult<Trade> {
        let _guard = self.write_lock.lock().await;
        let mut trades = self.trades().await?;
        let trade = trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TradingError::NotFound(id.to_string()))?;
        if !trade.is_open() {
            return Err(TradingError::AlreadyClosed(id.to_string()));
        }

        let exit = match exit_price {
            Some(price) => price,
            None => self.market.price(&trade.asset).await?,
        };
        let closed = settle(trade, exit, now);
        self.save(&trades).await?;

        info!(id = %closed.id, exit, pnl = closed.pnl.unwrap_or(0.0), "Paper trade closed");
        self.bus.publish(VaultEvent::TradeClosed(closed.clone()));
        Ok(closed)
    }

    /// Close every open position `signal` contradicts at `price`.
    pub async fn auto_close_on_reversal(
        &self,
        signal: Signal,
        price: f64,
        now: i64,
    ) -> TradingResult<Vec<Trade>> {
        let _guard = self.write_lock.lock().await;
        let mut trades = self.trades().await?;
        let closed: Vec<Trade> = trades
            .iter_mut()
            .filter(|t| t.is_open() && t.reversed_by(signal))
            .map(|t| settle(t, price, now))
            .collect();
        if closed.is_empty() {
            return Ok(closed);
        }
        self.save(&trades).await?;

        info!(signal = %signal, closed = closed.len(), "Closed positions on reversal");
        for trade in &closed {
            self.bus.publish(VaultEvent::TradeClosed(trade.clone()));
        }
        Ok(closed)
    }
}

fn settle(trade: &mut Trade, exit: f64, now: i64) -> Trade {
    let profit = pnl(trade.direction, trade.entry_price, exit, trade.size);
    trade.exit_price = Some(exit);
    trade.exit_time = Some(now);
    trade.status = TradeStatus::Closed;
    trade.pnl = Some(profit);
    trade.pnl_percentage = Some(if trade.size > 0.0 {
        profit / trade.size * 100.0
    } else {
        0.0
    });
    trade.clone()
}
