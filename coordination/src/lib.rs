//! Consensus Vault coordination library
//!
//! This library provides:
//! - A 17-persona crypto chatroom that debates, converges and cools down
//! - A KV-backed store with a generation lock, rolling history and snapshots
//! - A five-analyst trading council with provider fallbacks
//! - A bridge that convenes the council on strong chatroom consensus
//! - Paper trading on council verdicts
//!
//! # Modules
//!
//! ## Chatroom
//! - [`chatroom::ChatroomEngine`]: picks a speaker, prompts it and applies
//!   phase, consensus and persuasion updates
//! - [`chatroom::RollingHistory`]: one-hour window with snapshots of what
//!   falls out of it
//!
//! ## Council
//! - [`council::TradingCouncil`]: concurrent analyst votes and the 4/5 tally
//! - [`bridge::CouncilBridge`]: rate-limited chatroom → council trigger
//! - [`trading::PaperTrader`]: opens and closes simulated positions
//!
//! ## Plumbing
//! - [`kv`]: in-memory or RocksDB (`heavy-state`) key/value backends
//! - [`caller`]: spaced, retrying LLM client with a circuit breaker
//! - [`events`]: broadcast bus tying the pieces together

pub mod bridge;
pub mod caller;
pub mod chatroom;
pub mod council;
pub mod events;
pub mod kv;
pub mod market;
pub mod models;
pub mod personas;
pub mod trading;

use rand::Rng;

// Re-export key chatroom types
pub use chatroom::{
    ChatMessage, ChatRoomState, ChatroomConfig, ChatroomEngine, ChatroomError, ChatroomStore,
    GenerationOutcome, GenerationResult, HistoryConfig, Phase, RollingHistory, Sentiment,
};

// Re-export council, bridge and trading types
pub use bridge::{BridgeConfig, BridgeState, CouncilBridge, CouncilOutcome, CouncilTrigger, TriggerSource};
pub use council::{CouncilError, DetailedConsensus, Signal, TradingCouncil};
pub use trading::{PaperTrader, PortfolioMetrics, Trade, TradingError};

// Re-export plumbing
pub use caller::{CallError, HttpModelCaller, ModelCaller, SharedCaller};
pub use events::{ConsensusUpdate, EventBus, SharedEventBus, VaultEvent};
pub use kv::{KvError, KvStore, MemoryKv, SharedKv};
pub use market::{CoinGeckoFeed, MarketFeed, SharedFeed, StaticFeed};
pub use models::ModelRegistry;

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `{prefix}_{now}_{six random lowercase alphanumerics}`
pub(crate) fn make_id<R: Rng + ?Sized>(prefix: &str, now: i64, rng: &mut R) -> String {
    let suffix: String = (0..6)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}_{now}_{suffix}")
}
