//! Council bridge integration test: a strong chatroom consensus convenes
//! the council, the verdict is scored against the chatroom and paper
//! trading reacts, all wired through the event bus.
//!
//! Covers: events ↔ bridge ↔ council ↔ trading with scripted analysts.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vault_coordination::bridge::{BridgeConfig, CouncilBridge, TriggerSource};
use vault_coordination::caller::{CallError, ModelCaller};
use vault_coordination::chatroom::{Phase, Sentiment};
use vault_coordination::council::{ConsensusStatus, Signal, TradingCouncil, VoteStatus};
use vault_coordination::events::{next_event, ConsensusUpdate, EventBus, VaultEvent};
use vault_coordination::kv::MemoryKv;
use vault_coordination::market::StaticFeed;
use vault_coordination::models::ModelRegistry;
use vault_coordination::trading::{PaperTrader, TradeDirection, TradeStatus};

/// Every analyst answers with the current scripted signal, except the
/// models listed in `down`.
struct ScriptedAnalysts {
    signal: Mutex<&'static str>,
    down: Vec<&'static str>,
}

impl ScriptedAnalysts {
    fn new(signal: &'static str) -> Self {
        Self {
            signal: Mutex::new(signal),
            down: Vec::new(),
        }
    }

    fn with_down(mut self, models: &[&'static str]) -> Self {
        self.down = models.to_vec();
        self
    }

    fn set_signal(&self, signal: &'static str) {
        *self.signal.lock().unwrap() = signal;
    }
}

#[async_trait]
impl ModelCaller for ScriptedAnalysts {
    async fn call(
        &self,
        model_id: &str,
        _system: &str,
        user: &str,
        _max_tokens: u32,
    ) -> Result<String, CallError> {
        if self.down.contains(&model_id) {
            return Err(CallError::Timeout(30_000));
        }
        assert!(user.starts_with("Analyze BTC for a trading signal."));
        let signal = *self.signal.lock().unwrap();
        Ok(format!(
            "```json\n{{\"signal\": \"{signal}\", \"confidence\": 80, \"reasoning\": \"scripted analyst view for {model_id}\"}}\n```"
        ))
    }
}

fn mock_update(direction: Sentiment, strength: u8) -> ConsensusUpdate {
    ConsensusUpdate {
        direction: Some(direction),
        strength,
        message_count: 24,
        phase: Phase::Consensus,
        timestamp: 0,
    }
}

// ── Trigger → council → alignment ──────────────────────────────────

#[tokio::test]
async fn test_chatroom_consensus_convenes_council() {
    let bus = EventBus::new().shared();
    let mut rx = bus.subscribe();
    let bridge = CouncilBridge::new(BridgeConfig::default(), bus.clone());
    let council = TradingCouncil::new(
        Arc::new(ScriptedAnalysts::new("buy")),
        Arc::new(ModelRegistry::default()),
    );

    assert!(bridge
        .handle_consensus_update(&mock_update(Sentiment::Bullish, 70), 1_000)
        .is_none());
    let trigger = bridge
        .handle_consensus_update(&mock_update(Sentiment::Bullish, 90), 2_000)
        .expect("90% bullish triggers");
    assert!(bridge.is_pending());

    match next_event(&mut rx).await.unwrap() {
        VaultEvent::CouncilTriggered(t) => assert_eq!(t.strength, 90),
        other => panic!("unexpected {other:?}"),
    }

    let detailed = council
        .run(&trigger.asset, Some(&trigger.context))
        .await
        .unwrap();
    assert_eq!(detailed.consensus_status, ConsensusStatus::ConsensusReached);
    assert_eq!(detailed.consensus_signal, Some(Signal::Buy));

    let outcome = bridge.record_council_result(detailed, TriggerSource::Chatroom, 3_000);
    assert!(!bridge.is_pending());
    // avg (90 + 80) / 2 = 85 → 50 + 42.5
    assert_eq!(outcome.alignment_score, 93);
    assert!(outcome.commentary.starts_with("Strong agreement"));

    match next_event(&mut rx).await.unwrap() {
        VaultEvent::CouncilCompleted(o) => assert_eq!(o.alignment_score, 93),
        other => panic!("unexpected {other:?}"),
    }

    // second strong update inside the interval is rate limited
    assert!(bridge
        .handle_consensus_update(&mock_update(Sentiment::Bearish, 95), 60_000)
        .is_none());
    assert!(bridge.time_until_next_allowed(60_000) > 0);
}

#[tokio::test]
async fn test_council_with_failures_reports_statuses() {
    let caller = ScriptedAnalysts::new("sell").with_down(&["kimi", "glm", "deepseek", "minimax"]);
    let council = TradingCouncil::new(Arc::new(caller), Arc::new(ModelRegistry::default()));

    let detailed = council.run("BTC", None).await.unwrap();

    // only gemini answers, for itself and as everyone's last fallback
    assert_eq!(detailed.status_counts.success, 5);
    assert!(detailed
        .individual_votes
        .iter()
        .all(|v| v.served_by == "gemini"));
    let kimi = detailed
        .individual_votes
        .iter()
        .find(|v| v.model_id == "kimi")
        .unwrap();
    assert!(kimi.model_name.contains("(via "));
    assert_eq!(detailed.consensus_signal, Some(Signal::Sell));
}

#[tokio::test]
async fn test_council_insufficient_when_everything_times_out() {
    let caller =
        ScriptedAnalysts::new("buy").with_down(&["kimi", "glm", "deepseek", "minimax", "gemini"]);
    let council = TradingCouncil::new(Arc::new(caller), Arc::new(ModelRegistry::default()));

    let detailed = council.run("BTC", None).await.unwrap();
    assert_eq!(detailed.consensus_status, ConsensusStatus::InsufficientResponses);
    assert_eq!(detailed.status_counts.success, 0);
    assert!(detailed.individual_votes.iter().all(|v| v.signal.is_none()));
    // the first analyst fails on a real timeout; later ones may hit open circuits
    assert_eq!(detailed.individual_votes[0].status, VoteStatus::Timeout);
}

// ── Verdict → paper trades ─────────────────────────────────────────

#[tokio::test]
async fn test_verdicts_open_and_reverse_positions() {
    let bus = EventBus::new().shared();
    let mut rx = bus.subscribe();
    let analysts = Arc::new(ScriptedAnalysts::new("buy"));
    let council = TradingCouncil::new(analysts.clone(), Arc::new(ModelRegistry::default()));
    let trader = PaperTrader::new(
        Arc::new(MemoryKv::new()),
        Arc::new(StaticFeed::new().with_price("BTC", 100_000.0)),
        bus.clone(),
    )
    .with_position_size(2_000.0);

    let buy = council.run("BTC", None).await.unwrap();
    let opened = trader.execute(&buy, "BTC", 10).await.unwrap();
    assert_eq!(opened.direction, TradeDirection::Long);
    assert_eq!(opened.size, 2_000.0);
    assert!(matches!(next_event(&mut rx).await.unwrap(), VaultEvent::TradeOpened(_)));

    analysts.set_signal("sell");
    let sell = council.run("BTC", None).await.unwrap();
    let closed = trader
        .auto_close_on_reversal(Signal::Sell, 110_000.0, 20)
        .await
        .unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].status, TradeStatus::Closed);
    assert!((closed[0].pnl.unwrap() - 200.0).abs() < 1e-9);
    assert!(matches!(next_event(&mut rx).await.unwrap(), VaultEvent::TradeClosed(_)));

    let short = trader.execute(&sell, "BTC", 30).await.unwrap();
    assert_eq!(short.direction, TradeDirection::Short);

    let metrics = trader.metrics().await.unwrap();
    assert_eq!(metrics.total_trades, 2);
    assert_eq!(metrics.open_trades, 1);
    assert_eq!(metrics.winning_trades, 1);
    assert_eq!(metrics.win_rate, 100.0);
}
