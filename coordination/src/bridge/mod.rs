//! Chatroom → trading council bridge
//!
//! Listens to rolling consensus updates and convenes the trading council
//! when the chatroom is decisive enough, at most once per interval. When
//! the council reports back, its verdict is scored against the chatroom
//! mood and broadcast.
//!
//! ```text
//!  stream ──ConsensusUpdated──▶ handle_consensus_update ──CouncilTriggered──▶ listener
//!                                                                              │ council.run
//!  trading ◀──CouncilCompleted── record_council_result ◀───────────────────────┘
//! ```

pub mod alignment;

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use alignment::{
    alignment_commentary, alignment_score, chatroom_consensus, format_summary, is_significant,
    prepare_council_context, ChatroomConsensus,
};

use crate::chatroom::types::Sentiment;
use crate::council::{DetailedConsensus, Signal};
use crate::events::{ConsensusUpdate, SharedEventBus, VaultEvent};

pub const DEFAULT_THRESHOLD: u8 = 80;
pub const DEFAULT_MIN_INTERVAL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Minimum chatroom strength that convenes the council.
    pub threshold: u8,
    pub min_interval_ms: i64,
    /// Asset handed to the council.
    pub asset: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            asset: "BTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerDecision {
    pub trigger: bool,
    pub reason: String,
}

impl TriggerDecision {
    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            trigger: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Chatroom,
    Manual,
}

/// Chatroom direction and strength at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatroomReading {
    pub direction: Option<Sentiment>,
    pub strength: u8,
    pub timestamp: i64,
}

/// Request to convene the council on behalf of the chatroom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouncilTrigger {
    pub direction: Sentiment,
    pub strength: u8,
    pub message_count: u64,
    pub asset: String,
    pub context: String,
    pub triggered_at: i64,
}

/// Council verdict plus how well it lines up with the chatroom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouncilOutcome {
    pub consensus: DetailedConsensus,
    pub chatroom_context: Option<ChatroomReading>,
    pub alignment_score: u8,
    pub commentary: String,
    pub triggered_by: TriggerSource,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeState {
    pub last_trigger_at: Option<i64>,
    pub last_trigger: Option<ChatroomReading>,
    /// Most recent update seen, triggering or not.
    pub last_chatroom_consensus: Option<ChatroomReading>,
    pub last_result: Option<CouncilOutcome>,
    pub pending: bool,
}

/// Council context paragraph describing the chatroom mood.
pub fn build_council_context(direction: Sentiment, strength: u8, message_count: u64) -> String {
    let outlook = match direction {
        Sentiment::Bullish => "optimistic and bullish",
        Sentiment::Bearish => "pessimistic and bearish",
        Sentiment::Neutral => "neutral and undecided",
    };
    format!(
        "Market Sentiment Context: The AI chatroom has reached {strength}% consensus with a {outlook} outlook \
         after {message_count} messages of debate. \
         This crowd sentiment signal should be considered alongside your technical, on-chain, and risk analysis. \
         The chatroom consensus represents collective AI opinion from diverse analytical perspectives."
    )
}

pub struct CouncilBridge {
    config: BridgeConfig,
    bus: SharedEventBus,
    state: Mutex<BridgeState>,
}

impl CouncilBridge {
    pub fn new(config: BridgeConfig, bus: SharedEventBus) -> Self {
        Self {
            config,
            bus,
            state: Mutex::new(BridgeState::default()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn should_trigger(
        &self,
        direction: Option<Sentiment>,
        strength: u8,
        now: i64,
    ) -> TriggerDecision {
        let direction = match direction {
            Some(d @ (Sentiment::Bullish | Sentiment::Bearish)) => d,
            _ => return TriggerDecision::refuse("No clear consensus direction"),
        };

        if strength < self.config.threshold {
            return TriggerDecision::refuse(format!(
                "Consensus strength {strength}% below threshold {}%",
                self.config.threshold
            ));
        }

        let remaining = self.time_until_next_allowed(now);
        if remaining > 0 {
            let minutes = (remaining + 59_999) / 60_000;
            return TriggerDecision::refuse(format!(
                "Rate limited: {minutes} minute(s) until next council allowed"
            ));
        }

        let state = self.state();
        if state
            .last_trigger
            .is_some_and(|last| last.direction == Some(direction) && last.strength == strength)
        {
            return TriggerDecision::refuse("Same consensus already triggered council");
        }

        TriggerDecision {
            trigger: true,
            reason: "Chatroom consensus ready to trigger council".to_string(),
        }
    }

    /// Feed a rolling consensus update; returns the trigger when the
    /// council should run.
    pub fn handle_consensus_update(
        &self,
        update: &ConsensusUpdate,
        now: i64,
    ) -> Option<CouncilTrigger> {
        let reading = ChatroomReading {
            direction: update.direction,
            strength: update.strength,
            timestamp: now,
        };
        self.state().last_chatroom_consensus = Some(reading);

        let decision = self.should_trigger(update.direction, update.strength, now);
        let direction = match (decision.trigger, update.direction) {
            (true, Some(direction)) => direction,
            _ => {
                debug!(
                    direction = ?update.direction,
                    strength = update.strength,
                    reason = %decision.reason,
                    "Council not triggered"
                );
                return None;
            }
        };

        {
            let mut state = self.state();
            state.pending = true;
            state.last_trigger_at = Some(now);
            state.last_trigger = Some(reading);
        }

        let trigger = CouncilTrigger {
            direction,
            strength: update.strength,
            message_count: update.message_count,
            asset: self.config.asset.clone(),
            context: build_council_context(direction, update.strength, update.message_count),
            triggered_at: now,
        };
        info!(
            direction = %direction,
            strength = update.strength,
            asset = %trigger.asset,
            "Council triggered by chatroom consensus"
        );
        self.bus.publish(VaultEvent::CouncilTriggered(trigger.clone()));
        Some(trigger)
    }

    /// Store a council verdict, score it against the chatroom and publish it.
    pub fn record_council_result(
        &self,
        consensus: DetailedConsensus,
        triggered_by: TriggerSource,
        now: i64,
    ) -> CouncilOutcome {
        let chatroom = self.state().last_chatroom_consensus;

        let signal = consensus.consensus_signal.unwrap_or(Signal::Hold);
        let confidence = consensus.average_confidence(signal);
        let direction = chatroom.and_then(|c| c.direction);
        let strength = chatroom.map_or(0, |c| c.strength);
        let score = alignment_score(direction, strength, signal, confidence);

        let outcome = CouncilOutcome {
            commentary: alignment_commentary(score, direction, signal),
            alignment_score: score,
            chatroom_context: chatroom,
            consensus,
            triggered_by,
            timestamp: now,
        };

        {
            let mut state = self.state();
            state.pending = false;
            state.last_result = Some(outcome.clone());
        }

        info!(
            status = outcome.consensus.consensus_status.as_str(),
            alignment = score,
            triggered_by = ?triggered_by,
            "Council result recorded"
        );
        self.bus.publish(VaultEvent::CouncilCompleted(outcome.clone()));
        outcome
    }

    /// Milliseconds until another trigger is allowed, 0 when allowed now.
    pub fn time_until_next_allowed(&self, now: i64) -> i64 {
        match self.state().last_trigger_at {
            Some(at) => (self.config.min_interval_ms - (now - at)).max(0),
            None => 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state().pending
    }

    /// Drop a pending trigger whose council run never produced a verdict.
    pub fn abandon_pending(&self) {
        self.state().pending = false;
    }

    pub fn reset(&self) {
        *self.state() = BridgeState::default();
    }

    pub fn snapshot(&self) -> BridgeState {
        self.state().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatroom::types::Phase;
    use crate::council::{calculate_consensus_detailed, AnalystOpinion, AnalystVote};
    use crate::events::EventBus;

    const MIN: i64 = 60_000;

    fn bridge() -> CouncilBridge {
        CouncilBridge::new(BridgeConfig::default(), EventBus::new().shared())
    }

    fn update(direction: Sentiment, strength: u8) -> ConsensusUpdate {
        ConsensusUpdate {
            direction: Some(direction),
            strength,
            message_count: 30,
            phase: Phase::Consensus,
            timestamp: 0,
        }
    }

    fn verdict(signal: Signal, agreeing: usize) -> DetailedConsensus {
        let votes = (0..5)
            .map(|i| {
                let s = if i < agreeing { signal } else { Signal::Hold };
                AnalystVote::success(
                    &format!("m{i}"),
                    format!("M{i}"),
                    &format!("m{i}"),
                    AnalystOpinion {
                        signal: s,
                        confidence: 90,
                        reasoning: "clean breakout with volume".into(),
                    },
                    10,
                )
            })
            .collect();
        calculate_consensus_detailed(votes, 0)
    }

    #[test]
    fn test_refusal_reasons() {
        let b = bridge();
        assert_eq!(b.should_trigger(None, 95, 0).reason, "No clear consensus direction");
        assert_eq!(
            b.should_trigger(Some(Sentiment::Neutral), 95, 0).reason,
            "No clear consensus direction"
        );
        assert_eq!(
            b.should_trigger(Some(Sentiment::Bullish), 79, 0).reason,
            "Consensus strength 79% below threshold 80%"
        );
        assert!(b.should_trigger(Some(Sentiment::Bullish), 80, 0).trigger);
    }

    #[test]
    fn test_rate_limit_and_duplicate() {
        let b = bridge();
        let start = 1_000_000;
        assert!(b.handle_consensus_update(&update(Sentiment::Bullish, 85), start).is_some());
        assert!(b.is_pending());

        let d = b.should_trigger(Some(Sentiment::Bearish), 90, start + 30_000);
        assert_eq!(d.reason, "Rate limited: 5 minute(s) until next council allowed");
        let d = b.should_trigger(Some(Sentiment::Bearish), 90, start + 4 * MIN + 1);
        assert_eq!(d.reason, "Rate limited: 1 minute(s) until next council allowed");
        assert_eq!(b.time_until_next_allowed(start + 2 * MIN), 3 * MIN);

        let later = start + 6 * MIN;
        assert_eq!(b.time_until_next_allowed(later), 0);
        assert_eq!(
            b.should_trigger(Some(Sentiment::Bullish), 85, later).reason,
            "Same consensus already triggered council"
        );
        assert!(b.should_trigger(Some(Sentiment::Bullish), 86, later).trigger);
    }

    #[tokio::test]
    async fn test_trigger_publishes_event() {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let b = CouncilBridge::new(BridgeConfig::default(), bus);

        assert!(b.handle_consensus_update(&update(Sentiment::Bullish, 50), 0).is_none());
        let trigger = b
            .handle_consensus_update(&update(Sentiment::Bearish, 88), 0)
            .unwrap();
        assert_eq!(trigger.asset, "BTC");
        assert!(trigger.context.contains("88% consensus with a pessimistic and bearish outlook"));

        match crate::events::next_event(&mut rx).await.unwrap() {
            VaultEvent::CouncilTriggered(t) => assert_eq!(t, trigger),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_record_result_scores_alignment() {
        let b = bridge();
        b.handle_consensus_update(&update(Sentiment::Bullish, 90), 0);
        let outcome = b.record_council_result(verdict(Signal::Buy, 5), TriggerSource::Chatroom, 5);

        assert!(!b.is_pending());
        // avg (90 + 90) / 2 = 90 → 50 + 45
        assert_eq!(outcome.alignment_score, 95);
        assert!(outcome.commentary.starts_with("Strong agreement"));
        assert_eq!(b.snapshot().last_result, Some(outcome));

        let opposed = b.record_council_result(verdict(Signal::Sell, 4), TriggerSource::Manual, 6);
        assert_eq!(opposed.alignment_score, 5);
        assert!(opposed.commentary.starts_with("Disagreement"));
    }

    #[test]
    fn test_reset_clears_state() {
        let b = bridge();
        b.handle_consensus_update(&update(Sentiment::Bullish, 90), 0);
        b.reset();
        assert_eq!(b.snapshot(), BridgeState::default());
        assert_eq!(b.time_until_next_allowed(1), 0);
    }

    #[test]
    fn test_abandon_keeps_rate_limit() {
        let b = bridge();
        b.handle_consensus_update(&update(Sentiment::Bearish, 85), 0);
        assert!(b.is_pending());
        b.abandon_pending();
        assert!(!b.is_pending());
        assert!(b.time_until_next_allowed(MIN) > 0);
    }
}
