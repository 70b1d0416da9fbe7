//! Chatroom records: messages, room state, rollups.
//!
//! Field names serialise in camelCase so stored records and SSE payloads
//! match what chatroom clients already read.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Phase of the chatroom debate cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Personas argue and tag their messages with sentiment.
    #[default]
    Debate,
    /// Rolling consensus crossed the threshold.
    Consensus,
    /// Casual banter until the cooldown timer expires.
    Cooldown,
}

impl Phase {
    /// Phases whose messages feed the rolling consensus.
    pub fn tracks_consensus(self) -> bool {
        matches!(self, Self::Debate | Self::Consensus)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debate => write!(f, "DEBATE"),
            Self::Consensus => write!(f, "CONSENSUS"),
            Self::Cooldown => write!(f, "COOLDOWN"),
        }
    }
}

/// Market direction a message or consensus leans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    pub const ALL: [Sentiment; 3] = [Self::Bullish, Self::Bearish, Self::Neutral];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }

    /// Case-insensitive parse of `bullish` / `bearish` / `neutral`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }

    /// Bullish and bearish oppose each other; neutral opposes nothing.
    pub fn opposes(self, other: Sentiment) -> bool {
        matches!(
            (self, other),
            (Self::Bullish, Self::Bearish) | (Self::Bearish, Self::Bullish)
        )
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persona utterance. Append-only once written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub persona_id: String,
    pub handle: String,
    pub avatar: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    /// 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    /// Unix millis
    pub timestamp: i64,
    pub phase: Phase,
    #[serde(default)]
    pub acknowledges_opposing_view: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data_refs: Option<Vec<String>>,
}

impl ChatMessage {
    /// Sentiment and confidence, if the message carries both.
    pub fn stance(&self) -> Option<(Sentiment, u8)> {
        Some((self.sentiment?, self.confidence?))
    }

    pub fn has_market_refs(&self) -> bool {
        self.market_data_refs
            .as_ref()
            .is_some_and(|refs| !refs.is_empty())
    }
}

/// Direction and strength of the rolling consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsensusReading {
    pub direction: Option<Sentiment>,
    /// 0-100
    pub strength: u8,
}

/// The single mutable chatroom record, guarded by the generation lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomState {
    pub phase: Phase,
    pub phase_started_at: i64,
    pub cooldown_ends_at: Option<i64>,
    pub last_message_at: i64,
    pub last_speaker_id: Option<String>,
    pub message_count: u64,
    pub next_speaker_id: Option<String>,
    pub consensus_direction: Option<Sentiment>,
    pub consensus_strength: u8,
    /// Most recent first, at most five
    pub recent_speakers: Vec<String>,
    /// Personas whose model failed since they last spoke
    #[serde(default)]
    pub unavailable_personas: BTreeSet<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_asset")]
    pub current_asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_debate_summary: Option<DebateSummary>,
}

fn default_asset() -> String {
    "BTC".to_string()
}

impl ChatRoomState {
    /// Fresh DEBATE-phase state stamped at `now`.
    pub fn new(now: i64) -> Self {
        Self {
            phase: Phase::Debate,
            phase_started_at: now,
            cooldown_ends_at: None,
            last_message_at: now,
            last_speaker_id: None,
            message_count: 0,
            next_speaker_id: None,
            consensus_direction: None,
            consensus_strength: 0,
            recent_speakers: Vec::new(),
            unavailable_personas: BTreeSet::new(),
            retry_count: 0,
            current_asset: default_asset(),
            previous_debate_summary: None,
        }
    }

    pub fn consensus(&self) -> ConsensusReading {
        ConsensusReading {
            direction: self.consensus_direction,
            strength: self.consensus_strength,
        }
    }

    pub fn set_consensus(&mut self, reading: ConsensusReading) {
        self.consensus_direction = reading.direction;
        self.consensus_strength = reading.strength;
    }
}

/// A persona's stance flip recorded in a debate summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StanceChangeRecord {
    pub persona_id: String,
    pub handle: String,
    pub from: Sentiment,
    pub to: Sentiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    pub timestamp: i64,
}

/// Rollup of a finished debate round, carried into the next round's prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateSummary {
    pub round_number: u32,
    pub timestamp: i64,
    pub consensus_direction: Option<Sentiment>,
    pub consensus_strength: u8,
    pub key_bullish_arguments: Vec<String>,
    pub key_bearish_arguments: Vec<String>,
    pub stance_changes: Vec<StanceChangeRecord>,
    pub top_data_points: Vec<String>,
    pub message_count: usize,
}

/// Why a consensus snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    TimeWindowRollover,
    Manual,
    ConsensusReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyArguments {
    pub bullish: Vec<String>,
    pub bearish: Vec<String>,
    pub neutral: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaContribution {
    pub persona_id: String,
    pub handle: String,
    pub message_count: usize,
    pub primary_stance: Sentiment,
    pub key_points: Vec<String>,
}

/// Immutable rollup of messages that left the rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSnapshot {
    pub id: String,
    pub timestamp: i64,
    pub timestamp_range: TimestampRange,
    pub consensus_direction: Option<Sentiment>,
    pub consensus_strength: u8,
    pub key_arguments_summary: KeyArguments,
    pub top_persona_contributions: Vec<PersonaContribution>,
    pub message_count: usize,
    pub snapshot_reason: SnapshotReason,
}
