//! Analyst votes and the council tally.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CouncilError;
use crate::chatroom::types::Sentiment;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());
static BARE_JSON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Valid votes needed before any tally is meaningful.
pub const MIN_VALID_VOTES: usize = 3;
/// Same-signal votes needed for `CONSENSUS_REACHED`.
pub const CONSENSUS_VOTES: usize = 4;
/// Agreement ratio needed for a recommendation.
pub const RECOMMENDATION_RATIO: f64 = 0.8;
/// Shortest acceptable reasoning, in characters.
pub const MIN_REASONING_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Self::Buy, Self::Sell, Self::Hold];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Hold => "hold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "hold" => Some(Self::Hold),
            _ => None,
        }
    }

    /// buy → bullish, sell → bearish, hold → neutral
    pub fn sentiment(self) -> Sentiment {
        match self {
            Self::Buy => Sentiment::Bullish,
            Self::Sell => Sentiment::Bearish,
            Self::Hold => Sentiment::Neutral,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteStatus {
    Success,
    Timeout,
    Error,
}

impl VoteStatus {
    /// Timeouts and aborts are told apart from other failures by message.
    pub fn classify(error: &str) -> Self {
        let lower = error.to_ascii_lowercase();
        if lower.contains("timeout") || lower.contains("aborted") {
            Self::Timeout
        } else {
            Self::Error
        }
    }
}

/// Parsed body of an analyst reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalystOpinion {
    pub signal: Signal,
    pub confidence: u8,
    pub reasoning: String,
}

/// One analyst's ballot, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystVote {
    pub model_id: String,
    pub model_name: String,
    pub signal: Option<Signal>,
    pub confidence: u8,
    pub reasoning: String,
    pub status: VoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub response_time_ms: u64,
    /// Model that actually answered; differs from `model_id` on fallback.
    pub served_by: String,
}

impl AnalystVote {
    pub fn success(
        model_id: &str,
        model_name: String,
        served_by: &str,
        opinion: AnalystOpinion,
        response_time_ms: u64,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            model_name,
            signal: Some(opinion.signal),
            confidence: opinion.confidence,
            reasoning: opinion.reasoning,
            status: VoteStatus::Success,
            error: None,
            response_time_ms,
            served_by: served_by.to_string(),
        }
    }

    pub fn failed(model_id: &str, model_name: &str, error: String, response_time_ms: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            model_name: model_name.to_string(),
            signal: None,
            confidence: 0,
            reasoning: String::new(),
            status: VoteStatus::classify(&error),
            error: Some(error),
            response_time_ms,
            served_by: model_id.to_string(),
        }
    }

    /// Signal of a successful vote.
    pub fn valid_signal(&self) -> Option<Signal> {
        match self.status {
            VoteStatus::Success => self.signal,
            _ => None,
        }
    }
}

/// Parse an analyst reply into an opinion.
///
/// Accepts a fenced ```json block or the first `{…}` span. The signal must
/// be buy/sell/hold in any case, confidence is clamped to 0..=100 and the
/// reasoning must be at least ten characters.
pub fn parse_analyst_response(text: &str) -> Result<AnalystOpinion, CouncilError> {
    if text.trim().is_empty() {
        return Err(CouncilError::Parse("empty response".into()));
    }

    let json_text = FENCED_JSON
        .captures(text)
        .and_then(|c| c.get(1))
        .or_else(|| BARE_JSON.find(text))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            CouncilError::Parse(
                r#"no JSON found, expected {"signal": "buy|sell|hold", "confidence": 0-100, "reasoning": "..."}"#
                    .into(),
            )
        })?;

    let parsed: Value = serde_json::from_str(json_text)
        .map_err(|e| CouncilError::Parse(format!("invalid JSON: {e}")))?;

    let raw_signal = match parsed.get("signal") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => {
            return Err(CouncilError::Parse("missing required field: signal".into()))
        }
        Some(other) => other.to_string(),
    };
    let signal = Signal::parse(&raw_signal).ok_or_else(|| {
        CouncilError::Parse(format!(
            "invalid signal \"{}\", must be buy, sell or hold",
            raw_signal.trim()
        ))
    })?;

    let confidence = match parsed.get("confidence") {
        Some(Value::Null) | None => {
            return Err(CouncilError::Parse("missing required field: confidence".into()))
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(_) => 0.0,
    };
    let confidence = confidence.clamp(0.0, 100.0).round() as u8;

    let reasoning = match parsed.get("reasoning") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => "No reasoning provided".to_string(),
        Some(other) => other.to_string(),
    };
    if reasoning.chars().count() < MIN_REASONING_CHARS {
        return Err(CouncilError::Parse(format!(
            "reasoning too short (minimum {MIN_REASONING_CHARS} characters)"
        )));
    }

    Ok(AnalystOpinion {
        signal,
        confidence,
        reasoning,
    })
}

/// Simple majority tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsensusResult {
    InsufficientData {
        valid_votes: usize,
    },
    Decided {
        signal: Signal,
        /// `round(agreement ratio × average majority confidence)`
        consensus_level: u8,
        /// Only set when at least 80% of valid votes agree.
        recommendation: Option<Signal>,
    },
}

/// Majority tally over the successful votes.
pub fn calculate_consensus(votes: &[AnalystVote]) -> ConsensusResult {
    let valid: Vec<&AnalystVote> = votes.iter().filter(|v| v.valid_signal().is_some()).collect();
    if valid.len() < MIN_VALID_VOTES {
        return ConsensusResult::InsufficientData {
            valid_votes: valid.len(),
        };
    }

    let mut counts = [0usize; 3];
    let mut confidence_sums = [0u32; 3];
    for vote in &valid {
        if let Some(signal) = vote.valid_signal() {
            counts[slot(signal)] += 1;
            confidence_sums[slot(signal)] += vote.confidence as u32;
        }
    }

    // strict > keeps the earlier signal (buy, sell, hold) on ties
    let mut majority = Signal::Hold;
    let mut max_count = 0;
    for signal in Signal::ALL {
        if counts[slot(signal)] > max_count {
            max_count = counts[slot(signal)];
            majority = signal;
        }
    }

    let avg_confidence = confidence_sums[slot(majority)] as f64 / max_count as f64;
    let ratio = max_count as f64 / valid.len() as f64;
    let consensus_level = (ratio * avg_confidence).round().clamp(0.0, 100.0) as u8;

    ConsensusResult::Decided {
        signal: majority,
        consensus_level,
        recommendation: (ratio >= RECOMMENDATION_RATIO).then_some(majority),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStatus {
    ConsensusReached,
    NoConsensus,
    InsufficientResponses,
}

impl ConsensusStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConsensusReached => "CONSENSUS_REACHED",
            Self::NoConsensus => "NO_CONSENSUS",
            Self::InsufficientResponses => "INSUFFICIENT_RESPONSES",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct VoteCounts {
    pub buy: usize,
    pub sell: usize,
    pub hold: usize,
}

impl VoteCounts {
    pub fn get(&self, signal: Signal) -> usize {
        match signal {
            Signal::Buy => self.buy,
            Signal::Sell => self.sell,
            Signal::Hold => self.hold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub timeout: usize,
    pub error: usize,
}

/// Strict four-of-five council verdict with every ballot attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedConsensus {
    pub consensus_status: ConsensusStatus,
    pub consensus_signal: Option<Signal>,
    /// "4/5" or "5/5" when consensus was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_strength: Option<String>,
    pub individual_votes: Vec<AnalystVote>,
    pub vote_counts: VoteCounts,
    pub status_counts: StatusCounts,
    pub timestamp: i64,
}

impl DetailedConsensus {
    pub fn reached(&self) -> bool {
        self.consensus_status == ConsensusStatus::ConsensusReached
    }

    /// Mean confidence of successful votes for `signal`, 0 when none.
    pub fn average_confidence(&self, signal: Signal) -> u8 {
        let confidences: Vec<u32> = self
            .individual_votes
            .iter()
            .filter(|v| v.valid_signal() == Some(signal))
            .map(|v| v.confidence as u32)
            .collect();
        if confidences.is_empty() {
            return 0;
        }
        (confidences.iter().sum::<u32>() as f64 / confidences.len() as f64).round() as u8
    }
}

/// Tally votes under the four-vote rule.
pub fn calculate_consensus_detailed(votes: Vec<AnalystVote>, now: i64) -> DetailedConsensus {
    let mut status_counts = StatusCounts::default();
    for vote in &votes {
        match vote.status {
            VoteStatus::Success => status_counts.success += 1,
            VoteStatus::Timeout => status_counts.timeout += 1,
            VoteStatus::Error => status_counts.error += 1,
        }
    }

    let valid: Vec<Signal> = votes.iter().filter_map(AnalystVote::valid_signal).collect();
    if valid.len() < MIN_VALID_VOTES {
        return DetailedConsensus {
            consensus_status: ConsensusStatus::InsufficientResponses,
            consensus_signal: None,
            consensus_strength: None,
            individual_votes: votes,
            vote_counts: VoteCounts::default(),
            status_counts,
            timestamp: now,
        };
    }

    let vote_counts = VoteCounts {
        buy: valid.iter().filter(|s| **s == Signal::Buy).count(),
        sell: valid.iter().filter(|s| **s == Signal::Sell).count(),
        hold: valid.iter().filter(|s| **s == Signal::Hold).count(),
    };

    let winner = Signal::ALL
        .into_iter()
        .find(|s| vote_counts.get(*s) >= CONSENSUS_VOTES);

    let (consensus_status, consensus_strength) = match winner {
        Some(signal) => {
            let strength = if vote_counts.get(signal) >= 5 { "5/5" } else { "4/5" };
            (ConsensusStatus::ConsensusReached, Some(strength.to_string()))
        }
        None => (ConsensusStatus::NoConsensus, None),
    };

    DetailedConsensus {
        consensus_status,
        consensus_signal: winner,
        consensus_strength,
        individual_votes: votes,
        vote_counts,
        status_counts,
        timestamp: now,
    }
}

fn slot(signal: Signal) -> usize {
    match signal {
        Signal::Buy => 0,
        Signal::Sell => 1,
        Signal::Hold => 2,
    }
}
