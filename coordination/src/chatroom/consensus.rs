//! Rolling consensus over recent debate messages.
//!
//! Each tagged DEBATE message with non-zero confidence votes for its sentiment with weight
//! `decay^age × confidence/100`, where age 0 is the newest message. The
//! winning sentiment's share of the total weight is the strength.

use super::types::{ChatMessage, ConsensusReading, Phase, Sentiment};

/// Per-message decay applied by age.
pub const DECAY: f64 = 0.85;
/// Number of most recent tagged messages considered.
pub const WINDOW: usize = 15;
/// Fewer tagged messages than this yields no consensus.
pub const MIN_MESSAGES: usize = 3;

/// Compute the rolling consensus from the full message history.
pub fn rolling_consensus(messages: &[ChatMessage]) -> ConsensusReading {
    let tagged: Vec<(Sentiment, u8)> = messages
        .iter()
        .filter(|m| m.phase == Phase::Debate)
        .filter_map(ChatMessage::stance)
        .filter(|(_, confidence)| *confidence > 0)
        .collect();

    if tagged.len() < MIN_MESSAGES {
        return ConsensusReading::default();
    }

    let window = &tagged[tagged.len().saturating_sub(WINDOW)..];
    let newest = window.len() - 1;

    let mut scores = [0.0f64; 3];
    let mut total = 0.0f64;
    for (i, (sentiment, confidence)) in window.iter().enumerate() {
        let age = (newest - i) as i32;
        let weight = DECAY.powi(age) * (*confidence as f64 / 100.0);
        scores[slot(*sentiment)] += weight;
        total += weight;
    }

    if total <= 0.0 {
        return ConsensusReading::default();
    }

    // Ties resolve in Sentiment::ALL order.
    let (direction, max) = Sentiment::ALL
        .iter()
        .map(|s| (*s, scores[slot(*s)]))
        .fold((Sentiment::Neutral, f64::MIN), |best, cur| {
            if cur.1 > best.1 {
                cur
            } else {
                best
            }
        });

    ConsensusReading {
        direction: Some(direction),
        strength: ((max / total) * 100.0).round().clamp(0.0, 100.0) as u8,
    }
}

fn slot(s: Sentiment) -> usize {
    match s {
        Sentiment::Bullish => 0,
        Sentiment::Bearish => 1,
        Sentiment::Neutral => 2,
    }
}
