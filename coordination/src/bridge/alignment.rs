//! How the chatroom's mood is summarised for the council, and how closely
//! the council's verdict agrees with it.

use serde::{Deserialize, Serialize};

use crate::chatroom::consensus::rolling_consensus;
use crate::chatroom::types::{ChatMessage, ChatRoomState, Phase, Sentiment};
use crate::council::Signal;

/// Fewer messages than this gives no chatroom consensus.
pub const MIN_MESSAGES: usize = 5;
/// Weaker readings than this are treated as noise.
pub const MIN_STRENGTH: u8 = 20;
/// Strength needed for the chatroom to sway a trading decision.
pub const SIGNIFICANT_STRENGTH: u8 = 60;

/// Chatroom consensus as handed to the council.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatroomConsensus {
    pub direction: Option<Sentiment>,
    pub strength: u8,
    pub message_count: usize,
    pub phase: Phase,
    pub last_updated: i64,
}

/// Fresh rolling consensus over `messages`, or `None` when there is too
/// little signal to pass along.
pub fn chatroom_consensus(
    messages: &[ChatMessage],
    state: &ChatRoomState,
    now: i64,
) -> Option<ChatroomConsensus> {
    let reading = rolling_consensus(messages);
    if messages.len() < MIN_MESSAGES || reading.strength < MIN_STRENGTH {
        return None;
    }
    Some(ChatroomConsensus {
        direction: reading.direction,
        strength: reading.strength,
        message_count: messages.len(),
        phase: state.phase,
        last_updated: now,
    })
}

pub fn format_summary(consensus: &ChatroomConsensus) -> String {
    let direction = match consensus.direction {
        Some(d @ (Sentiment::Bullish | Sentiment::Bearish)) => d,
        _ => {
            return format!(
                "Community debate ongoing ({} messages). No clear consensus yet.",
                consensus.message_count
            )
        }
    };

    let intensity = match consensus.strength {
        80.. => "strong",
        60.. => "moderate",
        _ => "weak",
    };
    let phase = if consensus.phase == Phase::Consensus {
        "Consensus reached"
    } else {
        "Active debate"
    };

    format!(
        "{phase}: {intensity} {direction} consensus ({}% agreement) from 17-persona crypto chatroom debate.",
        consensus.strength
    )
}

/// Chatroom summary and caller context merged into one council context
/// block. Empty when there is neither.
pub fn prepare_council_context(
    consensus: Option<&ChatroomConsensus>,
    extra: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(consensus) = consensus {
        parts.push(format!("**Community Consensus:** {}", format_summary(consensus)));
    }
    if let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) {
        parts.push(format!("**Additional Context:** {extra}"));
    }
    parts.join("\n\n")
}

pub fn is_significant(consensus: Option<&ChatroomConsensus>) -> bool {
    consensus.is_some_and(|c| {
        matches!(c.direction, Some(Sentiment::Bullish | Sentiment::Bearish))
            && c.strength >= SIGNIFICANT_STRENGTH
    })
}

/// 0-100 agreement between the chatroom and the council.
///
/// Same direction lands in 50..=100, opposite in 0..=50, anything
/// involving neutral (or no chatroom direction) is 50.
pub fn alignment_score(
    chatroom_direction: Option<Sentiment>,
    chatroom_strength: u8,
    council_signal: Signal,
    council_confidence: u8,
) -> u8 {
    let Some(chatroom) = chatroom_direction else {
        return 50;
    };
    let council = council_signal.sentiment();
    let avg = (council_confidence as f64 + chatroom_strength as f64) / 2.0;

    let score = if chatroom == council {
        50.0 + avg / 2.0
    } else if chatroom.opposes(council) {
        50.0 - avg / 2.0
    } else {
        50.0
    };
    score.round().clamp(0.0, 100.0) as u8
}

pub fn alignment_commentary(
    score: u8,
    chatroom_direction: Option<Sentiment>,
    council_signal: Signal,
) -> String {
    let Some(direction) = chatroom_direction else {
        return "No chatroom consensus available for comparison.".to_string();
    };
    let chatroom = direction.as_str().to_uppercase();
    let council = council_signal.as_str().to_uppercase();

    match score {
        80.. => format!(
            "Strong agreement: Both systems align (chatroom: {chatroom}, council: {council})"
        ),
        60.. => "Moderate agreement: Systems mostly align with some variation in confidence"
            .to_string(),
        40.. => "Weak agreement: Systems have different confidence levels or mixed signals"
            .to_string(),
        _ => format!("Disagreement: Chatroom leans {chatroom}, but council recommends {council}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(direction: Option<Sentiment>, strength: u8, phase: Phase) -> ChatroomConsensus {
        ChatroomConsensus {
            direction,
            strength,
            message_count: 42,
            phase,
            last_updated: 0,
        }
    }

    fn msg(i: i64, sentiment: Sentiment) -> ChatMessage {
        ChatMessage {
            id: format!("msg_{i}"),
            persona_id: format!("p{i}"),
            handle: format!("p{i}"),
            avatar: String::new(),
            content: "x".into(),
            sentiment: Some(sentiment),
            confidence: Some(80),
            timestamp: i,
            phase: Phase::Debate,
            acknowledges_opposing_view: false,
            market_data_refs: None,
        }
    }

    #[test]
    fn test_chatroom_consensus_thresholds() {
        let state = ChatRoomState::new(0);
        let few: Vec<_> = (0..4).map(|i| msg(i, Sentiment::Bullish)).collect();
        assert!(chatroom_consensus(&few, &state, 1).is_none());

        let many: Vec<_> = (0..8).map(|i| msg(i, Sentiment::Bullish)).collect();
        let c = chatroom_consensus(&many, &state, 1).unwrap();
        assert_eq!(c.direction, Some(Sentiment::Bullish));
        assert_eq!(c.strength, 100);
        assert_eq!(c.message_count, 8);
        assert_eq!(c.last_updated, 1);
    }

    #[test]
    fn test_format_summary() {
        assert_eq!(
            format_summary(&reading(Some(Sentiment::Bullish), 85, Phase::Consensus)),
            "Consensus reached: strong bullish consensus (85% agreement) from 17-persona crypto chatroom debate."
        );
        assert_eq!(
            format_summary(&reading(Some(Sentiment::Bearish), 65, Phase::Debate)),
            "Active debate: moderate bearish consensus (65% agreement) from 17-persona crypto chatroom debate."
        );
        assert_eq!(
            format_summary(&reading(Some(Sentiment::Neutral), 90, Phase::Debate)),
            "Community debate ongoing (42 messages). No clear consensus yet."
        );
    }

    #[test]
    fn test_prepare_context() {
        let c = reading(Some(Sentiment::Bearish), 40, Phase::Debate);
        let text = prepare_council_context(Some(&c), Some("  fed minutes today "));
        assert!(text.starts_with("**Community Consensus:** Active debate: weak bearish"));
        assert!(text.ends_with("\n\n**Additional Context:** fed minutes today"));
        assert_eq!(prepare_council_context(None, Some("  ")), "");
    }

    #[test]
    fn test_significance() {
        assert!(is_significant(Some(&reading(Some(Sentiment::Bullish), 60, Phase::Debate))));
        assert!(!is_significant(Some(&reading(Some(Sentiment::Bullish), 59, Phase::Debate))));
        assert!(!is_significant(Some(&reading(Some(Sentiment::Neutral), 95, Phase::Debate))));
        assert!(!is_significant(None));
    }

    #[test]
    fn test_alignment_score() {
        assert_eq!(alignment_score(None, 90, Signal::Buy, 90), 50);
        assert_eq!(alignment_score(Some(Sentiment::Bullish), 80, Signal::Buy, 90), 93);
        assert_eq!(alignment_score(Some(Sentiment::Bearish), 80, Signal::Buy, 90), 8);
        assert_eq!(alignment_score(Some(Sentiment::Bullish), 80, Signal::Hold, 90), 50);
        assert_eq!(alignment_score(Some(Sentiment::Neutral), 80, Signal::Hold, 60), 85);
    }

    #[test]
    fn test_commentary_bands() {
        let bull = Some(Sentiment::Bullish);
        assert_eq!(
            alignment_commentary(93, bull, Signal::Buy),
            "Strong agreement: Both systems align (chatroom: BULLISH, council: BUY)"
        );
        assert!(alignment_commentary(65, bull, Signal::Buy).starts_with("Moderate"));
        assert!(alignment_commentary(50, bull, Signal::Hold).starts_with("Weak"));
        assert_eq!(
            alignment_commentary(8, bull, Signal::Sell),
            "Disagreement: Chatroom leans BULLISH, but council recommends SELL"
        );
        assert_eq!(
            alignment_commentary(50, None, Signal::Buy),
            "No chatroom consensus available for comparison."
        );
    }
}
