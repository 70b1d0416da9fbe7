//! End-of-round rollups and argument ranking.

use std::collections::HashSet;

use super::persuasion::PersuasionBook;
use super::types::{ChatMessage, ChatRoomState, DebateSummary, Phase, Sentiment, StanceChangeRecord};
use crate::personas;

const TOP_ARGUMENTS: usize = 3;
const TOP_DATA_POINTS: usize = 3;
const ARGUMENT_CHARS: usize = 160;

/// Cut `text` to at most `max` characters, adding an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Score a message's argument quality, 0-100.
///
/// `index` is the message's position in `all`; `stance_triggers` holds ids
/// of messages that flipped somebody's stance.
pub fn argument_quality(
    all: &[ChatMessage],
    index: usize,
    stance_triggers: &HashSet<String>,
) -> u8 {
    let Some(message) = all.get(index) else {
        return 0;
    };
    let confidence = message.confidence.unwrap_or(0) as f64;
    let mut score = confidence * 0.4;
    if confidence >= 80.0 {
        score += 10.0;
    }
    if message.has_market_refs() {
        score += 15.0;
    }
    if message.acknowledges_opposing_view {
        score += 10.0;
    }
    if stance_triggers.contains(&message.id) {
        score += 25.0;
    }
    let engagement = all[index + 1..]
        .iter()
        .filter(|m| m.persona_id != message.persona_id)
        .count()
        .min(50);
    score += engagement as f64 * 0.3;
    score.round().clamp(0.0, 100.0) as u8
}

/// Trailing run of non-cooldown messages, i.e. the round being closed.
pub fn current_round(messages: &[ChatMessage]) -> &[ChatMessage] {
    let start = messages
        .iter()
        .rposition(|m| m.phase == Phase::Cooldown)
        .map_or(0, |i| i + 1);
    &messages[start..]
}

fn stance_changes(book: &PersuasionBook) -> Vec<StanceChangeRecord> {
    let mut changes: Vec<StanceChangeRecord> = book
        .states()
        .flat_map(|state| {
            let handle = personas::by_id(&state.persona_id)
                .map_or(state.persona_id.as_str(), |p| p.handle);
            state.stance_history.windows(2).map(move |pair| StanceChangeRecord {
                persona_id: state.persona_id.clone(),
                handle: handle.to_string(),
                from: pair[0].stance,
                to: pair[1].stance,
                triggered_by: pair[1].triggered_by.clone(),
                timestamp: pair[1].timestamp,
            })
        })
        .collect();
    changes.sort_by_key(|c| c.timestamp);
    changes
}

/// Best `limit` arguments for `stance`, rendered `handle: content`.
pub fn top_arguments(
    messages: &[ChatMessage],
    stance: Sentiment,
    stance_triggers: &HashSet<String>,
    limit: usize,
) -> Vec<String> {
    let mut ranked: Vec<(u8, usize)> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.sentiment == Some(stance))
        .map(|(i, _)| (argument_quality(messages, i, stance_triggers), i))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(_, i)| {
            let m = &messages[i];
            format!("{}: {}", m.handle, truncate_chars(&m.content, ARGUMENT_CHARS))
        })
        .collect()
}

impl DebateSummary {
    /// Roll up the round that just reached consensus.
    pub fn capture(
        round_number: u32,
        messages: &[ChatMessage],
        state: &ChatRoomState,
        book: &PersuasionBook,
        now: i64,
    ) -> Self {
        let round = current_round(messages);
        let stance_changes = stance_changes(book);
        let triggers: HashSet<String> = stance_changes
            .iter()
            .filter_map(|c| c.triggered_by.clone())
            .collect();

        let top_data_points = round
            .iter()
            .rev()
            .filter(|m| m.has_market_refs())
            .take(TOP_DATA_POINTS)
            .map(|m| format!("{}: {}", m.handle, truncate_chars(&m.content, ARGUMENT_CHARS)))
            .collect();

        Self {
            round_number,
            timestamp: now,
            consensus_direction: state.consensus_direction,
            consensus_strength: state.consensus_strength,
            key_bullish_arguments: top_arguments(round, Sentiment::Bullish, &triggers, TOP_ARGUMENTS),
            key_bearish_arguments: top_arguments(round, Sentiment::Bearish, &triggers, TOP_ARGUMENTS),
            stance_changes,
            top_data_points,
            message_count: round.len(),
        }
    }
}

/// Context block carried into the next round's prompts.
pub fn debate_context(summary: &DebateSummary) -> String {
    let verdict = match summary.consensus_direction {
        Some(direction) => format!(
            "The room reached a {}% {} consensus after {} messages.",
            summary.consensus_strength, direction, summary.message_count
        ),
        None => format!(
            "The room ended without a clear direction after {} messages.",
            summary.message_count
        ),
    };
    let mut out = format!("PREVIOUS DEBATE (Round {}): {verdict}", summary.round_number);

    let mut section = |title: &str, items: &[String]| {
        if !items.is_empty() {
            out.push_str(&format!("\n{title}:"));
            for item in items {
                out.push_str(&format!("\n- {item}"));
            }
        }
    };
    section("Strongest bullish points", &summary.key_bullish_arguments);
    section("Strongest bearish points", &summary.key_bearish_arguments);
    section("Data cited", &summary.top_data_points);

    if !summary.stance_changes.is_empty() {
        let flips: Vec<String> = summary
            .stance_changes
            .iter()
            .map(|c| format!("{} ({} → {})", c.handle, c.from, c.to))
            .collect();
        out.push_str(&format!("\nMinds changed: {}", flips.join(", ")));
    }
    out.push_str("\nBuild on or challenge these conclusions. Do not repeat them verbatim.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatroom::persuasion::{update_stance, PersuasionState};

    fn msg(id: &str, persona: &str, s: Option<Sentiment>, c: u8, phase: Phase) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            persona_id: persona.into(),
            handle: persona.into(),
            avatar: String::new(),
            content: format!("{persona} says {id}"),
            sentiment: s,
            confidence: s.map(|_| c),
            timestamp: 0,
            phase,
            acknowledges_opposing_view: false,
            market_data_refs: None,
        }
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("🚀🚀🚀🚀", 3), "🚀🚀…");
    }

    #[test]
    fn test_argument_quality_components() {
        let mut data = msg("a", "nxbl", Some(Sentiment::Bullish), 80, Phase::Debate);
        data.market_data_refs = Some(vec!["price".into()]);
        data.acknowledges_opposing_view = true;
        let all = vec![
            data,
            msg("b", "0xviv", Some(Sentiment::Bearish), 50, Phase::Debate),
            msg("c", "nxbl", Some(Sentiment::Bullish), 50, Phase::Debate),
        ];
        let mut triggers = HashSet::new();
        // 32 + 10 + 15 + 10 + 0.3 (one other speaker) → 67
        assert_eq!(argument_quality(&all, 0, &triggers), 67);
        triggers.insert("a".to_string());
        assert_eq!(argument_quality(&all, 0, &triggers), 92);
        assert_eq!(argument_quality(&all, 2, &triggers), 20);
        assert_eq!(argument_quality(&all, 9, &triggers), 0);
    }

    #[test]
    fn test_current_round_starts_after_cooldown() {
        let all = vec![
            msg("a", "nxbl", Some(Sentiment::Bullish), 60, Phase::Debate),
            msg("b", "nxbl", None, 0, Phase::Cooldown),
            msg("c", "nxbl", Some(Sentiment::Bearish), 60, Phase::Debate),
        ];
        let round = current_round(&all);
        assert_eq!(round.len(), 1);
        assert_eq!(round[0].id, "c");
    }

    #[test]
    fn test_capture_collects_arguments_and_flips() {
        let all = vec![
            msg("a", "nxbl", Some(Sentiment::Bullish), 90, Phase::Debate),
            msg("b", "0xviv", Some(Sentiment::Bearish), 70, Phase::Debate),
            msg("c", "moonvember", Some(Sentiment::Bullish), 60, Phase::Consensus),
        ];
        let mut state = ChatRoomState::new(0);
        state.consensus_direction = Some(Sentiment::Bullish);
        state.consensus_strength = 84;

        let mut book = PersuasionBook::new();
        let start = PersuasionState::new("0xviv", Sentiment::Bearish, 20, 0);
        book.put(update_stance(&start, Sentiment::Bullish, None, Some("a"), 5));

        let summary = DebateSummary::capture(3, &all, &state, &book, 10);
        assert_eq!(summary.round_number, 3);
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.key_bullish_arguments.len(), 2);
        assert!(summary.key_bullish_arguments[0].starts_with("nxbl:"));
        assert_eq!(summary.key_bearish_arguments.len(), 1);
        assert_eq!(summary.stance_changes.len(), 1);
        assert_eq!(summary.stance_changes[0].to, Sentiment::Bullish);

        let text = debate_context(&summary);
        assert!(text.starts_with("PREVIOUS DEBATE (Round 3): The room reached a 84% bullish"));
        assert!(text.contains("Minds changed: 0xviv (bearish → bullish)"));
    }
}
