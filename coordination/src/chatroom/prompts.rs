//! Prompt builders for personas, the moderator and the summariser.

use std::collections::HashMap;

use super::types::{ChatMessage, ConsensusReading, Phase};
use crate::personas::{self, Persona};

/// System and user halves of a chat completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// Optional context layered onto a debate prompt.
#[derive(Debug, Clone, Default)]
pub struct DebateContext<'a> {
    pub asset: &'a str,
    /// Rendered market data block
    pub market: Option<&'a str>,
    /// Conviction summary for the speaking persona
    pub persuasion: Option<&'a str>,
    /// Nudge to concede an opposing point
    pub acknowledgment: Option<&'a str>,
    /// Rollup of the previous round
    pub previous_round: Option<&'a str>,
}

const EMPTY_ROOM: &str = "(No messages yet. You are starting the conversation.)";

/// Render the tail of the chat as `handle: content [sentiment]` lines.
pub fn format_recent(messages: &[ChatMessage], limit: usize) -> String {
    let recent = &messages[messages.len().saturating_sub(limit)..];
    if recent.is_empty() {
        return EMPTY_ROOM.to_string();
    }
    recent
        .iter()
        .map(|m| match m.sentiment {
            Some(s) => format!("{}: {} [{}]", m.handle, m.content, s),
            None => format!("{}: {}", m.handle, m.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn debate_prompt(persona: &Persona, recent: &[ChatMessage], ctx: &DebateContext<'_>) -> PromptPair {
    let mut system = format!(
        "{}\n{}\n\nYou are in a live crypto chat room debating where {} goes next. Stay in character at all times. Respond naturally as if chatting: no greetings, no \"I think\", just jump into your take.",
        persona.personality_prompt,
        personas::length_rule(),
        ctx.asset
    );

    if let Some(market) = ctx.market {
        system.push_str("\n\n");
        system.push_str(market.trim());
        system.push_str("\nUse these numbers when they support your view.");
    }
    if let Some(previous) = ctx.previous_round {
        system.push_str("\n\n");
        system.push_str(previous.trim());
    }
    if let Some(persuasion) = ctx.persuasion {
        system.push_str("\n\n");
        system.push_str(persuasion);
    }
    if let Some(ack) = ctx.acknowledgment {
        system.push_str("\n\n");
        system.push_str(ack);
    }

    system.push_str(
        "\n\nIMPORTANT: End your message with a sentiment tag in this exact format:\n\
[SENTIMENT: bullish|bearish|neutral, CONFIDENCE: 0-100]\n\n\
The sentiment tag should reflect YOUR genuine assessment from your persona's perspective. The confidence is how strongly you feel about it.\n\n\
Example response:\n\
Holding 44k support cleanly, volume profile showing accumulation. Next leg targets 48k if we clear 45.5k.\n\
[SENTIMENT: bullish, CONFIDENCE: 72]",
    );

    let user = format!(
        "Recent chat:\n{}\n\nYour turn to speak. React to what others have said, add your perspective, or bring up something new. Stay concise (2-4 sentences max). Remember to end with [SENTIMENT: ..., CONFIDENCE: ...].",
        format_recent(recent, 10)
    );

    PromptPair { system, user }
}

pub fn cooldown_prompt(persona: &Persona, recent: &[ChatMessage]) -> PromptPair {
    let system = format!(
        "{}\n{}\n\nYou are in a crypto chat room during a chill period. A trade signal just fired and the room is winding down. No market analysis needed, just hang out. Talk about crypto culture, memes, past experiences, hot takes, or banter with others. Keep it fun and casual. Stay in character. No sentiment tags needed.",
        persona.personality_prompt,
        personas::length_rule()
    );
    let user = format!(
        "Recent chat:\n{}\n\nYour turn. Keep it casual and fun. 1-3 sentences. No market analysis or sentiment tags.",
        format_recent(recent, 10)
    );
    PromptPair { system, user }
}

/// Prompt asking the moderator model to pick the next speaker.
pub fn moderator_prompt(
    candidate_ids: &[&str],
    handles: &HashMap<&str, &str>,
    recent: &[ChatMessage],
    recent_speakers: &[String],
) -> PromptPair {
    let available = candidate_ids
        .iter()
        .map(|id| format!("- {} ({})", id, handles.get(id).copied().unwrap_or(*id)))
        .collect::<Vec<_>>()
        .join("\n");

    let spoke = if recent_speakers.is_empty() {
        "none".to_string()
    } else {
        recent_speakers
            .iter()
            .map(|id| handles.get(id.as_str()).copied().unwrap_or(id.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let system = format!(
        "You are a chat room moderator. Your ONLY job is to pick who speaks next. Consider:\n\
1. Don't let the same person speak twice in a row\n\
2. Favor personas who haven't spoken recently\n\
3. Pick someone whose perspective would add to or challenge what was just said\n\
4. Mix up the models/viewpoints for variety\n\n\
Available personas:\n{available}\n\n\
Recently spoke (most recent first): {spoke}\n\n\
Respond with ONLY a JSON object: {{\"nextSpeakerId\": \"persona_id\", \"reason\": \"brief reason\"}}"
    );
    let user = format!(
        "Recent chat:\n{}\n\nWho should speak next? Respond with ONLY valid JSON.",
        format_recent(recent, 5)
    );
    PromptPair { system, user }
}

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summarizer for a crypto trading chatroom where AI personas debate market trends.

Create a brief, informative summary (2-3 sentences) of the missed conversation that captures:
1. Key topics discussed (market trends, price movements, technical analysis)
2. Any consensus reached or significant stance changes by personas
3. Current phase and sentiment direction (bullish/bearish/neutral)

Be concise. Mention specific personas only if they made significant points. Note major price levels. Say whether consensus was reached or the debate is ongoing.

Respond with ONLY the summary text, no JSON formatting, no preamble.";

/// User prompt for the missed-conversation summariser.
pub fn summary_prompt(
    messages: &[ChatMessage],
    phase: Option<Phase>,
    consensus: Option<ConsensusReading>,
) -> String {
    let lines = messages
        .iter()
        .map(|m| {
            let time = chrono::DateTime::from_timestamp_millis(m.timestamp)
                .map(|t| t.format("%H:%M").to_string())
                .unwrap_or_else(|| "--:--".into());
            let tag = m
                .sentiment
                .map(|s| format!("[{}] ", s.as_str().to_uppercase()))
                .unwrap_or_default();
            format!("[{time}] {}: {tag}{}", m.handle, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut context = String::new();
    if let Some(phase) = phase {
        context.push_str(&format!("\nCurrent Phase: {phase}"));
    }
    if let Some(ConsensusReading {
        direction: Some(direction),
        strength,
    }) = consensus
    {
        context.push_str(&format!(
            "\nCurrent Consensus: {} ({}% strength)",
            direction.as_str().to_uppercase(),
            strength
        ));
    }

    format!(
        "Please summarize the following {} messages from the crypto trading debate chatroom:{context}\n\nMESSAGES:\n{lines}\n\nProvide a 2-3 sentence summary focusing on key topics, any consensus or stance changes, and the overall sentiment direction.",
        messages.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatroom::types::Sentiment;

    fn msg(handle: &str, content: &str, sentiment: Option<Sentiment>) -> ChatMessage {
        ChatMessage {
            id: "m".into(),
            persona_id: handle.into(),
            handle: handle.into(),
            avatar: "".into(),
            content: content.into(),
            sentiment,
            confidence: sentiment.map(|_| 60),
            timestamp: 0,
            phase: Phase::Debate,
            acknowledges_opposing_view: false,
            market_data_refs: None,
        }
    }

    #[test]
    fn test_format_recent_limits_and_tags() {
        assert_eq!(format_recent(&[], 10), EMPTY_ROOM);
        let msgs: Vec<_> = (0..12)
            .map(|i| msg(&format!("p{i}"), "gm", Some(Sentiment::Bullish)))
            .collect();
        let out = format_recent(&msgs, 10);
        assert_eq!(out.lines().count(), 10);
        assert!(out.starts_with("p2: gm [bullish]"));
        assert_eq!(format_recent(&[msg("a", "hi", None)], 5), "a: hi");
    }

    #[test]
    fn test_debate_prompt_carries_context() {
        let persona = personas::by_id("chartsurgeon").unwrap();
        let ctx = DebateContext {
            asset: "ETH",
            market: Some("=== CURRENT MARKET DATA (ETH) ==="),
            persuasion: Some("Your current conviction: weak (30/100)"),
            acknowledgment: None,
            previous_round: Some("Last round ended bullish at 84%."),
        };
        let p = debate_prompt(persona, &[], &ctx);
        assert!(p.system.starts_with(persona.personality_prompt));
        assert!(p.system.contains("where ETH goes next"));
        assert!(p.system.contains("CURRENT MARKET DATA"));
        assert!(p.system.contains("Last round ended bullish"));
        assert!(p.system.contains("[SENTIMENT: bullish|bearish|neutral, CONFIDENCE: 0-100]"));
        assert!(p.user.contains(EMPTY_ROOM));
    }

    #[test]
    fn test_cooldown_prompt_drops_tags() {
        let persona = personas::by_id("ser_fumbles").unwrap();
        let p = cooldown_prompt(persona, &[msg("a", "gm", None)]);
        assert!(p.system.contains("No sentiment tags needed"));
        assert!(!p.system.contains("[SENTIMENT:"));
    }

    #[test]
    fn test_moderator_prompt_lists_handles() {
        let handles: HashMap<&str, &str> = [("nxbl", "nxbl"), ("0xviv", "0xViv")].into();
        let p = moderator_prompt(
            &["nxbl", "0xviv"],
            &handles,
            &[],
            &["0xviv".to_string()],
        );
        assert!(p.system.contains("- 0xviv (0xViv)"));
        assert!(p.system.contains("Recently spoke (most recent first): 0xViv"));
        assert!(p.system.contains("{\"nextSpeakerId\""));
    }

    #[test]
    fn test_summary_prompt_context() {
        let msgs = vec![msg("a", "dump incoming", Some(Sentiment::Bearish))];
        let p = summary_prompt(
            &msgs,
            Some(Phase::Consensus),
            Some(ConsensusReading {
                direction: Some(Sentiment::Bearish),
                strength: 82,
            }),
        );
        assert!(p.contains("following 1 messages"));
        assert!(p.contains("Current Phase: CONSENSUS"));
        assert!(p.contains("Current Consensus: BEARISH (82% strength)"));
        assert!(p.contains("a: [BEARISH] dump incoming"));
    }
}
