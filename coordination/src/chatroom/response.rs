//! Parsing of raw model replies.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::types::Sentiment;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());
static THINK_TAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<think>.*").unwrap());
static SENTIMENT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[SENTIMENT:\s*(bullish|bearish|neutral)\s*,\s*CONFIDENCE:\s*(\d+)\s*\]")
        .unwrap()
});
static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Confidence assigned to debate messages without a tag.
pub const DEFAULT_CONFIDENCE: u8 = 50;

/// Remove reasoning blocks, including an unterminated trailing one.
pub fn strip_think(raw: &str) -> String {
    let closed = THINK_BLOCK.replace_all(raw.trim(), "");
    THINK_TAIL.replace_all(closed.trim(), "").trim().to_string()
}

/// Pull the sentiment tag out of a message.
///
/// Returns the content with the tag removed and the parsed stance.
/// Confidence is clamped to 0-100.
pub fn extract_sentiment(content: &str) -> (String, Option<(Sentiment, u8)>) {
    let Some(caps) = SENTIMENT_TAG.captures(content) else {
        return (content.trim().to_string(), None);
    };
    let sentiment = caps.get(1).and_then(|m| Sentiment::parse(m.as_str()));
    let confidence = caps
        .get(2)
        .map(|m| m.as_str().parse::<u64>().unwrap_or(u64::MAX).min(100) as u8);
    let whole = caps.get(0).map(|m| m.range());

    let stripped = match whole {
        Some(range) => {
            let mut s = content.to_string();
            s.replace_range(range, "");
            s.trim().to_string()
        }
        None => content.trim().to_string(),
    };
    (stripped, sentiment.zip(confidence))
}

/// Parsed persona reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub content: String,
    pub sentiment: Option<Sentiment>,
    pub confidence: Option<u8>,
}

/// Clean a persona reply.
///
/// Any sentiment tag is removed from the content. Only DEBATE replies keep
/// the parsed stance, defaulting to neutral/50 when the tag is missing.
pub fn parse_reply(raw: &str, debate: bool) -> ParsedReply {
    let cleaned = strip_think(raw);
    let (content, stance) = extract_sentiment(&cleaned);
    if !debate {
        return ParsedReply {
            content,
            sentiment: None,
            confidence: None,
        };
    }
    let (sentiment, confidence) = stance.unwrap_or((Sentiment::Neutral, DEFAULT_CONFIDENCE));
    ParsedReply {
        content,
        sentiment: Some(sentiment),
        confidence: Some(confidence),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeratorPick {
    next_speaker_id: Option<String>,
}

/// Extract the moderator's choice if it names a valid candidate.
pub fn parse_moderator_pick(raw: &str, candidates: &[&str]) -> Option<String> {
    let cleaned = strip_think(raw);
    let json = JSON_OBJECT.find(&cleaned)?;
    let pick: ModeratorPick = serde_json::from_str(json.as_str()).ok()?;
    let id = pick.next_speaker_id?;
    candidates.contains(&id.as_str()).then_some(id)
}

/// Trim whitespace and one layer of surrounding quotes.
pub fn clean_summary(raw: &str) -> String {
    let s = strip_think(raw);
    let s = s.strip_prefix(['"', '\'']).unwrap_or(&s);
    let s = s.strip_suffix(['"', '\'']).unwrap_or(s);
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think_blocks() {
        assert_eq!(strip_think("<think>hmm</think> hello"), "hello");
        assert_eq!(strip_think("<THINK>a\nb</THINK>x <think>y</think>z"), "x z");
        assert_eq!(strip_think("answer <think>still going"), "answer");
    }

    #[test]
    fn test_extract_sentiment_tag() {
        let (c, s) = extract_sentiment("Support holds. [sentiment: Bullish , confidence: 72]");
        assert_eq!(c, "Support holds.");
        assert_eq!(s, Some((Sentiment::Bullish, 72)));

        let (_, s) = extract_sentiment("x [SENTIMENT: bearish, CONFIDENCE: 250]");
        assert_eq!(s, Some((Sentiment::Bearish, 100)));

        let (c, s) = extract_sentiment("  no tag here ");
        assert_eq!(c, "no tag here");
        assert_eq!(s, None);
    }

    #[test]
    fn test_parse_reply_defaults_in_debate() {
        let r = parse_reply("<think>plan</think>just vibes", true);
        assert_eq!(r.content, "just vibes");
        assert_eq!(r.sentiment, Some(Sentiment::Neutral));
        assert_eq!(r.confidence, Some(50));

        let r = parse_reply("gm [SENTIMENT: bullish, CONFIDENCE: 80]", false);
        assert_eq!(r.sentiment, None);
        assert_eq!(r.content, "gm");
    }

    #[test]
    fn test_moderator_pick() {
        let ids = ["nxbl", "0xviv"];
        assert_eq!(
            parse_moderator_pick(
                "Sure! {\"nextSpeakerId\": \"0xviv\", \"reason\": \"data\"}",
                &ids
            ),
            Some("0xviv".to_string())
        );
        assert_eq!(parse_moderator_pick("{\"nextSpeakerId\": \"ghost\"}", &ids), None);
        assert_eq!(parse_moderator_pick("no json", &ids), None);
        assert_eq!(parse_moderator_pick("{broken", &ids), None);
    }

    #[test]
    fn test_clean_summary() {
        assert_eq!(clean_summary("\"Bulls won the round.\"\n"), "Bulls won the round.");
        assert_eq!(clean_summary("plain"), "plain");
    }
}
