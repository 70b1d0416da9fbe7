//! Persona conviction tracking and stance shifts.
//!
//! Every persona holds a stance and a 0-100 conviction score. Opposing
//! messages apply a persuasion factor; a factor at or above the persona's
//! threshold knocks conviction down, anything weaker slightly hardens it.
//! The engine flips a stance once conviction drops below
//! [`STANCE_FLIP_BELOW`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, Sentiment};
use crate::personas::Persona;

static SPECIFIC_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d+%|\$[\d,]+|\d+\s*(k|m|b|million|billion)").unwrap()
});
static TIMEFRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+h|\d+d|24h|7d|weekly|daily").unwrap());
static STRONG_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+%|\$[\d,]+(k|m|b)").unwrap());

const MAX_FACTORS: usize = 20;
const MAX_STANCE_HISTORY: usize = 10;

/// Conviction below this after a persuasion hit resets to [`SHIFT_RESET_SCORE`].
const SHIFT_FLOOR: u8 = 30;
const SHIFT_RESET_SCORE: u8 = 40;
/// Engine-level stance flip happens under this score.
pub const STANCE_FLIP_BELOW: u8 = 30;
/// Opposing message confidence needed to flip a wavering persona.
pub const STANCE_FLIP_CONFIDENCE: u8 = 70;

/// Qualitative conviction band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvictionLevel {
    Strong,
    Moderate,
    Weak,
    Wavering,
}

impl ConvictionLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            75.. => Self::Strong,
            50.. => Self::Moderate,
            25.. => Self::Weak,
            _ => Self::Wavering,
        }
    }

    /// Impact needed to dent conviction at this level.
    pub fn persuasion_threshold(self) -> u8 {
        match self {
            Self::Strong => 15,
            Self::Moderate => 10,
            Self::Weak => 5,
            Self::Wavering => 3,
        }
    }

    /// Speaker-selection weight; shaky personas get asked more.
    pub fn speaker_weight(self) -> u32 {
        match self {
            Self::Wavering => 3,
            Self::Weak => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ConvictionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Moderate => write!(f, "moderate"),
            Self::Weak => write!(f, "weak"),
            Self::Wavering => write!(f, "wavering"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StanceEntry {
    pub stance: Sentiment,
    pub conviction: u8,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    DataQuality,
    Contradiction,
    Agreement,
    Novelty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersuasionFactor {
    #[serde(rename = "type")]
    pub kind: FactorKind,
    pub source_persona_id: String,
    pub message_id: String,
    pub impact: u8,
    pub timestamp: i64,
    pub description: String,
}

/// Conviction record for one persona within a debate round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersuasionState {
    pub persona_id: String,
    pub current_stance: Sentiment,
    pub conviction: ConvictionLevel,
    pub conviction_score: u8,
    pub stance_history: Vec<StanceEntry>,
    pub persuasion_factors: Vec<PersuasionFactor>,
    pub last_updated: i64,
}

impl PersuasionState {
    pub fn new(persona_id: &str, stance: Sentiment, score: u8, now: i64) -> Self {
        let score = score.min(100);
        Self {
            persona_id: persona_id.to_string(),
            current_stance: stance,
            conviction: ConvictionLevel::from_score(score),
            conviction_score: score,
            stance_history: vec![StanceEntry {
                stance,
                conviction: score,
                timestamp: now,
                triggered_by: None,
                reason: None,
            }],
            persuasion_factors: Vec::new(),
            last_updated: now,
        }
    }

    /// Opening state for a persona at the start of a round.
    pub fn for_persona(persona: &Persona, now: i64) -> Self {
        Self::new(persona.id, persona.bias, persona.initial_conviction(), now)
    }

    fn set_score(&mut self, score: u8) {
        self.conviction_score = score.min(100);
        self.conviction = ConvictionLevel::from_score(self.conviction_score);
    }

    /// Number of stance flips so far.
    pub fn stance_changes(&self) -> usize {
        self.stance_history.len().saturating_sub(1)
    }
}

/// Score how persuasive `message` is for a persona in `recipient` state.
///
/// Returns `None` for untagged messages and messages agreeing with the
/// recipient's current stance.
pub fn impact(
    message: &ChatMessage,
    recipient: &PersuasionState,
    recent: &[ChatMessage],
    now: i64,
) -> Option<PersuasionFactor> {
    let sentiment = message.sentiment?;
    if sentiment == recipient.current_stance {
        return None;
    }

    let mut score: u8 = 0;
    let mut notes: Vec<String> = Vec::new();

    let has_data = SPECIFIC_DATA.is_match(&message.content);
    let has_timeframe = TIMEFRAME.is_match(&message.content);
    if has_data && has_timeframe {
        score += 4;
        notes.push("Strong data-backed argument with specific metrics and timeframe".into());
    } else if has_data {
        score += 2;
        notes.push("Data-backed argument with specific numbers".into());
    }

    match message.confidence {
        Some(c) if c >= 80 => {
            score += 3;
            notes.push("High confidence speaker (80%+)".into());
        }
        Some(c) if c >= 60 => {
            score += 1;
            notes.push("Moderate confidence".into());
        }
        _ => {}
    }

    // Any differing stance counts as a direct challenge.
    score += 2;
    let mut kind = FactorKind::Contradiction;
    notes.push("Direct challenge to current stance".into());

    let agreeing = recent
        .iter()
        .filter(|m| m.sentiment == Some(sentiment) && m.id != message.id)
        .count();
    if agreeing >= 3 {
        score += 3;
        kind = FactorKind::Agreement;
        notes.push(format!("{agreeing} recent messages support this view"));
    } else if agreeing >= 1 {
        score += 1;
        notes.push("Some recent agreement".into());
    }

    let opening: String = message
        .content
        .to_lowercase()
        .chars()
        .take(20)
        .collect();
    let novel = !recent
        .iter()
        .any(|m| m.id != message.id && m.content.to_lowercase().contains(&opening));
    if novel {
        score += 2;
        kind = FactorKind::Novelty;
        notes.push("Novel perspective or data point".into());
    }

    Some(PersuasionFactor {
        kind,
        source_persona_id: message.persona_id.clone(),
        message_id: message.id.clone(),
        impact: score,
        timestamp: now,
        description: notes.join("; "),
    })
}

/// Apply a persuasion factor to a persona's conviction.
pub fn apply(state: &PersuasionState, factor: PersuasionFactor, now: i64) -> PersuasionState {
    let mut next = state.clone();
    let threshold = state.conviction.persuasion_threshold();
    let impact = factor.impact;

    next.persuasion_factors.push(factor);
    if next.persuasion_factors.len() > MAX_FACTORS {
        let excess = next.persuasion_factors.len() - MAX_FACTORS;
        next.persuasion_factors.drain(..excess);
    }

    if impact >= threshold {
        let mut score = state.conviction_score.saturating_sub(impact.saturating_mul(2));
        if score < SHIFT_FLOOR {
            score = SHIFT_RESET_SCORE;
        }
        next.set_score(score);
    } else {
        next.set_score(state.conviction_score.saturating_add(1));
    }
    next.last_updated = now;
    next
}

/// Switch a persona to `stance`, resetting conviction to moderate.
pub fn update_stance(
    state: &PersuasionState,
    stance: Sentiment,
    reason: Option<&str>,
    triggered_by: Option<&str>,
    now: i64,
) -> PersuasionState {
    if stance == state.current_stance {
        return state.clone();
    }
    let mut next = state.clone();
    next.stance_history.push(StanceEntry {
        stance,
        conviction: state.conviction_score,
        timestamp: now,
        triggered_by: triggered_by.map(str::to_string),
        reason: reason.map(str::to_string),
    });
    if next.stance_history.len() > MAX_STANCE_HISTORY {
        let excess = next.stance_history.len() - MAX_STANCE_HISTORY;
        next.stance_history.drain(..excess);
    }
    next.current_stance = stance;
    next.set_score(50);
    next.last_updated = now;
    next
}

/// Harden a persona's current stance.
pub fn reinforce(state: &PersuasionState, amount: u8, now: i64) -> PersuasionState {
    let mut next = state.clone();
    next.set_score(state.conviction_score.saturating_add(amount));
    next.last_updated = now;
    next
}

/// One-line conviction context for the persona's prompt.
pub fn persuasion_summary(state: &PersuasionState) -> String {
    let mut summary = format!(
        "Your current conviction: {} ({}/100)",
        state.conviction, state.conviction_score
    );

    let changes = state.stance_changes();
    if changes > 0 {
        summary.push_str(&format!(
            ". You've shifted stance {changes} time{} in this debate.",
            if changes > 1 { "s" } else { "" }
        ));
    }

    let recent = &state.persuasion_factors[state.persuasion_factors.len().saturating_sub(3)..];
    if !recent.is_empty() {
        let pressure: u32 = recent.iter().map(|f| f.impact as u32).sum();
        summary.push_str(&format!(" Recent persuasion pressure: {pressure} points."));
    }

    match state.conviction {
        ConvictionLevel::Wavering => summary
            .push_str(" You're open to changing your view if presented with compelling data."),
        ConvictionLevel::Weak => {
            summary.push_str(" You might acknowledge good points from opposing views.")
        }
        ConvictionLevel::Strong => summary
            .push_str(" You're confident in your position but should still engage with data."),
        ConvictionLevel::Moderate => {}
    }
    summary
}

/// Roll whether a shaky persona concedes a point to `opposing`.
pub fn should_acknowledge<R: Rng + ?Sized>(
    state: &PersuasionState,
    opposing: &ChatMessage,
    rng: &mut R,
) -> bool {
    if state.conviction_score >= 50 {
        return false;
    }
    let strong = STRONG_DATA.is_match(&opposing.content) && opposing.confidence.unwrap_or(0) > 70;
    let chance = if strong { 0.7 } else { 0.3 };
    rng.gen_bool(chance)
}

/// Prompt fragment nudging a persona to concede `opposing`'s point.
pub fn acknowledgment_prompt<R: Rng + ?Sized>(
    state: &PersuasionState,
    opposing: &ChatMessage,
    rng: &mut R,
) -> String {
    let h = &opposing.handle;
    let openers = [
        format!("You notice {h} made a compelling point."),
        format!("You find yourself considering {h}'s argument."),
        format!("The data {h} shared gives you pause."),
        format!("You're struck by the strength of {h}'s analysis."),
    ];
    let opener = &openers[rng.gen_range(0..openers.len())];
    format!(
        "{opener} While you still lean {}, you should acknowledge the validity of their data or reasoning in your response. Don't completely flip your stance yet, but show you're considering it.",
        state.current_stance
    )
}

/// Aggregate persuasion statistics for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateStats {
    pub total_stance_changes: usize,
    pub average_conviction: f64,
    pub most_persuadable: Option<String>,
    pub most_stubborn: Option<String>,
}

/// Persuasion states for every persona in the current round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersuasionBook {
    states: BTreeMap<String, PersuasionState>,
}

impl PersuasionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed every persona with its opening stance and conviction.
    pub fn initialize_all(personas: &[Persona], now: i64) -> Self {
        let states = personas
            .iter()
            .map(|p| (p.id.to_string(), PersuasionState::for_persona(p, now)))
            .collect();
        Self { states }
    }

    pub fn get(&self, persona_id: &str) -> Option<&PersuasionState> {
        self.states.get(persona_id)
    }

    pub fn put(&mut self, state: PersuasionState) {
        self.states.insert(state.persona_id.clone(), state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = &PersuasionState> {
        self.states.values()
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Fold a freshly posted message into every persona's state.
    ///
    /// The sender is reinforced by 2; everyone else takes the message's
    /// persuasion impact, if any.
    pub fn process_message(&mut self, message: &ChatMessage, all: &[ChatMessage], now: i64) {
        if message.sentiment.is_none() {
            return;
        }
        if let Some(sender) = self.states.get(&message.persona_id) {
            let reinforced = reinforce(sender, 2, now);
            self.states.insert(message.persona_id.clone(), reinforced);
        }
        for (id, state) in self.states.iter_mut() {
            if *id == message.persona_id {
                continue;
            }
            if let Some(factor) = impact(message, state, all, now) {
                *state = apply(state, factor, now);
            }
        }
    }

    pub fn stats(&self) -> DebateStats {
        let mut total_changes = 0;
        let mut total_conviction = 0u32;
        let mut most_persuadable: Option<(&str, u8)> = None;
        let mut most_stubborn: Option<(&str, u8)> = None;

        for (id, state) in &self.states {
            total_changes += state.stance_changes();
            total_conviction += state.conviction_score as u32;
            if most_persuadable.map_or(true, |(_, s)| state.conviction_score < s) {
                most_persuadable = Some((id, state.conviction_score));
            }
            if most_stubborn.map_or(true, |(_, s)| state.conviction_score > s) {
                most_stubborn = Some((id, state.conviction_score));
            }
        }

        let count = self.states.len();
        DebateStats {
            total_stance_changes: total_changes,
            average_conviction: if count > 0 {
                total_conviction as f64 / count as f64
            } else {
                0.0
            },
            most_persuadable: most_persuadable.map(|(id, _)| id.to_string()),
            most_stubborn: most_stubborn.map(|(id, _)| id.to_string()),
        }
    }
}
