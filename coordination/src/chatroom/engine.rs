//! One chatroom tick: pick a speaker, prompt their model, fold the reply
//! into persuasion and consensus, advance the phase.
//!
//! The engine never holds the generation lock itself; the stream loop
//! takes the lock, calls [`ChatroomEngine::generate_next`], then
//! [`ChatroomEngine::commit`]s the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::consensus::rolling_consensus;
use super::persuasion::{
    acknowledgment_prompt, apply, impact, persuasion_summary, should_acknowledge, update_stance,
    PersuasionBook, STANCE_FLIP_BELOW, STANCE_FLIP_CONFIDENCE,
};
use super::phase::{cooldown_expired, transition, CooldownWindow, PhaseChange, TransitionError};
use super::prompts::{
    cooldown_prompt, debate_prompt, moderator_prompt, summary_prompt, DebateContext,
    SUMMARY_SYSTEM_PROMPT,
};
use super::response::{clean_summary, parse_moderator_pick, parse_reply};
use super::store::ChatroomStore;
use super::summary::{current_round, debate_context};
use super::types::{
    ChatMessage, ChatRoomState, ConsensusReading, DebateSummary, Phase, Sentiment,
    StanceChangeRecord,
};
use crate::caller::{call_quiet, SharedCaller};
use crate::kv::KvError;
use crate::market::{detect_refs, format_for_prompt, MarketSnapshot, SharedFeed};
use crate::personas::{self, Persona};

const PERSUASION_WINDOW: usize = 10;
const ACKNOWLEDGE_WINDOW: usize = 3;
/// Recent speakers excluded from the random fallback, besides the last one.
const FALLBACK_EXCLUDE_RECENT: usize = 2;

#[derive(Debug, Error)]
pub enum ChatroomError {
    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("no persona available to speak")]
    NoSpeaker,

    #[error("no messages since last visit")]
    NoMessages,

    #[error("summary model unavailable")]
    ModelUnavailable,
}

pub type ChatroomResult<T> = Result<T, ChatroomError>;

/// Tunables for the debate cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatroomConfig {
    /// Rolling consensus strength that ends a debate.
    pub consensus_threshold: u8,
    pub cooldown: CooldownWindow,
    pub recent_speaker_limit: usize,
    /// CONSENSUS-phase messages before moving to COOLDOWN.
    pub consensus_messages: usize,
    pub asset: String,
    pub moderator_model: String,
    pub summary_model: String,
    pub persona_max_tokens: u32,
    pub moderator_max_tokens: u32,
    pub summary_max_tokens: u32,
}

impl Default for ChatroomConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 80,
            cooldown: CooldownWindow::default(),
            recent_speaker_limit: 5,
            consensus_messages: 2,
            asset: "BTC".to_string(),
            moderator_model: "deepseek".to_string(),
            summary_model: "deepseek".to_string(),
            persona_max_tokens: 250,
            moderator_max_tokens: 60,
            summary_max_tokens: 150,
        }
    }
}

/// A message produced by one tick, with everything it changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub message: ChatMessage,
    pub state: ChatRoomState,
    pub consensus: Option<ConsensusReading>,
    pub phase_change: Option<PhaseChange>,
    pub stance_change: Option<StanceChangeRecord>,
    pub debate_summary: Option<DebateSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Message(Box<GenerationResult>),
    /// The chosen persona's model failed; the state records it as unavailable.
    Skipped {
        persona_id: String,
        state: ChatRoomState,
        phase_change: Option<PhaseChange>,
    },
}

impl GenerationOutcome {
    pub fn state(&self) -> &ChatRoomState {
        match self {
            Self::Message(result) => &result.state,
            Self::Skipped { state, .. } => state,
        }
    }
}

pub struct ChatroomEngine {
    caller: SharedCaller,
    market: SharedFeed,
    store: ChatroomStore,
    config: ChatroomConfig,
    last_market: Mutex<Option<MarketSnapshot>>,
    seed: Option<u64>,
    ticks: AtomicU64,
}

impl ChatroomEngine {
    pub fn new(
        caller: SharedCaller,
        market: SharedFeed,
        store: ChatroomStore,
        config: ChatroomConfig,
    ) -> Self {
        Self {
            caller,
            market,
            store,
            config,
            last_market: Mutex::new(None),
            seed: None,
            ticks: AtomicU64::new(0),
        }
    }

    /// Deterministic randomness, for tests and replays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn store(&self) -> &ChatroomStore {
        &self.store
    }

    pub fn config(&self) -> &ChatroomConfig {
        &self.config
    }

    /// Load the room state, creating it for the configured asset on first use.
    pub async fn initialize(&self, now: i64) -> ChatroomResult<ChatRoomState> {
        let mut state = self.store.initialize_if_empty(now).await?;
        if state.message_count == 0 && state.current_asset != self.config.asset {
            state.current_asset = self.config.asset.clone();
            self.store.set_state(&state).await?;
        }
        Ok(state)
    }

    fn rng(&self) -> StdRng {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(tick)),
            None => StdRng::from_entropy(),
        }
    }

    async fn market_snapshot(&self, asset: &str) -> Option<MarketSnapshot> {
        match self.market.snapshot(asset).await {
            Ok(snap) => {
                *self.last_market.lock().await = Some(snap.clone());
                Some(snap)
            }
            Err(e) => {
                warn!(asset, error = %e, "market data unavailable, using last snapshot");
                self.last_market.lock().await.clone()
            }
        }
    }

    async fn load_book(&self, history: &[ChatMessage], now: i64) -> ChatroomResult<PersuasionBook> {
        if let Some(book) = self.store.persuasion().await? {
            if !book.is_empty() {
                return Ok(book);
            }
        }
        let mut book = PersuasionBook::initialize_all(personas::all(), now);
        let window = &history[history.len().saturating_sub(PERSUASION_WINDOW)..];
        for (i, message) in window.iter().enumerate() {
            book.process_message(message, &window[..=i], now);
        }
        debug!(replayed = window.len(), "rebuilt persuasion book");
        Ok(book)
    }

    /// Produce the next chatroom message from `history` and `state`.
    pub async fn generate_next(
        &self,
        history: &[ChatMessage],
        mut state: ChatRoomState,
    ) -> ChatroomResult<GenerationOutcome> {
        let now = crate::now_ms();
        let mut rng = self.rng();
        let mut phase_change = None;
        let mut book = self.load_book(history, now).await?;

        if cooldown_expired(&state, now) {
            phase_change = Some(transition(
                &mut state,
                Phase::Debate,
                now,
                self.config.cooldown,
                &mut rng,
            )?);
            book = PersuasionBook::initialize_all(personas::all(), now);
            info!(phase = %Phase::Debate, "cooldown over, new debate round");
        }

        let asset = state.current_asset.clone();
        let market = self.market_snapshot(&asset).await;

        let persona = self.pick_speaker(history, &state, &book, &mut rng).await?;

        absorb_recent(&mut book, persona, history, now);

        let mut stance_change = None;
        if state.phase != Phase::Cooldown {
            stance_change = flip_if_wavering(&mut book, persona, history, now);
        }

        let speaker_state = book.get(persona.id).cloned();
        let mut acknowledges = false;
        let prompt = if state.phase == Phase::Cooldown {
            cooldown_prompt(persona, history)
        } else {
            let market_block = market.as_ref().map(|m| format_for_prompt(m, &asset));
            let persuasion = speaker_state.as_ref().map(persuasion_summary);
            let previous = state.previous_debate_summary.as_ref().map(debate_context);
            let acknowledgment = speaker_state.as_ref().and_then(|s| {
                let opposing = history
                    .iter()
                    .rev()
                    .take(ACKNOWLEDGE_WINDOW)
                    .find(|m| m.sentiment.is_some_and(|x| x.opposes(s.current_stance)))?;
                should_acknowledge(s, opposing, &mut rng)
                    .then(|| acknowledgment_prompt(s, opposing, &mut rng))
            });
            acknowledges = acknowledgment.is_some();
            debate_prompt(
                persona,
                history,
                &DebateContext {
                    asset: &asset,
                    market: market_block.as_deref(),
                    persuasion: persuasion.as_deref(),
                    acknowledgment: acknowledgment.as_deref(),
                    previous_round: previous.as_deref(),
                },
            )
        };

        let Some(raw) = call_quiet(
            self.caller.as_ref(),
            persona.model_id,
            &prompt.system,
            &prompt.user,
            self.config.persona_max_tokens,
        )
        .await
        else {
            state.unavailable_personas.insert(persona.id.to_string());
            if state.unavailable_personas.len() >= personas::all().len() {
                state.unavailable_personas.clear();
            }
            state.retry_count += 1;
            state.next_speaker_id = None;
            self.store.set_persuasion(&book).await?;
            warn!(persona = persona.id, retries = state.retry_count, "persona skipped");
            return Ok(GenerationOutcome::Skipped {
                persona_id: persona.id.to_string(),
                state,
                phase_change,
            });
        };

        let reply = parse_reply(&raw, state.phase == Phase::Debate);
        let market_refs = market
            .as_ref()
            .map(|m| detect_refs(&reply.content, m))
            .filter(|refs| !refs.is_empty());

        let message = ChatMessage {
            id: crate::make_id("msg", now, &mut rng),
            persona_id: persona.id.to_string(),
            handle: persona.handle.to_string(),
            avatar: persona.avatar.to_string(),
            content: reply.content,
            sentiment: reply.sentiment,
            confidence: reply.confidence,
            timestamp: now,
            phase: state.phase,
            acknowledges_opposing_view: acknowledges && reply.sentiment.is_some(),
            market_data_refs: market_refs,
        };

        let mut all = history.to_vec();
        all.push(message.clone());
        let window = &all[all.len().saturating_sub(PERSUASION_WINDOW)..];
        book.process_message(&message, window, now);

        state.last_message_at = now;
        state.last_speaker_id = Some(persona.id.to_string());
        state.message_count += 1;
        state.recent_speakers.retain(|id| id != persona.id);
        state.recent_speakers.insert(0, persona.id.to_string());
        state.recent_speakers.truncate(self.config.recent_speaker_limit);
        state.unavailable_personas.remove(persona.id);
        state.retry_count = 0;

        let mut consensus = None;
        let mut debate_summary = None;
        if state.phase.tracks_consensus() {
            let reading = rolling_consensus(&all);
            state.set_consensus(reading);
            consensus = Some(reading);

            match state.phase {
                Phase::Debate => {
                    let decisive = reading
                        .direction
                        .is_some_and(|d| d != Sentiment::Neutral);
                    if decisive && reading.strength >= self.config.consensus_threshold {
                        phase_change = Some(transition(
                            &mut state,
                            Phase::Consensus,
                            now,
                            self.config.cooldown,
                            &mut rng,
                        )?);
                        info!(
                            phase = %Phase::Consensus,
                            strength = reading.strength,
                            "consensus reached"
                        );
                    }
                }
                Phase::Consensus => {
                    let in_consensus = current_round(&all)
                        .iter()
                        .filter(|m| m.phase == Phase::Consensus)
                        .count();
                    if in_consensus >= self.config.consensus_messages {
                        let round = self.store.next_debate_round().await?;
                        let summary = DebateSummary::capture(round, &all, &state, &book, now);
                        state.previous_debate_summary = Some(summary.clone());
                        debate_summary = Some(summary);
                        phase_change = Some(transition(
                            &mut state,
                            Phase::Cooldown,
                            now,
                            self.config.cooldown,
                            &mut rng,
                        )?);
                        info!(phase = %Phase::Cooldown, round, "debate round closed");
                    }
                }
                Phase::Cooldown => {}
            }
        }

        state.next_speaker_id = weighted_pick(&eligible(&state), &book, &mut rng)
            .map(|p| p.id.to_string());

        self.store.set_persuasion(&book).await?;

        debug!(
            persona = persona.id,
            phase = %state.phase,
            strength = state.consensus_strength,
            "generated chat message"
        );
        Ok(GenerationOutcome::Message(Box::new(GenerationResult {
            message,
            state,
            consensus,
            phase_change,
            stance_change,
            debate_summary,
        })))
    }

    /// Persist a tick: append the message (if any) and write the state.
    pub async fn commit(&self, outcome: &GenerationOutcome) -> ChatroomResult<()> {
        if let GenerationOutcome::Message(result) = outcome {
            self.store.append_message(&result.message).await?;
        }
        self.store.set_state(outcome.state()).await?;
        Ok(())
    }

    async fn pick_speaker<R: Rng + Send>(
        &self,
        history: &[ChatMessage],
        state: &ChatRoomState,
        book: &PersuasionBook,
        rng: &mut R,
    ) -> ChatroomResult<&'static Persona> {
        if let Some(id) = &state.next_speaker_id {
            if let Some(p) = personas::by_id(id) {
                let usable = !state.unavailable_personas.contains(id)
                    && state.last_speaker_id.as_deref() != Some(p.id);
                if usable {
                    return Ok(p);
                }
            }
        }

        let candidates = eligible(state);
        if candidates.is_empty() {
            return Err(ChatroomError::NoSpeaker);
        }

        let ids: Vec<&str> = candidates.iter().map(|p| p.id).collect();
        let handles: HashMap<&str, &str> = personas::all().iter().map(|p| (p.id, p.handle)).collect();
        let prompt = moderator_prompt(&ids, &handles, history, &state.recent_speakers);
        let picked = call_quiet(
            self.caller.as_ref(),
            &self.config.moderator_model,
            &prompt.system,
            &prompt.user,
            self.config.moderator_max_tokens,
        )
        .await
        .and_then(|raw| parse_moderator_pick(&raw, &ids))
        .and_then(|id| personas::by_id(&id));
        if let Some(p) = picked {
            return Ok(p);
        }

        weighted_pick(&candidates, book, rng).ok_or(ChatroomError::NoSpeaker)
    }

    /// Summarise what a returning visitor missed since `last_visit`.
    pub async fn summarize_missed(
        &self,
        messages: &[ChatMessage],
        last_visit: i64,
        phase: Option<Phase>,
        consensus: Option<ConsensusReading>,
    ) -> ChatroomResult<String> {
        let mut missed: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.timestamp > last_visit)
            .cloned()
            .collect();
        if missed.is_empty() {
            return Err(ChatroomError::NoMessages);
        }
        missed.sort_by_key(|m| m.timestamp);

        let user = summary_prompt(&missed, phase, consensus);
        let raw = call_quiet(
            self.caller.as_ref(),
            &self.config.summary_model,
            SUMMARY_SYSTEM_PROMPT,
            &user,
            self.config.summary_max_tokens,
        )
        .await
        .ok_or(ChatroomError::ModelUnavailable)?;

        let summary = clean_summary(&raw);
        if summary.is_empty() {
            return Err(ChatroomError::ModelUnavailable);
        }
        Ok(summary)
    }
}

/// Personas allowed to speak next.
///
/// Excludes the last speaker, the two most recent speakers and anyone whose
/// model is failing. Relaxes to "anyone but the last speaker" when that
/// leaves nobody.
pub fn eligible(state: &ChatRoomState) -> Vec<&'static Persona> {
    let last = state.last_speaker_id.as_deref();
    let recent: Vec<&str> = state
        .recent_speakers
        .iter()
        .take(FALLBACK_EXCLUDE_RECENT)
        .map(String::as_str)
        .collect();
    let strict: Vec<&'static Persona> = personas::all()
        .iter()
        .filter(|p| Some(p.id) != last)
        .filter(|p| !recent.contains(&p.id))
        .filter(|p| !state.unavailable_personas.contains(p.id))
        .collect();
    if !strict.is_empty() {
        return strict;
    }
    personas::all().iter().filter(|p| Some(p.id) != last).collect()
}

/// Conviction-weighted random choice; shaky personas speak more.
pub fn weighted_pick<R: Rng + ?Sized>(
    candidates: &[&'static Persona],
    book: &PersuasionBook,
    rng: &mut R,
) -> Option<&'static Persona> {
    let weights: Vec<u32> = candidates
        .iter()
        .map(|p| book.get(p.id).map_or(1, |s| s.conviction.speaker_weight()))
        .collect();
    let total: u32 = weights.iter().sum();
    if total == 0 {
        return None;
    }
    let mut roll = rng.gen_range(0..total);
    for (persona, weight) in candidates.iter().zip(weights) {
        if roll < weight {
            return Some(persona);
        }
        roll -= weight;
    }
    candidates.last().copied()
}

/// Let the last [`PERSUASION_WINDOW`] messages from others work on the speaker.
fn absorb_recent(book: &mut PersuasionBook, persona: &Persona, history: &[ChatMessage], now: i64) {
    let window = &history[history.len().saturating_sub(PERSUASION_WINDOW)..];
    for message in window.iter().filter(|m| m.persona_id != persona.id) {
        let Some(state) = book.get(persona.id) else {
            return;
        };
        if let Some(factor) = impact(message, state, window, now) {
            let next = apply(state, factor, now);
            book.put(next);
        }
    }
}

/// Flip a wavering speaker to the strongest opposing view in recent chat.
fn flip_if_wavering(
    book: &mut PersuasionBook,
    persona: &Persona,
    history: &[ChatMessage],
    now: i64,
) -> Option<StanceChangeRecord> {
    let state = book.get(persona.id)?;
    if state.conviction_score >= STANCE_FLIP_BELOW {
        return None;
    }
    let window = &history[history.len().saturating_sub(PERSUASION_WINDOW)..];
    let strongest = window
        .iter()
        .filter(|m| m.persona_id != persona.id)
        .filter(|m| m.sentiment.is_some_and(|s| s != state.current_stance))
        .max_by_key(|m| m.confidence.unwrap_or(0))?;
    let to = strongest.sentiment?;
    if strongest.confidence.unwrap_or(0) <= STANCE_FLIP_CONFIDENCE {
        return None;
    }

    let from = state.current_stance;
    let reason = format!("Persuaded by {}", strongest.handle);
    let flipped = update_stance(state, to, Some(&reason), Some(&strongest.id), now);
    book.put(flipped);
    info!(persona = persona.id, %from, %to, by = %strongest.handle, "stance change");
    Some(StanceChangeRecord {
        persona_id: persona.id.to_string(),
        handle: persona.handle.to_string(),
        from,
        to,
        triggered_by: Some(strongest.id.clone()),
        timestamp: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::{CallError, MockModelCaller};
    use crate::chatroom::persuasion::PersuasionState;
    use crate::kv::MemoryKv;
    use crate::market::StaticFeed;
    use rand::rngs::mock::StepRng;
    use std::sync::Arc;

    fn engine(mock: MockModelCaller) -> ChatroomEngine {
        let store = ChatroomStore::new(Arc::new(MemoryKv::new()));
        let feed = StaticFeed::new().with_price("BTC", 64_000.0);
        ChatroomEngine::new(Arc::new(mock), Arc::new(feed), store, ChatroomConfig::default())
            .with_seed(11)
    }

    fn tagged(id: &str, persona: &str, s: Sentiment, c: u8, phase: Phase) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            persona_id: persona.into(),
            handle: persona.into(),
            avatar: String::new(),
            content: format!("{persona} on {id}"),
            sentiment: Some(s),
            confidence: Some(c),
            timestamp: 1,
            phase,
            acknowledges_opposing_view: false,
            market_data_refs: None,
        }
    }

    #[test]
    fn test_eligible_excludes_recent_and_unavailable() {
        let mut state = ChatRoomState::new(0);
        state.last_speaker_id = Some("nxbl".into());
        state.recent_speakers = vec!["nxbl".into(), "0xviv".into(), "hodljenny".into()];
        state.unavailable_personas.insert("gas_goblin".into());
        let ids: Vec<&str> = eligible(&state).iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), 14);
        assert!(!ids.contains(&"nxbl"));
        assert!(!ids.contains(&"0xviv"));
        assert!(ids.contains(&"hodljenny"));
        assert!(!ids.contains(&"gas_goblin"));
    }

    #[test]
    fn test_eligible_relaxes_when_everyone_is_out() {
        let mut state = ChatRoomState::new(0);
        state.last_speaker_id = Some("nxbl".into());
        for p in personas::all() {
            state.unavailable_personas.insert(p.id.to_string());
        }
        assert_eq!(eligible(&state).len(), 16);
    }

    #[test]
    fn test_weighted_pick_prefers_wavering() {
        let a = personas::by_id("nxbl").unwrap();
        let b = personas::by_id("0xviv").unwrap();
        let mut book = PersuasionBook::new();
        book.put(PersuasionState::new("nxbl", Sentiment::Neutral, 90, 0));
        book.put(PersuasionState::new("0xviv", Sentiment::Neutral, 10, 0));
        // weights 1 and 3; a zero roll lands on the first candidate
        let mut zero = StepRng::new(0, 0);
        assert_eq!(weighted_pick(&[a, b], &book, &mut zero).unwrap().id, "nxbl");
        let mut high = StepRng::new(0xC000_0000, 0);
        assert_eq!(weighted_pick(&[a, b], &book, &mut high).unwrap().id, "0xviv");
        assert!(weighted_pick(&[], &book, &mut zero).is_none());
    }

    #[test]
    fn test_flip_requires_confident_opposition() {
        let persona = personas::by_id("the_intern").unwrap();
        let mut book = PersuasionBook::new();
        book.put(PersuasionState::new("the_intern", Sentiment::Neutral, 20, 0));

        let weak = vec![tagged("m1", "nxbl", Sentiment::Bullish, 70, Phase::Debate)];
        assert!(flip_if_wavering(&mut book, persona, &weak, 5).is_none());

        let strong = vec![
            tagged("m1", "nxbl", Sentiment::Bullish, 75, Phase::Debate),
            tagged("m2", "0xviv", Sentiment::Bearish, 90, Phase::Debate),
        ];
        let change = flip_if_wavering(&mut book, persona, &strong, 5).unwrap();
        assert_eq!(change.to, Sentiment::Bearish);
        assert_eq!(change.triggered_by.as_deref(), Some("m2"));
        assert_eq!(book.get("the_intern").unwrap().conviction_score, 50);
        // conviction reset, no second flip
        assert!(flip_if_wavering(&mut book, persona, &strong, 6).is_none());
    }

    #[tokio::test]
    async fn test_generate_uses_preselected_speaker() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .withf(|model, _, _, max| model == "kimi" && *max == 250)
            .times(1)
            .returning(|_, _, _, _| {
                Ok("<think>hmm</think>Funding flipped negative at $64k. [SENTIMENT: bearish, CONFIDENCE: 77]".into())
            });
        let engine = engine(mock);
        let mut state = ChatRoomState::new(0);
        state.next_speaker_id = Some("0xviv".into());

        let outcome = engine.generate_next(&[], state).await.unwrap();
        let GenerationOutcome::Message(result) = outcome else {
            panic!("expected a message");
        };
        assert_eq!(result.message.persona_id, "0xviv");
        assert_eq!(result.message.content, "Funding flipped negative at $64k.");
        assert_eq!(result.message.sentiment, Some(Sentiment::Bearish));
        assert_eq!(result.message.confidence, Some(77));
        assert!(result.message.id.starts_with("msg_"));
        assert_eq!(result.message.market_data_refs, Some(vec!["price".to_string()]));
        assert_eq!(result.state.message_count, 1);
        assert_eq!(result.state.recent_speakers, vec!["0xviv".to_string()]);
        assert_eq!(result.consensus, Some(ConsensusReading::default()));
        let next = result.state.next_speaker_id.as_deref().unwrap();
        assert_ne!(next, "0xviv");
    }

    #[tokio::test]
    async fn test_speaker_absorbs_recent_opposition() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .withf(|model, system, _, _| model == "kimi" && system.contains("(40/100)"))
            .times(1)
            .returning(|_, _, _, _| Ok("Still fading this. [SENTIMENT: bearish, CONFIDENCE: 70]".into()));
        let engine = engine(mock);
        let mut book = PersuasionBook::new();
        book.put(PersuasionState::new("0xviv", Sentiment::Bearish, 60, 0));
        engine.store().set_persuasion(&book).await.unwrap();

        let mut history = vec![
            tagged("b1", "nxbl", Sentiment::Bullish, 90, Phase::Debate),
            tagged("b2", "moonvember", Sentiment::Bullish, 90, Phase::Debate),
            tagged("b3", "hodljenny", Sentiment::Bullish, 90, Phase::Debate),
        ];
        history[0].content = "ETF inflows hit $500M over 7d".into();
        history[1].content = "Funding up 12% in 24h, shorts paying".into();
        history[2].content = "Open interest grew $2b weekly on spot".into();
        let mut state = ChatRoomState::new(0);
        state.next_speaker_id = Some("0xviv".into());

        let GenerationOutcome::Message(result) = engine.generate_next(&history, state).await.unwrap()
        else {
            panic!("expected a message");
        };
        assert!(result.stance_change.is_none());

        // each take scores 12: 60 → 36, then two hits that floor out at 40,
        // plus 2 for posting a bearish reply
        let stored = engine.store().persuasion().await.unwrap().unwrap();
        let viv = stored.get("0xviv").unwrap();
        assert_eq!(viv.current_stance, Sentiment::Bearish);
        assert_eq!(viv.conviction_score, 42);
        assert_eq!(viv.persuasion_factors.len(), 3);
    }

    #[tokio::test]
    async fn test_initialize_applies_configured_asset() {
        let store = ChatroomStore::new(Arc::new(MemoryKv::new()));
        let config = ChatroomConfig {
            asset: "ETH".into(),
            ..ChatroomConfig::default()
        };
        let engine = ChatroomEngine::new(
            Arc::new(MockModelCaller::new()),
            Arc::new(StaticFeed::new()),
            store.clone(),
            config,
        );

        let state = engine.initialize(5).await.unwrap();
        assert_eq!(state.current_asset, "ETH");
        assert_eq!(store.state().await.unwrap().unwrap().current_asset, "ETH");

        // a room that already talked keeps its asset
        let mut busy = state;
        busy.current_asset = "BTC".into();
        busy.message_count = 3;
        store.set_state(&busy).await.unwrap();
        assert_eq!(engine.initialize(6).await.unwrap().current_asset, "BTC");
    }

    #[tokio::test]
    async fn test_failed_model_skips_persona() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .returning(|_, _, _, _| Err(CallError::Timeout(30_000)));
        let engine = engine(mock);
        let mut state = ChatRoomState::new(0);
        state.next_speaker_id = Some("ozymandias".into());

        let outcome = engine.generate_next(&[], state).await.unwrap();
        match &outcome {
            GenerationOutcome::Skipped { persona_id, state, .. } => {
                assert_eq!(persona_id, "ozymandias");
                assert!(state.unavailable_personas.contains("ozymandias"));
                assert_eq!(state.retry_count, 1);
                assert_eq!(state.message_count, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        engine.commit(&outcome).await.unwrap();
        let stored = engine.store().state().await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_debate_reaches_consensus() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .returning(|_, _, _, _| Ok("Send it. [SENTIMENT: bullish, CONFIDENCE: 90]".into()));
        let engine = engine(mock);
        let history: Vec<ChatMessage> = (0..4)
            .map(|i| tagged(&format!("h{i}"), "moonvember", Sentiment::Bullish, 85, Phase::Debate))
            .collect();
        let mut state = ChatRoomState::new(0);
        state.next_speaker_id = Some("sats_stacker".into());

        let GenerationOutcome::Message(result) = engine.generate_next(&history, state).await.unwrap()
        else {
            panic!("expected a message");
        };
        let change = result.phase_change.unwrap();
        assert_eq!((change.from, change.to), (Phase::Debate, Phase::Consensus));
        assert_eq!(result.state.phase, Phase::Consensus);
        assert_eq!(result.state.consensus_direction, Some(Sentiment::Bullish));
        assert_eq!(result.state.consensus_strength, 100);
        let ends = result.state.cooldown_ends_at.unwrap();
        let now = result.message.timestamp;
        assert!(ends >= now + 15 * 60_000 && ends <= now + 30 * 60_000);
    }

    #[tokio::test]
    async fn test_consensus_closes_into_cooldown_with_summary() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .returning(|_, _, _, _| Ok("Told you. [SENTIMENT: bullish, CONFIDENCE: 80]".into()));
        let engine = engine(mock);
        let mut history: Vec<ChatMessage> = (0..4)
            .map(|i| tagged(&format!("h{i}"), "moonvember", Sentiment::Bullish, 85, Phase::Debate))
            .collect();
        history.push(tagged("c1", "nxbl", Sentiment::Bullish, 80, Phase::Consensus));
        let mut state = ChatRoomState::new(0);
        state.phase = Phase::Consensus;
        state.cooldown_ends_at = Some(i64::MAX);
        state.consensus_direction = Some(Sentiment::Bullish);
        state.consensus_strength = 100;
        state.next_speaker_id = Some("hodljenny".into());

        let GenerationOutcome::Message(result) = engine.generate_next(&history, state).await.unwrap()
        else {
            panic!("expected a message");
        };
        // CONSENSUS replies carry no stance
        assert_eq!(result.message.sentiment, None);
        assert_eq!(result.message.content, "Told you.");
        assert_eq!(result.state.phase, Phase::Cooldown);
        let summary = result.debate_summary.unwrap();
        assert_eq!(summary.round_number, 1);
        assert_eq!(summary.message_count, 6);
        assert_eq!(result.state.previous_debate_summary.as_ref(), Some(&summary));
    }

    #[tokio::test]
    async fn test_expired_cooldown_restarts_debate() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .returning(|_, _, _, _| Ok("new day. [SENTIMENT: neutral, CONFIDENCE: 40]".into()));
        let engine = engine(mock);
        let mut state = ChatRoomState::new(0);
        state.phase = Phase::Cooldown;
        state.cooldown_ends_at = Some(1);
        state.consensus_direction = Some(Sentiment::Bearish);
        state.consensus_strength = 88;
        state.next_speaker_id = Some("nxbl".into());

        let GenerationOutcome::Message(result) = engine.generate_next(&[], state).await.unwrap()
        else {
            panic!("expected a message");
        };
        let change = result.phase_change.unwrap();
        assert_eq!((change.from, change.to), (Phase::Cooldown, Phase::Debate));
        assert_eq!(result.message.phase, Phase::Debate);
        assert_eq!(result.state.cooldown_ends_at, None);
        assert_eq!(result.state.consensus_direction, None);
    }

    #[tokio::test]
    async fn test_moderator_pick_used_without_preselection() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .withf(|_, _, _, max| *max == 60)
            .times(1)
            .returning(|_, _, _, _| Ok(r#"{"nextSpeakerId": "macromaven", "reason": "macro"}"#.into()));
        mock.expect_call()
            .withf(|model, _, _, max| model == "gemini" && *max == 250)
            .times(1)
            .returning(|_, _, _, _| Ok("Real yields matter. [SENTIMENT: bearish, CONFIDENCE: 60]".into()));
        let engine = engine(mock);

        let GenerationOutcome::Message(result) =
            engine.generate_next(&[], ChatRoomState::new(0)).await.unwrap()
        else {
            panic!("expected a message");
        };
        assert_eq!(result.message.persona_id, "macromaven");
    }

    #[tokio::test]
    async fn test_summarize_missed() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .withf(|model, _, user, max| model == "deepseek" && *max == 150 && user.contains("2 messages"))
            .returning(|_, _, _, _| Ok("\"Bulls pressed, bears folded.\"".into()));
        let engine = engine(mock);
        let mut old = tagged("a", "nxbl", Sentiment::Bullish, 60, Phase::Debate);
        old.timestamp = 100;
        let mut b = tagged("b", "0xviv", Sentiment::Bearish, 60, Phase::Debate);
        b.timestamp = 300;
        let mut c = tagged("c", "nxbl", Sentiment::Bullish, 60, Phase::Debate);
        c.timestamp = 200;

        let summary = engine
            .summarize_missed(&[old.clone(), b, c], 150, Some(Phase::Debate), None)
            .await
            .unwrap();
        assert_eq!(summary, "Bulls pressed, bears folded.");

        assert!(matches!(
            engine.summarize_missed(&[old], 150, None, None).await,
            Err(ChatroomError::NoMessages)
        ));
    }

    #[tokio::test]
    async fn test_summarize_missed_model_down() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .returning(|_, _, _, _| Err(CallError::Network("down".into())));
        let engine = engine(mock);
        let mut m = tagged("a", "nxbl", Sentiment::Bullish, 60, Phase::Debate);
        m.timestamp = 500;
        assert!(matches!(
            engine.summarize_missed(&[m], 0, None, None).await,
            Err(ChatroomError::ModelUnavailable)
        ));
    }
}
