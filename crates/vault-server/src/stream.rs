//! Per-connection server-sent-event loop for the chatroom.
//!
//! Every open connection runs the same loop. Whichever connection takes the
//! generation lock when a message is due produces it; the rest pick the new
//! messages up from the store's message index on their next poll.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use vault_coordination::chatroom::typing;
use vault_coordination::chatroom::{
    debate_context, ChatMessage, ChatRoomState, ChatroomResult, ChatroomStore, DebateSummary,
    GenerationOutcome, Phase,
};
use vault_coordination::events::{ConsensusUpdate, VaultEvent};
use vault_coordination::{now_ms, personas};

use crate::state::AppState;

// ── Payloads ──

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Connected {
    timestamp: i64,
    connection_time_ms: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPayload<'a> {
    messages: &'a [ChatMessage],
    phase: Phase,
    cooldown_ends_at: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Typing {
    id: &'static str,
    handle: &'static str,
    avatar: &'static str,
    duration_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DebateContextPayload<'a> {
    summary: &'a DebateSummary,
    context: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationError<'a> {
    timestamp: i64,
    persona_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemError {
    timestamp: i64,
    message: String,
    severity: &'static str,
}

/// Named SSE event with a JSON body.
pub fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(event = name, error = %e, "failed to encode SSE payload");
            Event::default().event("system_error").data("{}")
        }
    }
}

fn consensus_event(room: &ChatRoomState, now: i64) -> Event {
    sse_event("consensus_update", &consensus_update(room, now))
}

fn consensus_update(room: &ChatRoomState, now: i64) -> ConsensusUpdate {
    ConsensusUpdate {
        direction: room.consensus_direction,
        strength: room.consensus_strength,
        message_count: room.message_count,
        phase: room.phase,
        timestamp: now,
    }
}

/// `typing` for a persona id, with a rough duration hint for the client.
fn typing_event(persona_id: Option<&str>) -> Option<Event> {
    let persona = personas::by_id(persona_id?)?;
    let estimate = typing::estimate(persona, &mut rand::thread_rng());
    Some(sse_event(
        "typing",
        &Typing {
            id: persona.id,
            handle: persona.handle,
            avatar: persona.avatar,
            duration_ms: estimate.duration_ms,
        },
    ))
}

fn debate_context_event(summary: &DebateSummary) -> Event {
    sse_event(
        "debate_context",
        &DebateContextPayload {
            summary,
            context: debate_context(summary),
        },
    )
}

fn system_error(message: String) -> Event {
    sse_event(
        "system_error",
        &SystemError {
            timestamp: now_ms(),
            message,
            severity: "warning",
        },
    )
}

/// Events for one committed tick, in broadcast order.
pub fn outcome_events(outcome: &GenerationOutcome, now: i64) -> Vec<Event> {
    let mut events = Vec::new();
    match outcome {
        GenerationOutcome::Skipped {
            persona_id,
            phase_change,
            ..
        } => {
            if let Some(change) = phase_change {
                events.push(sse_event("phase_change", change));
            }
            events.push(sse_event(
                "generation_error",
                &GenerationError {
                    timestamp: now,
                    persona_id,
                },
            ));
        }
        GenerationOutcome::Message(result) => {
            events.push(sse_event("message", &result.message));
            if let Some(change) = &result.phase_change {
                events.push(sse_event("phase_change", change));
            }
            events.push(consensus_event(&result.state, now));
            if let Some(stance) = &result.stance_change {
                events.push(sse_event("stance_change", stance));
            }
            if let Some(summary) = &result.debate_summary {
                events.push(debate_context_event(summary));
            }
        }
    }
    events
}

/// A message is due once the jittered interval has passed, or the room is empty.
pub fn message_due(room: &ChatRoomState, now: i64, interval_ms: u64) -> bool {
    room.message_count == 0 || now - room.last_message_at >= interval_ms as i64
}

fn lock_id(now: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("sse_{now}_{suffix}")
}

/// Releases the generation lock when the connection goes away mid-tick.
struct LockGuard {
    store: ChatroomStore,
    holder: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let store = self.store.clone();
        let holder = std::mem::take(&mut self.holder);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match store.release_lock(&holder).await {
                    Ok(true) => debug!(holder = %holder, "released lock on disconnect"),
                    Ok(false) => {}
                    Err(e) => warn!(holder = %holder, error = %e, "lock release on disconnect failed"),
                }
            });
        }
    }
}

async fn generate(app: &AppState, room: ChatRoomState) -> ChatroomResult<GenerationOutcome> {
    let history = app.store.messages().await?;
    let outcome = app.engine.generate_next(&history, room).await?;
    app.engine.commit(&outcome).await?;
    Ok(outcome)
}

/// GET /api/chatroom/stream
pub async fn chatroom_stream(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let keepalive = Duration::from_millis(app.config.stream.keepalive_ms);
    Sse::new(event_stream(app)).keep_alive(KeepAlive::new().interval(keepalive).text("keepalive"))
}

/// The connection's event sequence: the initial snapshot, then the tick loop.
pub fn event_stream(app: AppState) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        let started = now_ms();
        let holder = lock_id(started);
        let _guard = LockGuard { store: app.store.clone(), holder: holder.clone() };
        let cadence = app.config.stream;
        let poll = Duration::from_millis(cadence.poll_ms);
        let typing_delay = Duration::from_millis(cadence.typing_delay_ms);

        let room = match app.engine.initialize(started).await {
            Ok(room) => room,
            Err(e) => {
                warn!(error = %e, "chatroom state unavailable");
                yield Ok(system_error(format!("Chatroom state unavailable: {e}")));
                ChatRoomState::new(started)
            }
        };

        let now = now_ms();
        yield Ok(sse_event("connected", &Connected { timestamp: now, connection_time_ms: now - started }));

        let messages = app.store.messages().await.unwrap_or_default();
        yield Ok(sse_event("history", &HistoryPayload {
            messages: &messages,
            phase: room.phase,
            cooldown_ends_at: room.cooldown_ends_at,
        }));
        if room.consensus_direction.is_some() {
            yield Ok(consensus_event(&room, now));
        }
        if let Some(event) = typing_event(room.next_speaker_id.as_deref()) {
            yield Ok(event);
        }
        if let Some(summary) = &room.previous_debate_summary {
            yield Ok(debate_context_event(summary));
        }
        info!(holder = %holder, history = messages.len(), "chatroom stream connected");

        let mut last_index = app.store.message_index().await.unwrap_or(0);

        loop {
            let now = now_ms();
            let (due, range) = match app.store.state().await {
                Ok(Some(room)) => {
                    let range = cadence.interval_for(room.phase);
                    let interval = range.sample(&mut rand::thread_rng());
                    (message_due(&room, now, interval), range)
                }
                Ok(None) => (true, cadence.debate),
                Err(e) => {
                    warn!(error = %e, "failed to load chatroom state");
                    (false, cadence.debate)
                }
            };

            let locked = due && match app.store.acquire_lock(&holder).await {
                Ok(locked) => locked,
                Err(e) => {
                    warn!(error = %e, "lock acquire failed");
                    false
                }
            };

            if locked {
                match app.engine.initialize(now_ms()).await {
                    Ok(fresh) if message_due(&fresh, now_ms(), range.floor_ms()) => {
                        if let Some(event) = typing_event(fresh.next_speaker_id.as_deref()) {
                            yield Ok(event);
                        }
                        match generate(&app, fresh).await {
                            Ok(outcome) => {
                                for event in outcome_events(&outcome, now_ms()) {
                                    yield Ok(event);
                                }
                                if let GenerationOutcome::Message(result) = &outcome {
                                    app.bus.publish(VaultEvent::ConsensusUpdated(
                                        consensus_update(&result.state, now_ms()),
                                    ));
                                    tokio::time::sleep(typing_delay).await;
                                    if let Some(event) = typing_event(result.state.next_speaker_id.as_deref()) {
                                        yield Ok(event);
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(holder = %holder, error = %e, "message generation failed");
                                yield Ok(system_error(
                                    "Message generation failed - will retry on next cycle".to_string(),
                                ));
                            }
                        }
                        last_index = app.store.message_index().await.unwrap_or(last_index);
                    }
                    Ok(_) => debug!(holder = %holder, "another connection generated first"),
                    Err(e) => {
                        warn!(error = %e, "failed to reload chatroom state");
                        yield Ok(system_error(format!("Chatroom state unavailable: {e}")));
                    }
                }
                if let Err(e) = app.store.release_lock(&holder).await {
                    warn!(holder = %holder, error = %e, "lock release failed");
                }
            } else {
                match app.store.messages_since(last_index).await {
                    Ok((fresh, index)) => {
                        if !fresh.is_empty() {
                            debug!(count = fresh.len(), index, "relaying messages from another generator");
                            for message in &fresh {
                                yield Ok(sse_event("message", message));
                            }
                            if let Ok(Some(room)) = app.store.state().await {
                                yield Ok(consensus_event(&room, now_ms()));
                            }
                        }
                        last_index = index;
                    }
                    Err(e) => warn!(error = %e, "poll for new messages failed"),
                }
            }

            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_due() {
        let mut room = ChatRoomState::new(1_000);
        assert!(message_due(&room, 1_000, 60_000));

        room.message_count = 3;
        room.last_message_at = 1_000;
        assert!(!message_due(&room, 30_000, 60_000));
        assert!(message_due(&room, 61_000, 60_000));
    }

    #[test]
    fn test_lock_id_shape() {
        let id = lock_id(1_700_000_000_000);
        assert!(id.starts_with("sse_1700000000000_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_typing_for_unknown_persona() {
        assert!(typing_event(None).is_none());
        assert!(typing_event(Some("nobody")).is_none());
    }
}
