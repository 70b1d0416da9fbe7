//! Phase state machine for the debate cycle.
//!
//! ```text
//! DEBATE ──(strength ≥ threshold, non-neutral)──► CONSENSUS
//!    ▲                                              │
//!    │                                   (2 consensus messages)
//!    │                                              ▼
//!    └──────────(now ≥ cooldownEndsAt)────────── COOLDOWN
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::types::{ChatRoomState, ConsensusReading, Phase};

impl Phase {
    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [Phase] {
        match self {
            Self::Debate => &[Self::Consensus],
            Self::Consensus => &[Self::Cooldown],
            Self::Cooldown => &[Self::Debate],
        }
    }

    pub fn can_transition_to(self, to: Phase) -> bool {
        self.valid_transitions().contains(&to)
    }
}

/// Error for invalid phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid phase transition {} → {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// A recorded phase edge, also the `phase_change` event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    pub at: i64,
    pub cooldown_ends_at: Option<i64>,
}

/// Random cooldown length range, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CooldownWindow {
    pub min_minutes: f64,
    pub max_minutes: f64,
}

impl Default for CooldownWindow {
    fn default() -> Self {
        Self {
            min_minutes: 15.0,
            max_minutes: 30.0,
        }
    }
}

impl CooldownWindow {
    /// Uniform sample of the cooldown length in milliseconds.
    pub fn sample_ms<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        let minutes = if self.max_minutes > self.min_minutes {
            rng.gen_range(self.min_minutes..self.max_minutes)
        } else {
            self.min_minutes
        };
        (minutes * 60_000.0).round() as i64
    }
}

/// Move `state` to `to`, applying the side effects of entering that phase.
///
/// Entering CONSENSUS schedules the cooldown end. Entering COOLDOWN keeps an
/// existing schedule. Entering DEBATE clears the schedule and the consensus.
pub fn transition<R: Rng + ?Sized>(
    state: &mut ChatRoomState,
    to: Phase,
    now: i64,
    window: CooldownWindow,
    rng: &mut R,
) -> Result<PhaseChange, TransitionError> {
    let from = state.phase;
    if !from.can_transition_to(to) {
        return Err(TransitionError { from, to });
    }

    match to {
        Phase::Consensus => {
            state.cooldown_ends_at = Some(now + window.sample_ms(rng));
        }
        Phase::Cooldown => {
            if state.cooldown_ends_at.is_none() {
                state.cooldown_ends_at = Some(now + window.sample_ms(rng));
            }
        }
        Phase::Debate => {
            state.cooldown_ends_at = None;
            state.set_consensus(ConsensusReading::default());
        }
    }
    state.phase = to;
    state.phase_started_at = now;

    Ok(PhaseChange {
        from,
        to,
        at: now,
        cooldown_ends_at: state.cooldown_ends_at,
    })
}

/// Whether a COOLDOWN room is due to reopen the debate.
///
/// A cooldown with no scheduled end is treated as expired so the room
/// cannot stall.
pub fn cooldown_expired(state: &ChatRoomState, now: i64) -> bool {
    state.phase == Phase::Cooldown && state.cooldown_ends_at.map_or(true, |end| now >= end)
}
