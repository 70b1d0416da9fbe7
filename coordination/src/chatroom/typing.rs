//! Typing indicator timing.
//!
//! Durations imitate a human typist: 50-80 ms per character, scaled by a
//! per-persona speed, jittered ±20% and clamped to 0.5-8 s.

use std::ops::RangeInclusive;

use rand::Rng;
use serde::Serialize;

use crate::personas::Persona;

const MS_PER_CHAR: RangeInclusive<f64> = 50.0..=80.0;
const VARIANCE: f64 = 0.2;
const MIN_DURATION_MS: f64 = 500.0;
const MAX_DURATION_MS: f64 = 8000.0;
const DEFAULT_LENGTH: (usize, usize) = (100, 250);

/// Speed multiplier for a persona; below 1.0 types faster.
pub fn speed_modifier(persona: &Persona) -> f64 {
    match persona.id {
        "nxbl" => 0.85,
        "exchangeflow" => 0.88,
        "0xviv" => 0.9,
        "macromaven" => 1.1,
        "ozymandias" | "just_a_plumber" => 1.15,
        "hodljenny" => 1.2,
        _ => match persona.model_id {
            "deepseek" => 0.95,
            "minimax" => 1.05,
            _ => 1.0,
        },
    }
}

/// Typical message length range in characters.
pub fn length_range(persona: &Persona) -> (usize, usize) {
    match persona.id {
        "nxbl" => (30, 80),
        "sats_stacker" | "the_intern" | "gas_goblin" | "hodljenny" => (80, 180),
        "exchangeflow" => (80, 200),
        "just_a_plumber" => (120, 300),
        "uncle_bags" | "regulatory_rick" | "macromaven" | "panicsellpaul" => (120, 280),
        "0xviv" | "ser_fumbles" => (120, 260),
        "moonvember" | "quantumrug" => (100, 240),
        "ozymandias" => (140, 320),
        _ => DEFAULT_LENGTH,
    }
}

/// Computed typing duration with the inputs that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEstimate {
    pub duration_ms: u64,
    pub ms_per_char: f64,
    pub char_count: usize,
    pub persona_modifier: f64,
}

/// Typing duration for a message of `char_count` characters.
pub fn duration_for<R: Rng + ?Sized>(
    char_count: usize,
    persona: Option<&Persona>,
    rng: &mut R,
) -> TypingEstimate {
    let persona_modifier = persona.map_or(1.0, speed_modifier);
    let ms_per_char = rng.gen_range(MS_PER_CHAR) * persona_modifier;
    let variance = 1.0 + rng.gen_range(-VARIANCE..=VARIANCE);
    let raw = char_count as f64 * ms_per_char * variance;
    let clamped = raw.clamp(MIN_DURATION_MS, MAX_DURATION_MS);
    TypingEstimate {
        duration_ms: ((clamped / 100.0).round() * 100.0) as u64,
        ms_per_char,
        char_count,
        persona_modifier,
    }
}

/// Predicted typing duration before the message exists.
pub fn estimate<R: Rng + ?Sized>(persona: &Persona, rng: &mut R) -> TypingEstimate {
    let (min, max) = length_range(persona);
    let chars = rng.gen_range(min..=max);
    duration_for(chars, Some(persona), rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::personas;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_modifiers_and_ranges() {
        let nxbl = personas::by_id("nxbl").unwrap();
        assert_eq!(speed_modifier(nxbl), 0.85);
        assert_eq!(length_range(nxbl), (30, 80));

        let chart = personas::by_id("chartsurgeon").unwrap();
        assert_eq!(speed_modifier(chart), 0.95);
        assert_eq!(length_range(chart), DEFAULT_LENGTH);
    }

    #[test]
    fn test_duration_is_clamped_and_rounded() {
        let mut rng = StdRng::seed_from_u64(7);
        for chars in [0, 3, 40, 150, 10_000] {
            let t = duration_for(chars, None, &mut rng);
            assert!((500..=8000).contains(&t.duration_ms), "{t:?}");
            assert_eq!(t.duration_ms % 100, 0);
        }
        assert_eq!(duration_for(1, None, &mut rng).duration_ms, 500);
        assert_eq!(duration_for(100_000, None, &mut rng).duration_ms, 8000);
    }

    #[test]
    fn test_estimate_uses_persona_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let persona = personas::by_id("ozymandias").unwrap();
        for _ in 0..20 {
            let t = estimate(persona, &mut rng);
            assert!((140..=320).contains(&t.char_count));
            assert_eq!(t.persona_modifier, 1.15);
        }
    }
}
