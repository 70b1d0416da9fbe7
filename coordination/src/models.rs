//! Analyst model registry.
//!
//! Five LLM endpoints serve both the chatroom personas and the trading
//! council. Each council analyst has a role prompt; when its own model is
//! down the council walks [`fallbacks_for`] in order.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::caller::CallError;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1_000..=300_000;

/// Wire protocol spoken by a model endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// `/chat/completions`
    OpenAi,
    /// `/messages`
    Anthropic,
    /// `:generateContent`
    Google,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    pub provider: Provider,
    pub system_prompt: String,
    pub timeout_ms: u64,
}

const RESPONSE_FORMAT: &str = "Signal guidelines:\n- BUY: the evidence in your specialty points clearly up\n- SELL: the evidence points clearly down\n- HOLD: mixed, sideways or uncertain\n\nConfidence (0-100): 80+ means multiple strongly aligned signals, 60-79 good alignment with some conflict, 40-59 mixed, below 40 weak or contradictory.\n\nRespond with ONLY a JSON object in this exact format:\n{\"signal\": \"buy\" | \"sell\" | \"hold\", \"confidence\": 0-100, \"reasoning\": \"specific analysis with numbers, levels and timeframes\"}\n\nBe specific. Avoid vague language. No text outside the JSON object.";

fn analyst_prompt(name: &str, focus: &str, steps: &[&str]) -> String {
    let steps: Vec<String> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {s}", i + 1))
        .collect();
    format!(
        "You are the {name}, an expert crypto market analyst specializing in {focus}.\n\nWhen analyzing an asset:\n{}\n\n{RESPONSE_FORMAT}",
        steps.join("\n")
    )
}

struct Builtin {
    id: &'static str,
    name: &'static str,
    role: &'static str,
    base_url: &'static str,
    api_key_env: &'static str,
    model: &'static str,
    provider: Provider,
    focus: &'static str,
    steps: &'static [&'static str],
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "deepseek",
        name: "Momentum Hunter",
        role: "Technical Analysis & Trend Detection",
        base_url: "https://api.deepseek.com/v1",
        api_key_env: "DEEPSEEK_API_KEY",
        model: "deepseek-chat",
        provider: Provider::OpenAi,
        focus: "price action, momentum indicators and trend structure",
        steps: &[
            "Identify the primary trend (up, down, sideways) with evidence",
            "Name key support and resistance levels",
            "Cite momentum readings (RSI, MACD, Bollinger Bands)",
            "Check whether volume confirms or diverges",
            "Call out any pattern formations",
        ],
    },
    Builtin {
        id: "kimi",
        name: "Whale Watcher",
        role: "Large Holder Movements & Accumulation Patterns",
        base_url: "https://api.kimi.com/coding/v1",
        api_key_env: "KIMI_API_KEY",
        model: "k2p5",
        provider: Provider::Anthropic,
        focus: "large holder behavior and institutional flows",
        steps: &[
            "Describe recent large holder movements with sizes",
            "Read exchange flow direction (inflows sell pressure, outflows accumulation)",
            "Note institutional signals and dormant wallet activity",
            "Track concentration among top holders",
        ],
    },
    Builtin {
        id: "minimax",
        name: "Sentiment Scout",
        role: "Social Sentiment & Community Buzz",
        base_url: "https://api.minimax.io/v1",
        api_key_env: "MINIMAX_API_KEY",
        model: "MiniMax-M2",
        provider: Provider::OpenAi,
        focus: "social sentiment and community dynamics",
        steps: &[
            "Quantify current sentiment across social channels",
            "Identify narratives gaining or losing traction",
            "Reference the Fear & Greed index where relevant",
            "Note influencer commentary and search interest",
        ],
    },
    Builtin {
        id: "glm",
        name: "On-Chain Oracle",
        role: "On-Chain Metrics & TVL Analysis",
        base_url: "https://api.z.ai/api/anthropic/v1",
        api_key_env: "GLM_API_KEY",
        model: "glm-4.6",
        provider: Provider::Anthropic,
        focus: "on-chain metrics and network fundamentals",
        steps: &[
            "Report TVL trends with numbers",
            "Cite active address and transaction growth",
            "Assess fees, protocol revenue and staking ratios",
            "Mention bridge flows and cross-chain activity",
        ],
    },
    Builtin {
        id: "gemini",
        name: "Risk Manager",
        role: "Risk Assessment & Portfolio Exposure",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        api_key_env: "GEMINI_API_KEY",
        model: "gemini-2.5-flash",
        provider: Provider::Google,
        focus: "risk assessment; high confidence means low risk",
        steps: &[
            "State the volatility regime with metrics",
            "Report funding rates and derivatives positioning",
            "Assess correlation with BTC and macro markets",
            "Note regulatory or geopolitical catalysts",
            "Evaluate risk/reward and liquidation zones",
        ],
    },
];

impl ModelConfig {
    fn from_builtin(b: &Builtin) -> Self {
        Self {
            id: b.id.to_string(),
            name: b.name.to_string(),
            role: b.role.to_string(),
            base_url: b.base_url.to_string(),
            api_key_env: b.api_key_env.to_string(),
            model: b.model.to_string(),
            provider: b.provider,
            system_prompt: analyst_prompt(b.name, b.focus, b.steps),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Ordered fallback models for `id`.
pub fn fallbacks_for(id: &str) -> &'static [&'static str] {
    match id {
        "deepseek" => &["minimax", "glm", "kimi", "gemini"],
        "kimi" => &["deepseek", "minimax", "glm", "gemini"],
        "minimax" => &["deepseek", "kimi", "glm", "gemini"],
        "glm" => &["deepseek", "minimax", "kimi", "gemini"],
        "gemini" => &["deepseek", "minimax", "kimi", "glm"],
        _ => &[],
    }
}

/// All known models plus the subset selected for the council.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelConfig>,
    active: Vec<String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let models: Vec<ModelConfig> = BUILTINS.iter().map(ModelConfig::from_builtin).collect();
        let active = models.iter().map(|m| m.id.clone()).collect();
        Self { models, active }
    }
}

impl ModelRegistry {
    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    ///
    /// Reads `MODEL_<ID>_MODEL`, `MODEL_<ID>_BASE_URL`, `MODEL_<ID>_TIMEOUT`
    /// and the `CONSENSUS_AI_MODELS` selection.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut registry = Self::default();

        for model in &mut registry.models {
            let prefix = format!("MODEL_{}", model.id.to_ascii_uppercase());
            if let Some(name) = lookup(&format!("{prefix}_MODEL")).filter(|v| !v.trim().is_empty()) {
                model.model = name.trim().to_string();
            }
            if let Some(url) = lookup(&format!("{prefix}_BASE_URL")).filter(|v| !v.trim().is_empty()) {
                model.base_url = url.trim().trim_end_matches('/').to_string();
            }
            if let Some(raw) = lookup(&format!("{prefix}_TIMEOUT")) {
                match raw.trim().parse::<u64>() {
                    Ok(ms) if TIMEOUT_RANGE.contains(&ms) => model.timeout_ms = ms,
                    _ => warn!(model = %model.id, value = %raw, "ignoring out-of-range model timeout"),
                }
            }
        }

        if let Some(selection) = lookup("CONSENSUS_AI_MODELS") {
            registry.select(&selection);
        }
        registry
    }

    /// Restrict the active set to a comma-separated id list.
    ///
    /// Unknown ids are dropped; an empty result keeps every model.
    pub fn select(&mut self, selection: &str) {
        let mut active = Vec::new();
        for id in selection.split(',').map(|s| s.trim().to_ascii_lowercase()) {
            if id.is_empty() || id == "all" {
                continue;
            }
            if self.get(&id).is_none() {
                warn!(model = %id, "unknown model in selection, ignoring");
            } else if !active.contains(&id) {
                active.push(id);
            }
        }
        self.active = if active.is_empty() {
            self.models.iter().map(|m| m.id.clone()).collect()
        } else {
            active
        };
    }

    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn all(&self) -> &[ModelConfig] {
        &self.models
    }

    /// Models selected for council analysis, in registry order of selection.
    pub fn active(&self) -> Vec<&ModelConfig> {
        self.active.iter().filter_map(|id| self.get(id)).collect()
    }

    /// API key for `id` from its configured environment variable.
    pub fn api_key(&self, id: &str) -> Result<String, CallError> {
        let model = self
            .get(id)
            .ok_or_else(|| CallError::UnknownModel(id.to_string()))?;
        std::env::var(&model.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| CallError::MissingApiKey(model.api_key_env.clone()))
    }
}
