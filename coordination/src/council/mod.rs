//! Trading council
//!
//! Five analyst models vote buy / sell / hold on an asset, optionally with
//! chatroom context. Each analyst falls back through other providers when
//! its own model fails, keeping its role prompt so the vote still reflects
//! its specialty.

pub mod tally;

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use tally::{
    calculate_consensus, calculate_consensus_detailed, parse_analyst_response, AnalystOpinion,
    AnalystVote, ConsensusResult, ConsensusStatus, DetailedConsensus, Signal, StatusCounts,
    VoteCounts, VoteStatus,
};

use crate::caller::{CallError, CircuitBreaker, SharedCaller};
use crate::models::{fallbacks_for, ModelConfig, ModelRegistry};

/// Token ceiling for a single analyst reply.
pub const ANALYSIS_MAX_TOKENS: u32 = 1024;

/// Errors from council operations
#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("model call failed: {0}")]
    Call(#[from] CallError),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("no analyst models are active")]
    NoAnalysts,
}

/// Instruction prompt for one analysis round.
pub fn analysis_prompt(asset: &str, context: Option<&str>) -> String {
    let asset = asset.to_uppercase();
    let base = format!("Analyze {asset} for a trading signal.");

    match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(context) => format!(
            "{base}\n\n\
             Additional Context: {context}\n\n\
             Instructions:\n\
             1. Consider the provided context alongside your specialized expertise\n\
             2. Focus on actionable insights relevant to current market conditions\n\
             3. Be specific about key levels, metrics, or indicators\n\
             4. Provide a clear, concise reasoning for your signal\n\n\
             Remember: Respond ONLY with valid JSON in the exact format specified."
        ),
        None => format!(
            "{base}\n\n\
             Instructions:\n\
             1. Analyze current market conditions for {asset}\n\
             2. Apply your specialized analytical framework\n\
             3. Identify the most significant factors influencing the market\n\
             4. Provide clear, specific reasoning for your signal\n\
             5. Base confidence on the strength and alignment of your signals\n\n\
             Remember: Respond ONLY with valid JSON in the exact format specified."
        ),
    }
}

/// Runs the active analysts and tallies their votes.
pub struct TradingCouncil {
    caller: SharedCaller,
    registry: Arc<ModelRegistry>,
    breaker: Mutex<CircuitBreaker>,
}

impl TradingCouncil {
    pub fn new(caller: SharedCaller, registry: Arc<ModelRegistry>) -> Self {
        Self {
            caller,
            registry,
            breaker: Mutex::new(CircuitBreaker::default()),
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Mutex::new(breaker);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Query every active analyst concurrently and tally the votes.
    pub async fn run(
        &self,
        asset: &str,
        context: Option<&str>,
    ) -> Result<DetailedConsensus, CouncilError> {
        let analysts = self.registry.active();
        if analysts.is_empty() {
            return Err(CouncilError::NoAnalysts);
        }

        let prompt = analysis_prompt(asset, context);
        info!(asset, analysts = analysts.len(), with_context = context.is_some(), "Council convened");

        let votes = join_all(analysts.into_iter().map(|a| self.opinion(a, &prompt))).await;
        let detailed = calculate_consensus_detailed(votes, crate::now_ms());

        info!(
            asset,
            status = detailed.consensus_status.as_str(),
            signal = ?detailed.consensus_signal,
            valid = detailed.status_counts.success,
            "Council finished"
        );
        Ok(detailed)
    }

    /// One analyst's vote, walking the fallback ladder on failure.
    pub async fn opinion(&self, analyst: &ModelConfig, prompt: &str) -> AnalystVote {
        let started = Instant::now();

        let primary_error = match self.ask(&analyst.id, &analyst.system_prompt, prompt).await {
            Ok(opinion) => {
                return AnalystVote::success(
                    &analyst.id,
                    analyst.name.clone(),
                    &analyst.id,
                    opinion,
                    elapsed_ms(started),
                )
            }
            Err(e) => e.to_string(),
        };
        warn!(analyst = %analyst.id, error = %primary_error, "Primary failed, trying fallbacks");

        for fallback_id in fallbacks_for(&analyst.id) {
            let Some(fallback) = self.registry.get(fallback_id) else {
                continue;
            };
            match self.ask(&fallback.id, &analyst.system_prompt, prompt).await {
                Ok(opinion) => {
                    info!(analyst = %analyst.id, via = %fallback.id, "Fallback answered");
                    return AnalystVote::success(
                        &analyst.id,
                        format!("{} (via {})", analyst.name, fallback.name),
                        &fallback.id,
                        opinion,
                        elapsed_ms(started),
                    );
                }
                Err(CouncilError::Call(CallError::MissingApiKey(_)))
                | Err(CouncilError::CircuitOpen(_)) => continue,
                Err(e) => {
                    warn!(analyst = %analyst.id, fallback = %fallback.id, error = %e, "Fallback failed");
                }
            }
        }

        warn!(analyst = %analyst.id, "All fallbacks exhausted");
        AnalystVote::failed(
            &analyst.id,
            &analyst.name,
            format!("All models failed. Primary: {primary_error}"),
            elapsed_ms(started),
        )
    }

    /// Single attempt against `model_id`, feeding the circuit breaker.
    async fn ask(
        &self,
        model_id: &str,
        system_prompt: &str,
        prompt: &str,
    ) -> Result<AnalystOpinion, CouncilError> {
        if !self.breaker.lock().await.is_available(model_id) {
            return Err(CouncilError::CircuitOpen(model_id.to_string()));
        }

        let result = match self
            .caller
            .call(model_id, system_prompt, prompt, ANALYSIS_MAX_TOKENS)
            .await
        {
            Ok(text) => parse_analyst_response(&text),
            Err(e) => Err(CouncilError::Call(e)),
        };

        let mut breaker = self.breaker.lock().await;
        match &result {
            Ok(_) => breaker.record_success(model_id),
            // a missing key says nothing about the provider's health
            Err(CouncilError::Call(CallError::MissingApiKey(_))) => {}
            Err(_) => breaker.record_failure(model_id),
        }
        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::MockModelCaller;
    use std::time::Duration;

    const BUY: &str = r#"{"signal": "buy", "confidence": 80, "reasoning": "higher lows on the daily"}"#;

    fn registry(active: &str) -> Arc<ModelRegistry> {
        let mut registry = ModelRegistry::default();
        registry.select(active);
        Arc::new(registry)
    }

    #[test]
    fn test_prompt_with_and_without_context() {
        let plain = analysis_prompt("btc", None);
        assert!(plain.starts_with("Analyze BTC for a trading signal."));
        assert!(plain.contains("1. Analyze current market conditions for BTC"));

        let with = analysis_prompt("eth", Some("  chatroom is 85% bullish "));
        assert!(with.contains("Additional Context: chatroom is 85% bullish\n"));
        assert!(!with.contains("Analyze current market conditions"));

        assert_eq!(analysis_prompt("btc", Some("   ")), plain);
    }

    #[tokio::test]
    async fn test_primary_success() {
        let mut caller = MockModelCaller::new();
        caller
            .expect_call()
            .withf(|model, _, _, _| model == "kimi")
            .times(1)
            .returning(|_, _, _, _| Ok(BUY.to_string()));

        let council = TradingCouncil::new(Arc::new(caller), registry("kimi"));
        let analyst = council.registry().get("kimi").unwrap().clone();
        let vote = council.opinion(&analyst, "prompt").await;
        assert_eq!(vote.status, VoteStatus::Success);
        assert_eq!(vote.signal, Some(Signal::Buy));
        assert_eq!(vote.served_by, "kimi");
        assert_eq!(vote.model_name, analyst.name);
    }

    #[tokio::test]
    async fn test_fallback_keeps_role_prompt() {
        let registry = registry("kimi");
        let kimi_prompt = registry.get("kimi").unwrap().system_prompt.clone();

        let mut caller = MockModelCaller::new();
        caller
            .expect_call()
            .withf(|model, _, _, _| model == "kimi")
            .returning(|_, _, _, _| Err(CallError::Http { status: 500, body: "down".into() }));
        let expected = kimi_prompt.clone();
        caller
            .expect_call()
            .withf(move |model, system, _, _| model == "deepseek" && system == expected)
            .times(1)
            .returning(|_, _, _, _| Ok(BUY.to_string()));

        let council = TradingCouncil::new(Arc::new(caller), registry.clone());
        let analyst = registry.get("kimi").unwrap().clone();
        let vote = council.opinion(&analyst, "prompt").await;

        let deepseek = registry.get("deepseek").unwrap();
        assert_eq!(vote.status, VoteStatus::Success);
        assert_eq!(vote.model_id, "kimi");
        assert_eq!(vote.served_by, "deepseek");
        assert_eq!(vote.model_name, format!("{} (via {})", analyst.name, deepseek.name));
    }

    #[tokio::test]
    async fn test_all_failed_timeout_status() {
        let mut caller = MockModelCaller::new();
        caller
            .expect_call()
            .returning(|_, _, _, _| Err(CallError::Timeout(30_000)));

        let council = TradingCouncil::new(Arc::new(caller), registry("glm"));
        let analyst = council.registry().get("glm").unwrap().clone();
        let vote = council.opinion(&analyst, "prompt").await;
        assert_eq!(vote.status, VoteStatus::Timeout);
        assert!(vote.error.unwrap().starts_with("All models failed. Primary:"));
        assert_eq!(vote.signal, None);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_primary() {
        let mut caller = MockModelCaller::new();
        caller
            .expect_call()
            .withf(|model, _, _, _| model == "deepseek")
            .times(0)
            .returning(|_, _, _, _| Ok(BUY.to_string()));
        caller
            .expect_call()
            .withf(|model, _, _, _| model == "minimax")
            .times(1)
            .returning(|_, _, _, _| Ok(BUY.to_string()));

        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(600));
        breaker.record_failure("deepseek");
        let council =
            TradingCouncil::new(Arc::new(caller), registry("deepseek")).with_breaker(breaker);
        let analyst = council.registry().get("deepseek").unwrap().clone();
        let vote = council.opinion(&analyst, "prompt").await;
        assert_eq!(vote.served_by, "minimax");
    }

    #[tokio::test]
    async fn test_run_tallies_all_active() {
        let mut caller = MockModelCaller::new();
        caller
            .expect_call()
            .returning(|_, _, _, _| Ok(BUY.to_string()));

        let council = TradingCouncil::new(Arc::new(caller), Arc::new(ModelRegistry::default()));
        let detailed = council.run("BTC", None).await.unwrap();
        assert_eq!(detailed.individual_votes.len(), 5);
        assert!(detailed.reached());
        assert_eq!(detailed.consensus_strength.as_deref(), Some("5/5"));
    }
}
