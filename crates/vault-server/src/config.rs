use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use vault_coordination::bridge::BridgeConfig;
use vault_coordination::chatroom::{ChatroomConfig, HistoryConfig, Phase};

/// Command-line overrides, applied after the config file and environment.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:3000
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory for the RocksDB store (heavy-state builds)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Asset the chatroom debates and the council analyses
    #[arg(long)]
    pub asset: Option<String>,
}

/// Uniformly jittered interval between `min_ms` and `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl IntervalRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        if self.max_ms > self.min_ms {
            rng.gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        }
    }

    /// Shortest gap accepted once the generation lock is held.
    pub fn floor_ms(&self) -> u64 {
        self.min_ms * 4 / 5
    }
}

/// Cadence of the SSE loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub debate: IntervalRange,
    pub cooldown: IntervalRange,
    pub poll_ms: u64,
    pub keepalive_ms: u64,
    pub typing_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            debate: IntervalRange::new(60_000, 90_000),
            cooldown: IntervalRange::new(120_000, 180_000),
            poll_ms: 5_000,
            keepalive_ms: 15_000,
            typing_delay_ms: 2_000,
        }
    }
}

impl StreamConfig {
    /// DEBATE and CONSENSUS share the faster cadence.
    pub fn interval_for(&self, phase: Phase) -> IntervalRange {
        match phase {
            Phase::Debate | Phase::Consensus => self.debate,
            Phase::Cooldown => self.cooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Open and close paper positions on council verdicts.
    pub auto_execute: bool,
    /// USD notional per position.
    pub position_size: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            auto_execute: false,
            position_size: vault_coordination::trading::DEFAULT_POSITION_SIZE,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub bind: String,
    /// RocksDB directory; in-memory storage when unset.
    pub data_dir: Option<PathBuf>,
    /// Bearer token required by the cron endpoint when set.
    pub cron_secret: Option<String>,
    pub stream: StreamConfig,
    pub chatroom: ChatroomConfig,
    pub history: HistoryConfig,
    pub bridge: BridgeConfig,
    pub trading: TradingConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            data_dir: None,
            cron_secret: None,
            stream: StreamConfig::default(),
            chatroom: ChatroomConfig::default(),
            history: HistoryConfig::default(),
            bridge: BridgeConfig::default(),
            trading: TradingConfig::default(),
        }
    }
}

impl VaultConfig {
    /// File, then process environment, then command line.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse TOML")
    }

    /// Overrides from `VAULT_BIND`, `VAULT_DATA_DIR`, `CRON_SECRET` and
    /// `VAULT_ASSET`. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(bind) = get("VAULT_BIND") {
            self.bind = bind;
        }
        if let Some(dir) = get("VAULT_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(secret) = get("CRON_SECRET") {
            self.cron_secret = Some(secret);
        }
        if let Some(asset) = get("VAULT_ASSET") {
            self.set_asset(&asset);
        }
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = &cli.bind {
            self.bind = bind.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.data_dir = Some(dir.clone());
        }
        if let Some(asset) = &cli.asset {
            self.set_asset(asset);
        }
    }

    /// The chatroom and the bridge always talk about the same asset.
    fn set_asset(&mut self, asset: &str) {
        let asset = asset.trim().to_ascii_uppercase();
        self.chatroom.asset = asset.clone();
        self.bridge.asset = asset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.bind, "0.0.0.0:3000");
        assert_eq!(config.stream.poll_ms, 5_000);
        assert_eq!(config.stream.keepalive_ms, 15_000);
        assert_eq!(config.bridge.threshold, 80);
        assert!(!config.trading.auto_execute);
        assert!(config.cron_secret.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VaultConfig::from_toml(
            r#"
            bind = "127.0.0.1:8080"

            [stream]
            poll_ms = 1000

            [trading]
            auto_execute = true
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.stream.poll_ms, 1_000);
        assert_eq!(config.stream.debate, IntervalRange::new(60_000, 90_000));
        assert!(config.trading.auto_execute);
        assert_eq!(config.trading.position_size, 1_000.0);
        assert_eq!(config.chatroom.consensus_threshold, 80);
    }

    #[test]
    fn test_bad_toml_is_error() {
        assert!(VaultConfig::from_toml("bind = [").is_err());
    }

    #[test]
    fn test_env_then_cli_precedence() {
        let mut config = VaultConfig::default();
        config.apply_env(lookup(&[
            ("VAULT_BIND", "0.0.0.0:4000"),
            ("CRON_SECRET", "s3cret"),
            ("VAULT_ASSET", "eth"),
            ("VAULT_DATA_DIR", "  "),
        ]));
        assert_eq!(config.bind, "0.0.0.0:4000");
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.chatroom.asset, "ETH");
        assert_eq!(config.bridge.asset, "ETH");
        assert!(config.data_dir.is_none());

        let cli = Cli {
            bind: Some("127.0.0.1:5000".into()),
            asset: Some("SOL".into()),
            ..Cli::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.bind, "127.0.0.1:5000");
        assert_eq!(config.chatroom.asset, "SOL");
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_interval_sampling() {
        let mut rng = StdRng::seed_from_u64(9);
        let range = IntervalRange::new(60_000, 90_000);
        for _ in 0..50 {
            let ms = range.sample(&mut rng);
            assert!((60_000..=90_000).contains(&ms));
        }
        assert_eq!(range.floor_ms(), 48_000);
        assert_eq!(IntervalRange::new(5, 5).sample(&mut rng), 5);
    }

    #[test]
    fn test_interval_for_phase() {
        let stream = StreamConfig::default();
        assert_eq!(stream.interval_for(Phase::Consensus), stream.debate);
        assert_eq!(stream.interval_for(Phase::Cooldown), stream.cooldown);
    }
}
