//! Rolling one-hour message window with snapshot rollover.
//!
//! Messages older than the window are rolled into a [`ConsensusSnapshot`]
//! and dropped from the log. Snapshots are kept newest first, capped.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::consensus::rolling_consensus;
use super::store::{ChatroomStore, MAX_MESSAGES};
use super::summary::{argument_quality, top_arguments, truncate_chars};
use super::types::{
    ChatMessage, ChatRoomState, ConsensusSnapshot, KeyArguments, PersonaContribution, Sentiment,
    SnapshotReason, TimestampRange,
};
use crate::kv::KvResult;

const KEY_ARGUMENTS_PER_STANCE: usize = 3;
const TOP_CONTRIBUTORS: usize = 5;
const KEY_POINTS_PER_PERSONA: usize = 2;
const KEY_POINT_CHARS: usize = 120;

/// Window sizing and cleanup cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_age_ms: i64,
    pub max_messages: usize,
    pub cleanup_interval_ms: i64,
    pub max_snapshots: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 60 * 60 * 1000,
            max_messages: MAX_MESSAGES,
            cleanup_interval_ms: 5 * 60 * 1000,
            max_snapshots: 24,
        }
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: usize,
    pub remaining: usize,
    pub snapshot_created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatus {
    pub rolling_messages: usize,
    pub oldest_message_age_ms: Option<i64>,
    pub newest_message_age_ms: Option<i64>,
    pub snapshot_count: usize,
    pub last_cleanup: Option<i64>,
    pub window_ms: i64,
    pub max_snapshots: usize,
}

/// Recent messages plus the rollups that preceded them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub messages: Vec<ChatMessage>,
    pub snapshots: Vec<ConsensusSnapshot>,
    pub state: Option<ChatRoomState>,
    pub total_messages: usize,
    pub total_snapshots: usize,
    pub oldest_message_age_ms: Option<i64>,
    pub newest_message_age_ms: Option<i64>,
    pub rolling_window_hours: f64,
}

fn primary_stance(messages: &[&ChatMessage]) -> Sentiment {
    let mut counts: BTreeMap<Sentiment, usize> = BTreeMap::new();
    for m in messages {
        if let Some(s) = m.sentiment {
            *counts.entry(s).or_default() += 1;
        }
    }
    // ties go to bullish, then bearish
    Sentiment::ALL
        .iter()
        .rev()
        .copied()
        .max_by_key(|s| counts.get(s).copied().unwrap_or(0))
        .unwrap_or(Sentiment::Neutral)
}

fn contributions(messages: &[ChatMessage]) -> Vec<PersonaContribution> {
    let none = HashSet::new();
    let mut by_persona: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, m) in messages.iter().enumerate() {
        by_persona.entry(m.persona_id.as_str()).or_default().push(i);
    }

    let mut out: Vec<PersonaContribution> = by_persona
        .into_iter()
        .map(|(persona_id, indexes)| {
            let own: Vec<&ChatMessage> = indexes.iter().map(|&i| &messages[i]).collect();
            let mut ranked: Vec<(u8, usize)> = indexes
                .iter()
                .map(|&i| (argument_quality(messages, i, &none), i))
                .collect();
            ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            PersonaContribution {
                persona_id: persona_id.to_string(),
                handle: own[0].handle.clone(),
                message_count: own.len(),
                primary_stance: primary_stance(&own),
                key_points: ranked
                    .iter()
                    .take(KEY_POINTS_PER_PERSONA)
                    .map(|&(_, i)| truncate_chars(&messages[i].content, KEY_POINT_CHARS))
                    .collect(),
            }
        })
        .collect();
    out.sort_by(|a, b| b.message_count.cmp(&a.message_count));
    out.truncate(TOP_CONTRIBUTORS);
    out
}

/// Roll `messages` into a snapshot. `None` if there is nothing to roll.
pub fn build_snapshot<R: Rng + ?Sized>(
    messages: &[ChatMessage],
    reason: SnapshotReason,
    now: i64,
    rng: &mut R,
) -> Option<ConsensusSnapshot> {
    let start = messages.iter().map(|m| m.timestamp).min()?;
    let end = messages.iter().map(|m| m.timestamp).max()?;
    let reading = rolling_consensus(messages);
    let none = HashSet::new();
    let args = |stance| top_arguments(messages, stance, &none, KEY_ARGUMENTS_PER_STANCE);

    Some(ConsensusSnapshot {
        id: crate::make_id("snap", now, rng),
        timestamp: now,
        timestamp_range: TimestampRange { start, end },
        consensus_direction: reading.direction,
        consensus_strength: reading.strength,
        key_arguments_summary: KeyArguments {
            bullish: args(Sentiment::Bullish),
            bearish: args(Sentiment::Bearish),
            neutral: args(Sentiment::Neutral),
        },
        top_persona_contributions: contributions(messages),
        message_count: messages.len(),
        snapshot_reason: reason,
    })
}

fn ages(messages: &[ChatMessage], now: i64) -> (Option<i64>, Option<i64>) {
    let oldest = messages.iter().map(|m| m.timestamp).min().map(|t| now - t);
    let newest = messages.iter().map(|m| m.timestamp).max().map(|t| now - t);
    (oldest, newest)
}

/// Rolling-window maintenance over the chatroom store.
#[derive(Clone)]
pub struct RollingHistory {
    store: ChatroomStore,
    config: HistoryConfig,
}

impl RollingHistory {
    pub fn new(store: ChatroomStore, config: HistoryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Whether the cleanup interval has elapsed since the last pass.
    pub async fn cleanup_due(&self, now: i64) -> KvResult<bool> {
        Ok(match self.store.last_cleanup().await? {
            Some(at) => now - at >= self.config.cleanup_interval_ms,
            None => true,
        })
    }

    /// Drop expired and over-cap messages, rolling them into a snapshot.
    pub async fn cleanup(&self, now: i64) -> KvResult<CleanupReport> {
        let cutoff = now - self.config.max_age_ms;
        let max_messages = self.config.max_messages;
        let (rolled, remaining) = self
            .store
            .update_messages(|messages| {
                let (mut kept, mut rolled): (Vec<ChatMessage>, Vec<ChatMessage>) =
                    messages.into_iter().partition(|m| m.timestamp >= cutoff);
                let overflow = kept.len().saturating_sub(max_messages);
                rolled.extend(kept.drain(..overflow));
                let remaining = kept.len();
                let next = (!rolled.is_empty()).then_some(kept);
                (next, (rolled, remaining))
            })
            .await?;

        let snapshot = build_snapshot(
            &rolled,
            SnapshotReason::TimeWindowRollover,
            now,
            &mut rand::thread_rng(),
        );
        let snapshot_created = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            self.store
                .push_snapshot(snapshot, self.config.max_snapshots)
                .await?;
        }
        self.store.set_last_cleanup(now).await?;

        let report = CleanupReport {
            removed: rolled.len(),
            remaining,
            snapshot_created,
        };
        info!(
            removed = report.removed,
            remaining = report.remaining,
            snapshot = report.snapshot_created,
            "rolling history cleanup"
        );
        Ok(report)
    }

    /// Snapshot the current window without removing anything.
    pub async fn snapshot_now(
        &self,
        reason: SnapshotReason,
        now: i64,
    ) -> KvResult<Option<ConsensusSnapshot>> {
        let messages = self.store.messages().await?;
        let snapshot = build_snapshot(&messages, reason, now, &mut rand::thread_rng());
        if let Some(snapshot) = &snapshot {
            self.store
                .push_snapshot(snapshot.clone(), self.config.max_snapshots)
                .await?;
        }
        Ok(snapshot)
    }

    pub async fn status(&self, now: i64) -> KvResult<HistoryStatus> {
        let messages = self.store.messages().await?;
        let (oldest, newest) = ages(&messages, now);
        Ok(HistoryStatus {
            rolling_messages: messages.len(),
            oldest_message_age_ms: oldest,
            newest_message_age_ms: newest,
            snapshot_count: self.store.snapshots().await?.len(),
            last_cleanup: self.store.last_cleanup().await?,
            window_ms: self.config.max_age_ms,
            max_snapshots: self.config.max_snapshots,
        })
    }

    /// Newest `limit_messages` messages and `limit_snapshots` snapshots.
    pub async fn history_with_snapshots(
        &self,
        limit_messages: usize,
        limit_snapshots: usize,
        now: i64,
    ) -> KvResult<HistoryView> {
        let messages = self.store.messages().await?;
        let snapshots = self.store.snapshots().await?;
        let (oldest, newest) = ages(&messages, now);
        let start = messages.len().saturating_sub(limit_messages);
        Ok(HistoryView {
            total_messages: messages.len(),
            total_snapshots: snapshots.len(),
            messages: messages[start..].to_vec(),
            snapshots: snapshots.into_iter().take(limit_snapshots).collect(),
            state: self.store.state().await?,
            oldest_message_age_ms: oldest,
            newest_message_age_ms: newest,
            rolling_window_hours: self.config.max_age_ms as f64 / 3_600_000.0,
        })
    }
}
