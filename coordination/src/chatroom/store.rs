//! Chatroom persistence over the KV adapter.
//!
//! Key layout:
//!
//! | key                      | value                           |
//! |--------------------------|---------------------------------|
//! | `chatroom:messages`      | JSON array, newest last, ≤ 200  |
//! | `chatroom:state`         | [`ChatRoomState`]               |
//! | `chatroom:lock`          | holder id, 120 s TTL            |
//! | `chatroom:msg_index`     | monotonically increasing count  |
//! | `chatroom:persuasion`    | [`PersuasionBook`], 24 h TTL    |
//! | `chatroom:snapshots`     | JSON array, newest first        |
//! | `chatroom:last_cleanup`  | unix millis                     |
//! | `chatroom:debate_round`  | round counter                   |

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::persuasion::PersuasionBook;
use super::types::{ChatMessage, ChatRoomState, ConsensusSnapshot};
use crate::kv::{parse_counter, KvExt, KvResult, SharedKv};

pub const MESSAGES_KEY: &str = "chatroom:messages";
pub const STATE_KEY: &str = "chatroom:state";
pub const LOCK_KEY: &str = "chatroom:lock";
pub const MSG_INDEX_KEY: &str = "chatroom:msg_index";
pub const PERSUASION_KEY: &str = "chatroom:persuasion";
pub const SNAPSHOTS_KEY: &str = "chatroom:snapshots";
pub const LAST_CLEANUP_KEY: &str = "chatroom:last_cleanup";
pub const DEBATE_ROUND_KEY: &str = "chatroom:debate_round";

/// Hard cap on the stored message log.
pub const MAX_MESSAGES: usize = 200;
/// Generation lock lifetime; a crashed holder frees it after this.
pub const LOCK_TTL: Duration = Duration::from_secs(120);
const PERSUASION_TTL: Duration = Duration::from_secs(86_400);

/// Typed access to every chatroom record.
///
/// Clones share one write guard, so read-modify-write cycles on the message
/// log and snapshot list never interleave within a process.
#[derive(Clone)]
pub struct ChatroomStore {
    kv: SharedKv,
    writes: Arc<Mutex<()>>,
}

impl ChatroomStore {
    pub fn new(kv: SharedKv) -> Self {
        Self {
            kv,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn kv(&self) -> &SharedKv {
        &self.kv
    }

    // ── Messages ──

    pub async fn messages(&self) -> KvResult<Vec<ChatMessage>> {
        Ok(self.kv.get_json(MESSAGES_KEY).await?.unwrap_or_default())
    }

    async fn write_messages(&self, messages: &[ChatMessage]) -> KvResult<()> {
        let start = messages.len().saturating_sub(MAX_MESSAGES);
        let kept = &messages[start..];
        self.kv.set_json(MESSAGES_KEY, &kept, None).await
    }

    /// Replace the whole log.
    pub async fn set_messages(&self, messages: &[ChatMessage]) -> KvResult<()> {
        let _guard = self.writes.lock().await;
        self.write_messages(messages).await
    }

    /// Rewrite the log under the write guard.
    ///
    /// `edit` gets the current log and returns the log to store, or `None`
    /// to leave it untouched, plus a value handed back to the caller.
    pub async fn update_messages<T, F>(&self, edit: F) -> KvResult<T>
    where
        F: FnOnce(Vec<ChatMessage>) -> (Option<Vec<ChatMessage>>, T),
    {
        let _guard = self.writes.lock().await;
        let (next, out) = edit(self.messages().await?);
        if let Some(next) = next {
            self.write_messages(&next).await?;
        }
        Ok(out)
    }

    /// Append to the log, trim to [`MAX_MESSAGES`] and bump the index.
    ///
    /// Returns the new message index.
    pub async fn append_message(&self, message: &ChatMessage) -> KvResult<i64> {
        let _guard = self.writes.lock().await;
        let mut messages = self.messages().await?;
        messages.push(message.clone());
        self.write_messages(&messages).await?;
        let index = self.kv.incr(MSG_INDEX_KEY).await?;
        debug!(id = %message.id, index, "appended chat message");
        Ok(index)
    }

    pub async fn message_index(&self) -> KvResult<i64> {
        let raw = self.kv.get(MSG_INDEX_KEY).await?;
        parse_counter(MSG_INDEX_KEY, raw.as_deref())
    }

    /// Messages appended after a poller last saw `index`.
    ///
    /// Returns the new messages (oldest first) and the current index.
    pub async fn messages_since(&self, index: i64) -> KvResult<(Vec<ChatMessage>, i64)> {
        let current = self.message_index().await?;
        if current <= index {
            return Ok((Vec::new(), current));
        }
        let messages = self.messages().await?;
        let fresh = usize::try_from(current - index).unwrap_or(usize::MAX);
        let start = messages.len().saturating_sub(fresh);
        Ok((messages[start..].to_vec(), current))
    }

    // ── Room state ──

    pub async fn state(&self) -> KvResult<Option<ChatRoomState>> {
        self.kv.get_json(STATE_KEY).await
    }

    pub async fn set_state(&self, state: &ChatRoomState) -> KvResult<()> {
        self.kv.set_json(STATE_KEY, state, None).await
    }

    /// Load the state, writing a fresh DEBATE state if none exists.
    pub async fn initialize_if_empty(&self, now: i64) -> KvResult<ChatRoomState> {
        if let Some(state) = self.state().await? {
            return Ok(state);
        }
        let state = ChatRoomState::new(now);
        self.set_state(&state).await?;
        debug!("initialized chatroom state");
        Ok(state)
    }

    // ── Generation lock ──

    /// Try to take the generation lock for `holder`.
    pub async fn acquire_lock(&self, holder: &str) -> KvResult<bool> {
        self.kv.set_nx(LOCK_KEY, holder, Some(LOCK_TTL)).await
    }

    /// Release the lock if `holder` still owns it.
    pub async fn release_lock(&self, holder: &str) -> KvResult<bool> {
        match self.kv.get(LOCK_KEY).await? {
            Some(current) if current == holder => self.kv.del(LOCK_KEY).await,
            _ => Ok(false),
        }
    }

    pub async fn lock_holder(&self) -> KvResult<Option<String>> {
        self.kv.get(LOCK_KEY).await
    }

    // ── Persuasion ──

    pub async fn persuasion(&self) -> KvResult<Option<PersuasionBook>> {
        self.kv.get_json(PERSUASION_KEY).await
    }

    pub async fn set_persuasion(&self, book: &PersuasionBook) -> KvResult<()> {
        self.kv
            .set_json(PERSUASION_KEY, book, Some(PERSUASION_TTL))
            .await
    }

    // ── Snapshots ──

    /// Snapshots, newest first.
    pub async fn snapshots(&self) -> KvResult<Vec<ConsensusSnapshot>> {
        Ok(self.kv.get_json(SNAPSHOTS_KEY).await?.unwrap_or_default())
    }

    /// Put `snapshot` at the front of the list, keeping at most `max`.
    pub async fn push_snapshot(&self, snapshot: ConsensusSnapshot, max: usize) -> KvResult<()> {
        let _guard = self.writes.lock().await;
        let mut snapshots = self.snapshots().await?;
        snapshots.insert(0, snapshot);
        snapshots.truncate(max);
        self.kv.set_json(SNAPSHOTS_KEY, &snapshots, None).await
    }

    pub async fn last_cleanup(&self) -> KvResult<Option<i64>> {
        self.kv.get_json(LAST_CLEANUP_KEY).await
    }

    pub async fn set_last_cleanup(&self, at: i64) -> KvResult<()> {
        self.kv.set_json(LAST_CLEANUP_KEY, &at, None).await
    }

    /// Advance and return the debate round counter.
    pub async fn next_debate_round(&self) -> KvResult<u32> {
        let round = self.kv.incr(DEBATE_ROUND_KEY).await?;
        Ok(u32::try_from(round).unwrap_or(u32::MAX))
    }
}
