//! Chatroom Debate: Persona Turn-Taking and Consensus Cycle
//!
//! Seventeen personas argue about the market one message at a time. Each
//! debate message carries a sentiment tag; a decayed, confidence-weighted
//! rolling vote over those tags drives the phase machine.
//!
//! # Tick Flow
//!
//! ```text
//! [cooldown over?] → pick speaker → persuasion / stance flip → prompt
//!        │               │                                      │
//!        │      preselected | moderator | weighted random        ▼
//!        │                                               call persona model
//!        │                                                 │          │
//!        │                                              failed       reply
//!        │                                                 │          │
//!        │                                             Skipped   parse + refs
//!        │                                                            │
//!        └──────────────── rolling consensus → phase edge → preselect next
//! ```

pub mod consensus;
pub mod engine;
pub mod history;
pub mod persuasion;
pub mod phase;
pub mod prompts;
pub mod response;
pub mod store;
pub mod summary;
pub mod types;
pub mod typing;

pub use consensus::rolling_consensus;
pub use engine::{
    ChatroomConfig, ChatroomEngine, ChatroomError, ChatroomResult, GenerationOutcome,
    GenerationResult,
};
pub use history::{CleanupReport, HistoryConfig, HistoryStatus, HistoryView, RollingHistory};
pub use persuasion::{ConvictionLevel, DebateStats, PersuasionBook, PersuasionState};
pub use phase::{CooldownWindow, PhaseChange, TransitionError};
pub use store::ChatroomStore;
pub use summary::debate_context;
pub use types::{
    ChatMessage, ChatRoomState, ConsensusReading, ConsensusSnapshot, DebateSummary, Phase,
    Sentiment, SnapshotReason, StanceChangeRecord,
};
pub use typing::TypingEstimate;
