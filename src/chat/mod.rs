//! The chat turn engine: per-turn state machine, streaming delivery, and
//! running-turn bookkeeping.

mod engine;
mod queue;
mod tracker;
mod turn;

pub use queue::{QueueItem, ResponseQueue};
pub use tracker::{TurnSnapshot, TurnTracker, default_tracker};
pub use turn::{ChatHandle, ChatTurn, ChatTurnBuilder, ChunkCallback, Registries, TurnShared};
