//! Shared agent state: the filesystem-mediated control plane.
//!
//! Launchers, control commands and UI clients coordinate only through
//! this store. Records take no locks; each is replaced whole and the last
//! writer wins. Per-task concurrency slots are the one place that uses
//! advisory file locks.

pub mod control;
mod file;
mod memory;
mod record;
mod scope;
mod slots;
mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(test)]
pub(crate) use memory::RejectingStore;
pub use record::{AgentId, AgentRecord, AgentStatus, ExitReason, TerminateMode, Usage};
pub use scope::Scope;
pub use slots::{SlotGuard, TaskSlots, SLOT_POLL_INTERVAL};
pub use store::{AgentStore, ChangeFeed, SharedStore, StoreEvent};
