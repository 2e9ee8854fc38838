//! Cross-context send coordination.
//!
//! Multiple consoles (tabs, windows, processes) may be open on the same
//! conversation; only one of them may send at a time. A claim record in a
//! shared store acts as the mutex, with a staleness window so crashed
//! contexts cannot wedge a conversation forever.

mod claim;
mod store;

pub use claim::{sending_key, unix_millis, ClaimOutcome, ClaimRecord, SendCoordinator, CLAIM_TTL};
pub use store::{FileStore, KeyChange, MemoryStore, SharedStore, StoreError};
