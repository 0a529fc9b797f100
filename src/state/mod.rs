//! Order state with durable persistence
//!
//! Handles:
//! - The order model and its per-leg state machine
//! - An in-memory order index with per-order locks
//! - File or PostgreSQL backed records and watcher checkpoints

pub mod order;
mod postgres;
mod records;
mod store;

pub use order::{
    ActionRecord, ActionState, Fill, FillRequest, LegObservation, LockState, Order, OrderRequest,
    OrderStatus, TxObservation,
};
pub use postgres::PgRecordStore;
pub use records::{FileRecordStore, RecordStore};
pub use store::OrderStore;
