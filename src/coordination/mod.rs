//! Coordination of HTLC events into order state and cross-chain actions
//!
//! The event processor:
//! 1. Drops re-delivered events by idempotency key
//! 2. Serializes events sharing a hashlock
//! 3. Folds each event into the orders holding its hashlock
//! 4. Plans redeems once a secret is revealed, and refunds once timelocks expire

pub mod idempotency;
pub mod processor;

pub use idempotency::{Claim, IdempotencyCache};
pub use processor::{EventOutcome, EventProcessor};
