//! HTLC Relayer - atomic swap coordination between bitcoin and ethereum
//!
//! Watches both chains for hashed-timelock locks, redeems and refunds, keeps
//! per-order swap state, and completes the counterpart redeem as soon as a
//! secret is revealed on either side.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod supervisor;
pub mod tx;
pub mod types;

pub use config::Settings;
pub use error::{RelayerError, RelayerResult};
pub use supervisor::{Relayer, RelayerStatus};
