pub mod account;
pub mod config;

pub use account::{Account, AccountSource, AccountStats, ModelLimit, StoreDocument};
pub use config::{PoolSettings, RuntimeConfig};
