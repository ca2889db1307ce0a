pub mod config;
pub mod id;

pub use config::{PoolerConfig, RuleConfig, StorageConfig};
pub use id::{ClientId, IdAllocator, ServerId};
