//! Key lifecycle engine: pool storage, replenishment, authorization and distribution

pub mod audit;
pub mod authorization;
pub mod distribution;
pub mod generator;
pub mod manager;
pub mod pool;
pub mod storage;

pub use audit::*;
pub use authorization::*;
pub use distribution::*;
pub use generator::*;
pub use manager::*;
pub use pool::*;
pub use storage::*;

use qkme_core::Result;
use std::path::Path;
use std::sync::Arc;

/// Open the key pool store described by `config`, backed by fjall at
/// `data_dir` or held in memory when no directory is given
pub fn open_pool(config: &PoolConfig, data_dir: Option<&Path>) -> Result<Arc<KeyPoolStore>> {
    let store = match data_dir {
        Some(path) => {
            let persistence = Arc::new(FjallStore::open(path)?);
            KeyPoolStore::with_persistence(persistence, config.max_key_count, config.retirement)?
        }
        None => KeyPoolStore::in_memory(config.max_key_count, config.retirement),
    };
    Ok(Arc::new(store))
}
