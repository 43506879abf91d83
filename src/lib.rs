pub mod config;
pub mod math;
pub mod network;
pub mod sync;
pub mod voxel;
pub mod wire;
pub mod world;

use config::SyncConfig;
use network::transport::Broadcaster;
use std::sync::Arc;
use sync::SyncLoop;
use world::{StoreError, WorldStateStore};

/// Opens the world named by `config.state_path`, or an empty one when no file
/// exists yet. Voxel decodes use `config.voxel_limits` either way.
pub fn open_world(config: &SyncConfig) -> Result<Arc<WorldStateStore>, StoreError> {
    let store = match &config.state_path {
        Some(path) if path.exists() => WorldStateStore::read_from_disk_with_limits(path, config.voxel_limits)?,
        _ => WorldStateStore::new().with_voxel_limits(config.voxel_limits),
    };
    Ok(Arc::new(store))
}

/// Loads the world and runs its sync loop until `config.max_ticks`.
pub fn run(config: SyncConfig, broadcaster: Box<dyn Broadcaster>) -> Result<u64, StoreError> {
    let store = open_world(&config)?;
    log::info!(
        "[worldsync] serving {} objects and {} avatars",
        store.object_count(),
        store.avatar_count()
    );
    let mut sync = SyncLoop::new(store, broadcaster, config);
    Ok(sync.run())
}
