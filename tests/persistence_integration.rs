use cgmath::Vector3;
use std::sync::Arc;
use worldsync::config::SyncConfig;
use worldsync::network::transport::RecordingBroadcaster;
use worldsync::sync::SyncLoop;
use worldsync::voxel::{Voxel, VoxelCodec, VoxelGroup, VoxelLimits};
use worldsync::world::{
    ClientId, ObjectType, StoreError, WorldMaterial, WorldObject, WorldStateStore,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn voxel_object() -> WorldObject {
    let mut ob = WorldObject::new(ObjectType::VoxelGroup)
        .with_pose(Vector3::new(-3.5, 0.25, 10.0), Vector3::new(0.0, 1.0, 0.0), 1.25);
    ob.materials = vec![
        WorldMaterial {
            colour_rgb: [0.8, 0.1, 0.1],
            colour_texture_url: "textures/brick.png".into(),
            ..WorldMaterial::default()
        },
        WorldMaterial::default(),
    ];
    ob.creator_id = ClientId(12);
    ob.created_time = 1_700_000_000_000_000;
    ob.mass = 120.0;
    let group = VoxelGroup::new(vec![
        Voxel::new(0, 0, 0, 0),
        Voxel::new(1, 0, 0, 1),
        Voxel::new(1, 5, -2, 0),
    ]);
    ob.set_voxel_group(&group, &VoxelCodec::new(VoxelLimits::default()))
        .expect("encode voxels");
    ob
}

#[test]
fn world_survives_disk_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worlds").join("main.bin");

    let store = WorldStateStore::new();
    let voxels = store.create_object(voxel_object());
    let mut hypercard = WorldObject::new(ObjectType::Hypercard);
    hypercard.content = "Welcome to the gallery".into();
    hypercard.script = "on_click: open".into();
    let card = store.create_object(hypercard);
    let doomed = store.create_object(WorldObject::default().with_model("models/old.glb"));
    store.mark_object_dead(doomed).unwrap();

    store.serialise_to_disk(&path).unwrap();
    let reloaded = WorldStateStore::read_from_disk(&path).unwrap();

    assert_eq!(reloaded.object_count(), 2);
    let original = store.lock();
    let loaded = reloaded.lock();
    assert_eq!(loaded.object(voxels), original.object(voxels));
    assert_eq!(loaded.object(card), original.object(card));
    assert!(loaded.object(doomed).is_none());
    assert_eq!(loaded.object(voxels).unwrap().voxel_group().len(), 3);
}

#[test]
fn reloaded_world_never_reuses_uids() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.bin");

    let store = WorldStateStore::new();
    let mut last = store.create_object(WorldObject::default());
    for _ in 0..4 {
        last = store.create_object(WorldObject::default());
    }
    store.serialise_to_disk(&path).unwrap();

    let reloaded = WorldStateStore::read_from_disk(&path).unwrap();
    let fresh = reloaded.create_object(WorldObject::default());
    assert!(fresh > last);
}

#[test]
fn rejects_files_that_are_not_worlds() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.bin");
    std::fs::write(&path, b"definitely not a world").unwrap();
    assert!(matches!(
        WorldStateStore::read_from_disk(&path),
        Err(StoreError::BadMagic(_))
    ));
    assert!(matches!(
        WorldStateStore::read_from_disk(&dir.path().join("missing.bin")),
        Err(StoreError::Io(_))
    ));
}

#[test]
fn sync_loop_saves_on_interval_when_changed() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autosave.bin");
    let config = SyncConfig::default()
        .with_save_interval_secs(1.0)
        .with_state_path(&path);

    let store = Arc::new(WorldStateStore::new());
    let mut sync = SyncLoop::new(store.clone(), Box::new(RecordingBroadcaster::new()), config.clone());
    store.create_object(WorldObject::default().with_model("models/tree.glb"));

    assert!(!sync.tick(0.0).saved);
    assert!(!sync.tick(0.5).saved);
    assert!(sync.tick(1.0).saved);
    assert!(path.exists());
    // Saved and nothing changed since.
    assert!(!sync.tick(2.5).saved);

    let reopened = worldsync::open_world(&config).unwrap();
    assert_eq!(reopened.object_count(), 1);
}

#[test]
fn open_world_starts_empty_without_a_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig::default().with_state_path(dir.path().join("new.bin"));
    let store = worldsync::open_world(&config).unwrap();
    assert_eq!(store.object_count(), 0);
}

#[test]
fn open_world_applies_configured_voxel_limits() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxels.bin");
    let store = WorldStateStore::new();
    let uid = store.create_object(voxel_object());
    store.serialise_to_disk(&path).unwrap();

    let strict = SyncConfig::default()
        .with_state_path(&path)
        .with_voxel_limits(VoxelLimits {
            max_voxels: 2,
            max_materials: 8,
        });
    let reopened = worldsync::open_world(&strict).unwrap();
    assert_eq!(reopened.voxel_codec().limits().max_voxels, 2);
    assert_eq!(reopened.voxel_group(uid), Some(VoxelGroup::default()));

    let roomy = worldsync::open_world(&SyncConfig::default().with_state_path(&path)).unwrap();
    assert_eq!(roomy.voxel_group(uid).map(|group| group.len()), Some(3));

    let fresh = worldsync::open_world(
        &SyncConfig::default()
            .with_state_path(dir.path().join("absent.bin"))
            .with_voxel_limits(VoxelLimits {
                max_voxels: 5,
                max_materials: 1,
            }),
    )
    .unwrap();
    assert_eq!(fresh.voxel_codec().limits().max_materials, 1);
}
