//! Describes the serialization formats so peers and tooling can detect drift.

use super::{OLDEST_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION, message_type};
use crate::world::serialize::{WORLD_MATERIAL_SERIALISATION_VERSION, WORLD_OBJECT_SERIALISATION_VERSION};
use once_cell::sync::Lazy;
use serde::Serialize;
use siphasher::sip::SipHasher24;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;

const STABLE_HASH_KEY_0: u64 = 0x0ddcc001feedface;
const STABLE_HASH_KEY_1: u64 = 0xabcdef0123456789;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionEntry {
    pub version: u32,
    pub change: &'static str,
}

/// What each world object record version introduced.
pub const WORLD_OBJECT_VERSION_HISTORY: &[VersionEntry] = &[
    VersionEntry { version: 1, change: "uid, model url, transform" },
    VersionEntry { version: 2, change: "materials" },
    VersionEntry { version: 3, change: "scale" },
    VersionEntry { version: 4, change: "script url" },
    VersionEntry { version: 5, change: "created time, creator id" },
    VersionEntry { version: 6, change: "content" },
    VersionEntry { version: 7, change: "object type" },
    VersionEntry { version: 8, change: "target url" },
    VersionEntry { version: 9, change: "raw voxels" },
    VersionEntry { version: 10, change: "inline script replaces script url" },
    VersionEntry { version: 11, change: "flags" },
    VersionEntry { version: 12, change: "compressed voxels replace raw voxels" },
    VersionEntry { version: 13, change: "lightmap url" },
    VersionEntry { version: 14, change: "translation" },
    VersionEntry { version: 15, change: "audio source url, audio volume" },
    VersionEntry { version: 16, change: "last modified time" },
    VersionEntry { version: 17, change: "mass, friction, restitution" },
    VersionEntry { version: 18, change: "max model lod level" },
    VersionEntry { version: 19, change: "world space aabb" },
    VersionEntry { version: 20, change: "centre of mass offset" },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageEntry {
    pub id: u32,
    pub name: &'static str,
}

pub const MESSAGE_TYPES: &[MessageEntry] = &[
    MessageEntry { id: message_type::AVATAR_CREATED, name: "AvatarCreated" },
    MessageEntry { id: message_type::AVATAR_DESTROYED, name: "AvatarDestroyed" },
    MessageEntry { id: message_type::AVATAR_TRANSFORM_UPDATE, name: "AvatarTransformUpdate" },
    MessageEntry { id: message_type::OBJECT_CREATED, name: "ObjectCreated" },
    MessageEntry { id: message_type::OBJECT_DESTROYED, name: "ObjectDestroyed" },
    MessageEntry { id: message_type::OBJECT_TRANSFORM_UPDATE, name: "ObjectTransformUpdate" },
    MessageEntry { id: message_type::OBJECT_FULL_UPDATE, name: "ObjectFullUpdate" },
    MessageEntry {
        id: message_type::OBJECT_PHYSICS_OWNERSHIP_TAKEN,
        name: "ObjectPhysicsOwnershipTaken",
    },
];

/// Computes the stable SipHash-2-4 identifier for a name.
pub fn stable_hash(name: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(STABLE_HASH_KEY_0, STABLE_HASH_KEY_1);
    name.hash(&mut hasher);
    hasher.finish()
}

/// Hash over every version and message id. Two builds with the same
/// fingerprint agree on the wire and disk formats.
pub static SCHEMA_FINGERPRINT: Lazy<u64> = Lazy::new(|| {
    let mut hasher = SipHasher24::new_with_keys(STABLE_HASH_KEY_0, STABLE_HASH_KEY_1);
    PROTOCOL_VERSION.hash(&mut hasher);
    WORLD_OBJECT_SERIALISATION_VERSION.hash(&mut hasher);
    WORLD_MATERIAL_SERIALISATION_VERSION.hash(&mut hasher);
    for entry in WORLD_OBJECT_VERSION_HISTORY {
        entry.version.hash(&mut hasher);
        entry.change.hash(&mut hasher);
    }
    for entry in MESSAGE_TYPES {
        entry.id.hash(&mut hasher);
        entry.name.hash(&mut hasher);
    }
    hasher.finish()
});

pub fn schema_fingerprint() -> u64 {
    *SCHEMA_FINGERPRINT
}

#[derive(Debug, Serialize)]
pub struct SchemaManifest {
    pub protocol_version: u32,
    pub oldest_supported_protocol_version: u32,
    pub world_object_version: u32,
    pub world_material_version: u32,
    pub fingerprint: u64,
    pub world_object_history: &'static [VersionEntry],
    pub messages: Vec<ManifestMessage>,
}

#[derive(Debug, Serialize)]
pub struct ManifestMessage {
    pub id: u32,
    pub name: &'static str,
    pub stable_hash: u64,
}

pub fn manifest() -> SchemaManifest {
    SchemaManifest {
        protocol_version: PROTOCOL_VERSION,
        oldest_supported_protocol_version: OLDEST_SUPPORTED_PROTOCOL_VERSION,
        world_object_version: WORLD_OBJECT_SERIALISATION_VERSION,
        world_material_version: WORLD_MATERIAL_SERIALISATION_VERSION,
        fingerprint: schema_fingerprint(),
        world_object_history: WORLD_OBJECT_VERSION_HISTORY,
        messages: MESSAGE_TYPES
            .iter()
            .map(|entry| ManifestMessage {
                id: entry.id,
                name: entry.name,
                stable_hash: stable_hash(entry.name),
            })
            .collect(),
    }
}

/// Writes the manifest to the provided JSON file path.
pub fn write_manifest_json(path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(&manifest())?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, json)
}

/// Returns the first message type id or name hash that is not unique.
pub fn find_collision() -> Option<&'static str> {
    let mut ids = HashSet::new();
    let mut hashes = HashSet::new();
    MESSAGE_TYPES
        .iter()
        .find(|entry| !ids.insert(entry.id) || !hashes.insert(stable_hash(entry.name)))
        .map(|entry| entry.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("ObjectCreated"), stable_hash("ObjectCreated"));
        assert_ne!(stable_hash("ObjectCreated"), stable_hash("ObjectDestroyed"));
    }

    #[test]
    fn history_covers_every_version() {
        let versions: Vec<u32> = WORLD_OBJECT_VERSION_HISTORY.iter().map(|e| e.version).collect();
        let expected: Vec<u32> = (1..=WORLD_OBJECT_SERIALISATION_VERSION).collect();
        assert_eq!(versions, expected);
    }

    #[test]
    fn message_table_has_no_collisions() {
        assert_eq!(find_collision(), None);
    }

    #[test]
    fn manifest_writes_to_disk() {
        let tmp_dir = tempfile::tempdir().expect("tmpdir");
        let path = tmp_dir.path().join("schemas").join("manifest.json");
        write_manifest_json(&path).expect("write manifest");
        let contents = std::fs::read_to_string(path).expect("read manifest");
        assert!(contents.contains("ObjectPhysicsOwnershipTaken"));
        assert!(contents.contains("centre of mass offset"));
        assert!(contents.contains(&schema_fingerprint().to_string()));
    }
}
