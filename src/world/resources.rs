//! Rewrites local file references on objects into content-addressed URLs.

use super::{DirtyFlags, WorldObject};
use siphasher::sip::SipHasher24;
use std::collections::BTreeSet;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, Read};
use std::path::Path;

const CHECKSUM_KEY_0: u64 = 0x0ddcc001feedface;
const CHECKSUM_KEY_1: u64 = 0xabcdef0123456789;

pub trait ResourceResolver {
    /// URL the resource at `path`, with contents hashing to `checksum`, is served under.
    fn url_for_path_and_hash(&self, path: &Path, checksum: u64) -> String;
}

/// SipHash-2-4 of the file's contents.
pub fn file_checksum(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = SipHasher24::new_with_keys(CHECKSUM_KEY_0, CHECKSUM_KEY_1);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.write(&buf[..read]);
    }
    Ok(hasher.finish())
}

/// Maps `dir/name.ext` to `name_<checksum>.ext`.
#[derive(Debug, Clone, Default)]
pub struct ContentAddressedResolver;

impl ResourceResolver for ContentAddressedResolver {
    fn url_for_path_and_hash(&self, path: &Path, checksum: u64) -> String {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match path.extension() {
            Some(ext) => format!("{stem}_{checksum}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{checksum}"),
        }
    }
}

/// Returns the resolved URL when `url` names an existing local file.
fn resolve_local(url: &str, resolver: &dyn ResourceResolver) -> Option<String> {
    if url.is_empty() || url.contains("://") {
        return None;
    }
    let path = Path::new(url);
    if !path.is_file() {
        return None;
    }
    match file_checksum(path) {
        Ok(checksum) => Some(resolver.url_for_path_and_hash(path, checksum)),
        Err(err) => {
            log::warn!("[resources] could not checksum {url}: {err}");
            None
        }
    }
}

impl WorldObject {
    /// Replaces model, lightmap and material texture paths that name local files
    /// with resolver URLs. Returns how many references were rewritten.
    pub fn convert_local_paths_to_urls(&mut self, resolver: &dyn ResourceResolver) -> usize {
        let mut converted = 0;

        if let Some(url) = resolve_local(&self.model_url, resolver) {
            self.model_url = url;
            self.mark_local_dirty(DirtyFlags::MODEL_URL);
            converted += 1;
        }
        if let Some(url) = resolve_local(&self.lightmap_url, resolver) {
            self.lightmap_url = url;
            self.mark_local_dirty(DirtyFlags::LIGHTMAP_URL);
            converted += 1;
        }

        let mut materials_changed = false;
        for material in &mut self.materials {
            if let Some(url) = resolve_local(&material.colour_texture_url, resolver) {
                material.colour_texture_url = url;
                materials_changed = true;
                converted += 1;
            }
        }
        if materials_changed {
            self.mark_local_dirty(DirtyFlags::OTHER);
        }

        if converted > 0 {
            log::debug!("[resources] object {} rewrote {converted} local paths", self.uid);
        }
        converted
    }

    /// Every URL this object needs to render, without duplicates.
    pub fn dependency_urls(&self) -> BTreeSet<String> {
        std::iter::once(&self.model_url)
            .chain(std::iter::once(&self.lightmap_url))
            .chain(self.materials.iter().map(|m| &m.colour_texture_url))
            .chain(std::iter::once(&self.audio_source_url))
            .filter(|url| !url.is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{ObjectType, WorldMaterial};

    #[test]
    fn checksum_depends_on_contents() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::write(&b, b"hello").unwrap();
        assert_eq!(file_checksum(&a).unwrap(), file_checksum(&b).unwrap());

        std::fs::write(&b, b"hello!").unwrap();
        assert_ne!(file_checksum(&a).unwrap(), file_checksum(&b).unwrap());
        assert!(file_checksum(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn content_addressed_names_keep_extension() {
        let resolver = ContentAddressedResolver;
        assert_eq!(
            resolver.url_for_path_and_hash(Path::new("/models/chair.glb"), 42),
            "chair_42.glb"
        );
        assert_eq!(resolver.url_for_path_and_hash(Path::new("README"), 7), "README_7");
    }

    #[test]
    fn converts_only_existing_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("chair.glb");
        let texture = dir.path().join("wood.png");
        std::fs::write(&model, b"model bytes").unwrap();
        std::fs::write(&texture, b"texture bytes").unwrap();

        let mut ob = WorldObject::new(ObjectType::Generic)
            .with_model(model.to_string_lossy().into_owned());
        ob.lightmap_url = "https://cdn.example/lightmap.png".into();
        ob.materials = vec![
            WorldMaterial {
                colour_texture_url: texture.to_string_lossy().into_owned(),
                ..WorldMaterial::default()
            },
            WorldMaterial {
                colour_texture_url: dir.path().join("gone.png").to_string_lossy().into_owned(),
                ..WorldMaterial::default()
            },
        ];
        ob.from_local_dirty = DirtyFlags::empty();

        let converted = ob.convert_local_paths_to_urls(&ContentAddressedResolver);
        assert_eq!(converted, 2);

        let model_sum = file_checksum(&model).unwrap();
        assert_eq!(ob.model_url, format!("chair_{model_sum}.glb"));
        assert_eq!(ob.lightmap_url, "https://cdn.example/lightmap.png");
        assert!(ob.materials[0].colour_texture_url.starts_with("wood_"));
        assert!(ob.materials[1].colour_texture_url.ends_with("gone.png"));
        assert!(ob.from_local_dirty.contains(DirtyFlags::MODEL_URL | DirtyFlags::OTHER));
        assert!(!ob.from_local_dirty.contains(DirtyFlags::LIGHTMAP_URL));
    }

    #[test]
    fn dependency_urls_are_deduplicated() {
        let mut ob = WorldObject::new(ObjectType::Generic).with_model("a.glb");
        ob.lightmap_url = "lm.png".into();
        ob.materials = vec![
            WorldMaterial {
                colour_texture_url: "t.png".into(),
                ..WorldMaterial::default()
            },
            WorldMaterial {
                colour_texture_url: "t.png".into(),
                ..WorldMaterial::default()
            },
            WorldMaterial::default(),
        ];
        let urls: Vec<String> = ob.dependency_urls().into_iter().collect();
        assert_eq!(urls, vec!["a.glb", "lm.png", "t.png"]);
    }
}
