//! Deterministic volume naming per provider instance.
//!
//! Names are derived from `(base, provider id, logical mount)` and tracked
//! in memory so they can be handed back for disposal when the instance is
//! removed. Whether the underlying storage is deleted is up to the caller.
//!
//! Each part is escaped so it only contains ASCII alphanumerics, `-` and
//! `.`, and the parts are joined with `_`. Distinct inputs therefore never
//! share a name.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use voxhost_types::ProviderTemplate;

pub const DEFAULT_VOLUME_BASE: &str = "voxhost";

/// Logical mount name used for model caches.
pub const MODEL_MOUNT: &str = "models";

#[derive(Debug, Clone)]
pub struct VolumeManager {
    base_name: String,
    /// provider id -> logical mount -> volume name
    volumes: HashMap<String, BTreeMap<String, String>>,
}

impl VolumeManager {
    pub fn new(base_name: impl Into<String>) -> Self {
        let base_name = base_name.into();
        let base_name = if base_name.trim().is_empty() {
            DEFAULT_VOLUME_BASE.to_string()
        } else {
            encode_part(&base_name)
        };
        Self {
            base_name,
            volumes: HashMap::new(),
        }
    }

    /// Returns the model-cache volume for a provider, creating the entry on
    /// first use. Repeated calls return the identical name.
    pub fn get_or_create_model_volume(&mut self, provider_id: &str) -> String {
        self.get_or_create(provider_id, MODEL_MOUNT)
    }

    /// Expands every logical mount of the template into a concrete
    /// `volume name -> container path` map.
    pub fn get_mount_paths(
        &mut self,
        provider_id: &str,
        template: &ProviderTemplate,
    ) -> BTreeMap<String, String> {
        self.mount_paths_for(provider_id, &template.volumes)
    }

    /// Like [`VolumeManager::get_mount_paths`] but over an already merged
    /// logical mount map.
    pub fn mount_paths_for(
        &mut self,
        provider_id: &str,
        mounts: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        mounts
            .iter()
            .map(|(logical, container_path)| {
                (self.get_or_create(provider_id, logical), container_path.clone())
            })
            .collect()
    }

    /// Drops every tracked volume of the provider and returns the names so
    /// the caller can dispose of the storage.
    pub fn remove_provider_volumes(&mut self, provider_id: &str) -> Vec<String> {
        self.volumes
            .remove(provider_id)
            .map(|mounts| mounts.into_values().collect())
            .unwrap_or_default()
    }

    pub fn tracked_volumes(&self, provider_id: &str) -> Vec<String> {
        self.volumes
            .get(provider_id)
            .map(|mounts| mounts.values().cloned().collect())
            .unwrap_or_default()
    }

    fn get_or_create(&mut self, provider_id: &str, logical: &str) -> String {
        let base = &self.base_name;
        self.volumes
            .entry(provider_id.to_string())
            .or_default()
            .entry(logical.to_string())
            .or_insert_with(|| format!("{}_{}_{}", base, encode_part(provider_id), encode_part(logical)))
            .clone()
    }
}

impl Default for VolumeManager {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_BASE)
    }
}

/// Encoded parts longer than this are shortened to a prefix plus a digest.
const MAX_PART_LEN: usize = 64;

/// Escapes `raw` into characters the container runtime accepts in names.
///
/// ASCII alphanumerics and `-` are kept; every other byte becomes `.xx`
/// (lowercase hex), so the encoding never produces `_` and never produces
/// `.h`. Overlong results keep a readable prefix and end in `.h` plus a
/// SHA-256 digest of the raw input.
pub(crate) fn encode_part(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!(".{:02x}", byte));
        }
    }
    if encoded.len() <= MAX_PART_LEN {
        return encoded;
    }
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    let prefix: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(16)
        .collect();
    format!("{}.h{}", prefix, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxhost_types::DeploymentMode;

    #[test]
    fn model_volume_is_idempotent_and_distinct_per_provider() {
        let mut volumes = VolumeManager::default();
        let first = volumes.get_or_create_model_volume("p1");
        let second = volumes.get_or_create_model_volume("p1");
        let other = volumes.get_or_create_model_volume("p2");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first, "voxhost_p1_models");
    }

    #[test]
    fn ids_with_separators_stay_distinct() {
        let mut volumes = VolumeManager::default();
        let a = volumes.get_or_create_model_volume("team/a");
        let b = volumes.get_or_create_model_volume("team:a");
        assert_ne!(a, b);
        assert_eq!(a, "voxhost_team.2fa_models");
        assert_eq!(b, "voxhost_team.3aa_models");
    }

    #[test]
    fn dashes_in_ids_and_mounts_do_not_collide() {
        let mut volumes = VolumeManager::default();
        let mut mounts = BTreeMap::new();
        mounts.insert("b-models".to_string(), "/data".to_string());

        let from_mount = volumes.mount_paths_for("a", &mounts);
        let from_id = volumes.get_or_create_model_volume("a-b");

        assert_eq!(from_mount.keys().next().map(String::as_str), Some("voxhost_a_b-models"));
        assert_eq!(from_id, "voxhost_a-b_models");
        assert!(!from_mount.contains_key(&from_id));
    }

    #[test]
    fn escaped_ids_never_match_verbatim_ones() {
        // "x.2fy" reads like the escape of "x/y" but its own dot is escaped.
        assert_eq!(encode_part("x/y"), "x.2fy");
        assert_eq!(encode_part("x.2fy"), "x.2e2fy");
        assert_eq!(encode_part("stt_1"), "stt.5f1");
    }

    #[test]
    fn overlong_parts_are_shortened_deterministically() {
        let long_a = "a".repeat(100);
        let long_b = format!("{}b", "a".repeat(99));
        let encoded = encode_part(&long_a);
        assert!(encoded.len() <= MAX_PART_LEN);
        assert!(encoded.starts_with("aaaaaaaaaaaaaaaa.h"));
        assert_eq!(encoded, encode_part(&long_a));
        assert_ne!(encoded, encode_part(&long_b));
    }

    #[test]
    fn mount_paths_expand_every_logical_mount() {
        let mut template = ProviderTemplate::new("whisper-asr", DeploymentMode::Container);
        template
            .volumes
            .insert("models".to_string(), "/root/.cache/whisper".to_string());
        template
            .volumes
            .insert("hf cache".to_string(), "/root/.cache/huggingface".to_string());

        let mut volumes = VolumeManager::new("stt");
        let mounts = volumes.get_mount_paths("inst-1", &template);
        assert_eq!(mounts.len(), 2);
        assert_eq!(
            mounts.get("stt_inst-1_models").map(String::as_str),
            Some("/root/.cache/whisper")
        );
        assert_eq!(
            mounts.get("stt_inst-1_hf.20cache").map(String::as_str),
            Some("/root/.cache/huggingface")
        );

        // The model volume requested directly is the same tracked entry.
        assert_eq!(volumes.get_or_create_model_volume("inst-1"), "stt_inst-1_models");
    }

    #[test]
    fn removal_returns_names_and_forgets_them() {
        let mut volumes = VolumeManager::default();
        let name = volumes.get_or_create_model_volume("p1");
        volumes.get_or_create_model_volume("p2");

        let removed = volumes.remove_provider_volumes("p1");
        assert_eq!(removed, vec![name]);
        assert!(volumes.tracked_volumes("p1").is_empty());
        assert_eq!(volumes.tracked_volumes("p2").len(), 1);
        assert!(volumes.remove_provider_volumes("p1").is_empty());
    }
}
