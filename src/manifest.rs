use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which store most recently contributed a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub source: Source,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
}

pub type Manifest = BTreeMap<String, ManifestRecord>;

pub const MANIFEST_FILENAME: &str = ".last_sync_state.json";

/// Loads the per-project manifest. A missing or unparsable file is not an
/// error: it is treated as an empty dict (with the caller expected to log a
/// warning), per the Parse error policy.
pub fn load(path: &Path) -> Manifest {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            crate::logging::warn(format!("manifest parse error {}: {e}", path.display()));
            Manifest::new()
        }),
        Err(_) => Manifest::new(),
    }
}

/// Writes the manifest atomically (write-temp-then-rename), matching the
/// download-staging idiom used elsewhere for local writes.
pub fn save(path: &Path, manifest: &Manifest) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(manifest)?;
    let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, &body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_manifest_path() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("originsync-manifest-test-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir.join(MANIFEST_FILENAME)
    }

    #[test]
    fn missing_manifest_loads_empty() {
        let path = temp_manifest_path();
        let m = load(&path);
        assert!(m.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_manifest_path();
        let mut m = Manifest::new();
        m.insert(
            "dir/x.txt".to_string(),
            ManifestRecord {
                source: Source::S3,
                last_modified: Utc::now(),
            },
        );
        save(&path, &m).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["dir/x.txt"].source, Source::S3);
    }

    #[test]
    fn corrupt_manifest_loads_empty_not_error() {
        let path = temp_manifest_path();
        fs::write(&path, b"not json").unwrap();
        let m = load(&path);
        assert!(m.is_empty());
    }

    #[test]
    fn save_is_atomic_no_stray_tmp_after_success() {
        let path = temp_manifest_path();
        save(&path, &Manifest::new()).unwrap();
        let parent = path.parent().unwrap();
        let stray_tmp = fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".tmp-"));
        assert!(!stray_tmp);
    }
}
