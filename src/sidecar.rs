use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side last wrote the bytes currently on disk. Used for echo
/// suppression: a file whose `origin` is `Filevine` requires a fingerprint
/// *change* before it is eligible for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Filevine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarMeta {
    pub origin: Origin,
    pub fingerprint: String,
    #[serde(rename = "markedAt")]
    pub marked_at: DateTime<Utc>,
}

/// Out-of-band metadata store. Mirrors the relative path of each tracked
/// file into a parallel `.sync/` directory under the project root, with a
/// `.json` suffix, rather than alternate data streams or xattrs, so it
/// survives across filesystems that don't support either. A miss (e.g.
/// after a same-volume move that didn't carry a sidecar along) is treated
/// as absent metadata, never as an error — it is rebuilt on next write.
pub struct SidecarStore {
    project_root: PathBuf,
}

impl SidecarStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    fn sidecar_path(&self, rel_key: &str) -> PathBuf {
        self.project_root.join(".sync").join(format!("{rel_key}.json"))
    }

    pub fn get_meta(&self, rel_key: &str) -> Option<SidecarMeta> {
        let path = self.sidecar_path(rel_key);
        let raw = fs::read(&path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn set_meta(&self, rel_key: &str, meta: &SidecarMeta) -> Result<()> {
        let path = self.sidecar_path(rel_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create sidecar dir {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(meta).context("serialize sidecar meta")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn clear_meta(&self, rel_key: &str) {
        let _ = fs::remove_file(self.sidecar_path(rel_key));
    }
}
