use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::paths::is_ignored;

#[derive(Debug, Clone)]
pub struct LocalFileRecord {
    pub last_modified: DateTime<Utc>,
}

pub type LocalListing = BTreeMap<String, LocalFileRecord>;

/// Recursively enumerates regular files under `project_root`, skipping
/// ignored basenames and never following symlinks. Keys are forward-slash
/// relative paths in their original on-disk case.
pub fn scan(project_root: &Path) -> LocalListing {
    let mut out = LocalListing::new();
    let walker = WalkDir::new(project_root).follow_links(false);
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == project_root {
            continue;
        }
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_ignored(basename) {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_symlink() || !file_type.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(project_root) else {
            continue;
        };
        let Some(rel_key) = to_forward_slash(rel) else {
            continue;
        };
        if rel_key.split('/').any(is_ignored) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        out.insert(
            rel_key,
            LocalFileRecord {
                last_modified: DateTime::<Utc>::from(modified),
            },
        );
    }
    out
}

fn to_forward_slash(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        parts.push(comp.as_os_str().to_str()?.to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("originsync-scanner-test-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn scan_finds_nested_files_and_skips_ignored() {
        let root = temp_root();
        fs::create_dir_all(root.join("dir")).unwrap();
        fs::write(root.join("dir/x.txt"), b"hi").unwrap();
        fs::write(root.join("dir/.DS_Store"), b"").unwrap();
        fs::write(root.join(".last_sync_state.json"), b"{}").unwrap();

        let listing = scan(&root);
        assert!(listing.contains_key("dir/x.txt"));
        assert!(!listing.contains_key("dir/.DS_Store"));
        assert!(!listing.contains_key(".last_sync_state.json"));
    }

    #[test]
    fn scan_uses_forward_slash_keys() {
        let root = temp_root();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c.txt"), b"hi").unwrap();
        let listing = scan(&root);
        assert!(listing.contains_key("a/b/c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn scan_does_not_follow_symlinks() {
        let root = temp_root();
        fs::write(root.join("real.txt"), b"hi").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();
        let listing = scan(&root);
        assert!(!listing.contains_key("link.txt"));
    }
}
