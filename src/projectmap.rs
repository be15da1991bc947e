use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

/// The project-name → project-id dictionary, shared across every worker
/// (watchers, the poll loop, the webhook router). Updates are serialized
/// through an in-process write lock and persisted atomically so they also
/// survive process restarts.
pub struct ProjectMap {
    path: PathBuf,
    entries: Mutex<HashMap<String, i64>>,
}

impl ProjectMap {
    pub fn load(path: PathBuf) -> Self {
        let entries = fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        Self { path, entries: Mutex::new(entries) }
    }

    pub async fn get(&self, project_name: &str) -> Option<i64> {
        self.entries.lock().await.get(project_name).copied()
    }

    /// A point-in-time copy of the whole map, used by lookups that need to
    /// search by id rather than by name.
    pub async fn snapshot(&self) -> HashMap<String, i64> {
        self.entries.lock().await.clone()
    }

    /// Records a successful resolution and persists the whole map.
    pub async fn set(&self, project_name: &str, project_id: i64) -> Result<()> {
        let mut guard = self.entries.lock().await;
        guard.insert(project_name.to_string(), project_id);
        self.persist(&guard)
    }

    fn persist(&self, entries: &HashMap<String, i64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Looks up a project id, resolving and persisting it on first use.
pub async fn resolve_and_cache(
    map: &ProjectMap,
    origin: &dyn crate::origin::OriginAdapter,
    project_name: &str,
) -> Result<Option<i64>> {
    if let Some(id) = map.get(project_name).await {
        return Ok(Some(id));
    }
    match origin.resolve_project_id(project_name).await? {
        Some(id) => {
            map.set(project_name, id).await?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_map_path() -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("originsync-projectmap-test-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir.join("projects.json")
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_persists() {
        let path = temp_map_path();
        let map = ProjectMap::load(path.clone());
        map.set("Smith-v-Jones", 4242).await.unwrap();
        assert_eq!(map.get("Smith-v-Jones").await, Some(4242));

        let reloaded = ProjectMap::load(path);
        assert_eq!(reloaded.get("Smith-v-Jones").await, Some(4242));
    }

    #[tokio::test]
    async fn missing_project_is_none() {
        let path = temp_map_path();
        let map = ProjectMap::load(path);
        assert_eq!(map.get("Unknown").await, None);
    }
}
