use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::objectstore::ObjectStoreAdapter;
use crate::origin::OriginAdapter;
use crate::paths::sanitize;
use crate::projectmap::{self, ProjectMap};
use crate::reconciler::{self, ProjectContext};
use crate::sidecar::SidecarStore;
use crate::watcher::{self, WatcherConfig};
use crate::webhook::{ProjectLocator, ProjectPlacement};

const POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Discovers projects from both sides, hydrates new ones serially, starts a
/// watcher + poll loop per project, and serializes every reconciliation
/// (fast-path or full-pass) for a given project behind that project's lock.
pub struct Orchestrator {
    config: Config,
    object_store: Arc<dyn ObjectStoreAdapter>,
    origin: Arc<dyn OriginAdapter>,
    project_map: Arc<ProjectMap>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    document_keys: Mutex<HashMap<(i64, i64), String>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        object_store: Arc<dyn ObjectStoreAdapter>,
        origin: Arc<dyn OriginAdapter>,
    ) -> Arc<Self> {
        let project_map = Arc::new(ProjectMap::load(config.project_map_path.clone()));
        Arc::new(Self {
            config,
            object_store,
            origin,
            project_map,
            locks: Mutex::new(HashMap::new()),
            document_keys: Mutex::new(HashMap::new()),
        })
    }

    pub fn project_map(&self) -> Arc<ProjectMap> {
        self.project_map.clone()
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().await;
        guard.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn local_root(&self, name: &str) -> PathBuf {
        self.config.zdrive_root.join(name)
    }

    fn object_prefix(&self, name: &str) -> String {
        let root = self.config.s3_root_prefix.trim_matches('/');
        format!("{root}/{name}/{}/{name}/", self.config.org_folder_name)
    }

    fn context(&self, name: &str, project_id: Option<i64>) -> ProjectContext {
        ProjectContext {
            project_root: self.local_root(name),
            bucket: self.config.bucket.clone(),
            object_prefix: self.object_prefix(name),
            project_id,
            root_folder_id: self.config.root_folder_id,
            require_resolved: self.config.require_resolved,
            enable_origin_upload: self.config.enable_origin_upload,
        }
    }

    /// Step 1: list the root prefix one level deep and return the set of
    /// sanitized project names observed in the bucket.
    async fn discover_s3_projects(&self) -> Vec<String> {
        let root = format!("{}/", self.config.s3_root_prefix.trim_matches('/'));
        let listing = match self.object_store.list_recursive(&self.config.bucket, &root).await {
            Ok(l) => l,
            Err(e) => {
                crate::logging::warn(format!("discover_s3_projects failed: {e}"));
                return Vec::new();
            }
        };
        let mut names: Vec<String> = listing
            .into_iter()
            .filter_map(|record| record.rel_original.split('/').next().map(sanitize))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn ensure_local_dir(&self, name: &str) -> anyhow::Result<()> {
        let root = self.local_root(name);
        let newly_created = !root.exists();
        std::fs::create_dir_all(&root)?;
        if newly_created {
            std::fs::write(root.join(".placeholder"), [])?;
        }
        Ok(())
    }

    async fn project_id_for(&self, name: &str) -> Option<i64> {
        projectmap::resolve_and_cache(&self.project_map, self.origin.as_ref(), name)
            .await
            .ok()
            .flatten()
    }

    async fn hydrate(&self, name: &str) {
        let project_id = self.project_id_for(name).await;
        let ctx = self.context(name, project_id);
        let sidecars = SidecarStore::new(&ctx.project_root);
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;
        if let Err(e) = reconciler::full_pass(&ctx, self.object_store.as_ref(), self.origin.as_ref(), &sidecars, true).await {
            crate::logging::warn(format!("hydration failed for {name}: {e}"));
        }
    }

    async fn run_full_pass(&self, name: &str) {
        let project_id = self.project_id_for(name).await;
        let ctx = self.context(name, project_id);
        let sidecars = SidecarStore::new(&ctx.project_root);
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;
        if let Err(e) = reconciler::full_pass(&ctx, self.object_store.as_ref(), self.origin.as_ref(), &sidecars, false).await {
            crate::logging::warn(format!("full pass failed for {name}: {e}"));
        }
    }

    /// Per §4.8: spawns a background task that drains the watcher's
    /// debounced event channel and, for each event, runs the fast path
    /// under the project's lock.
    fn start_watcher(self: &Arc<Self>, name: String) {
        let root = self.local_root(&name);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut rx = match watcher::spawn(root, WatcherConfig::default()) {
                Ok(rx) => rx,
                Err(e) => {
                    crate::logging::warn(format!("watcher failed to start for {name}: {e}"));
                    return;
                }
            };
            while let Some(path) = rx.recv().await {
                let project_id = orchestrator.project_id_for(&name).await;
                let ctx = orchestrator.context(&name, project_id);
                let sidecars = SidecarStore::new(&ctx.project_root);
                let lock = orchestrator.lock_for(&name).await;
                let _guard = lock.lock().await;
                if let Err(e) = reconciler::fast_path(
                    &ctx,
                    orchestrator.object_store.as_ref(),
                    orchestrator.origin.as_ref(),
                    &sidecars,
                    &path,
                    false,
                )
                .await
                {
                    crate::logging::warn(format!("fast path failed for {name} {}: {e}", path.display()));
                }
            }
        });
    }

    /// Runs the full startup sequence (§4.9 steps 1-4) followed by the 300s
    /// poll loop (step 5) until cancelled.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut watched: Vec<String> = Vec::new();

        let discovered = self.discover_s3_projects().await;
        for name in &discovered {
            if let Err(e) = self.ensure_local_dir(name) {
                crate::logging::warn(format!("ensure_local_dir failed for {name}: {e}"));
                continue;
            }
        }
        // Serial hydration: parallel hydration could let a watcher observe
        // an incomplete tree and mistake downloads for local creations.
        for name in &discovered {
            self.hydrate(name).await;
        }
        for name in &discovered {
            self.start_watcher(name.clone());
            watched.push(name.clone());
        }
        for name in &discovered {
            self.run_full_pass(name).await;
        }

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.tick().await; // first tick fires immediately; already handled above
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = self.discover_s3_projects().await;
                    for name in &current {
                        if !watched.contains(name) {
                            if let Err(e) = self.ensure_local_dir(name) {
                                crate::logging::warn(format!("ensure_local_dir failed for {name}: {e}"));
                                continue;
                            }
                            self.hydrate(name).await;
                            self.start_watcher(name.clone());
                            watched.push(name.clone());
                        }
                        self.run_full_pass(name).await;
                    }
                }
                _ = &mut shutdown => {
                    crate::logging::info("orchestrator shutting down".to_string());
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ProjectLocator for Orchestrator {
    async fn locate(&self, project_id: i64) -> Option<ProjectPlacement> {
        let entries = self.project_map.snapshot().await;
        let name = entries.iter().find(|(_, id)| **id == project_id).map(|(n, _)| n.clone())?;
        Some(ProjectPlacement {
            local_root: self.local_root(&name),
            bucket: self.config.bucket.clone(),
            object_prefix: self.object_prefix(&name),
        })
    }

    async fn cached_key(&self, project_id: i64, document_id: i64) -> Option<String> {
        self.document_keys.lock().await.get(&(project_id, document_id)).cloned()
    }

    async fn record_key(&self, project_id: i64, document_id: i64, rel_key: &str) {
        self.document_keys.lock().await.insert((project_id, document_id), rel_key.to_string());
    }

    async fn full_sync(&self, project_id: i64) {
        let entries = self.project_map.snapshot().await;
        if let Some((name, _)) = entries.into_iter().find(|(_, id)| *id == project_id) {
            self.run_full_pass(&name).await;
        }
    }
}
