use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::paths::is_ignored;

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Starts a per-project filesystem watcher. Created/Changed/Deleted/Renamed
/// events on regular files are debounced per path and forwarded on the
/// returned channel; directory events and ignored basenames never reach
/// the channel. The `notify::RecommendedWatcher` is kept alive for as long
/// as the background task runs; dropping the returned receiver stops it.
pub fn spawn(project_root: PathBuf, config: WatcherConfig) -> Result<mpsc::UnboundedReceiver<PathBuf>> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("create filesystem watcher")?;
    watcher
        .watch(&project_root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", project_root.display()))?;

    let (out_tx, out_rx) = mpsc::unbounded_channel::<PathBuf>();
    let debounce = config.debounce;

    tokio::spawn(async move {
        let _watcher = watcher; // keep alive for the task's lifetime
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        loop {
            let sleep_until = pending
                .values()
                .min()
                .map(|deadline| *deadline + debounce);
            tokio::select! {
                biased;
                _ = async {
                    match sleep_until {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, last_seen)| now >= **last_seen + debounce)
                        .map(|(p, _)| p.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        if out_tx.send(path).is_err() {
                            return;
                        }
                    }
                }
                maybe_event = raw_rx.recv() => {
                    let Some(event_result) = maybe_event else { return };
                    let Ok(event) = event_result else { continue };
                    handle_raw_event(&event, &mut pending);
                }
            }
        }
    });

    Ok(out_rx)
}

fn handle_raw_event(event: &Event, pending: &mut HashMap<PathBuf, Instant>) {
    let interesting = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    if !interesting {
        return;
    }
    for path in &event.paths {
        if path.is_dir() {
            continue;
        }
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_ignored(basename) {
            continue;
        }
        pending.insert(path.clone(), Instant::now());
    }
}
