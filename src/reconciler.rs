use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::fingerprint::fingerprint;
use crate::manifest::{self, Manifest, ManifestRecord, Source};
use crate::objectstore::ObjectStoreAdapter;
use crate::origin::OriginAdapter;
use crate::paths::is_ignored;
use crate::scanner;
use crate::sidecar::{Origin, SidecarMeta, SidecarStore};

/// Everything a reconciliation pass needs to know about one project.
pub struct ProjectContext {
    pub project_root: PathBuf,
    pub bucket: String,
    /// Full object-key prefix for this project, including the trailing
    /// slash, e.g. `<rootPrefix>/<project>/<org>/<project>/`.
    pub object_prefix: String,
    pub project_id: Option<i64>,
    pub root_folder_id: Option<i64>,
    pub require_resolved: bool,
    pub enable_origin_upload: bool,
}

impl ProjectContext {
    fn object_uri(&self, rel_key: &str) -> String {
        format!("s3://{}/{}{}", self.bucket, self.object_prefix, rel_key)
    }

    fn local_path(&self, rel_key: &str) -> PathBuf {
        let mut p = self.project_root.clone();
        for seg in rel_key.split('/') {
            p.push(seg);
        }
        p
    }

    fn manifest_path(&self) -> PathBuf {
        self.project_root.join(manifest::MANIFEST_FILENAME)
    }

    /// Display name used as the `project` field on every structured log
    /// line this reconciliation pass emits.
    fn project_label(&self) -> String {
        self.project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.project_root.display().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Placeholder,
    DeleteLocal,
    DeleteS3,
    Compare,
    UploadNew,
    DownloadNew,
    Noop,
}

fn classify(
    rel_key: &str,
    in_local: bool,
    in_s3: bool,
    prev_source: Option<Source>,
) -> Classification {
    if rel_key.rsplit('/').next().unwrap_or(rel_key) == ".placeholder" {
        return Classification::Placeholder;
    }
    if prev_source == Some(Source::S3) && !in_s3 {
        return Classification::DeleteLocal;
    }
    if prev_source == Some(Source::Local) && !in_local {
        return Classification::DeleteS3;
    }
    if in_local && in_s3 {
        return Classification::Compare;
    }
    if in_local && !in_s3 {
        return Classification::UploadNew;
    }
    if in_s3 && !in_local {
        return Classification::DownloadNew;
    }
    Classification::Noop
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareDecision {
    Skip,
    Upload,
    Download,
}

/// The Compare step (§4.7): echo shield first, then the skew guard, then
/// last-writer-wins by modification time.
fn compare_decision(
    stored_fp: Option<&str>,
    curr_fp: Option<&str>,
    local_time: DateTime<Utc>,
    s3_time: DateTime<Utc>,
) -> CompareDecision {
    if let (Some(s), Some(c)) = (stored_fp, curr_fp) {
        if s == c {
            return CompareDecision::Skip;
        }
    }
    let skew = (local_time - s3_time).num_milliseconds().abs();
    if skew < 2000 {
        return CompareDecision::Skip;
    }
    if local_time > s3_time {
        CompareDecision::Upload
    } else {
        CompareDecision::Download
    }
}

struct UnionEntry {
    rel_key: String,
    in_local: bool,
    in_s3: bool,
    local_time: Option<DateTime<Utc>>,
    s3_time: Option<DateTime<Utc>>,
}

fn depth(rel_key: &str) -> usize {
    rel_key.matches('/').count()
}

fn is_placeholder_key(rel_key: &str) -> bool {
    rel_key.rsplit('/').next().unwrap_or(rel_key) == ".placeholder"
}

/// Builds the case-insensitive union of local/S3 keys and returns them in
/// the fixed processing order: placeholders first, then shallow-to-deep,
/// then lexicographic (property 4).
fn build_union(
    local: &scanner::LocalListing,
    s3: &[crate::objectstore::ObjectRecord],
) -> Vec<UnionEntry> {
    let mut by_lower: BTreeMap<String, UnionEntry> = BTreeMap::new();

    for (rel_key, record) in local {
        if rel_key.split('/').any(is_ignored) {
            continue;
        }
        let lower = rel_key.to_lowercase();
        by_lower.insert(
            lower,
            UnionEntry {
                rel_key: rel_key.clone(),
                in_local: true,
                in_s3: false,
                local_time: Some(record.last_modified),
                s3_time: None,
            },
        );
    }

    for record in s3 {
        if record.rel_original.split('/').any(is_ignored) && !is_placeholder_key(&record.rel_original) {
            continue;
        }
        let lower = record.rel_original.to_lowercase();
        by_lower
            .entry(lower)
            .and_modify(|e| {
                e.in_s3 = true;
                e.s3_time = Some(record.last_modified);
                // Case-preserving writes use S3's original-case form.
                e.rel_key = record.rel_original.clone();
            })
            .or_insert(UnionEntry {
                rel_key: record.rel_original.clone(),
                in_local: false,
                in_s3: true,
                local_time: None,
                s3_time: Some(record.last_modified),
            });
    }

    let mut entries: Vec<UnionEntry> = by_lower.into_values().collect();
    entries.sort_by(|a, b| {
        let a_ph = !is_placeholder_key(&a.rel_key);
        let b_ph = !is_placeholder_key(&b.rel_key);
        a_ph.cmp(&b_ph)
            .then(depth(&a.rel_key).cmp(&depth(&b.rel_key)))
            .then(a.rel_key.to_lowercase().cmp(&b.rel_key.to_lowercase()))
    });
    entries
}

/// Runs one full reconciliation pass for a project: refresh, load the three
/// states, classify every key in the fixed order, apply the resulting
/// action, and write back the new manifest.
pub async fn full_pass(
    ctx: &ProjectContext,
    object_store: &dyn ObjectStoreAdapter,
    origin: &dyn OriginAdapter,
    sidecars: &SidecarStore,
    hydrate_only: bool,
) -> anyhow::Result<()> {
    let project = ctx.project_label();

    if !hydrate_only {
        if let Some(project_id) = ctx.project_id {
            if let Err(e) = origin.refresh_from_origin(project_id).await {
                crate::logging::warn_kv(
                    "refresh_from_origin failed",
                    &[("project", project.as_str()), ("error", &e.to_string())],
                );
            }
        }
    }

    let previous = manifest::load(&ctx.manifest_path());
    let local = scanner::scan(&ctx.project_root);
    let s3 = match object_store
        .list_recursive(&ctx.bucket, &ctx.object_prefix)
        .await
    {
        Ok(listing) => listing,
        Err(e) => {
            crate::logging::warn_kv(
                "s3 list failed, treating as empty",
                &[("project", project.as_str()), ("error", &e.to_string())],
            );
            Vec::new()
        }
    };

    let union = build_union(&local, &s3);
    let mut new_manifest: Manifest = Manifest::new();

    for entry in &union {
        let prev_source = previous.get(&entry.rel_key).map(|r| r.source);
        let class = classify(&entry.rel_key, entry.in_local, entry.in_s3, prev_source);

        let final_local = entry.in_local;
        let mut final_s3 = entry.in_s3;

        match class {
            Classification::Placeholder => {
                if let Some(dir) = entry.rel_key.strip_suffix("/.placeholder") {
                    let local_dir = ctx.local_path(dir);
                    if let Err(e) = std::fs::create_dir_all(&local_dir) {
                        crate::logging::warn_kv(
                            "placeholder dir create failed",
                            &[
                                ("project", project.as_str()),
                                ("relKey", entry.rel_key.as_str()),
                                ("action", "placeholder"),
                                ("error", &e.to_string()),
                            ],
                        );
                    }
                }
                continue; // placeholders are not recorded in the manifest
            }
            Classification::DeleteLocal => {
                let local_path = ctx.local_path(&entry.rel_key);
                if local_path.exists() {
                    match std::fs::remove_file(&local_path) {
                        Ok(()) => {
                            sidecars.clear_meta(&entry.rel_key);
                            crate::logging::info_kv(
                                "deleted local file",
                                &[
                                    ("project", project.as_str()),
                                    ("relKey", entry.rel_key.as_str()),
                                    ("action", "delete_local"),
                                ],
                            );
                        }
                        Err(e) => crate::logging::warn_kv(
                            "delete local failed",
                            &[
                                ("project", project.as_str()),
                                ("relKey", entry.rel_key.as_str()),
                                ("action", "delete_local"),
                                ("error", &e.to_string()),
                            ],
                        ),
                    }
                }
                continue; // removed from both union and manifest
            }
            Classification::DeleteS3 => {
                if !hydrate_only {
                    let uri = ctx.object_uri(&entry.rel_key);
                    match object_store.remove(&uri).await {
                        Ok(()) => crate::logging::info_kv(
                            "deleted s3 object",
                            &[
                                ("project", project.as_str()),
                                ("relKey", entry.rel_key.as_str()),
                                ("action", "delete_s3"),
                            ],
                        ),
                        Err(e) => crate::logging::warn_kv(
                            "delete s3 failed",
                            &[
                                ("project", project.as_str()),
                                ("relKey", entry.rel_key.as_str()),
                                ("action", "delete_s3"),
                                ("error", &e.to_string()),
                            ],
                        ),
                    }
                }
                continue;
            }
            Classification::Compare => {
                let local_path = ctx.local_path(&entry.rel_key);
                let meta = sidecars.get_meta(&entry.rel_key);
                let curr_fp = fingerprint(&local_path);
                let (lt, st) = (
                    entry.local_time.unwrap_or_else(Utc::now),
                    entry.s3_time.unwrap_or_else(Utc::now),
                );
                let decision = compare_decision(meta.as_ref().map(|m| m.fingerprint.as_str()), curr_fp.as_deref(), lt, st);
                match decision {
                    CompareDecision::Skip => {}
                    CompareDecision::Upload => {
                        if !hydrate_only {
                            let uri = ctx.object_uri(&entry.rel_key);
                            match object_store.copy_up(&local_path, &uri).await {
                                Ok(()) => {
                                    if let Some(fp) = curr_fp {
                                        let _ = sidecars.set_meta(
                                            &entry.rel_key,
                                            &SidecarMeta { origin: Origin::Local, fingerprint: fp, marked_at: Utc::now() },
                                        );
                                    }
                                    maybe_origin_upload(ctx, origin, &entry.rel_key, &local_path).await;
                                    crate::logging::info_kv(
                                        "uploaded (local newer)",
                                        &[
                                            ("project", project.as_str()),
                                            ("relKey", entry.rel_key.as_str()),
                                            ("action", "upload"),
                                        ],
                                    );
                                }
                                Err(e) => crate::logging::warn_kv(
                                    "upload failed",
                                    &[
                                        ("project", project.as_str()),
                                        ("relKey", entry.rel_key.as_str()),
                                        ("action", "upload"),
                                        ("error", &e.to_string()),
                                    ],
                                ),
                            }
                        }
                    }
                    CompareDecision::Download => {
                        let uri = ctx.object_uri(&entry.rel_key);
                        match object_store.copy_down(&uri, &local_path).await {
                            Ok(()) => {
                                if let Some(fp) = fingerprint(&local_path) {
                                    let _ = sidecars.set_meta(
                                        &entry.rel_key,
                                        &SidecarMeta { origin: Origin::Filevine, fingerprint: fp, marked_at: Utc::now() },
                                    );
                                }
                                crate::logging::info_kv(
                                    "downloaded (s3 newer)",
                                    &[
                                        ("project", project.as_str()),
                                        ("relKey", entry.rel_key.as_str()),
                                        ("action", "download"),
                                    ],
                                );
                            }
                            Err(e) => crate::logging::warn_kv(
                                "download failed",
                                &[
                                    ("project", project.as_str()),
                                    ("relKey", entry.rel_key.as_str()),
                                    ("action", "download"),
                                    ("error", &e.to_string()),
                                ],
                            ),
                        }
                    }
                }
            }
            Classification::UploadNew => {
                let local_path = ctx.local_path(&entry.rel_key);
                let meta = sidecars.get_meta(&entry.rel_key);
                let curr_fp = fingerprint(&local_path);
                let echo = matches!(&meta, Some(m) if m.origin == Origin::Filevine)
                    && meta.as_ref().zip(curr_fp.as_deref()).map(|(m, c)| m.fingerprint == c).unwrap_or(false);
                if !hydrate_only && !echo {
                    let uri = ctx.object_uri(&entry.rel_key);
                    match object_store.copy_up(&local_path, &uri).await {
                        Ok(()) => {
                            final_s3 = true;
                            if let Some(fp) = curr_fp {
                                let _ = sidecars.set_meta(
                                    &entry.rel_key,
                                    &SidecarMeta { origin: Origin::Local, fingerprint: fp, marked_at: Utc::now() },
                                );
                            }
                            maybe_origin_upload(ctx, origin, &entry.rel_key, &local_path).await;
                            crate::logging::info_kv(
                                "uploaded (new local file)",
                                &[
                                    ("project", project.as_str()),
                                    ("relKey", entry.rel_key.as_str()),
                                    ("action", "upload"),
                                ],
                            );
                        }
                        Err(e) => crate::logging::warn_kv(
                            "upload failed",
                            &[
                                ("project", project.as_str()),
                                ("relKey", entry.rel_key.as_str()),
                                ("action", "upload"),
                                ("error", &e.to_string()),
                            ],
                        ),
                    }
                }
            }
            Classification::DownloadNew => {
                let local_path = ctx.local_path(&entry.rel_key);
                let uri = ctx.object_uri(&entry.rel_key);
                // Deliberately does not flip `final_local`: the manifest
                // record must credit S3 as the source of this key (it was
                // absent locally at scan time), so a later S3-side deletion
                // is still recognized as deletion-causing (§4.7, property 5)
                // rather than triggering a re-upload.
                match object_store.copy_down(&uri, &local_path).await {
                    Ok(()) => {
                        if let Some(fp) = fingerprint(&local_path) {
                            let _ = sidecars.set_meta(
                                &entry.rel_key,
                                &SidecarMeta { origin: Origin::Filevine, fingerprint: fp, marked_at: Utc::now() },
                            );
                        }
                        crate::logging::info_kv(
                            "downloaded (new s3 object)",
                            &[
                                ("project", project.as_str()),
                                ("relKey", entry.rel_key.as_str()),
                                ("action", "download"),
                            ],
                        );
                    }
                    Err(e) => crate::logging::warn_kv(
                        "download failed",
                        &[
                            ("project", project.as_str()),
                            ("relKey", entry.rel_key.as_str()),
                            ("action", "download"),
                            ("error", &e.to_string()),
                        ],
                    ),
                }
            }
            Classification::Noop => {}
        }

        let record = if final_local {
            Some(ManifestRecord { source: Source::Local, last_modified: entry.local_time.unwrap_or_else(Utc::now) })
        } else if final_s3 {
            Some(ManifestRecord { source: Source::S3, last_modified: entry.s3_time.unwrap_or_else(Utc::now) })
        } else {
            previous.get(&entry.rel_key).cloned()
        };
        if let Some(record) = record {
            new_manifest.insert(entry.rel_key.clone(), record);
        }
    }

    manifest::save(&ctx.manifest_path(), &new_manifest)?;
    Ok(())
}

async fn maybe_origin_upload(
    ctx: &ProjectContext,
    origin: &dyn OriginAdapter,
    rel_key: &str,
    local_path: &Path,
) {
    if !ctx.enable_origin_upload {
        return;
    }
    let Some(project_id) = ctx.project_id else { return };
    if project_id <= 0 {
        return;
    }
    let folder_subpath = rel_key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    if let Err(e) = origin
        .upload_file(project_id, local_path, folder_subpath, ctx.root_folder_id, ctx.require_resolved)
        .await
    {
        crate::logging::warn_kv(
            "origin upload failed",
            &[
                ("project", ctx.project_label().as_str()),
                ("relKey", rel_key),
                ("action", "origin_upload"),
                ("error", &e.to_string()),
            ],
        );
    }
}

/// The Watcher's fast path: a single changed (or deleted) file, reconciled
/// without the overhead of a full pass.
pub async fn fast_path(
    ctx: &ProjectContext,
    object_store: &dyn ObjectStoreAdapter,
    origin: &dyn OriginAdapter,
    sidecars: &SidecarStore,
    changed_path: &Path,
    hydrate_only: bool,
) -> anyhow::Result<()> {
    if hydrate_only {
        return Ok(());
    }
    if changed_path.is_dir() {
        return Ok(());
    }
    let Some(basename) = changed_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    if is_ignored(basename) {
        return Ok(());
    }
    let Ok(rel) = changed_path.strip_prefix(&ctx.project_root) else {
        return Ok(());
    };
    let rel_key: Vec<&str> = rel.to_str().map(|s| s.split(['/', '\\']).collect()).unwrap_or_default();
    if rel_key.is_empty() {
        return Ok(());
    }
    let rel_key = rel_key.join("/");
    let uri = ctx.object_uri(&rel_key);

    if changed_path.exists() {
        let curr_fp = fingerprint(changed_path);
        let meta = sidecars.get_meta(&rel_key);
        if let (Some(m), Some(c)) = (&meta, &curr_fp) {
            if m.fingerprint == *c {
                return Ok(()); // echo shield: this write is the echo of a prior download
            }
        }
        match object_store.copy_up(changed_path, &uri).await {
            Ok(()) => {
                if let Some(fp) = curr_fp {
                    sidecars.set_meta(&rel_key, &SidecarMeta { origin: Origin::Local, fingerprint: fp, marked_at: Utc::now() })?;
                }
                maybe_origin_upload(ctx, origin, &rel_key, changed_path).await;
                crate::logging::info_kv(
                    "fast path uploaded",
                    &[
                        ("project", ctx.project_label().as_str()),
                        ("relKey", rel_key.as_str()),
                        ("action", "upload"),
                    ],
                );
            }
            Err(e) => crate::logging::warn_kv(
                "fast path upload failed",
                &[
                    ("project", ctx.project_label().as_str()),
                    ("relKey", rel_key.as_str()),
                    ("action", "upload"),
                    ("error", &e.to_string()),
                ],
            ),
        }
    } else {
        match object_store.remove(&uri).await {
            Ok(()) => {
                sidecars.clear_meta(&rel_key);
                crate::logging::info_kv(
                    "fast path deleted",
                    &[
                        ("project", ctx.project_label().as_str()),
                        ("relKey", rel_key.as_str()),
                        ("action", "delete_s3"),
                    ],
                );
            }
            Err(e) => crate::logging::warn_kv(
                "fast path delete failed",
                &[
                    ("project", ctx.project_label().as_str()),
                    ("relKey", rel_key.as_str()),
                    ("action", "delete_s3"),
                    ("error", &e.to_string()),
                ],
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn classify_placeholder_takes_priority() {
        assert_eq!(
            classify("dir/.placeholder", true, true, None),
            Classification::Placeholder
        );
    }

    #[test]
    fn classify_deleted_on_s3() {
        assert_eq!(
            classify("x.txt", true, false, Some(Source::S3)),
            Classification::DeleteLocal
        );
    }

    #[test]
    fn classify_deleted_locally() {
        assert_eq!(
            classify("x.txt", false, true, Some(Source::Local)),
            Classification::DeleteS3
        );
    }

    #[test]
    fn classify_both_present_is_compare() {
        assert_eq!(classify("x.txt", true, true, None), Classification::Compare);
    }

    #[test]
    fn classify_new_local_and_new_remote() {
        assert_eq!(classify("x.txt", true, false, None), Classification::UploadNew);
        assert_eq!(classify("x.txt", false, true, None), Classification::DownloadNew);
    }

    #[test]
    fn classify_absent_everywhere_is_noop() {
        assert_eq!(classify("x.txt", false, false, None), Classification::Noop);
    }

    #[test]
    fn compare_decision_skips_when_fingerprint_unchanged() {
        let now = Utc::now();
        let decision = compare_decision(Some("abc|1"), Some("abc|1"), now + Duration::seconds(100), now);
        assert_eq!(decision, CompareDecision::Skip);
    }

    #[test]
    fn compare_decision_applies_skew_guard() {
        let now = Utc::now();
        let decision = compare_decision(None, None, now + Duration::milliseconds(500), now);
        assert_eq!(decision, CompareDecision::Skip);
    }

    #[test]
    fn compare_decision_local_newer_uploads() {
        let now = Utc::now();
        let decision = compare_decision(Some("a"), Some("b"), now + Duration::seconds(10), now);
        assert_eq!(decision, CompareDecision::Upload);
    }

    #[test]
    fn compare_decision_remote_newer_downloads() {
        let now = Utc::now();
        let decision = compare_decision(Some("a"), Some("b"), now, now + Duration::seconds(10));
        assert_eq!(decision, CompareDecision::Download);
    }

    #[test]
    fn build_union_orders_placeholders_then_depth_then_lex() {
        let mut local = scanner::LocalListing::new();
        local.insert(
            "dir/b.txt".to_string(),
            scanner::LocalFileRecord { last_modified: Utc::now() },
        );
        local.insert(
            "a.txt".to_string(),
            scanner::LocalFileRecord { last_modified: Utc::now() },
        );
        let s3 = vec![crate::objectstore::ObjectRecord {
            rel_original: "dir/.placeholder".to_string(),
            last_modified: Utc::now(),
            real_key: "proj/dir/.placeholder".to_string(),
        }];
        let union = build_union(&local, &s3);
        let keys: Vec<&str> = union.iter().map(|e| e.rel_key.as_str()).collect();
        assert_eq!(keys[0], "dir/.placeholder");
        assert_eq!(keys[1], "a.txt");
        assert_eq!(keys[2], "dir/b.txt");
    }

    #[test]
    fn build_union_prefers_s3_original_case() {
        let mut local = scanner::LocalListing::new();
        local.insert(
            "dir/File.TXT".to_string(),
            scanner::LocalFileRecord { last_modified: Utc::now() },
        );
        let s3 = vec![crate::objectstore::ObjectRecord {
            rel_original: "Dir/file.txt".to_string(),
            last_modified: Utc::now(),
            real_key: "proj/Dir/file.txt".to_string(),
        }];
        let union = build_union(&local, &s3);
        assert_eq!(union.len(), 1);
        assert_eq!(union[0].rel_key, "Dir/file.txt");
        assert!(union[0].in_local && union[0].in_s3);
    }
}
