use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ObjectRecord {
    /// Original-case relative key suffix, as reported by the listing.
    pub rel_original: String,
    pub last_modified: DateTime<Utc>,
    /// Full object key including the project prefix.
    pub real_key: String,
}

/// Blocking-semantics store operations, fronted by an async trait so the
/// Reconciler can run them inside the Tokio runtime without stalling other
/// projects' work. All operations log-and-abandon on failure; they never
/// panic.
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    async fn list_recursive(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectRecord>>;
    async fn copy_up(&self, local_path: &Path, object_uri: &str) -> Result<()>;
    async fn copy_down(&self, object_uri: &str, local_path: &Path) -> Result<()>;
    /// Idempotent: removing an object that doesn't exist is success.
    async fn remove(&self, object_uri: &str) -> Result<()>;
    /// Stamps an already-uploaded object with tags (used by the Webhook
    /// Router to record `{origin, fv_docid, projectId}` provenance).
    async fn tag(&self, object_uri: &str, tags: &[(String, String)]) -> Result<()>;
}

/// Shells out to the `aws` CLI for every operation. Chosen over an S3 SDK
/// client because the listing timestamp format (`yyyy-MM-dd HH:mm:ss` UTC)
/// is exactly what `aws s3 ls --recursive` emits, and every operation here
/// returns an exit code and stderr rather than a typed SDK error.
pub struct AwsCliObjectStore {
    binary: String,
}

impl Default for AwsCliObjectStore {
    fn default() -> Self {
        Self {
            binary: "aws".to_string(),
        }
    }
}

impl AwsCliObjectStore {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(bool, String, String)> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn {} {:?}", self.binary, args))?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }
}

#[async_trait]
impl ObjectStoreAdapter for AwsCliObjectStore {
    async fn list_recursive(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectRecord>> {
        let s3_uri = format!("s3://{bucket}/{prefix}");
        let (ok, stdout, stderr) = self
            .run(&["s3", "ls", "--recursive", &s3_uri])
            .await?;
        if !ok {
            anyhow::bail!("aws s3 ls failed for {s3_uri}: {stderr}");
        }
        Ok(parse_listing(&stdout, prefix))
    }

    async fn copy_up(&self, local_path: &Path, object_uri: &str) -> Result<()> {
        let local = local_path.to_string_lossy().to_string();
        let (ok, _stdout, stderr) = self.run(&["s3", "cp", &local, object_uri]).await?;
        if !ok {
            anyhow::bail!("aws s3 cp {} -> {object_uri} failed: {stderr}", local);
        }
        Ok(())
    }

    async fn copy_down(&self, object_uri: &str, local_path: &Path) -> Result<()> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let local = local_path.to_string_lossy().to_string();
        let (ok, _stdout, stderr) = self.run(&["s3", "cp", object_uri, &local]).await?;
        if !ok {
            anyhow::bail!("aws s3 cp {object_uri} -> {} failed: {stderr}", local);
        }
        Ok(())
    }

    async fn remove(&self, object_uri: &str) -> Result<()> {
        let (ok, _stdout, stderr) = self.run(&["s3", "rm", object_uri]).await?;
        if ok || stderr.to_lowercase().contains("does not exist") {
            return Ok(());
        }
        anyhow::bail!("aws s3 rm {object_uri} failed: {stderr}");
    }

    async fn tag(&self, object_uri: &str, tags: &[(String, String)]) -> Result<()> {
        let tag_set = tags
            .iter()
            .map(|(k, v)| format!("{{Key={k},Value={v}}}"))
            .collect::<Vec<_>>()
            .join(",");
        let tagging = format!("TagSet=[{tag_set}]");
        let bucket = bucket_of(object_uri)?;
        let key = key_of(object_uri)?;
        let (ok, _stdout, stderr) = self
            .run(&["s3api", "put-object-tagging", "--bucket", bucket, "--key", key, "--tagging", &tagging])
            .await?;
        if !ok {
            anyhow::bail!("aws s3api put-object-tagging {object_uri} failed: {stderr}");
        }
        Ok(())
    }
}

fn bucket_of(object_uri: &str) -> Result<&str> {
    object_uri
        .strip_prefix("s3://")
        .and_then(|rest| rest.split('/').next())
        .filter(|b| !b.is_empty())
        .context("malformed object uri: missing bucket")
}

fn key_of(object_uri: &str) -> Result<&str> {
    let rest = object_uri.strip_prefix("s3://").context("malformed object uri: missing scheme")?;
    rest.splitn(2, '/')
        .nth(1)
        .filter(|k| !k.is_empty())
        .context("malformed object uri: missing key")
}

/// Parses `aws s3 ls --recursive` output: one line per object,
/// `yyyy-MM-dd HH:mm:ss<ws>size<ws>key`. `prefix` is stripped from each key
/// to produce the project-relative `rel_original`; malformed lines are
/// skipped.
fn parse_listing(stdout: &str, prefix: &str) -> Vec<ObjectRecord> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, char::is_whitespace);
        let Some(date) = parts.next() else { continue };
        let rest = line[date.len()..].trim_start();
        let mut rest_parts = rest.splitn(3, char::is_whitespace);
        let Some(time) = rest_parts.next() else {
            continue;
        };
        let rest2 = rest[time.len()..].trim_start();
        let mut rest2_parts = rest2.splitn(2, char::is_whitespace);
        let Some(_size) = rest2_parts.next() else {
            continue;
        };
        let Some(key) = rest2_parts.next() else {
            continue;
        };
        let key = key.trim();

        let Ok(naive) = NaiveDateTime::parse_from_str(
            &format!("{date} {time}"),
            "%Y-%m-%d %H:%M:%S",
        ) else {
            continue;
        };
        let last_modified = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);

        let rel_original = key
            .strip_prefix(prefix)
            .unwrap_or(key)
            .trim_start_matches('/')
            .to_string();
        if rel_original.is_empty() {
            continue;
        }

        out.push(ObjectRecord {
            rel_original,
            last_modified,
            real_key: key.to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listing_extracts_relative_keys() {
        let stdout = "2024-01-01 10:00:00          0 A/dir/.placeholder\n\
                       2024-01-02 11:30:05       1024 A/dir/x.txt\n";
        let records = parse_listing(stdout, "A/");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rel_original, "dir/.placeholder");
        assert_eq!(records[1].rel_original, "dir/x.txt");
        assert_eq!(
            records[1].last_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-01-02 11:30:05"
        );
    }

    #[test]
    fn parse_listing_skips_malformed_lines() {
        let stdout = "garbage line with no timestamp\n\n";
        assert!(parse_listing(stdout, "A/").is_empty());
    }

    #[test]
    fn parse_listing_skips_prefix_only_entries() {
        let stdout = "2024-01-01 10:00:00          0 A/\n";
        assert!(parse_listing(stdout, "A/").is_empty());
    }
}
