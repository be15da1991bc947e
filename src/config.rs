use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use crate::origin::OriginCredentials;

/// `originsyncd run --zdrive <path> --s3-path s3://bucket`. Config beyond
/// these two CLI options comes from environment / env-file, precedence
/// flag > env > file > default.
#[derive(Debug, Parser)]
#[command(name = "originsyncd", version, about = "Three-way Origin/Object Store/Local Mirror sync daemon")]
pub struct Cli {
    /// Local mirror root.
    #[arg(long = "zdrive", env = "ZDRIVE_ROOT", global = true)]
    pub zdrive_root: Option<PathBuf>,

    /// `s3://<bucket>[/<prefix>]`.
    #[arg(long = "s3-path", env = "S3_PATH", global = true)]
    pub s3_path: Option<String>,

    /// Key=value env file (defaults to `.env` in the current directory).
    #[arg(long = "env-file", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the reconciliation daemon: discover projects, hydrate, watch,
    /// poll, and serve the Origin webhook.
    Run {
        #[arg(long = "webhook-addr", default_value = "0.0.0.0:8080")]
        webhook_addr: String,
    },
    /// Print the resolved project-map path and exit.
    ConfigPath,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub zdrive_root: PathBuf,
    pub bucket: String,
    pub s3_root_prefix: String,
    pub org_marker: String,
    pub org_folder_name: String,
    pub root_folder_id: Option<i64>,
    pub require_resolved: bool,
    pub enable_origin_upload: bool,
    pub project_map_path: PathBuf,
    pub origin: Option<OriginCredentials>,
    pub webhook_url: Option<String>,
}

const DEFAULT_S3_ROOT_PREFIX: &str = "filevine-sync";
const DEFAULT_ORG_FOLDER_NAME: &str = "Filevine";

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".originsync").join("logs").join("originsync.log")
}

pub fn default_project_map_path() -> PathBuf {
    home_dir().join(".originsync").join("projects.json")
}

impl Config {
    /// Assembles the immutable `Config` once at startup: CLI flags take
    /// precedence over environment variables, which take precedence over
    /// the key=value env file, which takes precedence over built-in
    /// defaults. There is no mutable global configuration anywhere else in
    /// the process.
    pub fn load(cli: &Cli) -> Result<Self> {
        let env_file_path = cli
            .env_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(".env"));
        let file_vars = load_env_file(&env_file_path).unwrap_or_default();

        let lookup = |key: &str| -> Option<String> {
            std::env::var(key).ok().or_else(|| file_vars.get(key).cloned())
        };

        let zdrive_root = cli
            .zdrive_root
            .clone()
            .or_else(|| lookup("ZDRIVE_ROOT").map(PathBuf::from))
            .context("ZDriveRoot is required (--zdrive, ZDRIVE_ROOT, or env file)")?;

        let s3_path = cli
            .s3_path
            .clone()
            .or_else(|| lookup("S3_PATH"))
            .context("S3Path is required (--s3-path, S3_PATH, or env file)")?;
        let (bucket, s3_root_prefix) = parse_s3_path(&s3_path)?;

        let origin = match (
            lookup("API_KEY"),
            lookup("API_SECRET"),
            lookup("USER_ID"),
            lookup("ORG_ID"),
            lookup("SESSION_URL"),
        ) {
            (Some(api_key), Some(api_secret), Some(user_id), Some(org_id), Some(session_url)) => {
                validate_url(&session_url)?;
                Some(OriginCredentials { api_key, api_secret, user_id, org_id, session_url })
            }
            _ => {
                crate::logging::warn("Origin credentials incomplete; Origin features degrade to no-ops");
                None
            }
        };
        let webhook_url = lookup("FILEVINE_TO_S3_WEBHOOK");

        Ok(Config {
            zdrive_root,
            bucket,
            s3_root_prefix: s3_root_prefix.unwrap_or_else(|| DEFAULT_S3_ROOT_PREFIX.to_string()),
            org_marker: lookup("ORG_MARKER").unwrap_or_else(|| "org".to_string()),
            org_folder_name: lookup("ORG_FOLDER_NAME").unwrap_or_else(|| DEFAULT_ORG_FOLDER_NAME.to_string()),
            root_folder_id: lookup("ROOT_FOLDER_ID").and_then(|v| v.parse().ok()),
            require_resolved: lookup("REQUIRE_RESOLVED").map(|v| v == "true" || v == "1").unwrap_or(false),
            enable_origin_upload: lookup("ENABLE_ORIGIN_UPLOAD").map(|v| v == "true" || v == "1").unwrap_or(false),
            project_map_path: lookup("PROJECT_MAP_PATH").map(PathBuf::from).unwrap_or_else(default_project_map_path),
            origin,
            webhook_url,
        })
    }
}

fn parse_s3_path(raw: &str) -> Result<(String, Option<String>)> {
    let rest = raw.strip_prefix("s3://").context("S3Path must start with s3://")?;
    let mut parts = rest.splitn(2, '/');
    let bucket = parts.next().filter(|b| !b.is_empty()).context("S3Path missing bucket")?;
    let prefix = parts.next().map(|p| {
        let p = p.trim_end_matches('/');
        format!("{p}/")
    });
    Ok((bucket.to_string(), prefix))
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Parses a key=value file: `#`-prefixed and empty lines are skipped,
/// values may optionally be wrapped in double quotes.
pub fn load_env_file(path: &Path) -> Option<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut out = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim().to_string();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = value[1..value.len() - 1].to_string();
        }
        out.insert(key, value);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn parse_s3_path_splits_bucket_and_prefix() {
        let (bucket, prefix) = parse_s3_path("s3://mybucket/some/prefix").unwrap();
        assert_eq!(bucket, "mybucket");
        assert_eq!(prefix.as_deref(), Some("some/prefix/"));
    }

    #[test]
    fn parse_s3_path_bucket_only() {
        let (bucket, prefix) = parse_s3_path("s3://mybucket").unwrap();
        assert_eq!(bucket, "mybucket");
        assert_eq!(prefix, None);
    }

    #[test]
    fn parse_s3_path_rejects_non_s3_scheme() {
        assert!(parse_s3_path("https://example.com").is_err());
    }

    #[test]
    fn load_env_file_skips_comments_and_blank_lines() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = std::env::temp_dir().join(format!("originsync-envfile-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".env");
        std::fs::write(
            &path,
            "# a comment\n\nAPI_KEY=abc123\nSESSION_URL=\"https://example.test/session\"\n",
        )
        .unwrap();
        let vars = load_env_file(&path).unwrap();
        assert_eq!(vars.get("API_KEY").map(String::as_str), Some("abc123"));
        assert_eq!(vars.get("SESSION_URL").map(String::as_str), Some("https://example.test/session"));
    }

    #[test]
    fn missing_env_file_is_none_not_error() {
        let missing = std::env::temp_dir().join("originsync-envfile-missing-xyz/.env");
        assert!(load_env_file(&missing).is_none());
    }

    #[test]
    fn validate_url_rejects_non_http_scheme() {
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("https://example.com").is_ok());
    }
}
