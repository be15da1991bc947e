use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

const IGNORE_LINES: &[&str] = &[
    "*.placeholder",
    "~$*",
    "*.tmp",
    ".DS_Store",
    "Thumbs.db",
    ".last_sync_state.json",
    "*.part",
    "*.crdownload",
    "*.temp",
    "*.swp",
    "*.swx",
    "*.lnk",
    // The sidecar metadata shadow tree (see sidecar.rs) is never itself a
    // syncable file.
    ".sync",
];

// `*.*.[0-9A-Fa-f]{8}` (hex-suffixed editor scratch names) isn't expressible
// as a single gitignore glob, so it's checked separately in `is_ignored`.
fn hex_scratch_suffix(basename: &str) -> bool {
    let mut parts = basename.rsplitn(2, '.');
    let Some(suffix) = parts.next() else {
        return false;
    };
    if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    let Some(rest) = parts.next() else {
        return false;
    };
    rest.contains('.')
}

fn matcher() -> &'static Gitignore {
    static MATCHER: OnceLock<Gitignore> = OnceLock::new();
    MATCHER.get_or_init(|| {
        let mut builder = GitignoreBuilder::new("/");
        for line in IGNORE_LINES {
            let _ = builder.add_line(None, line);
        }
        builder.build().unwrap_or_else(|_| Gitignore::empty())
    })
}

/// True iff `basename` matches one of the transient/editor-scratch patterns
/// this system never uploads, downloads, deletes, or records in a manifest.
pub fn is_ignored(basename: &str) -> bool {
    if matcher()
        .matched_path_or_any_parents(Path::new(basename), false)
        .is_ignore()
    {
        return true;
    }
    hex_scratch_suffix(basename)
}

/// Strips filesystem-unsafe characters from a project/folder display name,
/// collapses whitespace, and trims trailing dots. Never returns an empty
/// string.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = false;
    for c in name.chars() {
        if c.is_control() || "<>:\"/\\|?".contains(c) {
            continue;
        }
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        out.push(c);
    }
    let trimmed = out.trim().trim_end_matches('.').trim();
    if trimmed.is_empty() {
        "Unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extends a local drive-letter path with the Windows long-path prefix,
/// leaving UNC paths and already-extended paths unchanged. A no-op on
/// platforms without a short-path limit.
pub fn long_path(p: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        let s = p.to_string_lossy();
        if s.starts_with(r"\\?\") || s.starts_with(r"\\") {
            return p.to_path_buf();
        }
        if s.len() >= 2 && s.as_bytes()[1] == b':' {
            return PathBuf::from(format!(r"\\?\{s}"));
        }
        p.to_path_buf()
    }
    #[cfg(not(windows))]
    {
        p.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_unsafe_chars() {
        assert_eq!(sanitize("Smith / Jones: Case <1>"), "Smith Jones Case 1");
        assert_eq!(sanitize("   "), "Unnamed");
        assert_eq!(sanitize(""), "Unnamed");
        assert_eq!(sanitize("Trailing..."), "Trailing");
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize("a   b\t\tc"), "a b c");
    }

    #[test]
    fn is_ignored_matches_documented_patterns() {
        for name in [
            "folder.placeholder",
            "~$budget.xlsx",
            "scratch.tmp",
            ".DS_Store",
            "Thumbs.db",
            ".last_sync_state.json",
            "download.part",
            "download.crdownload",
            "file.temp",
            ".file.swp",
            ".file.swx",
            "shortcut.lnk",
            ".sync",
        ] {
            assert!(is_ignored(name), "{name} should be ignored");
        }
    }

    #[test]
    fn is_ignored_matches_hex_scratch_suffix() {
        assert!(is_ignored("report.docx.a1b2c3d4"));
        assert!(!is_ignored("report.a1b2c3d4")); // needs two dots
        assert!(!is_ignored("report.docx.zzzzzzzz")); // not hex
    }

    #[test]
    fn regular_files_are_not_ignored() {
        assert!(!is_ignored("case_summary.pdf"));
        assert!(!is_ignored("notes.txt"));
    }
}
