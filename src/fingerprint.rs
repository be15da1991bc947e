use std::fs;
use std::io::Read;
use std::path::Path;

/// `md5(content)|size` — the identity of a byte sequence used for echo
/// suppression. Returns `None` on read error (deleted, permission denied,
/// locked file): the caller treats a missing fingerprint as "unknown", not
/// as a zero-length file.
pub fn fingerprint(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
        size += n as u64;
    }
    Some(format!("{:x}|{size}", ctx.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("originsync-fp-test-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn fingerprint_includes_size_and_is_stable() {
        let path = temp_file("x.txt", b"hello world");
        let a = fingerprint(&path).unwrap();
        let b = fingerprint(&path).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("|11"));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let path = temp_file("y.txt", b"one");
        let a = fingerprint(&path).unwrap();
        fs::write(&path, b"two-longer").unwrap();
        let b = fingerprint(&path).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_none_for_missing_file() {
        let missing = std::env::temp_dir().join("originsync-fp-test-missing-xyz");
        assert!(fingerprint(&missing).is_none());
    }
}
