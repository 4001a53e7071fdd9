//! Integrity Primitives
//!
//! SHA-256 digests over rule and container content, and the sidecar
//! `.sha256` files recording the digest of what is currently on disk.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::constants::DIGEST_EXT;

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hex SHA-256 over lines, each terminated by a newline.
/// Matches the digest of the decompressed container file.
pub fn sha256_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Path of the digest sidecar for a file
pub fn digest_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(DIGEST_EXT);
    PathBuf::from(name)
}

/// Read a persisted digest; absent or unreadable sidecars yield None
pub fn read_digest(path: &Path) -> Option<String> {
    fs::read_to_string(digest_path(path))
        .ok()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// True when the local sidecar equals the remote digest
pub fn digest_matches(path: &Path, remote: &str) -> bool {
    read_digest(path).map_or(false, |local| local.eq_ignore_ascii_case(remote.trim()))
}

/// Write a file through a temporary sibling so readers never see a torn file
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Persist the digest sidecar for a file
pub fn write_digest(path: &Path, digest: &str) -> io::Result<()> {
    write_atomic(&digest_path(path), digest.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_lines_digest_matches_file_bytes() {
        let lines = vec!["evil.com", "bad.org"];
        assert_eq!(sha256_lines(&lines), sha256_hex(b"evil.com\nbad.org\n"));
        assert_eq!(sha256_lines::<&str>(&[]), sha256_hex(b""));
    }

    #[test]
    fn test_digest_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("database.rules");

        assert!(read_digest(&file).is_none());
        assert!(!digest_matches(&file, "abcd"));

        write_digest(&file, "ABCD\n").unwrap();
        assert_eq!(digest_path(&file), temp_dir.path().join("database.rules.sha256"));
        assert!(digest_matches(&file, "abcd"));
        assert!(!digest_matches(&file, "abce"));
    }

    #[test]
    fn test_sha256_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("data.bin");
        write_atomic(&file, b"abc").unwrap();
        assert_eq!(sha256_file(&file).unwrap(), sha256_hex(b"abc"));
    }
}
