//! SSL library discovery for uprobe attachment

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Common SSL library paths
pub static SSL_LIBRARY_PATHS: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libssl.so.3",
    "/usr/lib/x86_64-linux-gnu/libssl.so.1.1",
    "/usr/lib/aarch64-linux-gnu/libssl.so.3",
    "/usr/lib/aarch64-linux-gnu/libssl.so.1.1",
    "/lib/x86_64-linux-gnu/libssl.so.3",
    "/lib/x86_64-linux-gnu/libssl.so.1.1",
    "/lib/aarch64-linux-gnu/libssl.so.3",
    "/lib/aarch64-linux-gnu/libssl.so.1.1",
    "/usr/lib64/libssl.so.3",
    "/usr/lib64/libssl.so.1.1",
    "/usr/lib/libssl.so.3",
    "/usr/lib/libssl.so.1.1",
    "/usr/lib/libssl.so",
];

/// Symbols the probes attach to
pub const SSL_READ_SYMBOL: &str = "SSL_read";
pub const SSL_WRITE_SYMBOL: &str = "SSL_write";

/// Find available SSL libraries on the system
pub fn find_ssl_libraries() -> Vec<PathBuf> {
    SSL_LIBRARY_PATHS
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .collect()
}

/// Find the libssl a running process has mapped, via /proc/{pid}/maps
pub fn find_ssl_library_for_pid(pid: u32) -> Option<PathBuf> {
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid)).ok()?;
    let found = libssl_from_maps(&maps);
    debug!("libssl mapped by pid {}: {:?}", pid, found);
    found
}

/// Pick the libssl path out of the contents of a maps file
fn libssl_from_maps(maps: &str) -> Option<PathBuf> {
    maps.lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .find(|path| is_libssl(path))
        .map(PathBuf::from)
}

fn is_libssl(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("libssl.so"))
}

/// Resolve the library to attach to: explicit path, then the library the
/// target process has mapped, then the well-known system locations
pub fn resolve_ssl_library(explicit: Option<&Path>, pid: Option<u32>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    pid.and_then(find_ssl_library_for_pid)
        .or_else(|| find_ssl_libraries().into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a28000 r--p 00000000 08:01 1311 /usr/bin/curl
7f1c2a000000-7f1c2a09b000 r--p 00000000 08:01 2222 /usr/lib/x86_64-linux-gnu/libssl.so.3
7f1c2a09b000-7f1c2a0f7000 r-xp 0009b000 08:01 2222 /usr/lib/x86_64-linux-gnu/libssl.so.3
7f1c2b000000-7f1c2b021000 rw-p 00000000 00:00 0
7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn test_libssl_from_maps() {
        assert_eq!(
            libssl_from_maps(MAPS),
            Some(PathBuf::from("/usr/lib/x86_64-linux-gnu/libssl.so.3"))
        );
    }

    #[test]
    fn test_no_libssl_in_maps() {
        let maps = "7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]\n";
        assert_eq!(libssl_from_maps(maps), None);
    }

    #[test]
    fn test_is_libssl_ignores_lookalikes() {
        assert!(is_libssl("/usr/lib64/libssl.so.1.1"));
        assert!(!is_libssl("/usr/lib64/libcrypto.so.3"));
        assert!(!is_libssl("/opt/libssl.so.backup/libfoo.so"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/opt/openssl/lib/libssl.so.3");
        assert_eq!(
            resolve_ssl_library(Some(&explicit), Some(1)),
            Some(explicit.clone())
        );
    }
}
