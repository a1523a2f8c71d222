//! Host checks and preparation before loading the eBPF program

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where the built eBPF object is looked for when no path is configured
pub static EBPF_OBJECT_PATHS: &[&str] = &[
    "ebpf/target/bpfel-unknown-none/release/tlstap-ebpf",
    "ebpf/target/bpfel-unknown-none/debug/tlstap-ebpf",
    "/usr/local/lib/tlstap/tlstap-ebpf",
    "/usr/lib/tlstap/tlstap-ebpf",
];

/// Capabilities of the running host relevant to capture
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub bpf_fs: bool,
    pub btf: bool,
    pub kernel: Option<(u32, u32, u32)>,
    pub root: bool,
    pub ssl_libraries: Vec<PathBuf>,
    pub ebpf_object: Option<PathBuf>,
}

impl HostStatus {
    pub fn probe() -> Self {
        Self {
            bpf_fs: Path::new("/sys/fs/bpf").exists(),
            btf: Path::new("/sys/kernel/btf/vmlinux").exists(),
            kernel: get_kernel_version(),
            root: is_root(),
            ssl_libraries: crate::ssl::find_ssl_libraries(),
            ebpf_object: find_ebpf_object(),
        }
    }

    /// Ring buffer maps need Linux 5.8
    pub fn supports_ringbuf(&self) -> bool {
        self.kernel.is_some_and(|(major, minor, _)| (major, minor) >= (5, 8))
    }

    pub fn ready(&self) -> bool {
        self.bpf_fs && self.root && self.supports_ringbuf() && !self.ssl_libraries.is_empty()
    }
}

/// Check if eBPF is available on this system
pub fn check_ebpf_available() -> bool {
    if !Path::new("/sys/fs/bpf").exists() {
        warn!("BPF filesystem not mounted at /sys/fs/bpf");
        return false;
    }

    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not available - CO-RE programs may not work");
    }

    true
}

/// Check kernel version for eBPF feature support
pub fn get_kernel_version() -> Option<(u32, u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_kernel_release(&release)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();

    if parts.len() >= 2 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].split('-').next()?.parse().ok()?;
        let patch = parts
            .get(2)
            .and_then(|p| p.split('-').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Some((major, minor, patch))
    } else {
        None
    }
}

/// Check if running as root
#[cfg(target_os = "linux")]
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(target_os = "linux"))]
pub fn is_root() -> bool {
    false
}

/// Locate the eBPF object in the usual build and install locations
pub fn find_ebpf_object() -> Option<PathBuf> {
    EBPF_OBJECT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Bump memlock rlimit for eBPF (required on kernels before 5.11)
#[cfg(target_os = "linux")]
pub fn bump_memlock_rlimit() -> bool {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory (ret={})", ret);
        false
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.8.0-45-generic\n"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_release("5.15.153.1-microsoft"), Some((5, 15, 153)));
        assert_eq!(parse_kernel_release("6.1"), Some((6, 1, 0)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_ringbuf_support_needs_5_8() {
        let mut status = HostStatus {
            bpf_fs: true,
            btf: true,
            kernel: Some((5, 4, 0)),
            root: true,
            ssl_libraries: vec![PathBuf::from("/usr/lib/libssl.so")],
            ebpf_object: None,
        };
        assert!(!status.supports_ringbuf());
        assert!(!status.ready());

        status.kernel = Some((5, 8, 0));
        assert!(status.supports_ringbuf());
        assert!(status.ready());
    }
}
