//! Foreign memory reads from userspace
//!
//! Reads another process's memory with `process_vm_readv`, which reports
//! unmapped or protected ranges as an error instead of faulting the reader.

#![cfg(target_os = "linux")]

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;
use tlstap_common::{ForeignMemory, MemoryFault};

/// [`ForeignMemory`] backed by `process_vm_readv`.
///
/// Needs ptrace-read access to the target (same uid, or CAP_SYS_PTRACE).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    pub fn new() -> Self {
        Self
    }
}

impl ForeignMemory for ProcessMemory {
    fn read(&self, pid: u32, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        if dst.is_empty() {
            return Ok(());
        }

        let wanted = dst.len();
        let remote_iov = [RemoteIoVec {
            base: addr as usize,
            len: wanted,
        }];
        let mut local_iov = [IoSliceMut::new(dst)];

        match process_vm_readv(Pid::from_raw(pid as i32), &mut local_iov, &remote_iov) {
            Ok(read) if read == wanted => Ok(()),
            Ok(read) => Err(MemoryFault::Short { read }),
            Err(errno) => Err(MemoryFault::Unreadable(errno as i64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    /// Sandboxes commonly deny `process_vm_readv` outright
    fn is_permission_fault(fault: &MemoryFault) -> bool {
        matches!(
            fault,
            MemoryFault::Unreadable(code)
                if *code == Errno::EPERM as i64 || *code == Errno::ENOSYS as i64
        )
    }

    fn self_pid() -> u32 {
        std::process::id()
    }

    #[test]
    fn test_reads_own_buffer() {
        let source = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let mut dst = vec![0u8; source.len()];

        match ProcessMemory::new().read(self_pid(), source.as_ptr() as u64, &mut dst) {
            Ok(()) => assert_eq!(dst, source),
            // process_vm_readv is filtered in some sandboxes
            Err(fault) if is_permission_fault(&fault) => {}
            Err(fault) => panic!("unexpected fault: {fault:?}"),
        }
    }

    #[test]
    fn test_unmapped_address_is_a_fault_not_a_crash() {
        let mut dst = [0u8; 64];
        let result = ProcessMemory::new().read(self_pid(), 0, &mut dst);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_read_succeeds() {
        let mut dst = [0u8; 0];
        assert!(ProcessMemory::new().read(self_pid(), 0, &mut dst).is_ok());
    }
}
