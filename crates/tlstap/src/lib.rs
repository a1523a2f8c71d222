//! tlstap - plaintext capture at the SSL_read/SSL_write boundary
//!
//! An eBPF uprobe on entry to `SSL_read`/`SSL_write` records the caller's
//! buffer in a correlation store keyed by thread and call kind. The matching
//! uretprobe takes that entry back, copies up to `MAX_CAPTURE` bytes of the
//! buffer out of the traced process and publishes them on a ring buffer that
//! this crate drains.
//!
//! The correlation logic lives in `tlstap-common` and is generic over its
//! store, memory reader and channel. This crate provides native versions of
//! those ([`SlotStore`], [`ProcessMemory`], [`EventRing`]) alongside the
//! loader for the kernel program.

pub mod channel;
pub mod config;
pub mod content;
#[cfg(target_os = "linux")]
pub mod ebpf_capture;
pub mod error;
pub mod event;
#[cfg(target_os = "linux")]
mod forward;
pub mod loader;
#[cfg(target_os = "linux")]
pub mod memory;
pub mod ssl;
pub mod stats;
pub mod store;

pub use channel::EventRing;
pub use config::{CaptureSettings, ConfigLoader, TapConfig};
pub use content::ContentKind;
#[cfg(target_os = "linux")]
pub use ebpf_capture::EbpfCapture;
pub use error::{CaptureError, CaptureResult, DecodeError};
pub use event::{Direction, SslCapture};
#[cfg(target_os = "linux")]
pub use memory::ProcessMemory;
pub use stats::CaptureStats;
pub use store::SlotStore;

pub use tlstap_common::{
    CallKind, CapturedEvent, CorrelationStore, EventChannel, EventSlot, ForeignMemory,
    Interceptor, MemoryFault, Outcome, Task, MAX_CAPTURE,
};
