//! Capture statistics shared between the poller and the caller

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tlstap_common::Outcome;

/// Snapshot of capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Records drained from the event channel
    pub events_received: u64,
    /// Payload bytes carried by those records
    pub bytes_captured: u64,
    /// Records that failed to decode
    pub decode_errors: u64,
    /// Records lost because the consumer went away
    pub events_dropped: u64,
    /// In-flight entries left in the store when capture stopped
    pub orphaned: Option<u64>,
    /// Interceptor outcome counters summed across CPUs
    pub outcomes: BTreeMap<&'static str, u64>,
}

impl CaptureStats {
    /// Events the exit interceptor dropped without emitting
    pub fn interceptor_drops(&self) -> u64 {
        Outcome::ALL
            .iter()
            .filter(|o| o.is_drop())
            .filter_map(|o| self.outcomes.get(o.name()))
            .sum()
    }

    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(outcome.name()).copied().unwrap_or(0)
    }
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} bytes={} decode_errors={} dropped={}",
            self.events_received, self.bytes_captured, self.decode_errors, self.events_dropped
        )?;
        for outcome in Outcome::ALL {
            write!(f, " {}={}", outcome.name(), self.outcome(outcome))?;
        }
        if let Some(orphaned) = self.orphaned {
            write!(f, " orphaned={}", orphaned)?;
        }
        Ok(())
    }
}

/// Live counters updated by the poll task
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub events_received: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub decode_errors: AtomicU64,
    pub events_dropped: AtomicU64,
    /// `u64::MAX` until the store has been counted
    pub orphaned: AtomicU64,
    pub outcomes: [AtomicU64; Outcome::COUNT as usize],
}

impl StatsInner {
    pub fn new() -> Self {
        Self {
            orphaned: AtomicU64::new(u64::MAX),
            ..Default::default()
        }
    }

    pub fn set_outcome(&self, outcome: Outcome, value: u64) {
        self.outcomes[outcome.index() as usize].store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureStats {
        let orphaned = self.orphaned.load(Ordering::Relaxed);
        CaptureStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            orphaned: (orphaned != u64::MAX).then_some(orphaned),
            outcomes: Outcome::ALL
                .iter()
                .map(|o| {
                    (
                        o.name(),
                        self.outcomes[o.index() as usize].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }
}
