//! Kernel-side capture: load the probes, attach them to libssl and drain the
//! event ring into decoded captures

#![cfg(target_os = "linux")]

use crate::config::CaptureSettings;
use crate::error::{CaptureError, CaptureResult};
use crate::event::SslCapture;
use crate::forward::{forward, Forward};
use crate::loader::{bump_memlock_rlimit, check_ebpf_available, find_ebpf_object};
use crate::ssl::{resolve_ssl_library, SSL_READ_SYMBOL, SSL_WRITE_SYMBOL};
use crate::stats::{CaptureStats, StatsInner};

use aya::maps::{HashMap as AyaHashMap, MapData, PerCpuArray, RingBuf};
use aya::programs::UProbe;
use aya::{Ebpf, EbpfLoader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tlstap_common::{
    InFlightCall, Outcome, EVENTS_MAP, IN_FLIGHT_MAP, OUTCOMES_MAP, PROG_SSL_READ,
    PROG_SSL_READ_RET, PROG_SSL_WRITE, PROG_SSL_WRITE_RET,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Poll iterations between two reads of the outcome counters
const OUTCOME_REFRESH_POLLS: u32 = 50;

/// eBPF capture of SSL_read/SSL_write plaintext
pub struct EbpfCapture {
    settings: CaptureSettings,
    running: Arc<AtomicBool>,
    /// Wakes a poll task parked on a full consumer queue
    shutdown: watch::Sender<bool>,
    stats: Arc<StatsInner>,
    task: Option<JoinHandle<()>>,
}

/// Maps taken out of the loaded object, owned by the poll task
struct CaptureMaps {
    events: RingBuf<MapData>,
    outcomes: Option<PerCpuArray<MapData, u64>>,
    in_flight: Option<AyaHashMap<MapData, u64, InFlightCall>>,
}

impl EbpfCapture {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: watch::channel(false).0,
            stats: Arc::new(StatsInner::new()),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.snapshot()
    }

    /// Load and attach the probes, then spawn the task that forwards
    /// decoded captures to `tx`
    pub async fn start(&mut self, tx: mpsc::Sender<SslCapture>) -> CaptureResult<()> {
        if self.is_running() {
            return Err(CaptureError::AlreadyRunning);
        }

        info!("Starting eBPF capture...");
        if !check_ebpf_available() {
            warn!("Continuing without the BPF filesystem; loading may still fail");
        }
        bump_memlock_rlimit();

        let libssl = resolve_ssl_library(self.settings.libssl_path.as_deref(), self.settings.pid)
            .ok_or(CaptureError::NoSslLibrary)?;
        info!("Using SSL library: {}", libssl.display());

        let bytecode_path = self.bytecode_path()?;
        let bytecode = std::fs::read(&bytecode_path).map_err(|e| {
            CaptureError::Bytecode(format!("{}: {}", bytecode_path.display(), e))
        })?;
        info!(
            "Loading eBPF program from {} ({} bytes)...",
            bytecode_path.display(),
            bytecode.len()
        );

        let mut ebpf = EbpfLoader::new()
            .set_max_entries(IN_FLIGHT_MAP, self.settings.store_capacity)
            .set_max_entries(EVENTS_MAP, self.settings.channel_bytes)
            .load(&bytecode)
            .map_err(|e| CaptureError::Load(e.to_string()))?;

        // Return probes first, so every entry recorded has an exit to match it
        for (program, symbol) in [
            (PROG_SSL_WRITE_RET, SSL_WRITE_SYMBOL),
            (PROG_SSL_READ_RET, SSL_READ_SYMBOL),
            (PROG_SSL_WRITE, SSL_WRITE_SYMBOL),
            (PROG_SSL_READ, SSL_READ_SYMBOL),
        ] {
            attach_probe(&mut ebpf, program, symbol, &libssl, self.settings.pid)?;
        }

        let maps = take_maps(&mut ebpf)?;

        self.running.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        info!(
            "eBPF capture started (store capacity {}, ring {} bytes / ~{} records), polling ring buffer...",
            self.settings.store_capacity,
            self.settings.channel_bytes,
            self.settings.channel_records()
        );

        let running = self.running.clone();
        let shutdown = self.shutdown.subscribe();
        let stats = self.stats.clone();
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);

        self.task = Some(tokio::spawn(async move {
            // The programs stay attached for as long as `ebpf` is alive
            poll_events(maps, tx, running, shutdown, stats, poll_interval).await;
            drop(ebpf);
            info!("eBPF ring buffer polling stopped");
        }));

        Ok(())
    }

    /// Stop polling, detach the probes and wait for the final counters
    pub async fn stop(&mut self) -> CaptureResult<()> {
        info!("Stopping eBPF capture...");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("eBPF poll task failed: {}", e);
            }
        }
        Ok(())
    }

    fn bytecode_path(&self) -> CaptureResult<PathBuf> {
        match &self.settings.ebpf_path {
            Some(path) => Ok(path.clone()),
            None => find_ebpf_object().ok_or_else(|| {
                CaptureError::Bytecode(
                    "object not found; build ebpf/ or set capture.ebpf_path".to_string(),
                )
            }),
        }
    }
}

impl Drop for EbpfCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

/// Load one program and attach it to `symbol` in the SSL library.
///
/// Entry and return probes are both `UProbe` programs; the section they were
/// built for decides which one the kernel installs.
fn attach_probe(
    ebpf: &mut Ebpf,
    program: &str,
    symbol: &str,
    libssl: &Path,
    pid: Option<u32>,
) -> CaptureResult<()> {
    let probe: &mut UProbe = ebpf
        .program_mut(program)
        .ok_or_else(|| CaptureError::attach(program, "program not found"))?
        .try_into()
        .map_err(|e| CaptureError::attach(program, e))?;

    probe.load().map_err(|e| CaptureError::attach(program, e))?;
    probe
        .attach(symbol, libssl, pid, None)
        .map_err(|e| CaptureError::attach(program, e))?;

    info!("Attached {} to {}", program, symbol);
    Ok(())
}

/// Move the maps the poller needs out of the object
fn take_maps(ebpf: &mut Ebpf) -> CaptureResult<CaptureMaps> {
    let events = ebpf
        .take_map(EVENTS_MAP)
        .ok_or_else(|| CaptureError::map(EVENTS_MAP, "not found"))?;
    let events = RingBuf::try_from(events).map_err(|e| CaptureError::map(EVENTS_MAP, e))?;

    // Counters are diagnostics only; capture runs without them
    let outcomes: Option<PerCpuArray<MapData, u64>> =
        match ebpf.take_map(OUTCOMES_MAP).map(PerCpuArray::try_from) {
            Some(Ok(map)) => Some(map),
            Some(Err(e)) => {
                warn!("Failed to open {} map: {}", OUTCOMES_MAP, e);
                None
            }
            None => {
                debug!("{} map not found - outcome counters unavailable", OUTCOMES_MAP);
                None
            }
        };

    let in_flight: Option<AyaHashMap<MapData, u64, InFlightCall>> =
        match ebpf.take_map(IN_FLIGHT_MAP).map(AyaHashMap::try_from) {
            Some(Ok(map)) => Some(map),
            Some(Err(e)) => {
                warn!("Failed to open {} map: {}", IN_FLIGHT_MAP, e);
                None
            }
            None => None,
        };

    Ok(CaptureMaps {
        events,
        outcomes,
        in_flight,
    })
}

async fn poll_events(
    mut maps: CaptureMaps,
    tx: mpsc::Sender<SslCapture>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<StatsInner>,
    poll_interval: Duration,
) {
    let mut polls: u32 = 0;

    'poll: while running.load(Ordering::SeqCst) {
        loop {
            // Decode before awaiting so the ring item is released first
            let decoded = match maps.events.next() {
                Some(item) => SslCapture::from_bytes(&item),
                None => break,
            };

            let capture = match decoded {
                Ok(capture) => capture,
                Err(e) => {
                    debug!("Skipping malformed record: {}", e);
                    stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            stats.events_received.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_captured
                .fetch_add(capture.data.len() as u64, Ordering::Relaxed);

            match forward(&tx, capture, &mut shutdown).await {
                Forward::Sent => {}
                Forward::Closed => {
                    warn!("Capture receiver closed, stopping");
                    stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                    running.store(false, Ordering::SeqCst);
                    break 'poll;
                }
                Forward::Shutdown => {
                    debug!("Shutdown with the capture queue full");
                    stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                    break 'poll;
                }
            }
        }

        polls = polls.wrapping_add(1);
        if polls % OUTCOME_REFRESH_POLLS == 0 {
            refresh_outcomes(maps.outcomes.as_ref(), &stats);
        }

        tokio::time::sleep(poll_interval).await;
    }

    refresh_outcomes(maps.outcomes.as_ref(), &stats);

    if let Some(in_flight) = &maps.in_flight {
        let orphaned = in_flight.keys().filter(|key| key.is_ok()).count() as u64;
        if orphaned > 0 {
            debug!("{} in-flight calls had no matching exit", orphaned);
        }
        stats.orphaned.store(orphaned, Ordering::Relaxed);
    }
}

/// Sum the per-CPU outcome counters into the shared stats
fn refresh_outcomes(outcomes: Option<&PerCpuArray<MapData, u64>>, stats: &StatsInner) {
    let Some(outcomes) = outcomes else {
        return;
    };

    for outcome in Outcome::ALL {
        match outcomes.get(&outcome.index(), 0) {
            Ok(per_cpu) => stats.set_outcome(outcome, per_cpu.iter().sum()),
            Err(e) => debug!("Failed to read {} counter: {}", outcome.name(), e),
        }
    }
}
