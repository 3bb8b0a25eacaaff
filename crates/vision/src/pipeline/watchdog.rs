//! Watchdog reporting stalled input streams and a stalled dispatcher.
//!
//! The ingest thread beats once per received message on each stream and the
//! dispatcher once per cycle. A component that stops beating is reported once
//! per stall with a warning and the `seg_stream_stale` gauge; the pipeline
//! itself keeps running.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{info, warn};

use crate::pipeline::telemetry;

/// Sleep interval between watchdog health checks.
pub const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
/// Grace period at startup allowing the streams to warm up before monitoring.
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Logical components monitored by the watchdog.
pub enum HealthComponent {
    ColorStream,
    DepthStream,
    Dispatcher,
}

impl HealthComponent {
    pub const ALL: [HealthComponent; 3] = [
        HealthComponent::ColorStream,
        HealthComponent::DepthStream,
        HealthComponent::Dispatcher,
    ];

    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::ColorStream => "color",
            HealthComponent::DepthStream => "depth",
            HealthComponent::Dispatcher => "dispatch",
        }
    }

    fn index(self) -> usize {
        match self {
            HealthComponent::ColorStream => 0,
            HealthComponent::DepthStream => 1,
            HealthComponent::Dispatcher => 2,
        }
    }
}

/// Last heartbeat (ms since epoch) per component, plus a stalled flag.
#[derive(Debug)]
pub struct StreamHealth {
    last_beat: [AtomicU64; 3],
    stalled: [AtomicBool; 3],
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHealth {
    /// Initialise the tracker with the startup grace period applied to every component.
    pub fn new() -> Self {
        Self::starting_at(current_millis())
    }

    fn starting_at(now: u64) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            last_beat: std::array::from_fn(|_| AtomicU64::new(grace_deadline)),
            stalled: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        self.last_beat[component.index()].store(now, Ordering::Relaxed);
    }

    /// Components whose last heartbeat is older than the stale threshold.
    pub fn stale_components(&self, now: u64) -> Vec<HealthComponent> {
        HealthComponent::ALL
            .into_iter()
            .filter(|c| {
                let last = self.last_beat[c.index()].load(Ordering::Relaxed);
                now.saturating_sub(last) > WATCHDOG_STALE_THRESHOLD_MS
            })
            .collect()
    }

    /// Update stall flags for `now` and return `(component, stalled)` transitions.
    pub fn check(&self, now: u64) -> Vec<(HealthComponent, bool)> {
        let stale = self.stale_components(now);
        HealthComponent::ALL
            .into_iter()
            .filter_map(|c| {
                let is_stale = stale.contains(&c);
                let was_stale = self.stalled[c.index()].swap(is_stale, Ordering::Relaxed);
                (was_stale != is_stale).then_some((c, is_stale))
            })
            .collect()
    }
}

/// Spawn the watchdog thread; it exits once `shutdown` is set.
pub fn spawn_watchdog(
    health: Arc<StreamHealth>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("seg-watchdog", move || {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            for (component, stalled) in health.check(current_millis()) {
                metrics::gauge!("seg_stream_stale", "component" => component.label())
                    .set(if stalled { 1.0 } else { 0.0 });
                if stalled {
                    warn!(
                        "no {} heartbeat for over {WATCHDOG_STALE_THRESHOLD_MS} ms",
                        component.label()
                    );
                } else {
                    info!("{} heartbeat resumed", component.label());
                }
            }
        }
    })
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
