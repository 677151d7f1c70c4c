//! Diagnostic dump
//!
//! A dump must never hang on a wedged loop or a stuck hardware call, so
//! every lock it needs is taken with bounded retries and reported as held
//! when that fails.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

use crate::protocol::{AudioMode, Pid};
use crate::threads::playback::OutputDump;
use crate::threads::record::InputDump;

/// Take `lock`, trying `retries` times with `sleep` in between
pub(crate) fn try_lock_retrying<T>(
    lock: &Mutex<T>,
    retries: u32,
    sleep: Duration,
) -> Option<MutexGuard<'_, T>> {
    for attempt in 0..retries.max(1) {
        if let Some(guard) = lock.try_lock() {
            return Some(guard);
        }
        if attempt + 1 < retries {
            std::thread::sleep(sleep);
        }
    }
    None
}

/// Full server state at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub generated_at: DateTime<Utc>,
    /// Last hardware call in flight, if the hardware lock was held
    pub hardware_busy: bool,
    /// The server lock could not be taken; the tables below may be stale
    pub server_locked: bool,
    pub mode: AudioMode,
    pub clients: Vec<Pid>,
    pub listeners: usize,
    pub master_volume: f32,
    pub master_mute: bool,
    pub outputs: Vec<OutputDump>,
    pub inputs: Vec<InputDump>,
}

impl DumpReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human readable rendering, one block per io
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "audiomux dump at {}", self.generated_at.to_rfc3339());
        if self.hardware_busy {
            let _ = writeln!(out, "Hardware lock is taken");
        }
        if self.server_locked {
            let _ = writeln!(out, "Server lock is held, server may be deadlocked");
        }
        let _ = writeln!(
            out,
            "mode {:?}, master volume {:.3}{}, {} listener(s)",
            self.mode,
            self.master_volume,
            if self.master_mute { " (muted)" } else { "" },
            self.listeners
        );
        let _ = writeln!(out, "Clients: {:?}", self.clients);

        for output in &self.outputs {
            let _ = writeln!(out, "Output {} {} ({:?})", output.handle, output.name, output.kind);
            if output.locked {
                let _ = writeln!(out, "  thread lock is held, thread may be deadlocked");
            }
            if let Some(d) = &output.descriptor {
                let _ = writeln!(
                    out,
                    "  {} Hz {:?} x{}, {} frames, {} ms",
                    d.sample_rate, d.format, d.channels, d.frame_count, d.latency_ms
                );
            }
            write_stats(&mut out, &output.stats);
            if output.suspended > 0 {
                let _ = writeln!(out, "  suspended x{}", output.suspended);
            }
            if !output.sinks.is_empty() {
                let _ = writeln!(out, "  duplicating to {:?}", output.sinks);
            }
            let _ = writeln!(
                out,
                "  {:<6} {:<5} {:<6} {:<16} {:<10} {:<6} {:>6} {:>10} {:>10} {:>11}",
                "id", "name", "client", "stream", "state", "format", "frames", "user", "server", "volume"
            );
            for t in &output.tracks {
                let _ = writeln!(
                    out,
                    "  {:<6} {:<5} {:<6} {:<16} {:<10} {:<6} {:>6} {:>10} {:>10} {:>5}/{:<5}{}",
                    t.id.to_string(),
                    t.name.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    t.client.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    format!("{:?}", t.stream),
                    format!("{:?}", t.state),
                    format!("{:?}", t.format),
                    t.frame_count,
                    t.user,
                    t.server,
                    t.volume[0],
                    t.volume[1],
                    if t.active { " *" } else { "" }
                );
            }
        }

        for input in &self.inputs {
            let _ = writeln!(out, "Input {} {}", input.handle, input.name);
            if input.locked {
                let _ = writeln!(out, "  thread lock is held, thread may be deadlocked");
            }
            if let (Some(req), Some(native)) = (&input.requested, &input.native) {
                let _ = writeln!(
                    out,
                    "  delivers {} Hz x{}, hardware {} Hz {:?} x{}",
                    req.sample_rate, req.channels, native.sample_rate, native.format, native.channels
                );
            }
            write_stats(&mut out, &input.stats);
            for t in &input.tracks {
                let _ = writeln!(
                    out,
                    "  track {} client {:?} {:?} {:?} x{} user {} server {}{}",
                    t.id,
                    t.client,
                    t.state,
                    t.format,
                    t.channels,
                    t.user,
                    t.server,
                    if t.active { " *" } else { "" }
                );
            }
        }
        out
    }
}

fn write_stats(out: &mut String, stats: &crate::threads::StatsSnapshot) {
    let age = stats
        .last_io_age_ms
        .map(|ms| format!("{ms} ms ago"))
        .unwrap_or_else(|| "never".into());
    let _ = writeln!(
        out,
        "  last transfer {}, total {}, delayed {}, bytes {}, in transfer {}, standby {}",
        age, stats.total_io, stats.delayed_io, stats.bytes, stats.in_io, stats.standby
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_lock_gives_up() {
        let lock = Arc::new(Mutex::new(1));
        let held = lock.lock();
        assert!(try_lock_retrying(&lock, 3, Duration::from_millis(1)).is_none());
        drop(held);
        assert_eq!(*try_lock_retrying(&lock, 3, Duration::from_millis(1)).unwrap(), 1);
    }

    #[test]
    fn test_text_mentions_deadlock() {
        let report = DumpReport {
            generated_at: Utc::now(),
            hardware_busy: true,
            server_locked: true,
            mode: AudioMode::Normal,
            clients: vec![12],
            listeners: 0,
            master_volume: 1.0,
            master_mute: false,
            outputs: Vec::new(),
            inputs: Vec::new(),
        };
        let text = report.to_text();
        assert!(text.contains("Hardware lock is taken"));
        assert!(text.contains("may be deadlocked"));
        assert!(report.to_json().unwrap().contains("\"clients\""));
    }
}
