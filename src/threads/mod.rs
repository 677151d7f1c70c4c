//! Audio worker threads
//!
//! Every opened io runs one long-lived loop on its own OS thread:
//! [`PlaybackThread`] for outputs (mixing, direct or duplicating) and
//! [`RecordThread`] for inputs. The pieces every loop shares live here:
//! the parameter-change queue answered at the loop's checkpoint, the
//! config-event queue delivered with the thread lock released, the exit
//! flag, and write/read statistics.

pub mod backoff;
pub mod playback;
pub mod priority;
pub mod record;

pub use playback::{OutputKind, PlaybackThread};
pub use record::RecordThread;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crate::constants::PARAMETER_REPLY_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{IoConfigEvent, IoConfigNotification, IoDescriptor, IoHandle, StreamType};
use crate::server::listeners::ListenerRegistry;

/// Pending `set_parameters` call waiting for the loop
pub(crate) struct ParamRequest {
    pub kv: String,
    pub reply: Sender<Result<()>>,
}

/// Notification queued by a loop for delivery outside its lock
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConfigEvent {
    pub event: IoConfigEvent,
    pub stream: Option<StreamType>,
}

/// Queues every thread keeps under its state lock
#[derive(Default)]
pub(crate) struct ThreadQueues {
    pub params: VecDeque<ParamRequest>,
    pub events: VecDeque<ConfigEvent>,
}

impl ThreadQueues {
    pub fn push_event(&mut self, event: IoConfigEvent) {
        self.events.push_back(ConfigEvent {
            event,
            stream: None,
        });
    }

    /// Answer every queued request with `status`; used on exit
    pub fn fail_pending(&mut self, reason: &str) {
        for req in self.params.drain(..) {
            let _ = req.reply.send(Err(Error::NotInitialized(reason.to_string())));
        }
    }
}

/// Thread state types that carry the shared queues
pub(crate) trait ThreadState {
    fn queues(&mut self) -> &mut ThreadQueues;
    fn descriptor(&self) -> IoDescriptor;
}

/// Identity, exit flag and event delivery shared by all loops
pub struct ThreadBase {
    handle: IoHandle,
    name: String,
    exit_pending: AtomicBool,
    listeners: Arc<ListenerRegistry>,
    join: Mutex<Option<JoinHandle<()>>>,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl ThreadBase {
    pub(crate) fn new(handle: IoHandle, name: String, listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            handle,
            name,
            exit_pending: AtomicBool::new(false),
            listeners,
            join: Mutex::new(None),
            loop_thread: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> IoHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_pending.load(Ordering::Acquire)
    }

    /// Spawn the loop on a named OS thread
    pub(crate) fn spawn(&self, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(body)?;
        *self.loop_thread.lock() = Some(handle.thread().id());
        *self.join.lock() = Some(handle);
        Ok(())
    }

    /// Raise the exit flag under the thread lock and wake the loop
    pub(crate) fn request_exit<S>(&self, lock: &Mutex<S>, conds: &[&Condvar]) {
        let _guard = lock.lock();
        self.exit_pending.store(true, Ordering::Release);
        for cond in conds {
            cond.notify_all();
        }
    }

    /// Wait for the loop to finish. No-op from the loop itself.
    pub(crate) fn join(&self) {
        if *self.loop_thread.lock() == Some(thread::current().id()) {
            return;
        }
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("{} panicked", self.name);
            }
        }
    }

    /// Queue a parameter change and block until the loop answers
    pub(crate) fn request_parameters<S: ThreadState>(
        &self,
        lock: &Mutex<S>,
        work: &Condvar,
        kv: &str,
    ) -> Result<()> {
        let (tx, rx) = bounded(1);
        {
            let mut state = lock.lock();
            if self.exit_pending() {
                return Err(Error::NotInitialized(format!("{} is exiting", self.name)));
            }
            state.queues().params.push_back(ParamRequest {
                kv: kv.to_string(),
                reply: tx,
            });
            work.notify_all();
        }
        match rx.recv_timeout(PARAMETER_REPLY_TIMEOUT) {
            Ok(status) => status,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "{} did not answer set_parameters({kv})",
                self.name
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::NotInitialized(format!("{} exited", self.name)))
            }
        }
    }

    /// Queue a notification for the loop to deliver
    pub(crate) fn send_config_event<S: ThreadState>(
        &self,
        lock: &Mutex<S>,
        work: &Condvar,
        event: IoConfigEvent,
        stream: Option<StreamType>,
    ) {
        let mut state = lock.lock();
        state.queues().events.push_back(ConfigEvent { event, stream });
        work.notify_all();
    }

    /// Deliver queued notifications, never holding the thread lock while
    /// listeners run
    pub(crate) fn process_config_events<S: ThreadState>(&self, lock: &Mutex<S>) {
        loop {
            let (event, descriptor) = {
                let mut state = lock.lock();
                match state.queues().events.pop_front() {
                    Some(event) => (event, state.descriptor()),
                    None => break,
                }
            };
            self.deliver(event, descriptor);
        }
    }

    fn deliver(&self, event: ConfigEvent, descriptor: IoDescriptor) {
        let descriptor = match event.event {
            IoConfigEvent::OutputClosed | IoConfigEvent::InputClosed => None,
            IoConfigEvent::StreamConfigChanged => None,
            _ => Some(descriptor),
        };
        tracing::debug!("{}: {:?}", self.name, event.event);
        self.listeners.notify(&IoConfigNotification {
            event: event.event,
            handle: self.handle,
            descriptor,
            stream: event.stream,
        });
    }
}

/// Write/read accounting, readable without the thread lock
#[derive(Debug)]
pub struct ThreadStats {
    started: Instant,
    last_io_us: AtomicU64,
    num_io: AtomicU64,
    num_delayed: AtomicU64,
    bytes: AtomicU64,
    in_io: AtomicBool,
    standby: AtomicBool,
}

impl ThreadStats {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            last_io_us: AtomicU64::new(0),
            num_io: AtomicU64::new(0),
            num_delayed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            in_io: AtomicBool::new(false),
            standby: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin_io(&self) -> Instant {
        let now = Instant::now();
        self.last_io_us
            .store(now.duration_since(self.started).as_micros() as u64, Ordering::Relaxed);
        self.in_io.store(true, Ordering::Relaxed);
        self.standby.store(false, Ordering::Relaxed);
        now
    }

    /// Returns whether the transfer counted as delayed
    pub(crate) fn end_io(&self, started: Instant, bytes: usize, max_period: std::time::Duration) -> bool {
        self.in_io.store(false, Ordering::Relaxed);
        self.num_io.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if started.elapsed() > max_period {
            self.num_delayed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub(crate) fn set_standby(&self, standby: bool) {
        self.standby.store(standby, Ordering::Relaxed);
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last = self.last_io_us.load(Ordering::Relaxed);
        let now = self.started.elapsed().as_micros() as u64;
        let num_io = self.num_io.load(Ordering::Relaxed);
        StatsSnapshot {
            last_io_age_ms: if num_io == 0 {
                None
            } else {
                Some(now.saturating_sub(last) / 1000)
            },
            total_io: num_io,
            delayed_io: self.num_delayed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            in_io: self.in_io.load(Ordering::Relaxed),
            standby: self.standby.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ThreadStats`]
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub last_io_age_ms: Option<u64>,
    pub total_io: u64,
    pub delayed_io: u64,
    pub bytes: u64,
    pub in_io: bool,
    pub standby: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[derive(Default)]
    struct Dummy {
        queues: ThreadQueues,
    }

    impl ThreadState for Dummy {
        fn queues(&mut self) -> &mut ThreadQueues {
            &mut self.queues
        }

        fn descriptor(&self) -> IoDescriptor {
            IoDescriptor {
                sample_rate: 8000,
                format: crate::protocol::AudioFormat::Pcm16,
                channels: 1,
                frame_count: 80,
                latency_ms: 10,
            }
        }
    }

    #[test]
    fn test_events_delivered_in_order() {
        let listeners = Arc::new(ListenerRegistry::new());
        let (tx, rx) = unbounded();
        listeners.register(Box::new(tx));
        let base = ThreadBase::new(IoHandle(3), "test".into(), listeners);
        let lock = Mutex::new(Dummy::default());
        let work = Condvar::new();

        base.send_config_event(&lock, &work, IoConfigEvent::OutputOpened, None);
        base.send_config_event(&lock, &work, IoConfigEvent::StreamConfigChanged, Some(StreamType::Music));
        base.process_config_events(&lock);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event, IoConfigEvent::OutputOpened);
        assert_eq!(first.handle, IoHandle(3));
        assert_eq!(first.descriptor.unwrap().sample_rate, 8000);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.stream, Some(StreamType::Music));
        assert!(second.descriptor.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_parameter_request_answered_by_loop() {
        let listeners = Arc::new(ListenerRegistry::new());
        let base = Arc::new(ThreadBase::new(IoHandle(1), "params".into(), listeners));
        let state = Arc::new((Mutex::new(Dummy::default()), Condvar::new()));

        let loop_state = Arc::clone(&state);
        let worker = thread::spawn(move || {
            let (lock, work) = &*loop_state;
            let mut guard = lock.lock();
            while guard.queues.params.is_empty() {
                work.wait(&mut guard);
            }
            let req = guard.queues.params.pop_front().unwrap();
            let status = if req.kv.contains("frame_count") {
                Err(Error::InvalidOperation("tracks exist".into()))
            } else {
                Ok(())
            };
            req.reply.send(status).unwrap();
        });

        let (lock, work) = &*state;
        let result = base.request_parameters(lock, work, "frame_count=512");
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        worker.join().unwrap();
    }

    #[test]
    fn test_stats_delayed_io() {
        let stats = ThreadStats::new();
        assert!(stats.snapshot().last_io_age_ms.is_none());
        let t = stats.begin_io();
        assert!(!stats.end_io(t, 128, Duration::from_secs(10)));
        let t = stats.begin_io();
        std::thread::sleep(Duration::from_millis(3));
        assert!(stats.end_io(t, 128, Duration::from_millis(1)));
        let snap = stats.snapshot();
        assert_eq!(snap.total_io, 2);
        assert_eq!(snap.delayed_io, 1);
        assert_eq!(snap.bytes, 256);
        assert!(!snap.standby);
    }
}
