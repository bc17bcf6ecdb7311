//! USB lifecycle tracker.
//!
//! Polls the USB backend on a fixed period, keeps one [`DeviceSession`] per
//! attached device, starts at most one provisioning run per physical
//! connection and evicts sessions that stop showing up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::events::{Reporter, StatusEvent};
use crate::transport::{UsbBackend, UsbDevice};

/// Disconnect timeout outside of flashing.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub last_seen: Instant,
    pub disconnect_timeout: Duration,
    /// A run was started for this connection. Cleared only by eviction.
    pub attempted: bool,
}

impl DeviceSession {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            attempted: false,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.last_seen + self.disconnect_timeout
    }
}

/// Sessions keyed by device id.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<String, DeviceSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a session. Returns true if it was created.
    pub fn touch(&self, id: &str, now: Instant) -> bool {
        let mut sessions = self.inner.lock().unwrap();
        match sessions.get_mut(id) {
            Some(session) => {
                session.last_seen = now;
                false
            }
            None => {
                sessions.insert(id.to_string(), DeviceSession::new(now));
                true
            }
        }
    }

    /// Mark the session attempted. Returns false if it already was, or is absent.
    pub fn mark_attempted(&self, id: &str) -> bool {
        match self.inner.lock().unwrap().get_mut(id) {
            Some(session) if !session.attempted => {
                session.attempted = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<DeviceSession> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every session expired at `now`.
    pub fn evict_expired(&self, now: Instant) -> Vec<String> {
        let mut sessions = self.inner.lock().unwrap();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    pub fn handle(&self, id: &str) -> SessionHandle {
        SessionHandle {
            table: self.clone(),
            id: id.to_string(),
        }
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut DeviceSession)) {
        if let Some(session) = self.inner.lock().unwrap().get_mut(id) {
            f(session);
        }
    }
}

/// One device's view of the session table, held by its provisioning run.
#[derive(Clone)]
pub struct SessionHandle {
    table: SessionTable,
    id: String,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn touch(&self) {
        let now = Instant::now();
        self.table.update(&self.id, |s| s.last_seen = now);
    }

    pub fn extend_timeout(&self, timeout: Duration) {
        self.table.update(&self.id, |s| s.disconnect_timeout = timeout);
    }

    pub fn restore_timeout(&self) {
        self.extend_timeout(DEFAULT_DISCONNECT_TIMEOUT);
    }

    pub fn disconnect_timeout(&self) -> Option<Duration> {
        self.table.get(&self.id).map(|s| s.disconnect_timeout)
    }
}

/// Per-device workflow started by the tracker.
pub trait ProvisionRunner<D: UsbDevice>: Send + Sync + 'static {
    fn run(&self, device: D, session: SessionHandle) -> impl Future<Output = ()> + Send;
}

/// Polling loop over the USB backend.
pub struct UsbTracker<U, R> {
    usb: Arc<U>,
    runner: Arc<R>,
    sessions: SessionTable,
    reporter: Reporter,
    in_flight: HashMap<TaskId, String>,
    tasks: JoinSet<()>,
    max_in_flight: usize,
}

impl<U, R> UsbTracker<U, R>
where
    U: UsbBackend,
    R: ProvisionRunner<U::Device>,
{
    pub fn new(usb: Arc<U>, runner: Arc<R>, sessions: SessionTable, reporter: Reporter, max_in_flight: usize) -> Self {
        Self {
            usb,
            runner,
            sessions,
            reporter,
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Poll forever.
    pub async fn run(mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.poll_cycle(Instant::now()).await;
        }
    }

    /// One enumeration pass followed by an eviction pass.
    #[instrument(level = "trace", skip(self))]
    pub async fn poll_cycle(&mut self, now: Instant) {
        self.reap_finished();

        let listings = match self.usb.list_devices().await {
            Ok(listings) => listings,
            Err(e) => {
                warn!(error = %e, "USB enumeration failed");
                Vec::new()
            }
        };

        for listing in listings {
            let id = listing.id;

            // The run owns its handle; seeing it listed is enough
            if self.is_in_flight(&id) {
                self.sessions.touch(&id, now);
                self.sessions.mark_attempted(&id);
                continue;
            }

            let device = match self.usb.open_by_id(&id).await {
                Ok(device) => device,
                Err(e) => {
                    debug!(device = %id, error = %e, "Open failed, skipping this cycle");
                    continue;
                }
            };

            if self.sessions.touch(&id, now) {
                debug!(device = %id, "New USB session");
            }

            if self.in_flight.len() >= self.max_in_flight {
                debug!(device = %id, "Worker limit reached, deferring");
                continue;
            }

            if !self.sessions.mark_attempted(&id) {
                continue;
            }

            self.start(id, device);
        }

        for id in self.sessions.evict_expired(now) {
            info!(device = %id, "USB session evicted");
            self.reporter.emit(StatusEvent::UsbDisconnect { id });
        }
    }

    fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.values().any(|d| d == id)
    }

    fn start(&mut self, id: String, device: U::Device) {
        let runner = self.runner.clone();
        let session = self.sessions.handle(&id);
        let handle = self.tasks.spawn(async move {
            runner.run(device, session).await;
        });
        self.in_flight.insert(handle.id(), id);
    }

    /// Free the worker slot of every finished run.
    fn reap_finished(&mut self) {
        while let Some(res) = self.tasks.try_join_next_with_id() {
            let task_id = match res {
                Ok((task_id, ())) => task_id,
                Err(e) => {
                    warn!(error = %e, "Provisioning task panicked");
                    e.id()
                }
            };
            if let Some(id) = self.in_flight.remove(&task_id) {
                debug!(device = %id, "Provisioning run finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_log::DeviceLogs;
    use crate::events::RecordingObserver;
    use crate::transport::{MockDevice, MockUsb};

    #[derive(Default)]
    struct CountingRunner {
        runs: Mutex<Vec<String>>,
    }

    impl ProvisionRunner<MockDevice> for CountingRunner {
        async fn run(&self, device: MockDevice, _session: SessionHandle) {
            self.runs.lock().unwrap().push(device.id().to_string());
        }
    }

    fn tracker(
        usb: &MockUsb,
        dir: &std::path::Path,
    ) -> (UsbTracker<MockUsb, CountingRunner>, Arc<CountingRunner>, Arc<RecordingObserver>) {
        let runner = Arc::new(CountingRunner::default());
        let recorder = Arc::new(RecordingObserver::new());
        let reporter = Reporter::new(recorder.clone(), DeviceLogs::new(dir));
        let tracker = UsbTracker::new(Arc::new(usb.clone()), runner.clone(), SessionTable::new(), reporter, 4);
        (tracker, runner, recorder)
    }

    fn disconnects(recorder: &RecordingObserver) -> usize {
        recorder.count(|e| matches!(e, StatusEvent::UsbDisconnect { .. }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_run_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        let (mut tracker, runner, _) = tracker(&usb, dir.path());

        for _ in 0..3 {
            tracker.poll_cycle(Instant::now()).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(*runner.runs.lock().unwrap(), vec!["d1".to_string()]);
        assert!(tracker.sessions().get("d1").unwrap().attempted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_at_timeout_and_not_before() {
        let dir = tempfile::tempdir().unwrap();
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        let (mut tracker, _, recorder) = tracker(&usb, dir.path());

        let t = Instant::now();
        tracker.poll_cycle(t).await;
        usb.detach("d1");

        tracker
            .poll_cycle(t + DEFAULT_DISCONNECT_TIMEOUT - Duration::from_millis(1))
            .await;
        assert!(tracker.sessions().contains("d1"));
        assert_eq!(disconnects(&recorder), 0);

        tracker.poll_cycle(t + DEFAULT_DISCONNECT_TIMEOUT).await;
        assert!(!tracker.sessions().contains("d1"));
        assert_eq!(disconnects(&recorder), 1);

        tracker.poll_cycle(t + DEFAULT_DISCONNECT_TIMEOUT * 3).await;
        assert_eq!(disconnects(&recorder), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_skips_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        usb.set_locked("d1", true);
        let (mut tracker, runner, _) = tracker(&usb, dir.path());

        tracker.poll_cycle(Instant::now()).await;
        assert!(!tracker.sessions().contains("d1"));
        assert!(runner.runs.lock().unwrap().is_empty());

        usb.set_locked("d1", false);
        tracker.poll_cycle(Instant::now()).await;
        tokio::task::yield_now().await;
        assert_eq!(runner.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_eviction_runs_again() {
        let dir = tempfile::tempdir().unwrap();
        let usb = MockUsb::new();
        usb.attach("d1", 13);
        let (mut tracker, runner, _) = tracker(&usb, dir.path());

        let t = Instant::now();
        tracker.poll_cycle(t).await;
        tokio::task::yield_now().await;
        usb.detach("d1");
        tracker.poll_cycle(t + DEFAULT_DISCONNECT_TIMEOUT).await;

        usb.attach("d1", 13);
        tracker.poll_cycle(t + DEFAULT_DISCONNECT_TIMEOUT * 2).await;
        tokio::task::yield_now().await;
        assert_eq!(runner.runs.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_session_handle_timeout() {
        let table = SessionTable::new();
        table.touch("d1", Instant::now());
        let handle = table.handle("d1");

        handle.extend_timeout(Duration::from_secs(120));
        assert_eq!(handle.disconnect_timeout(), Some(Duration::from_secs(120)));
        handle.restore_timeout();
        assert_eq!(handle.disconnect_timeout(), Some(DEFAULT_DISCONNECT_TIMEOUT));
    }
}
