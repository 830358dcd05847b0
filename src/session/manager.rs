//! Session lifecycle manager
//!
//! Owns the single live `SessionInfo` and its `SessionStats`, applies
//! transitions computed by `reduce()`, samples durations while active, and
//! persists a snapshot after every lifecycle operation.
//!
//! Every operation completes (state, listeners, persistence) before it
//! returns. Operations that start the duration sampler must be called from
//! within a Tokio runtime.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::state::{reduce, SessionError, SessionInfo, SessionOp, SessionState, SessionStats};
use super::store::{Snapshot, SnapshotStore};
use crate::connection::SessionConfig;

/// Duration sampling period
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Notifications delivered to session listeners
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ConfigUpdated(SessionConfig),
}

/// Handle returned by `subscribe`
pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Live {
    info: Option<SessionInfo>,
    stats: SessionStats,
    /// Monotonic pause start; `None` after a restore
    paused_instant: Option<Instant>,
    last_tick: Option<Instant>,
    sampler: Option<JoinHandle<()>>,
}

impl Live {
    fn state(&self) -> SessionState {
        self.info
            .as_ref()
            .map(|info| info.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Add time since the last tick to the active/total durations
    fn accrue(&mut self) {
        if self.state() != SessionState::Active {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_tick.replace(now) {
            let elapsed = now.duration_since(last).as_secs_f64();
            self.stats.active_duration += elapsed;
            self.stats.total_duration += elapsed;
        }
    }

    fn stop_sampler(&mut self) {
        if let Some(task) = self.sampler.take() {
            task.abort();
        }
        self.last_tick = None;
    }

    /// Time spent paused so far, in seconds
    fn paused_elapsed(&self) -> f64 {
        match (self.paused_instant, self.info.as_ref().and_then(|i| i.paused_at)) {
            (Some(instant), _) => instant.elapsed().as_secs_f64(),
            // Restored from a snapshot: only wall-clock time is available
            (None, Some(paused_at)) => {
                let millis = (Utc::now() - paused_at).num_milliseconds().max(0);
                millis as f64 / 1000.0
            }
            (None, None) => 0.0,
        }
    }
}

struct Inner {
    store: Arc<dyn SnapshotStore>,
    live: Mutex<Live>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

/// Handle to the session state machine
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                live: Mutex::new(Live::default()),
                listeners: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    fn live(&self) -> MutexGuard<'_, Live> {
        self.inner.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state; `Idle` when no session exists
    pub fn state(&self) -> SessionState {
        self.live().state()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.live().info.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.live().stats
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Detach a listener; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners().retain(|(existing, _)| *existing != id);
    }

    /// Start a new session
    ///
    /// Fails if a previous session exists and has not been terminated.
    pub fn create_session(&self, config: SessionConfig) -> Result<SessionInfo, SessionError> {
        let steps = {
            let mut live = self.live();
            let steps = reduce(live.state(), SessionOp::Create)?;

            live.stop_sampler();
            live.info = Some(SessionInfo::new(config));
            live.stats = SessionStats::default();
            live.paused_instant = None;
            self.start_sampler(&mut live);
            steps
        };

        self.transition(&steps);
        self.persist();

        let info = self.session_info();
        if let Some(info) = &info {
            log::info!("Session: created {}", info.id);
        }
        info.ok_or(SessionError::InvalidState {
            operation: SessionOp::Create.as_str(),
            state: SessionState::Idle,
        })
    }

    /// Merge `patch` into the live configuration (only while active)
    pub fn update_session(&self, patch: SessionConfig) -> Result<(), SessionError> {
        let config = {
            let mut live = self.live();
            reduce(live.state(), SessionOp::Update)?;
            match live.info.as_mut() {
                Some(info) => {
                    info.config.merge(patch);
                    info.updated_at = Utc::now();
                    info.config.clone()
                }
                None => return Ok(()),
            }
        };

        self.persist();
        log::debug!("Session: configuration updated");
        self.notify(&SessionEvent::ConfigUpdated(config));
        Ok(())
    }

    /// Pause an active session; active time stops accruing
    pub fn pause_session(&self) -> Result<(), SessionError> {
        let steps = {
            let mut live = self.live();
            let steps = reduce(live.state(), SessionOp::Pause)?;
            live.accrue();
            live.stop_sampler();
            live.paused_instant = Some(Instant::now());
            if let Some(info) = live.info.as_mut() {
                info.paused_at = Some(Utc::now());
            }
            steps
        };

        self.transition(&steps);
        self.persist();
        log::info!("Session: paused");
        Ok(())
    }

    /// Resume a paused session, adding the pause to `paused_duration`
    pub fn resume_session(&self) -> Result<(), SessionError> {
        let steps = {
            let mut live = self.live();
            let steps = reduce(live.state(), SessionOp::Resume)?;
            let paused = live.paused_elapsed();
            live.stats.paused_duration += paused;
            live.paused_instant = None;
            if let Some(info) = live.info.as_mut() {
                info.paused_at = None;
            }
            log::info!("Session: resuming after {:.1}s paused", paused);
            steps
        };

        self.transition(&steps);
        {
            let mut live = self.live();
            self.start_sampler(&mut live);
        }
        self.persist();
        Ok(())
    }

    /// End the session and return its final stats
    ///
    /// With no session this only logs a warning and returns `Ok(None)`.
    pub fn terminate_session(&self) -> Result<Option<SessionStats>, SessionError> {
        let steps = {
            let mut live = self.live();
            if live.info.is_none() {
                log::warn!("Session: terminate requested with no session");
                return Ok(None);
            }
            let steps = reduce(live.state(), SessionOp::Terminate)?;
            live.accrue();
            live.stop_sampler();
            if live.state() == SessionState::Paused {
                let paused = live.paused_elapsed();
                live.stats.paused_duration += paused;
            }
            live.paused_instant = None;
            if let Some(info) = live.info.as_mut() {
                info.terminated_at = Some(Utc::now());
            }
            steps
        };

        self.transition(&steps);
        self.persist();

        let stats = self.stats();
        log::info!(
            "Session: terminated (active {:.1}s, paused {:.1}s, {} sent, {} received, {} errors)",
            stats.active_duration,
            stats.paused_duration,
            stats.messages_sent,
            stats.messages_received,
            stats.error_count
        );
        Ok(Some(stats))
    }

    /// Move a live session to `Error` after a fatal failure elsewhere
    pub fn fail_session(&self, reason: &str) -> Result<(), SessionError> {
        let steps = {
            let mut live = self.live();
            if live.info.is_none() {
                log::debug!("Session: ignoring failure with no session: {}", reason);
                return Ok(());
            }
            let steps = reduce(live.state(), SessionOp::Fail)?;
            live.accrue();
            live.stop_sampler();
            live.stats.error_count += 1;
            steps
        };

        log::error!("Session: failed: {}", reason);
        self.transition(&steps);
        self.persist();
        Ok(())
    }

    /// Load the persisted snapshot
    ///
    /// Returns `None` when nothing usable is stored, or when a live session
    /// already exists. Restoring an active session restarts the sampler.
    pub fn restore_session(&self) -> Option<Snapshot> {
        let contents = match self.inner.store.read() {
            Ok(Some(contents)) => contents,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Session: failed to read snapshot: {}", e);
                return None;
            }
        };
        let snapshot = match Snapshot::decode(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Session: ignoring stored snapshot: {}", e);
                return None;
            }
        };

        let mut live = self.live();
        if !matches!(live.state(), SessionState::Idle | SessionState::Terminated) {
            log::warn!(
                "Session: not restoring over live session in state {}",
                live.state()
            );
            return None;
        }

        live.stop_sampler();
        live.info = Some(snapshot.session_info.clone());
        live.stats = snapshot.stats;
        live.paused_instant = None;
        if snapshot.session_info.state == SessionState::Active {
            self.start_sampler(&mut live);
        }
        log::info!(
            "Session: restored {} ({})",
            snapshot.session_info.id,
            snapshot.session_info.state
        );
        Some(snapshot)
    }

    pub fn increment_messages_sent(&self) {
        self.live().stats.messages_sent += 1;
    }

    pub fn increment_messages_received(&self) {
        self.live().stats.messages_received += 1;
    }

    pub fn increment_error_count(&self) {
        self.live().stats.error_count += 1;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Walk `steps`, notifying listeners after each state is set
    fn transition(&self, steps: &[SessionState]) {
        for &to in steps {
            let from = {
                let mut live = self.live();
                let Some(info) = live.info.as_mut() else {
                    return;
                };
                let from = info.state;
                info.state = to;
                info.updated_at = Utc::now();
                from
            };
            log::debug!("Session: {} -> {}", from, to);
            self.notify(&SessionEvent::StateChanged { from, to });
        }
    }

    fn notify(&self, event: &SessionEvent) {
        // Call outside the lock so listeners may use the manager
        let listeners: Vec<Listener> = self
            .listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Write the current snapshot; failures are logged and ignored
    fn persist(&self) {
        let snapshot = {
            let live = self.live();
            match &live.info {
                Some(info) => Snapshot::new(info.clone(), live.stats),
                None => return,
            }
        };

        let result = snapshot
            .encode()
            .and_then(|contents| self.inner.store.write(&contents));
        if let Err(e) = result {
            log::warn!("Session: snapshot not persisted: {}", e);
        }
    }

    fn start_sampler(&self, live: &mut Live) {
        if let Some(task) = live.sampler.take() {
            task.abort();
        }
        live.last_tick = Some(Instant::now());

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        live.sampler = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner
                    .live
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .accrue();
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::{MemorySnapshotStore, StoreError};
    use SessionState::*;

    fn manager() -> (SessionManager, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        (SessionManager::new(store.clone()), store)
    }

    fn record_states(manager: &SessionManager) -> Arc<Mutex<Vec<SessionState>>> {
        let states = Arc::new(Mutex::new(vec![manager.state()]));
        let sink = states.clone();
        manager.subscribe(move |event| {
            if let SessionEvent::StateChanged { to, .. } = event {
                sink.lock().unwrap().push(*to);
            }
        });
        states
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn read(&self) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }
        fn write(&self, _contents: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }
        fn remove(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_visits_states_in_order() {
        let (manager, _) = manager();
        let states = record_states(&manager);

        manager.create_session(SessionConfig::translation()).unwrap();
        manager.pause_session().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        manager.resume_session().unwrap();
        let stats = manager.terminate_session().unwrap().unwrap();

        assert_eq!(
            *states.lock().unwrap(),
            vec![Idle, Creating, Active, Paused, Resuming, Active, Terminating, Terminated]
        );
        assert!((stats.paused_duration - 2.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_duration_sampled_while_active() {
        let (manager, _) = manager();
        manager.create_session(SessionConfig::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!((manager.stats().active_duration - 3.0).abs() < 1e-9);

        // Pause flushes the partial interval
        manager.pause_session().unwrap();
        assert!((manager.stats().active_duration - 3.5).abs() < 1e-9);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = manager.stats();
        assert!((stats.active_duration - 3.5).abs() < 1e-9);
        assert!((stats.total_duration - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_illegal_operations_name_the_state() {
        let (manager, _) = manager();
        manager.create_session(SessionConfig::default()).unwrap();

        let err = manager.resume_session().unwrap_err();
        assert_eq!(err.to_string(), "Cannot resume session in state 'active'");

        manager.pause_session().unwrap();
        assert_eq!(
            manager.update_session(SessionConfig::default()),
            Err(SessionError::InvalidState {
                operation: "update",
                state: Paused
            })
        );
        assert_eq!(manager.state(), Paused);
    }

    #[tokio::test]
    async fn test_create_requires_terminated_predecessor() {
        let (manager, _) = manager();
        let first = manager.create_session(SessionConfig::default()).unwrap();

        assert_eq!(
            manager.create_session(SessionConfig::default()),
            Err(SessionError::SessionExists(Active))
        );

        manager.increment_messages_sent();
        manager.terminate_session().unwrap();
        let second = manager.create_session(SessionConfig::default()).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.state, Active);
        assert_eq!(manager.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_update_merges_and_notifies() {
        let (manager, store) = manager();
        manager.create_session(SessionConfig::translation()).unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        manager.subscribe(move |event| {
            if let SessionEvent::ConfigUpdated(config) = event {
                sink.lock().unwrap().push(config.clone());
            }
        });

        manager
            .update_session(SessionConfig {
                voice: Some("verse".to_string()),
                ..Default::default()
            })
            .unwrap();

        let info = manager.session_info().unwrap();
        assert_eq!(info.config.voice.as_deref(), Some("verse"));
        assert_eq!(info.config.input_audio_format.as_deref(), Some("pcm16"));
        assert_eq!(updates.lock().unwrap().len(), 1);

        let stored = Snapshot::decode(&store.contents().unwrap()).unwrap();
        assert_eq!(stored.session_info.config.voice.as_deref(), Some("verse"));
    }

    #[test]
    fn test_terminate_without_session_is_noop() {
        let (manager, store) = manager();
        assert_eq!(manager.terminate_session(), Ok(None));
        assert!(store.contents().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (manager, _) = manager();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = manager.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        manager.create_session(SessionConfig::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        manager.unsubscribe(id);
        manager.pause_session().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fail_session() {
        let (manager, _) = manager();
        manager.create_session(SessionConfig::default()).unwrap();

        manager.fail_session("reconnects exhausted").unwrap();
        assert_eq!(manager.state(), Error);
        assert_eq!(manager.stats().error_count, 1);

        // Error → Terminated, then a new session may start
        manager.terminate_session().unwrap();
        assert!(manager.create_session(SessionConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let (manager, store) = manager();
        let created = manager.create_session(SessionConfig::translation()).unwrap();
        manager.increment_messages_received();
        manager.pause_session().unwrap();

        let restored_manager = SessionManager::new(store.clone());
        let snapshot = restored_manager.restore_session().unwrap();

        assert_eq!(snapshot.session_info.id, created.id);
        assert_eq!(snapshot.session_info.state, Paused);
        assert!(snapshot.session_info.paused_at.is_some());
        assert_eq!(snapshot.stats.messages_received, 1);
        assert_eq!(restored_manager.state(), Paused);

        restored_manager.resume_session().unwrap();
        assert_eq!(restored_manager.state(), Active);
    }

    #[test]
    fn test_restore_missing_or_corrupt_returns_none() {
        let empty = SessionManager::new(Arc::new(MemorySnapshotStore::new()));
        assert!(empty.restore_session().is_none());

        let corrupt = SessionManager::new(Arc::new(MemorySnapshotStore::with_contents("{\"ver")));
        assert!(corrupt.restore_session().is_none());
        assert_eq!(corrupt.state(), Idle);

        let unreadable = SessionManager::new(Arc::new(FailingStore));
        assert!(unreadable.restore_session().is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_interrupt() {
        let manager = SessionManager::new(Arc::new(FailingStore));

        manager.create_session(SessionConfig::default()).unwrap();
        manager.pause_session().unwrap();
        manager.resume_session().unwrap();

        assert_eq!(manager.state(), Active);
    }
}
