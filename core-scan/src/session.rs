//! # Session Registry
//!
//! Owns the scan lock. One session at a time may hold an active, non-stale
//! lock; everyone else gets `false` from [`SessionRegistry::acquire`] and can
//! wait or browse the index read-only.
//!
//! ## Staleness
//!
//! A session whose `lastHeartbeat` is older than the stale threshold
//! (default 5 minutes) is considered abandoned. Any caller may force-clear
//! it (status `interrupted`) before acquiring.
//!
//! ## Conflicts
//!
//! If two sessions are somehow both active and fresh, the earliest-created
//! one stays primary. Each secondary's progress is merged into the primary
//! (field-wise max) and the secondary is paused.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let session = registry.new_session(&identity);
//! if registry.acquire(&session).await? {
//!     registry.heartbeat(&session.session_id, "scanning", progress).await?;
//!     registry.release(&session.session_id, SessionStatus::Completed).await?;
//! }
//! ```

use crate::layout::StorageLayout;
use crate::records::{read_record, write_record};
use crate::{Result, ScanError};
use bridge_traits::storage::{CacheCollection, LocalCache, RemoteStore};
use bridge_traits::time::Clock;
use core_runtime::config::Identity;
use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
use core_runtime::logging::redact_if_sensitive;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a session ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| ScanError::InvalidSessionId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Interrupted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "interrupted" => Ok(SessionStatus::Interrupted),
            _ => Err(ScanError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Session Entity
// ============================================================================

/// Scan progress reported through heartbeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub total_pages: u64,
    pub scanned_pages: u64,
    pub failed_pages: u64,
    pub media_found: u64,
}

impl SessionProgress {
    /// Field-wise max; progress never moves backwards
    pub fn merge(&mut self, other: &SessionProgress) {
        self.total_pages = self.total_pages.max(other.total_pages);
        self.scanned_pages = self.scanned_pages.max(other.scanned_pages);
        self.failed_pages = self.failed_pages.max(other.failed_pages);
        self.media_found = self.media_found.max(other.media_found);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub browser_id: String,
    pub status: SessionStatus,
    pub current_stage: String,
    pub last_heartbeat: i64,
    pub created_at: i64,
    #[serde(default)]
    pub progress: SessionProgress,
}

impl Session {
    pub fn is_stale(&self, now: i64, threshold: Duration) -> bool {
        now - self.last_heartbeat > threshold.as_millis() as i64
    }

    /// Holds the scan lock as far as `now` is concerned
    pub fn holds_lock(&self, now: i64, threshold: Duration) -> bool {
        self.status == SessionStatus::Active && !self.is_stale(now, threshold)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Creates, heartbeats and expires scan sessions
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    layout: StorageLayout,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    stale_threshold: Duration,
    /// Serializes lock acquisition within this process
    acquire_lock: Arc<Mutex<()>>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        layout: StorageLayout,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            layout,
            clock,
            event_bus,
            stale_threshold,
            acquire_lock: Arc::new(Mutex::new(())),
        }
    }

    fn now(&self) -> i64 {
        self.clock.unix_timestamp_millis()
    }

    /// A fresh, not yet persisted session for `identity`
    pub fn new_session(&self, identity: &Identity) -> Session {
        let now = self.now();
        Session {
            session_id: SessionId::new(),
            user_id: identity.user_id.clone(),
            browser_id: identity.browser_id.clone(),
            status: SessionStatus::Active,
            current_stage: "idle".to_string(),
            last_heartbeat: now,
            created_at: now,
            progress: SessionProgress::default(),
        }
    }

    pub async fn get(&self, session_id: &SessionId) -> Result<Option<Session>> {
        read_record(self.store.as_ref(), &self.layout.session(&session_id.as_str())).await
    }

    /// Every persisted session, oldest first
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let entries = self.store.list(&self.layout.sessions_dir()).await?;
        let mut sessions = Vec::new();

        for entry in entries.iter().filter(|e| e.ext.as_deref() == Some("json")) {
            if let Some(session) = read_record::<Session>(self.store.as_ref(), &entry.path).await? {
                sessions.push(session);
            }
        }

        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        let key = session.session_id.as_str();
        write_record(self.store.as_ref(), &self.layout.session(&key), session).await?;
        self.cache
            .put(CacheCollection::Sessions, &key, &serde_json::to_value(session)?)
            .await?;
        Ok(())
    }

    /// Drop a finished session record from the store and the cache
    async fn prune(&self, session: &Session) -> Result<()> {
        let key = session.session_id.as_str();
        debug!(session_id = %key, status = %session.status, "Pruning finished session");
        self.store.delete(&self.layout.session(&key)).await?;
        self.cache.delete(CacheCollection::Sessions, &key).await?;
        Ok(())
    }

    /// Try to take the scan lock for `session`
    ///
    /// Returns `false` when another session holds an active lock with a
    /// fresh heartbeat. Stale holders are force-cleared first, and finished
    /// sessions whose last heartbeat is older than the stale threshold are
    /// deleted.
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub async fn acquire(&self, session: &Session) -> Result<bool> {
        let _guard = self.acquire_lock.lock().await;
        let now = self.now();

        for mut other in self.list_sessions().await? {
            if other.session_id == session.session_id {
                continue;
            }

            if other.status.is_terminal() {
                if other.is_stale(now, self.stale_threshold) {
                    self.prune(&other).await?;
                }
                continue;
            }

            if other.status != SessionStatus::Active {
                continue;
            }

            if other.is_stale(now, self.stale_threshold) {
                let age_ms = now - other.last_heartbeat;
                warn!(
                    stale_session = %other.session_id,
                    heartbeat_age_ms = age_ms,
                    "Force-clearing stale scan lock"
                );
                other.status = SessionStatus::Interrupted;
                self.persist(&other).await?;
                self.event_bus
                    .emit(CoreEvent::Session(SessionEvent::StaleCleared {
                        session_id: other.session_id.to_string(),
                        heartbeat_age_secs: (age_ms / 1000).max(0) as u64,
                    }))
                    .ok();
                continue;
            }

            info!(holder = %other.session_id, "Scan lock held by another session");
            return Ok(false);
        }

        let mut acquired = session.clone();
        acquired.status = SessionStatus::Active;
        acquired.last_heartbeat = now;
        self.persist(&acquired).await?;

        info!(
            user = %redact_if_sensitive("user_id", &acquired.user_id),
            "Scan lock acquired"
        );
        self.event_bus
            .emit(CoreEvent::Session(SessionEvent::Acquired {
                session_id: acquired.session_id.to_string(),
                user_id: acquired.user_id.clone(),
            }))
            .ok();

        Ok(true)
    }

    /// The session currently holding a fresh lock, if any
    pub async fn current_holder(&self) -> Result<Option<Session>> {
        let now = self.now();
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .find(|s| s.holds_lock(now, self.stale_threshold)))
    }

    /// Refresh liveness and merge reported progress
    pub async fn heartbeat(
        &self,
        session_id: &SessionId,
        stage: &str,
        progress: SessionProgress,
    ) -> Result<()> {
        let Some(mut session) = self.get(session_id).await? else {
            return Err(ScanError::Internal(format!(
                "Heartbeat for unknown session {}",
                session_id
            )));
        };

        if session.status.is_terminal() {
            debug!(session_id = %session_id, status = %session.status, "Ignoring heartbeat for finished session");
            return Ok(());
        }

        session.last_heartbeat = self.now();
        session.current_stage = stage.to_string();
        session.progress.merge(&progress);
        self.persist(&session).await
    }

    /// Clear the lock with a terminal status
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn release(&self, session_id: &SessionId, status: SessionStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(ScanError::InvalidStateTransition {
                from: SessionStatus::Active.as_str().to_string(),
                to: status.as_str().to_string(),
                reason: "Sessions are released with a terminal status".to_string(),
            });
        }

        let Some(mut session) = self.get(session_id).await? else {
            warn!("Releasing unknown session");
            return Ok(());
        };

        session.status = status;
        session.last_heartbeat = self.now();
        session.current_stage = status.as_str().to_string();
        self.persist(&session).await?;

        info!(status = %status, "Scan lock released");
        self.event_bus
            .emit(CoreEvent::Session(SessionEvent::Released {
                session_id: session_id.to_string(),
                status: status.as_str().to_string(),
            }))
            .ok();
        Ok(())
    }

    /// Pause every secondary active session in favor of the earliest one
    ///
    /// Returns the primary session id when at least one session is active.
    pub async fn resolve_conflicts(&self) -> Result<Option<SessionId>> {
        let _guard = self.acquire_lock.lock().await;
        let now = self.now();

        let mut active: Vec<Session> = self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.holds_lock(now, self.stale_threshold))
            .collect();

        if active.is_empty() {
            return Ok(None);
        }

        let mut primary = active.remove(0);
        if active.is_empty() {
            return Ok(Some(primary.session_id));
        }

        for mut secondary in active {
            primary.progress.merge(&secondary.progress);
            secondary.status = SessionStatus::Paused;
            self.persist(&secondary).await?;

            warn!(
                primary = %primary.session_id,
                secondary = %secondary.session_id,
                "Paused concurrent scan session"
            );
            self.event_bus
                .emit(CoreEvent::Session(SessionEvent::Paused {
                    session_id: secondary.session_id.to_string(),
                    primary_session_id: primary.session_id.to_string(),
                }))
                .ok();
        }

        self.persist(&primary).await?;
        Ok(Some(primary.session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::{MemoryRemoteStore, SqliteLocalCache};
    use bridge_traits::time::ManualClock;
    use core_runtime::config::ContentContext;

    struct Fixture {
        registry: SessionRegistry,
        clock: Arc<ManualClock>,
        events: tokio::sync::broadcast::Receiver<CoreEvent>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let registry = SessionRegistry::new(
            Arc::new(MemoryRemoteStore::new()),
            Arc::new(SqliteLocalCache::in_memory().await.unwrap()),
            StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index"),
            clock.clone(),
            bus,
            Duration::from_secs(300),
        );
        Fixture {
            registry,
            clock,
            events,
        }
    }

    fn identity(user: &str) -> Identity {
        Identity::new(user, format!("{}-browser", user))
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_fresh() {
        let f = fixture().await;
        let first = f.registry.new_session(&identity("alice"));
        let second = f.registry.new_session(&identity("bob"));

        assert!(f.registry.acquire(&first).await.unwrap());
        f.clock.advance(Duration::from_secs(60));
        assert!(!f.registry.acquire(&second).await.unwrap());

        let holder = f.registry.current_holder().await.unwrap().unwrap();
        assert_eq!(holder.session_id, first.session_id);
    }

    #[tokio::test]
    async fn test_stale_lock_is_force_cleared() {
        let mut f = fixture().await;
        let first = f.registry.new_session(&identity("alice"));
        assert!(f.registry.acquire(&first).await.unwrap());

        f.clock.advance(Duration::from_secs(6 * 60));
        let second = f.registry.new_session(&identity("bob"));
        assert!(f.registry.acquire(&second).await.unwrap());

        let cleared = f.registry.get(&first.session_id).await.unwrap().unwrap();
        assert_eq!(cleared.status, SessionStatus::Interrupted);

        let mut saw_stale = false;
        while let Ok(event) = f.events.try_recv() {
            if let CoreEvent::Session(SessionEvent::StaleCleared {
                heartbeat_age_secs, ..
            }) = event
            {
                assert_eq!(heartbeat_age_secs, 360);
                saw_stale = true;
            }
        }
        assert!(saw_stale);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_fresh_and_merges_progress() {
        let f = fixture().await;
        let first = f.registry.new_session(&identity("alice"));
        assert!(f.registry.acquire(&first).await.unwrap());

        f.clock.advance(Duration::from_secs(4 * 60));
        let progress = SessionProgress {
            total_pages: 10,
            scanned_pages: 6,
            failed_pages: 1,
            media_found: 12,
        };
        f.registry
            .heartbeat(&first.session_id, "scanning", progress)
            .await
            .unwrap();

        // An out-of-order heartbeat never lowers progress
        let older = SessionProgress {
            scanned_pages: 3,
            ..progress
        };
        f.registry
            .heartbeat(&first.session_id, "scanning", older)
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(4 * 60));
        let second = f.registry.new_session(&identity("bob"));
        assert!(!f.registry.acquire(&second).await.unwrap());

        let stored = f.registry.get(&first.session_id).await.unwrap().unwrap();
        assert_eq!(stored.progress.scanned_pages, 6);
        assert_eq!(stored.current_stage, "scanning");
    }

    #[tokio::test]
    async fn test_release_frees_lock() {
        let f = fixture().await;
        let first = f.registry.new_session(&identity("alice"));
        assert!(f.registry.acquire(&first).await.unwrap());
        f.registry
            .release(&first.session_id, SessionStatus::Completed)
            .await
            .unwrap();

        let second = f.registry.new_session(&identity("bob"));
        assert!(f.registry.acquire(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_old_finished_sessions_are_pruned_on_acquire() {
        let f = fixture().await;
        let finished = f.registry.new_session(&identity("alice"));
        assert!(f.registry.acquire(&finished).await.unwrap());
        f.registry
            .release(&finished.session_id, SessionStatus::Completed)
            .await
            .unwrap();

        // Released a minute ago: kept for inspection
        f.clock.advance(Duration::from_secs(60));
        let recent = f.registry.new_session(&identity("bob"));
        assert!(f.registry.acquire(&recent).await.unwrap());
        assert!(f.registry.get(&finished.session_id).await.unwrap().is_some());
        f.registry
            .release(&recent.session_id, SessionStatus::Failed)
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(6 * 60));
        let next = f.registry.new_session(&identity("carol"));
        assert!(f.registry.acquire(&next).await.unwrap());

        let remaining: Vec<SessionId> = f
            .registry
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(remaining, vec![next.session_id]);
        assert!(f
            .registry
            .cache
            .get(CacheCollection::Sessions, &finished.session_id.as_str())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_release_requires_terminal_status() {
        let f = fixture().await;
        let first = f.registry.new_session(&identity("alice"));
        assert!(f.registry.acquire(&first).await.unwrap());

        let result = f
            .registry
            .release(&first.session_id, SessionStatus::Paused)
            .await;
        assert!(matches!(result, Err(ScanError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_at_most_one_active_writer() {
        let f = fixture().await;
        let mut acquired = 0;

        for i in 0..5 {
            let session = f.registry.new_session(&identity(&format!("user{}", i)));
            if f.registry.acquire(&session).await.unwrap() {
                acquired += 1;
            }
            f.clock.advance(Duration::from_secs(30));
        }

        assert_eq!(acquired, 1);
        let now = f.clock.unix_timestamp_millis();
        let holders = f
            .registry
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.holds_lock(now, Duration::from_secs(300)))
            .count();
        assert_eq!(holders, 1);
    }

    #[tokio::test]
    async fn test_conflict_resolution_pauses_secondary() {
        let f = fixture().await;
        let primary = f.registry.new_session(&identity("alice"));
        f.clock.advance(Duration::from_secs(1));
        let mut secondary = f.registry.new_session(&identity("bob"));
        secondary.progress.scanned_pages = 9;

        // Simulate a second process writing its own session blob directly
        assert!(f.registry.acquire(&primary).await.unwrap());
        f.registry.persist(&secondary).await.unwrap();

        let resolved = f.registry.resolve_conflicts().await.unwrap();
        assert_eq!(resolved, Some(primary.session_id));

        let paused = f.registry.get(&secondary.session_id).await.unwrap().unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        let merged = f.registry.get(&primary.session_id).await.unwrap().unwrap();
        assert_eq!(merged.progress.scanned_pages, 9);
        assert_eq!(merged.status, SessionStatus::Active);
    }

    #[test]
    fn test_session_id_round_trip() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id = SessionId::from_string(uuid_str).unwrap();
        assert_eq!(id.as_str(), uuid_str);
        assert!(SessionId::from_string("nope").is_err());
    }
}
