use super::{
    catalog::{self, ServerName},
    error::{ServerError, ServerResult},
    ownership,
    registry::TenantState,
};
use crate::engine::{EngineError, ServerEngine, SessionHandle};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use std::{fmt, sync::Arc};
use tracing::{error, info, warn};

const SECRET_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// One-time token handed to whoever starts a session.
#[derive(Clone, PartialEq, Eq)]
pub struct StartSecret(String);

impl StartSecret {
    pub fn mint() -> Self {
        Self(
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(SECRET_LEN)
                .map(char::from)
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact comparison that does not stop at the first differing byte.
    pub fn matches(&self, supplied: &str) -> bool {
        let (a, b) = (self.0.as_bytes(), supplied.as_bytes());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for StartSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StartSecret(..)")
    }
}

#[derive(Debug)]
pub struct ServerSession {
    pub server_name: String,
    pub state: SessionState,
    pub owner_id: u64,
    pub secret: StartSecret,
    pub memory_gb: u32,
    pub address: Option<String>,
    pub handle: Option<SessionHandle>,
    pub since: DateTime<Utc>,
    /// Set while a terminate call is outstanding so a second stop cannot
    /// overlap it. Cleared when termination fails and may be retried.
    pub stop_in_flight: bool,
}

impl ServerSession {
    pub fn starting(server_name: String, owner_id: u64, secret: StartSecret, memory_gb: u32) -> Self {
        Self {
            server_name,
            state: SessionState::Starting,
            owner_id,
            secret,
            memory_gb,
            address: None,
            handle: None,
            since: Utc::now(),
            stop_in_flight: false,
        }
    }

    fn stoppable(&self) -> bool {
        match self.state {
            SessionState::Running => true,
            SessionState::Stopping => !self.stop_in_flight,
            SessionState::Idle | SessionState::Starting => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartedSession {
    pub server_name: String,
    pub owner_id: u64,
    pub secret: StartSecret,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub server_name: Option<String>,
    pub address: Option<String>,
    pub owner_id: Option<u64>,
    pub memory_gb: Option<u32>,
    pub since: Option<DateTime<Utc>>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            server_name: None,
            address: None,
            owner_id: None,
            memory_gb: None,
            since: None,
        }
    }
}

/// Drives a guild's single session through
/// `Idle -> Starting -> Running -> Stopping -> Idle`.
///
/// The guild lock is only held to validate and record a transition. Engine
/// calls happen between two lock scopes, and the intermediate state recorded
/// before the call keeps a concurrent start or stop from slipping through.
#[derive(Debug, Clone)]
pub struct SessionController {
    tenant: Arc<TenantState>,
    engine: Arc<dyn ServerEngine>,
}

impl SessionController {
    pub fn new(tenant: Arc<TenantState>, engine: Arc<dyn ServerEngine>) -> Self {
        Self { tenant, engine }
    }

    pub async fn start(
        &self,
        name: &str,
        memory_gb: u32,
        caller_id: u64,
    ) -> ServerResult<StartedSession> {
        let name = ServerName::parse(name)?;
        let root = self.tenant.storage_root();
        let secret = StartSecret::mint();

        {
            let mut inner = self.tenant.lock().await;
            if let Some(active) = &inner.session {
                return Err(ServerError::AlreadyRunning(active.server_name.clone()));
            }
            if !catalog::definitions(root, &inner).await?.contains(name.as_str()) {
                return Err(ServerError::ServerNotFound(name.as_str().to_string()));
            }
            inner.session = Some(ServerSession::starting(
                name.as_str().to_string(),
                caller_id,
                secret.clone(),
                memory_gb,
            ));
            info!(
                "Starting {} for guild {} with {}GB",
                name.as_str(),
                self.tenant.id(),
                memory_gb
            );
        }

        let launched = self.engine.launch(root, name.as_str(), memory_gb).await;

        let mut inner = self.tenant.lock().await;
        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                inner.session = None;
                warn!(
                    "Failed to start {} for guild {}: {}",
                    name.as_str(),
                    self.tenant.id(),
                    e
                );
                return Err(e.into());
            }
        };

        let committed = match inner.session.as_mut() {
            Some(session) if session.state == SessionState::Starting => {
                session.state = SessionState::Running;
                session.address = Some(launched.address.clone());
                session.handle = Some(launched.handle);
                session.since = Utc::now();
                true
            }
            _ => false,
        };
        drop(inner);

        if !committed {
            error!(
                "Session for guild {} vanished while {} was starting",
                self.tenant.id(),
                name.as_str()
            );
            if self.engine.terminate(launched.handle).await.is_err() {
                self.engine.release(launched.handle).await;
            }
            return Err(EngineError::Custom("the session was lost while starting".into()).into());
        }

        info!(
            "{} is running for guild {} at {}",
            name.as_str(),
            self.tenant.id(),
            launched.address
        );
        Ok(StartedSession {
            server_name: name.as_str().to_string(),
            owner_id: caller_id,
            secret,
            address: launched.address,
        })
    }

    /// Stops the running server if the caller owns it or knows its secret.
    /// Returns the name of the server that was stopped.
    pub async fn stop(&self, caller_id: u64, secret: Option<&str>) -> ServerResult<String> {
        let (handle, name) = {
            let mut inner = self.tenant.lock().await;
            let session = match inner.session.as_mut() {
                Some(session) if session.stoppable() => session,
                _ => return Err(ServerError::NotRunning),
            };
            if !ownership::authorized(session, caller_id, secret) {
                return Err(ServerError::Unauthorized);
            }
            let handle = session.handle.ok_or(ServerError::NotRunning)?;

            session.state = SessionState::Stopping;
            session.stop_in_flight = true;
            (handle, session.server_name.clone())
        };

        self.finish_stop(handle, name).await
    }

    /// Stops the running server on behalf of the bot itself.
    pub async fn force_stop(&self) -> ServerResult<Option<String>> {
        let (handle, name) = {
            let mut inner = self.tenant.lock().await;
            let Some(session) = inner.session.as_mut().filter(|s| s.stoppable()) else {
                return Ok(None);
            };
            let Some(handle) = session.handle else {
                return Ok(None);
            };
            session.state = SessionState::Stopping;
            session.stop_in_flight = true;
            (handle, session.server_name.clone())
        };

        self.finish_stop(handle, name).await.map(Some)
    }

    async fn finish_stop(&self, handle: SessionHandle, name: String) -> ServerResult<String> {
        let result = self.engine.terminate(handle).await;

        let mut inner = self.tenant.lock().await;
        match result {
            Ok(()) => {
                inner.session = None;
                info!("Stopped {} for guild {}", name, self.tenant.id());
                Ok(name)
            }
            Err(e) => {
                if let Some(session) = inner.session.as_mut() {
                    session.stop_in_flight = false;
                }
                warn!(
                    "Failed to stop {} for guild {}, it stays in stopping: {}",
                    name,
                    self.tenant.id(),
                    e
                );
                Err(e.into())
            }
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.tenant.lock().await;
        match &inner.session {
            Some(session) => SessionStatus {
                state: session.state,
                server_name: Some(session.server_name.clone()),
                address: session.address.clone(),
                owner_id: Some(session.owner_id),
                memory_gb: Some(session.memory_gb),
                since: Some(session.since),
            },
            None => SessionStatus::idle(),
        }
    }

    /// Sends `text` to the running server's console as is.
    pub async fn command(
        &self,
        caller_id: u64,
        secret: Option<&str>,
        text: &str,
    ) -> ServerResult<String> {
        let handle = {
            let inner = self.tenant.lock().await;
            let session = match &inner.session {
                Some(session) if session.state == SessionState::Running => session,
                _ => return Err(ServerError::NotRunning),
            };
            if !ownership::authorized(session, caller_id, secret) {
                return Err(ServerError::Unauthorized);
            }
            session.handle.ok_or(ServerError::NotRunning)?
        };

        Ok(self.engine.send_console_command(handle, text).await?)
    }

    /// Drops a running session whose process has gone away on its own.
    /// Returns the name of the server that was cleared.
    pub async fn reap_if_exited(&self) -> Option<String> {
        let handle = {
            let inner = self.tenant.lock().await;
            let session = inner.session.as_ref()?;
            if session.state != SessionState::Running {
                return None;
            }
            session.handle?
        };

        if self.engine.is_alive(handle).await {
            return None;
        }

        let mut inner = self.tenant.lock().await;
        let still_same = inner
            .session
            .as_ref()
            .is_some_and(|s| s.state == SessionState::Running && s.handle == Some(handle));
        if !still_same {
            return None;
        }

        let session = inner.session.take()?;
        drop(inner);

        self.engine.release(handle).await;
        warn!(
            "{} for guild {} exited on its own",
            session.server_name,
            self.tenant.id()
        );
        Some(session.server_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::Database,
        engine::fake::FakeEngine,
        modules::servers::{
            catalog::ServerCatalog,
            registry::{GuildRegistry, TenantId},
        },
    };
    use std::{sync::atomic::Ordering, time::Duration};
    use tempfile::TempDir;

    const GUILD: TenantId = TenantId::new(1);
    const U1: u64 = 1001;
    const U2: u64 = 1002;

    struct Fixture {
        _dir: TempDir,
        engine: Arc<FakeEngine>,
        catalog: ServerCatalog,
        sessions: SessionController,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let settings = Database::new(dir.path().join("servers.db")).await.unwrap();
        let registry = GuildRegistry::new(
            dir.path().join("SavedServers"),
            2,
            settings,
            engine.clone(),
        );
        let catalog = registry.catalog(GUILD).await.unwrap();
        catalog.create("a", None).await.unwrap();
        let sessions = registry.sessions(GUILD).await.unwrap();
        Fixture {
            _dir: dir,
            engine,
            catalog,
            sessions,
        }
    }

    async fn wait_for_state(sessions: &SessionController, state: SessionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sessions.status().await.state != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn secrets_are_unique_and_alphanumeric() {
        let a = StartSecret::mint();
        let b = StartSecret::mint();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), SECRET_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!format!("{:?}", a).contains(a.as_str()));
    }

    #[tokio::test]
    async fn start_then_second_start_is_rejected() {
        let f = fixture().await;

        let started = f.sessions.start("a", 4, U1).await.unwrap();
        assert_eq!(started.owner_id, U1);
        assert!(!started.address.is_empty());

        let err = f.sessions.start("a", 4, U2).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning(name) if name == "a"));
        assert_eq!(f.engine.launches.load(Ordering::SeqCst), 1);

        let status = f.sessions.status().await;
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(status.owner_id, Some(U1));
        assert_eq!(status.address, Some(started.address));
    }

    #[tokio::test]
    async fn start_of_unknown_server_fails() {
        let f = fixture().await;
        assert!(matches!(
            f.sessions.start("ghost", 2, U1).await,
            Err(ServerError::ServerNotFound(name)) if name == "ghost"
        ));
        assert_eq!(f.sessions.status().await, SessionStatus::idle());
    }

    #[tokio::test]
    async fn failed_launch_returns_to_no_session() {
        let f = fixture().await;
        f.engine.fail_launch.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.sessions.start("a", 2, U1).await,
            Err(ServerError::Engine(EngineError::Launch(_)))
        ));
        assert_eq!(f.sessions.status().await.state, SessionState::Idle);

        f.engine.fail_launch.store(false, Ordering::SeqCst);
        f.sessions.start("a", 2, U1).await.unwrap();
    }

    #[tokio::test]
    async fn stop_requires_owner_or_secret() {
        let f = fixture().await;
        let started = f.sessions.start("a", 4, U1).await.unwrap();

        assert!(matches!(
            f.sessions.stop(U2, Some("wrong")).await,
            Err(ServerError::Unauthorized)
        ));
        assert!(matches!(f.sessions.stop(U2, None).await, Err(ServerError::Unauthorized)));
        assert_eq!(f.sessions.status().await.state, SessionState::Running);
        assert_eq!(f.engine.terminations.load(Ordering::SeqCst), 0);

        assert_eq!(f.sessions.stop(U1, None).await.unwrap(), "a");
        assert_eq!(f.sessions.status().await.state, SessionState::Idle);

        let again = f.sessions.start("a", 4, U1).await.unwrap();
        assert_ne!(again.secret, started.secret);
    }

    #[tokio::test]
    async fn secret_lets_another_member_stop() {
        let f = fixture().await;
        let started = f.sessions.start("a", 4, U1).await.unwrap();

        f.sessions.stop(U2, Some(started.secret.as_str())).await.unwrap();
        assert_eq!(f.sessions.status().await.state, SessionState::Idle);
        assert_eq!(f.engine.running_count(), 0);
    }

    #[tokio::test]
    async fn old_secret_does_not_stop_a_new_session() {
        let f = fixture().await;
        let first = f.sessions.start("a", 4, U1).await.unwrap();
        f.sessions.stop(U1, None).await.unwrap();
        f.sessions.start("a", 4, U1).await.unwrap();

        assert!(matches!(
            f.sessions.stop(U2, Some(first.secret.as_str())).await,
            Err(ServerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn stop_without_session_is_not_running() {
        let f = fixture().await;
        assert!(matches!(f.sessions.stop(U1, None).await, Err(ServerError::NotRunning)));
        assert!(matches!(
            f.sessions.stop(U1, Some("anything")).await,
            Err(ServerError::NotRunning)
        ));
        assert_eq!(f.sessions.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_terminate_stays_stopping_and_can_retry() {
        let f = fixture().await;
        f.sessions.start("a", 4, U1).await.unwrap();
        f.engine.fail_terminate.store(true, Ordering::SeqCst);

        assert!(matches!(f.sessions.stop(U1, None).await, Err(ServerError::Engine(_))));
        assert_eq!(f.sessions.status().await.state, SessionState::Stopping);
        assert!(matches!(
            f.sessions.command(U1, None, "list").await,
            Err(ServerError::NotRunning)
        ));
        assert!(matches!(
            f.sessions.start("a", 4, U1).await,
            Err(ServerError::AlreadyRunning(_))
        ));
        assert!(matches!(f.sessions.stop(U2, None).await, Err(ServerError::Unauthorized)));

        f.engine.fail_terminate.store(false, Ordering::SeqCst);
        f.sessions.stop(U1, None).await.unwrap();
        assert_eq!(f.sessions.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn edits_are_blocked_while_active() {
        let f = fixture().await;
        f.catalog.create("b", None).await.unwrap();
        f.sessions.start("a", 4, U1).await.unwrap();

        assert!(matches!(
            f.catalog.edit_property("a", "difficulty", "hard").await,
            Err(ServerError::ServerRunning(name)) if name == "a"
        ));
        assert!(matches!(f.catalog.delete("a").await, Err(ServerError::ServerRunning(_))));
        f.catalog.edit_property("b", "difficulty", "hard").await.unwrap();

        f.sessions.stop(U1, None).await.unwrap();
        f.catalog.edit_property("a", "difficulty", "hard").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_reports_starting_until_ready() {
        let f = fixture().await;
        assert_eq!(f.sessions.status().await, SessionStatus::idle());

        f.engine.hold_launch.store(true, Ordering::SeqCst);
        let sessions = f.sessions.clone();
        let start = tokio::spawn(async move { sessions.start("a", 4, U1).await });

        wait_for_state(&f.sessions, SessionState::Starting).await;
        let starting = f.sessions.status().await;
        assert_eq!(starting.server_name.as_deref(), Some("a"));
        assert_eq!(starting.address, None);

        assert!(matches!(
            f.catalog.edit_property("a", "difficulty", "hard").await,
            Err(ServerError::ServerRunning(_))
        ));
        assert!(matches!(f.sessions.stop(U1, None).await, Err(ServerError::NotRunning)));

        f.engine.release_launch();
        let started = start.await.unwrap().unwrap();

        let running = f.sessions.status().await;
        assert_eq!(running.state, SessionState::Running);
        assert_eq!(running.address, Some(started.address));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_one_session() {
        let f = fixture().await;
        f.catalog.create("b", None).await.unwrap();
        f.engine.hold_launch.store(true, Ordering::SeqCst);

        let attempts: Vec<_> = (0..8u64)
            .map(|i| {
                let sessions = f.sessions.clone();
                let name = if i % 2 == 0 { "a" } else { "b" };
                tokio::spawn(async move { sessions.start(name, 2, i).await })
            })
            .collect();

        wait_for_state(&f.sessions, SessionState::Starting).await;
        f.engine.release_launch();

        let mut started = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => started += 1,
                Err(ServerError::AlreadyRunning(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(f.engine.launches.load(Ordering::SeqCst), 1);
        assert_eq!(f.engine.running_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_starting_guild_does_not_block_another() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let settings = Database::new(dir.path().join("servers.db")).await.unwrap();
        let registry = GuildRegistry::new(
            dir.path().join("SavedServers"),
            2,
            settings,
            engine.clone(),
        );
        let (first, second) = (TenantId::new(1), TenantId::new(2));
        registry.catalog(first).await.unwrap().create("a", None).await.unwrap();

        let slow = registry.sessions(first).await.unwrap();
        engine.hold_launch.store(true, Ordering::SeqCst);
        let parked = {
            let slow = slow.clone();
            tokio::spawn(async move { slow.start("a", 2, U1).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.launches.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(slow.status().await.state, SessionState::Starting);

        tokio::time::timeout(Duration::from_secs(2), async {
            let catalog = registry.catalog(second).await.unwrap();
            catalog.create("b", None).await.unwrap();
            let sessions = registry.sessions(second).await.unwrap();
            assert_eq!(sessions.status().await.state, SessionState::Idle);
            sessions.start("b", 2, U2).await.unwrap();
            assert_eq!(sessions.status().await.state, SessionState::Running);
            sessions.stop(U2, None).await.unwrap();
        })
        .await
        .expect("second guild waited on the first");

        assert_eq!(slow.status().await.state, SessionState::Starting);
        engine.release_launch();
        parked.await.unwrap().unwrap();
        assert_eq!(slow.status().await.state, SessionState::Running);
    }

    #[tokio::test]
    async fn command_is_forwarded_verbatim() {
        let f = fixture().await;
        assert!(matches!(
            f.sessions.command(U1, None, "list").await,
            Err(ServerError::NotRunning)
        ));

        let started = f.sessions.start("a", 2, U1).await.unwrap();
        let output = f.sessions.command(U1, None, " say hi ").await.unwrap();
        assert_eq!(output, "ran:  say hi ");

        assert!(matches!(
            f.sessions.command(U2, None, "op U2").await,
            Err(ServerError::Unauthorized)
        ));
        f.sessions
            .command(U2, Some(started.secret.as_str()), "list")
            .await
            .unwrap();

        assert_eq!(*f.engine.commands.lock().unwrap(), vec![" say hi ", "list"]);
    }

    #[tokio::test]
    async fn exited_process_is_reaped() {
        let f = fixture().await;
        f.sessions.start("a", 2, U1).await.unwrap();
        assert_eq!(f.sessions.reap_if_exited().await, None);

        let handle = {
            let inner = f.sessions.tenant.lock().await;
            inner.session.as_ref().unwrap().handle.unwrap()
        };
        f.engine.crash(handle);

        assert_eq!(f.sessions.reap_if_exited().await.as_deref(), Some("a"));
        assert_eq!(f.sessions.status().await.state, SessionState::Idle);
        assert_eq!(f.engine.attached_count(), 0);
    }

    #[tokio::test]
    async fn repeated_crashes_do_not_pile_up_in_the_engine() {
        let f = fixture().await;
        for _ in 0..3 {
            f.sessions.start("a", 2, U1).await.unwrap();
            let handle = {
                let inner = f.sessions.tenant.lock().await;
                inner.session.as_ref().unwrap().handle.unwrap()
            };
            f.engine.crash(handle);
            assert_eq!(f.sessions.reap_if_exited().await.as_deref(), Some("a"));
        }

        assert_eq!(f.engine.launches.load(Ordering::SeqCst), 3);
        assert_eq!(f.engine.attached_count(), 0);
    }

    #[tokio::test]
    async fn force_stop_ignores_ownership() {
        let f = fixture().await;
        assert_eq!(f.sessions.force_stop().await.unwrap(), None);

        f.sessions.start("a", 2, U1).await.unwrap();
        assert_eq!(f.sessions.force_stop().await.unwrap().as_deref(), Some("a"));
        assert_eq!(f.engine.running_count(), 0);
    }
}
