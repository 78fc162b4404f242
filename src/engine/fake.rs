//! In-memory engine for tests. Definitions are plain directories, launches
//! never spawn anything, and every operation can be told to fail.

use super::{EngineError, EngineResult, Launched, ServerEngine, SessionHandle};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};
use tokio::{fs, sync::Notify};

pub const FAKE_VERSION: &str = "1.21.4";

#[derive(Debug, Default)]
pub struct FakeEngine {
    pub fail_materialize: AtomicBool,
    pub fail_launch: AtomicBool,
    pub fail_terminate: AtomicBool,
    /// While set, `materialize` never finishes after writing its first file.
    pub hold_materialize: AtomicBool,
    /// When set, the next `launch` waits for `release_launch` before
    /// answering. Later launches go straight through.
    pub hold_launch: AtomicBool,
    launch_gate: Notify,
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    next_handle: AtomicU64,
    running: Mutex<HashSet<u64>>,
    /// Handles the engine still holds resources for, alive or not.
    attached: Mutex<HashSet<u64>>,
    properties: Mutex<HashMap<(PathBuf, String), String>>,
    pub commands: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release_launch(&self) {
        self.launch_gate.notify_one();
    }

    /// Simulates a server process dying without being asked to.
    pub fn crash(&self, handle: SessionHandle) {
        self.running.lock().unwrap().remove(&handle.0);
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }
}

#[async_trait]
impl ServerEngine for FakeEngine {
    async fn resolve_latest_version(&self) -> EngineResult<String> {
        Ok(FAKE_VERSION.to_string())
    }

    async fn materialize(
        &self,
        storage: &Path,
        name: &str,
        version: Option<&str>,
    ) -> EngineResult<String> {
        let dir = storage.join(name);
        fs::create_dir(&dir).await?;
        // Leave something behind so rollback has real work to do.
        fs::write(dir.join("eula.txt"), "eula=true\n").await?;
        tokio::task::yield_now().await;

        if self.hold_materialize.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_materialize.load(Ordering::SeqCst) {
            return Err(EngineError::MissingJava("java: not found".into()));
        }
        Ok(version.unwrap_or(FAKE_VERSION).to_string())
    }

    async fn launch(&self, _storage: &Path, name: &str, _memory_gb: u32) -> EngineResult<Launched> {
        let hold = self.hold_launch.swap(false, Ordering::SeqCst);
        self.launches.fetch_add(1, Ordering::SeqCst);
        if hold {
            self.launch_gate.notified().await;
        }
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(EngineError::Launch(format!("{} crashed while loading", name)));
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(id);
        self.attached.lock().unwrap().insert(id);
        Ok(Launched {
            handle: SessionHandle(id),
            address: format!("127.0.0.1:{}", 25565 + id),
        })
    }

    async fn terminate(&self, handle: SessionHandle) -> EngineResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(EngineError::Custom("process refused to stop".into()));
        }
        self.running.lock().unwrap().remove(&handle.0);
        self.attached.lock().unwrap().remove(&handle.0);
        Ok(())
    }

    async fn send_console_command(
        &self,
        handle: SessionHandle,
        text: &str,
    ) -> EngineResult<String> {
        if !self.running.lock().unwrap().contains(&handle.0) {
            return Err(EngineError::UnknownSession(handle));
        }
        self.commands.lock().unwrap().push(text.to_string());
        Ok(format!("ran: {}", text))
    }

    async fn read_property(
        &self,
        storage: &Path,
        name: &str,
        key: &str,
    ) -> EngineResult<Option<String>> {
        Ok(self
            .properties
            .lock()
            .unwrap()
            .get(&(storage.join(name), key.to_string()))
            .cloned())
    }

    async fn write_property(
        &self,
        storage: &Path,
        name: &str,
        key: &str,
        value: &str,
    ) -> EngineResult<()> {
        self.properties
            .lock()
            .unwrap()
            .insert((storage.join(name), key.to_string()), value.to_string());
        Ok(())
    }

    async fn is_alive(&self, handle: SessionHandle) -> bool {
        self.running.lock().unwrap().contains(&handle.0)
    }

    async fn release(&self, handle: SessionHandle) {
        self.running.lock().unwrap().remove(&handle.0);
        self.attached.lock().unwrap().remove(&handle.0);
    }
}
