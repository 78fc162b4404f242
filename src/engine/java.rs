use super::{
    manifest::VersionManifest, properties, EngineError, EngineResult, Launched, ServerEngine,
    SessionHandle,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{broadcast, oneshot, Mutex},
    time::{self, Instant},
};
use tracing::{debug, info, trace, warn};

const SERVER_JAR: &str = "server.jar";
const EULA_FILE: &str = "eula.txt";
const READY_MARKER: &str = "Done (";
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_WINDOW: Duration = Duration::from_millis(750);
const OUTPUT_BUFFER: usize = 256;

#[derive(Debug)]
struct RunningServer {
    name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    output: broadcast::Sender<String>,
}

impl RunningServer {
    async fn write_line(&self, line: &str) -> EngineResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(format!("{}\n", line).as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Runs vanilla servers with a local Java install.
#[derive(Debug)]
pub struct JavaEngine {
    java_path: String,
    host: String,
    http: reqwest::Client,
    processes: DashMap<u64, Arc<RunningServer>>,
    next_handle: AtomicU64,
}

impl JavaEngine {
    pub fn new(java_path: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            java_path: java_path.into(),
            host: host.into(),
            http: reqwest::Client::new(),
            processes: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    async fn check_java(&self) -> EngineResult<()> {
        let output = Command::new(&self.java_path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| EngineError::MissingJava(format!("{}: {}", self.java_path, e)))?;

        if !output.status.success() {
            return Err(EngineError::MissingJava(format!(
                "{} exited with {}",
                self.java_path, output.status
            )));
        }
        Ok(())
    }

    fn server(&self, handle: SessionHandle) -> EngineResult<Arc<RunningServer>> {
        self.processes
            .get(&handle.0)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::UnknownSession(handle))
    }
}

#[async_trait]
impl ServerEngine for JavaEngine {
    async fn resolve_latest_version(&self) -> EngineResult<String> {
        Ok(VersionManifest::fetch(&self.http).await?.latest.release)
    }

    async fn materialize(
        &self,
        storage: &Path,
        name: &str,
        version: Option<&str>,
    ) -> EngineResult<String> {
        self.check_java().await?;

        let manifest = VersionManifest::fetch(&self.http).await?;
        let version = version
            .unwrap_or(manifest.latest.release.as_str())
            .to_string();
        let download = manifest.server_download(&self.http, &version).await?;

        let dir = storage.join(name);
        fs::create_dir(&dir).await?;

        info!("Downloading Minecraft {} server for {}", version, name);
        let jar = self
            .http
            .get(&download.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        if jar.len() as u64 != download.size {
            return Err(EngineError::Custom(format!(
                "server jar download was truncated ({} of {} bytes)",
                jar.len(),
                download.size
            )));
        }

        fs::write(dir.join(SERVER_JAR), &jar).await?;
        fs::write(dir.join(EULA_FILE), "eula=true\n").await?;
        fs::write(dir.join(properties::PROPERTIES_FILE), properties::DEFAULT_PROPERTIES).await?;

        Ok(version)
    }

    async fn launch(&self, storage: &Path, name: &str, memory_gb: u32) -> EngineResult<Launched> {
        self.check_java().await?;

        let dir = storage.join(name);
        let port = properties::port(&properties::load(&dir).await?);

        let mut child = Command::new(&self.java_path)
            .arg(format!("-Xmx{}G", memory_gb))
            .arg(format!("-Xms{}G", memory_gb))
            .args(["-jar", SERVER_JAR, "nogui"])
            .current_dir(&dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Launch("server stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("server stdout was not captured".into()))?;

        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let forward = output.clone();
        let log_name = name.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut ready = Some(ready_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("[{}] {}", log_name, line);
                if line.contains(READY_MARKER) {
                    if let Some(tx) = ready.take() {
                        tx.send(()).ok();
                    }
                }
                forward.send(line).ok();
            }
            debug!("Output of {} closed", log_name);
        });

        // The reader drops the sender without firing it when stdout closes first.
        if ready_rx.await.is_err() {
            let status = child.wait().await?;
            return Err(EngineError::Launch(format!(
                "process exited with {} before it finished loading",
                status
            )));
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.processes.insert(
            id,
            Arc::new(RunningServer {
                name: name.to_string(),
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
                output,
            }),
        );

        Ok(Launched {
            handle: SessionHandle(id),
            address: format!("{}:{}", self.host, port),
        })
    }

    async fn terminate(&self, handle: SessionHandle) -> EngineResult<()> {
        let server = self.server(handle)?;

        if let Err(e) = server.write_line("stop").await {
            debug!("Could not send stop to {}: {}", server.name, e);
        }

        {
            let mut child = server.child.lock().await;
            match time::timeout(STOP_TIMEOUT, child.wait()).await {
                Ok(status) => {
                    info!("{} exited with {}", server.name, status?);
                }
                Err(_) => {
                    warn!("{} ignored stop for {:?}, killing it", server.name, STOP_TIMEOUT);
                    child.kill().await?;
                }
            }
        }

        self.processes.remove(&handle.0);
        Ok(())
    }

    async fn send_console_command(
        &self,
        handle: SessionHandle,
        text: &str,
    ) -> EngineResult<String> {
        let server = self.server(handle)?;
        let mut output = server.output.subscribe();
        server.write_line(text).await?;

        let deadline = Instant::now() + COMMAND_WINDOW;
        let mut lines = Vec::new();
        loop {
            match time::timeout_at(deadline, output.recv()).await {
                Ok(Ok(line)) => lines.push(line),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("Dropped {} console lines from {}", skipped, server.name);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }

        Ok(lines.join("\n"))
    }

    async fn read_property(
        &self,
        storage: &Path,
        name: &str,
        key: &str,
    ) -> EngineResult<Option<String>> {
        properties::read_value(&storage.join(name), key).await
    }

    async fn write_property(
        &self,
        storage: &Path,
        name: &str,
        key: &str,
        value: &str,
    ) -> EngineResult<()> {
        properties::write_value(&storage.join(name), key, value).await
    }

    async fn is_alive(&self, handle: SessionHandle) -> bool {
        let Ok(server) = self.server(handle) else {
            return false;
        };
        let mut child = server.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn release(&self, handle: SessionHandle) {
        let Some((_, server)) = self.processes.remove(&handle.0) else {
            return;
        };
        let mut child = server.child.lock().await;
        if let Ok(None) = child.try_wait() {
            warn!("{} was still running when released, killing it", server.name);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", server.name, e);
            }
        }
        debug!("Released {} ({})", server.name, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_java_is_reported() {
        let engine = JavaEngine::new("/nonexistent/bin/java", "localhost");
        let dir = tempfile::TempDir::new().unwrap();

        let err = engine.launch(dir.path(), "survival", 2).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingJava(_)));
        assert!(!dir.path().join("survival").exists());
    }

    /// Writes a stand-in for `java` that reports ready and exits at once.
    #[cfg(unix)]
    fn short_lived_java(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("java");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '[Server thread/INFO]: Done (0.5s)! For help, type \"help\"'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn released_handles_are_forgotten() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(storage.join("survival")).unwrap();
        let engine = JavaEngine::new(short_lived_java(dir.path()), "localhost");

        for _ in 0..3 {
            let launched = engine.launch(&storage, "survival", 1).await.unwrap();
            assert_eq!(launched.address, "localhost:25565");

            time::timeout(Duration::from_secs(5), async {
                while engine.is_alive(launched.handle).await {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
            engine.release(launched.handle).await;
        }

        assert!(engine.processes.is_empty());
        engine.release(SessionHandle(42)).await;
    }

    #[tokio::test]
    async fn unknown_handles_are_not_alive() {
        let engine = JavaEngine::new("java", "localhost");
        assert!(!engine.is_alive(SessionHandle(42)).await);
        assert!(matches!(
            engine.terminate(SessionHandle(42)).await,
            Err(EngineError::UnknownSession(SessionHandle(42)))
        ));
    }
}
