use crate::event::TunnelRequest;
use crate::proxy;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const ACCESS_TOKEN_ENV: &str = "AWSIOT_TUNNEL_ACCESS_TOKEN";
pub const LOCK_DIR_ENV: &str = "LOCK_FILE_PATH";
pub const PROXY_ENV: &str = "HTTP_PROXY";
pub const DUMMY_CONFIG_FILE: &str = "dummy_config.json";
pub const PROXY_CONFIG_FILE: &str = "http-proxy-config.conf";

/// Wait after SIGTERM before the replacement starts. Best effort: the prior
/// agent is not confirmed dead, so two instances may briefly coexist if it
/// ignores the signal.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// The agent validates this file on startup but every real connection
/// parameter arrives via command-line flags; the keys only need to exist.
const DUMMY_CONFIG_CONTENT: &str = r#"{
    "endpoint": "not_needed_see_argv",
    "cert": "not_needed_see_argv",
    "key": "not_needed_see_argv",
    "root-ca": "not_needed_see_argv",
    "thing-name": "not_needed_see_argv"
}"#;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("tunnel event carried an empty services list")]
    NoService,
    #[error("failed to serialize proxy configuration: {0}")]
    SerializeProxy(#[from] serde_json::Error),
    #[error("failed to write {path:?}: {source}")]
    WriteArtifact {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to reset lock directory {path:?}: {source}")]
    ResetLockDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to start tunnel agent {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub agent_binary: PathBuf,
    pub work_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Fixed in the production wiring; injectable so lifecycle tests do not
    /// sit through the full wait.
    pub grace_period: Duration,
}

impl SupervisorConfig {
    pub fn new(agent_binary: PathBuf, work_dir: PathBuf, lock_dir: PathBuf) -> Self {
        Self {
            agent_binary,
            work_dir,
            lock_dir,
            grace_period: TERMINATION_GRACE,
        }
    }
}

impl From<&crate::config::WatcherConfig> for SupervisorConfig {
    fn from(config: &crate::config::WatcherConfig) -> Self {
        Self::new(
            config.agent_binary.clone(),
            config.work_dir.clone(),
            config.lock_dir.clone(),
        )
    }
}

/// Bookkeeping for the one managed agent instance. The `Child` itself is
/// owned by the reaper task; the slot keeps the pid for signalling and a
/// shared flag the reaper sets on exit.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pid: u32,
    started_at: Instant,
    exited: Arc<AtomicBool>,
}

impl ManagedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn signal_terminate(&self) {
        if self.pid == 0 {
            return;
        }
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid = self.pid, error = %err, "failed to signal tunnel agent");
        }
    }
}

/// Owns the single tunnel-agent process slot. Each accepted request replaces
/// whatever instance currently occupies the slot; the full replacement cycle
/// (terminate, grace wait, lock-dir reset, spawn) runs under one lock so
/// concurrent notifications serialize rather than interleave.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    slot: Arc<Mutex<Option<ManagedProcess>>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Snapshot of the slot, if a process has been started.
    pub async fn current_process(&self) -> Option<ManagedProcess> {
        self.slot.lock().await.clone()
    }

    /// Handles one accepted tunnel request. Side effects only; every failure
    /// is logged and contained so a bad notification cannot take down the
    /// watcher or starve later notifications.
    pub async fn handle_request(&self, request: TunnelRequest) {
        if let Err(err) = self.launch(&request).await {
            error!(
                error = %err,
                region = %request.region,
                "failed to configure and start tunnel agent"
            );
        }
    }

    async fn launch(&self, request: &TunnelRequest) -> Result<(), LaunchError> {
        let proxy_config = proxy::build(std::env::var(PROXY_ENV).ok().as_deref());

        let dummy_config_path = self.config.work_dir.join(DUMMY_CONFIG_FILE);
        let proxy_config_path = self.config.work_dir.join(PROXY_CONFIG_FILE);
        write_artifact(&dummy_config_path, DUMMY_CONFIG_CONTENT.as_bytes()).await?;
        let proxy_json = serde_json::to_vec(&proxy_config)?;
        write_artifact(&proxy_config_path, &proxy_json).await?;

        // Fails on an empty services list before the prior instance is
        // touched; the request is dropped and the slot left alone.
        let args = synthesize_args(request, &dummy_config_path, &proxy_config_path)?;

        let mut slot = self.slot.lock().await;

        if let Some(current) = slot.as_ref() {
            if !current.has_exited() {
                info!(pid = current.pid(), "terminating existing tunnel agent");
                current.signal_terminate();
                tokio::time::sleep(self.config.grace_period).await;
            }
        }

        self.reset_lock_dir().await?;

        info!(
            binary = %self.config.agent_binary.display(),
            args = ?args,
            "starting tunnel agent"
        );

        let mut command = Command::new(&self.config.agent_binary);
        command
            .args(&args)
            .env(ACCESS_TOKEN_ENV, &request.access_token)
            .env(LOCK_DIR_ENV, &self.config.lock_dir)
            .stdin(Stdio::null());
        // Detach into its own process group so the agent outlives the
        // watcher and the replacement SIGTERM only reaches the agent.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            binary: self.config.agent_binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        let exited = Arc::new(AtomicBool::new(false));

        *slot = Some(ManagedProcess {
            pid,
            started_at: Instant::now(),
            exited: exited.clone(),
        });
        drop(slot);

        // Reap the agent once it exits so it never lingers as a zombie. The
        // result is bookkeeping only; exit never triggers a new launch.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, status = %status, "tunnel agent exited"),
                Err(err) => warn!(pid, error = %err, "failed to await tunnel agent"),
            }
            exited.store(true, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn reset_lock_dir(&self) -> Result<(), LaunchError> {
        let path = &self.config.lock_dir;
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LaunchError::ResetLockDir {
                    path: path.clone(),
                    source,
                })
            }
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| LaunchError::ResetLockDir {
                path: path.clone(),
                source,
            })
    }
}

/// Builds the agent command line for one request. Deterministic; the only
/// failure is an empty services list.
pub fn synthesize_args(
    request: &TunnelRequest,
    config_file: &Path,
    proxy_file: &Path,
) -> Result<Vec<String>, LaunchError> {
    let service = request.services.first().ok_or(LaunchError::NoService)?;
    Ok(vec![
        "--enable-tunneling".into(),
        "true".into(),
        "--tunneling-region".into(),
        request.region.clone(),
        "--tunneling-service".into(),
        service.clone(),
        "--endpoint".into(),
        format!("data.tunneling.iot.{}.amazonaws.com", request.region),
        "--tunneling-disable-notification".into(),
        "--config-file".into(),
        config_file.display().to_string(),
        "--http-proxy-config".into(),
        proxy_file.display().to_string(),
        "--log-level".into(),
        "DEBUG".into(),
    ])
}

async fn write_artifact(path: &Path, content: &[u8]) -> Result<(), LaunchError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|source| LaunchError::WriteArtifact {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(region: &str, services: &[&str]) -> TunnelRequest {
        TunnelRequest {
            region: region.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
            access_token: "tok".to_string(),
        }
    }

    #[test]
    fn args_match_agent_contract() {
        let args = synthesize_args(
            &request("eu-west-1", &["SSH"]),
            Path::new("dummy_config.json"),
            Path::new("http-proxy-config.conf"),
        )
        .expect("one service present");
        assert_eq!(
            args,
            vec![
                "--enable-tunneling",
                "true",
                "--tunneling-region",
                "eu-west-1",
                "--tunneling-service",
                "SSH",
                "--endpoint",
                "data.tunneling.iot.eu-west-1.amazonaws.com",
                "--tunneling-disable-notification",
                "--config-file",
                "dummy_config.json",
                "--http-proxy-config",
                "http-proxy-config.conf",
                "--log-level",
                "DEBUG",
            ]
        );
    }

    #[test]
    fn first_service_wins() {
        let args = synthesize_args(
            &request("us-east-2", &["SSH", "VNC"]),
            Path::new("c"),
            Path::new("p"),
        )
        .unwrap();
        assert!(args.contains(&"SSH".to_string()));
        assert!(!args.contains(&"VNC".to_string()));
    }

    #[test]
    fn empty_services_is_a_construction_failure() {
        let result = synthesize_args(&request("eu-west-1", &[]), Path::new("c"), Path::new("p"));
        assert!(matches!(result, Err(LaunchError::NoService)));
    }

    #[test]
    fn dummy_config_carries_required_keys() {
        let value: serde_json::Value =
            serde_json::from_str(DUMMY_CONFIG_CONTENT).expect("placeholder config is valid JSON");
        for key in ["endpoint", "cert", "key", "root-ca", "thing-name"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }
}
