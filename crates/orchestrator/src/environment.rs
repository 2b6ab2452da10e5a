//! Environment composition: one backend + one frontend per environment

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use lingotest_common::{Error, EventBus, Result};

use crate::ports::PortPool;
use crate::server::{ServerConfig, ServerInstance};

/// Template describing the process pair every environment spawns
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub backend: ServerConfig,
    pub frontend: ServerConfig,
}

/// A provisioned backend+frontend pair with private scratch and log
/// directories
///
/// Environments are never shared across concurrent workers, so no
/// locking is needed within one.
pub struct TestEnvironment {
    id: Uuid,
    label: String,
    backend: ServerInstance,
    frontend: ServerInstance,
    scratch: Option<TempDir>,
    log_dir: PathBuf,
    events: EventBus,
}

impl TestEnvironment {
    pub fn new(
        label: &str,
        config: EnvironmentConfig,
        pool: Arc<PortPool>,
        log_root: &Path,
        events: EventBus,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let log_dir = log_root.join(format!("{label}-{id}"));
        std::fs::create_dir_all(&log_dir)?;

        Ok(Self {
            id,
            label: label.to_string(),
            backend: ServerInstance::new(config.backend, pool.clone())?,
            frontend: ServerInstance::new(config.frontend, pool)?,
            scratch: Some(TempDir::new()?),
            log_dir,
            events,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|d| d.path())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn backend_url(&self) -> Option<&str> {
        self.backend.url()
    }

    pub fn frontend_url(&self) -> Option<&str> {
        self.frontend.url()
    }

    /// Start backend, gate on its health, then start the frontend
    /// with the backend's resolved URL, and gate on that too.
    pub async fn start(&mut self) -> Result<()> {
        match self.try_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Partial startup still tears down cleanly
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn try_start(&mut self) -> Result<()> {
        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("environment already stopped".to_string()))?
            .path()
            .to_path_buf();

        let mut backend_env = HashMap::new();
        backend_env.insert("HOST".to_string(), "127.0.0.1".to_string());
        backend_env.insert(
            "DATABASE_URL".to_string(),
            format!("sqlite://{}/lingoreel.db", scratch.display()),
        );
        backend_env.insert("JWT_SECRET".to_string(), "lingotest-secret".to_string());
        backend_env.insert("CORS_ALLOW_ALL".to_string(), "1".to_string());

        self.backend
            .start(&backend_env, &self.log_dir.join("backend.log"), &self.events)
            .await?;
        self.backend.wait_for_health().await?;

        // The frontend needs the backend's resolved URL, so readiness
        // strictly precedes this spawn.
        let backend_url = self
            .backend
            .url()
            .ok_or_else(|| Error::InvalidConfig("backend ready without a resolved url".to_string()))?
            .to_string();

        let mut frontend_env = HashMap::new();
        frontend_env.insert("HOST".to_string(), "127.0.0.1".to_string());
        frontend_env.insert("BACKEND_URL".to_string(), backend_url.clone());
        frontend_env.insert("VITE_API_URL".to_string(), backend_url);

        self.frontend
            .start(
                &frontend_env,
                &self.log_dir.join("frontend.log"),
                &self.events,
            )
            .await?;
        self.frontend.wait_for_health().await?;

        info!(
            env = %self.label,
            backend = self.backend.url(),
            frontend = self.frontend.url(),
            "environment up"
        );
        Ok(())
    }

    /// Tear down both instances concurrently, then drop the scratch
    /// directory. Never errors.
    pub async fn stop(&mut self) {
        tokio::join!(self.backend.stop(), self.frontend.stop());
        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.close() {
                warn!(env = %self.label, error = %e, "scratch removal failed");
            }
        }
    }

    /// Environment variables injected into spawned test commands
    pub fn child_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(url) = self.backend.url() {
            env.insert("BACKEND_URL".to_string(), url.to_string());
            env.insert("API_URL".to_string(), url.to_string());
        }
        if let Some(url) = self.frontend.url() {
            env.insert("FRONTEND_URL".to_string(), url.to_string());
            env.insert("BASE_URL".to_string(), url.to_string());
        }
        env
    }
}

/// Provisions environments from a shared port pool
///
/// Explicitly constructed and handed to the runner; there is no
/// module-level default instance.
pub struct Orchestrator {
    pool: Arc<PortPool>,
    template: EnvironmentConfig,
    log_root: PathBuf,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        template: EnvironmentConfig,
        pool: Arc<PortPool>,
        log_root: PathBuf,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            template,
            log_root,
            events,
        }
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Create and fully start a fresh environment
    pub async fn provision(&self, label: &str) -> Result<TestEnvironment> {
        let mut env = TestEnvironment::new(
            label,
            self.template.clone(),
            self.pool.clone(),
            &self.log_root,
            self.events.clone(),
        )?;
        env.start().await?;
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_config(name: &str, banner: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), format!("echo '{banner}'; sleep 30")],
            working_dir: None,
            env: HashMap::new(),
            candidate_ports: Vec::new(),
            health_path: "/health".to_string(),
            ready_patterns: vec![banner.to_string()],
            startup_timeout_ms: 5_000,
            shutdown_timeout_ms: 1_000,
            health_poll_ms: 50,
            health_attempts: 2,
        }
    }

    #[tokio::test]
    async fn test_stop_without_start_never_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(43300, 43320));
        let config = EnvironmentConfig {
            backend: sh_config("backend", "api ready"),
            frontend: sh_config("frontend", "ui ready"),
        };

        let mut env = TestEnvironment::new(
            "unit",
            config,
            pool.clone(),
            dir.path(),
            EventBus::detached(),
        )
        .unwrap();
        env.stop().await;
        env.stop().await;
        assert_eq!(pool.in_use(), 0);
        assert!(env.scratch_path().is_none());
    }

    #[tokio::test]
    async fn test_failed_backend_health_rolls_back() {
        // sh never answers HTTP, so the health gate must fail and the
        // environment must come back down with no ports leaked.
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(43330, 43350));
        let config = EnvironmentConfig {
            backend: sh_config("backend", "api ready"),
            frontend: sh_config("frontend", "ui ready"),
        };

        let mut env = TestEnvironment::new(
            "health-fail",
            config,
            pool.clone(),
            dir.path(),
            EventBus::detached(),
        )
        .unwrap();

        let err = env.start().await.unwrap_err();
        assert!(matches!(err, Error::HealthTimeout { .. }));
        assert_eq!(pool.in_use(), 0);
        assert!(env.backend_url().is_none());
    }

    #[tokio::test]
    async fn test_child_env_empty_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(43360, 43370));
        let config = EnvironmentConfig {
            backend: sh_config("backend", "api ready"),
            frontend: sh_config("frontend", "ui ready"),
        };
        let env = TestEnvironment::new(
            "pre",
            config,
            pool,
            dir.path(),
            EventBus::detached(),
        )
        .unwrap();
        assert!(env.child_env().is_empty());
    }
}
