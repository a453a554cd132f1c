//! Spawning worker child processes.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

impl<F> WorkerSpawner for F
where
    F: Fn() -> Result<Child, SpawnError> + Send + Sync + 'static,
{
    fn spawn(&self) -> Result<Child, SpawnError> {
        self()
    }
}

/// Spawns `program` with piped stdin/stdout and inherited stderr.
///
/// Children are killed if their handle is dropped without being reaped.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        tracing::debug!(
            program = ?self.program,
            pid = child.id(),
            "Spawned worker process"
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments() {
        let spawner = CommandSpawner::new("python")
            .with_arg("-u")
            .with_args(["-m", "worker"])
            .with_env("WORKER_MODE", "slot")
            .with_current_dir("/tmp");

        assert_eq!(spawner.program(), "python");
        assert_eq!(spawner.args, vec!["-u", "-m", "worker"]);
        assert_eq!(spawner.env.len(), 1);
        assert_eq!(spawner.current_dir, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/slotpool-worker");
        assert!(matches!(spawner.spawn(), Err(SpawnError::Spawn(_))));
    }

    #[tokio::test]
    async fn closures_are_spawners() {
        let spawner = || -> Result<Child, SpawnError> { Err(SpawnError::Other("disabled".into())) };
        let err = WorkerSpawner::spawn(&spawner).unwrap_err();
        assert_eq!(err.to_string(), "spawn failed: disabled");
    }
}
