//! Error types for pools and dispatchers.

use std::fmt;

/// Boxed collaborator error (from `create`, `dispose`, adapters, ...).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("resource pool is closed")]
    Closed,

    #[error("failed to create resource: {0}")]
    Creation(#[source] BoxError),

    #[error("resource pool closed with disposal failures: {0}")]
    Disposal(DisposalErrors),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is closed")]
    Closed,

    #[error("task was removed from the queue before it started")]
    Cleared,

    #[error("failed to create slot: {0}")]
    Creation(#[source] BoxError),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("dispatcher terminated with disposal failures: {0}")]
    Disposal(DisposalErrors),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<ConfigError> for DispatchError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidConfiguration(msg) => DispatchError::InvalidConfiguration(msg),
        }
    }
}

/// Which step of a disposal failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposeStage {
    /// The pre-disposal cleanup hook.
    Cleanup,
    /// The disposal operation itself.
    Dispose,
}

impl fmt::Display for DisposeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleanup => write!(f, "cleanup"),
            Self::Dispose => write!(f, "dispose"),
        }
    }
}

/// A single failed disposal step.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DisposeFailure {
    pub id: String,
    pub stage: DisposeStage,
    pub message: String,
}

impl DisposeFailure {
    pub fn new(id: impl fmt::Display, stage: DisposeStage, message: impl fmt::Display) -> Self {
        Self {
            id: id.to_string(),
            stage,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for DisposeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.id, self.stage, self.message)
    }
}

/// Disposal failures collected during a bulk shutdown.
///
/// Every disposal is attempted before this is reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct DisposalErrors(Vec<DisposeFailure>);

impl DisposalErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: DisposeFailure) {
        self.0.push(failure);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = DisposeFailure>) {
        self.0.extend(other);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn failures(&self) -> &[DisposeFailure] {
        &self.0
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate.
    pub fn into_result(self) -> Result<(), DisposalErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl IntoIterator for DisposalErrors {
    type Item = DisposeFailure;
    type IntoIter = std::vec::IntoIter<DisposeFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for DisposalErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_error_display() {
        assert_eq!(PoolError::Closed.to_string(), "resource pool is closed");

        let err = PoolError::Creation("boom".into());
        assert_eq!(err.to_string(), "failed to create resource: boom");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn disposal_errors_aggregate_display() {
        let mut errors = DisposalErrors::new();
        errors.push(DisposeFailure::new("a", DisposeStage::Cleanup, "hook failed"));
        errors.push(DisposeFailure::new("b", DisposeStage::Dispose, "kill failed"));

        assert_eq!(
            errors.to_string(),
            "2 failed: a (cleanup): hook failed; b (dispose): kill failed"
        );
    }

    #[test]
    fn disposal_errors_into_result() {
        assert!(DisposalErrors::new().into_result().is_ok());

        let mut errors = DisposalErrors::new();
        errors.push(DisposeFailure::new("a", DisposeStage::Dispose, "x"));
        let err = errors.into_result().unwrap_err();
        assert_eq!(err.len(), 1);
    }

    #[test]
    fn config_error_converts_to_dispatch_error() {
        let err: DispatchError = ConfigError::InvalidConfiguration("bad".to_string()).into();
        assert!(matches!(err, DispatchError::InvalidConfiguration(msg) if msg == "bad"));
    }

    #[test]
    fn disposal_errors_serialize() {
        let mut errors = DisposalErrors::new();
        errors.push(DisposeFailure::new("slot-1", DisposeStage::Cleanup, "hook failed"));
        insta::assert_json_snapshot!(errors, @r#"
        [
          {
            "id": "slot-1",
            "stage": "cleanup",
            "message": "hook failed"
          }
        ]
        "#);
    }
}
