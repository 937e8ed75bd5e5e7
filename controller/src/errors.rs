use kube::{Resource, ResourceExt};
use std::fmt;

/// How the controller reacts to a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ErrorKind {
    /// Invalid user input. Surfaced on the status, not retried.
    Validation,
    /// Inconsistent or incomplete configuration. Needs a spec change.
    Configuration,
    /// Connectivity or API failures. Retried with backoff.
    Transient,
    /// Failure to obtain or refresh a remote credential. Retried with backoff.
    Credential,
}

impl ErrorKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation | Self::Configuration)
    }

    /// Reason string used on status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationFailed",
            Self::Configuration => "ConfigurationError",
            Self::Transient => "TransientError",
            Self::Credential => "CredentialError",
        }
    }
}

/// Identity of the reconciled object, `namespace/name` or `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn of<K: Resource>(obj: &K) -> Self {
        match obj.namespace() {
            Some(namespace) => Self(format!("{namespace}/{}", obj.name_any())),
            None => Self(obj.name_any()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} error reconciling {object} during {operation}: {cause:#}")]
pub struct ReconcileError {
    pub kind: ErrorKind,
    pub object: ObjectId,
    pub operation: &'static str,
    pub cause: anyhow::Error,
}

impl ReconcileError {
    pub fn new(
        kind: ErrorKind,
        object: ObjectId,
        operation: &'static str,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            kind,
            object,
            operation,
            cause: cause.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Message for status conditions. Excludes the object identity, which is
    /// implied by where the condition is written.
    pub fn status_message(&self) -> String {
        format!("{}: {:#}", self.operation, self.cause)
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Attaches reconcile context to fallible operations.
pub trait ReconcileContext<T> {
    fn reconcile_err(
        self,
        kind: ErrorKind,
        object: &ObjectId,
        operation: &'static str,
    ) -> ReconcileResult<T>;

    fn transient(self, object: &ObjectId, operation: &'static str) -> ReconcileResult<T>
    where
        Self: Sized,
    {
        self.reconcile_err(ErrorKind::Transient, object, operation)
    }
}

impl<T, E> ReconcileContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn reconcile_err(
        self,
        kind: ErrorKind,
        object: &ObjectId,
        operation: &'static str,
    ) -> ReconcileResult<T> {
        self.map_err(|err| ReconcileError::new(kind, object.clone(), operation, err))
    }
}

/// Errors raised by the kube finalizer helper. Failures of the wrapped
/// reconcile keep their classification, finalizer bookkeeping is transient.
pub fn from_finalizer_error(
    object: ObjectId,
    err: kube::runtime::finalizer::Error<ReconcileError>,
) -> ReconcileError {
    use kube::runtime::finalizer::Error;
    match err {
        Error::ApplyFailed(err) | Error::CleanupFailed(err) => err,
        Error::AddFinalizer(err) => {
            ReconcileError::new(ErrorKind::Transient, object, "add finalizer", err)
        }
        Error::RemoveFinalizer(err) => {
            ReconcileError::new(ErrorKind::Transient, object, "remove finalizer", err)
        }
        err @ (Error::UnnamedObject | Error::InvalidFinalizer) => ReconcileError::new(
            ErrorKind::Configuration,
            object,
            "finalizer",
            anyhow::anyhow!("{err}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use greenhouse_apis::{Plugin, PluginSpec};

    #[test]
    fn terminal_kinds() {
        assert!(ErrorKind::Validation.is_terminal());
        assert!(ErrorKind::Configuration.is_terminal());
        assert!(!ErrorKind::Transient.is_terminal());
        assert!(!ErrorKind::Credential.is_terminal());
    }

    #[test]
    fn carries_identity_and_operation() {
        let mut plugin = Plugin::new("logging", PluginSpec::default());
        plugin.metadata.namespace = Some("org".to_owned());
        let id = ObjectId::of(&plugin);

        let result: Result<(), anyhow::Error> = Err(anyhow!("connection refused"));
        let err = result.transient(&id, "get release").unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.object.as_str(), "org/logging");
        assert_eq!(
            err.to_string(),
            "Transient error reconciling org/logging during get release: connection refused"
        );
        assert_eq!(err.status_message(), "get release: connection refused");
    }
}
