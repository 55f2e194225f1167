use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Malformed image or transport name
    #[error("invalid reference format '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Image not present in the local store
    #[error("image not known: {0}")]
    ImageNotFound(String),

    /// Image absent locally while the pull policy forbids pulling
    #[error("no such image \"{0}\"")]
    NoSuchImage(String),

    /// Container not present in the local store
    #[error("container not known: {0}")]
    ContainerNotFound(String),

    /// Container name already registered in the store
    #[error("the container name \"{0}\" is already in use")]
    DuplicateName(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Undecodable or ambiguous manifest
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Mounting a container's root filesystem failed
    #[error("Mount error: {0}")]
    MountError(String),

    /// Invariant violation, indicates a logic defect
    #[error("internal error: {0}")]
    Internal(String),

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Every name candidate failed to resolve
    #[error("{0}")]
    Resolution(ResolutionError),

    /// Error annotated with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<KilnError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KilnError {
    /// Wrap this error with a description of the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        KilnError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with every `Context` layer peeled off.
    pub fn root_cause(&self) -> &KilnError {
        let mut err = self;
        while let KilnError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_duplicate_name(&self) -> bool {
        matches!(self.root_cause(), KilnError::DuplicateName(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), KilnError::Cancelled)
    }

    pub fn is_image_not_found(&self) -> bool {
        matches!(self.root_cause(), KilnError::ImageNotFound(_))
    }

    /// Whether retrying the same network operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            KilnError::RegistryError { .. } | KilnError::IoError(_)
        )
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

/// Attach context to the error side of a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// One name candidate that could not be turned into a usable image.
#[derive(Debug)]
pub struct CandidateFailure {
    /// Fully-qualified (or local) name that was attempted
    pub candidate: String,
    /// Why it failed
    pub error: KilnError,
}

/// Aggregate of candidate failures for a single image request.
#[derive(Debug)]
pub struct ResolutionError {
    /// Image name as the caller spelled it
    pub requested: String,
    /// Registries configuration the candidates were derived from
    pub registries_conf: PathBuf,
    pub failures: Vec<CandidateFailure>,
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The following failures happened while trying to pull image specified by {:?} based on search registries in {}:",
            self.requested,
            self.registries_conf.display()
        )?;
        for failure in &self.failures {
            write!(f, "\n* {:?}: {}", failure.candidate, failure.error)?;
        }
        Ok(())
    }
}
