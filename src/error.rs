use std::path::PathBuf;

use nix::libc;

use crate::hash::HashInfo;
use crate::link::LinkType;

/// error type for hoard operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("object not found: {0}")]
    ObjectNotFound(HashInfo),

    #[error("malformed object {hash}: {message}")]
    ObjectFormat { hash: HashInfo, message: String },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: HashInfo, actual: String },

    #[error("{failed} object(s) failed to transfer")]
    Transfer {
        failed: usize,
        /// objects that could not be delivered, files and withheld directories
        hashes: Vec<HashInfo>,
    },

    #[error("{failed} path(s) failed to check out")]
    Checkout { failed: usize, paths: Vec<PathBuf> },

    #[error("{0} corrupt object(s) found")]
    Corrupt(usize),

    #[error("link type not supported here: {0}")]
    UnsupportedLinkType(LinkType),

    #[error("resource exhausted at {path}: {source}")]
    ResourceExhausted {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock contention on repository")]
    LockContention,

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("remote already exists: {0}")]
    RemoteExists(String),

    #[error("invalid tree path: {0}")]
    InvalidPath(String),

    #[error("duplicate tree path: {0}")]
    DuplicatePath(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("unknown hash algorithm: {0}")]
    UnknownHashAlgorithm(String),

    #[error("unknown link type: {0}")]
    UnknownLinkType(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// errors that must abort a whole batch instead of being tallied per object
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }

    /// true when the error means the object simply is not there
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ObjectNotFound(_) => true,
            Error::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// wrap an io error, classifying descriptor exhaustion separately
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if is_exhaustion(&source) {
            Error::ResourceExhausted { path, source }
        } else {
            Error::Io { path, source }
        }
    }
}

fn is_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::io(path, source))
    }
}
