//! hoard - content-addressed storage for large data directories
//!
//! files and directories are stored as immutable objects addressed by the
//! digest of their bytes, moved between stores in parallel, and materialized
//! into working directories with the cheapest link the filesystem allows.
//!
//! # Core concepts
//!
//! - **Object**: bytes stored under their own digest in an [`ObjectDb`]
//! - **Tree**: a sorted directory manifest, itself stored as an object
//! - **Index**: per-remote record of directories known to be complete there
//! - **State**: cache of `(path, size, mtime) -> hash` for files on disk
//!
//! A directory's tree object never reaches a destination before all of the
//! files it refers to do.
//!
//! # Example usage
//!
//! ```no_run
//! use std::collections::BTreeSet;
//! use std::path::Path;
//! use hoard::{build_tree, transfer, Checkout, CheckoutOptions, HashAlgorithm, Repo, TransferOptions};
//!
//! let repo = Repo::init(Path::new("/path/to/project"), HashAlgorithm::Sha256).unwrap();
//! let odb = repo.odb().unwrap();
//! let state = repo.state().unwrap();
//!
//! // store a directory
//! let tree = build_tree(&odb, &state, Path::new("/path/to/project/data"), 8).unwrap();
//!
//! // copy it to another store
//! let remote = hoard::ObjectDb::local("/mnt/storage/hoard", HashAlgorithm::Sha256).unwrap();
//! transfer(&odb, &remote, &BTreeSet::from([tree.clone()]), &TransferOptions::default()).unwrap();
//!
//! // and materialize it somewhere else
//! Checkout::new(&odb, &state, CheckoutOptions::default())
//!     .checkout(Path::new("/tmp/data"), &tree)
//!     .unwrap();
//! ```

mod build;
mod checkout;
mod config;
mod error;
mod hash;
mod index;
mod odb;
mod persist;
mod pool;
mod progress;
mod repo;
mod state;
mod status;
mod transfer;
mod tree;
mod verify;

pub mod backend;
pub mod link;

pub use backend::{Backend, LocalBackend, MemoryBackend, WriteStream};
pub use build::build_tree;
pub use checkout::{checkout, Checkout, CheckoutOptions, CheckoutStats};
pub use config::{CheckoutConfig, Config, CoreConfig, Remote};
pub use error::{Error, IoResultExt, Result};
pub use hash::{Digester, HashAlgorithm, HashInfo};
pub use index::Index;
pub use link::{LinkCache, LinkType};
pub use odb::{AddOptions, ObjectDb, ObjectHandle};
pub use pool::{default_jobs, WorkerPool};
pub use progress::{CountingProgress, NoProgress, Progress};
pub use repo::{Repo, RepoLock, REPO_DIR};
pub use state::{State, StateEntry};
pub use status::{compare, compare_indexed, expand_wanted, Status};
pub use transfer::{transfer, TransferOptions};
pub use tree::{FlatEntry, Reachable, Tree, TreeArena, TreeEntry};
pub use verify::{verify, CorruptObject, VerifyReport};
