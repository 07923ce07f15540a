use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::checkout::CheckoutOptions;
use crate::config::{Config, Remote};
use crate::error::{Error, IoResultExt, Result};
use crate::hash::HashAlgorithm;
use crate::index::Index;
use crate::odb::ObjectDb;
use crate::state::State;

/// name of the metadata directory at the root of a project
pub const REPO_DIR: &str = ".hoard";

/// a hoard project: a working directory with a `.hoard` directory in it
pub struct Repo {
    root: PathBuf,
    path: PathBuf,
    config: Config,
}

impl Repo {
    /// initialize a new repository at the given path
    pub fn init(root: &Path, hash: HashAlgorithm) -> Result<Self> {
        let path = root.join(REPO_DIR);
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::RepoExists(root.to_path_buf()));
        }

        // create directory structure
        std::fs::create_dir_all(path.join("cache")).with_path(&path)?;
        std::fs::create_dir_all(path.join("index")).with_path(&path)?;

        let config = Config::new(hash);
        config.save(&config_path)?;

        tracing::info!(root = %root.display(), %hash, "repository initialized");
        Ok(Self {
            root: root.to_path_buf(),
            path,
            config,
        })
    }

    /// open an existing repository
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(REPO_DIR);
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoRepo(root.to_path_buf()));
        }

        let config = Config::load(&config_path)?;

        Ok(Self {
            root: root.to_path_buf(),
            path,
            config,
        })
    }

    /// project root, the directory holding `.hoard`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// the `.hoard` directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// repository configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// save configuration changes
    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    /// local object cache
    pub fn cache_path(&self) -> PathBuf {
        self.path.join("cache")
    }

    pub fn state_path(&self) -> PathBuf {
        self.path.join("state.cbor")
    }

    /// index of what a remote is known to hold
    pub fn index_path(&self, remote: &str) -> PathBuf {
        self.path.join("index").join(format!("{}.cbor", remote))
    }

    /// path to lock file
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    pub fn jobs(&self) -> usize {
        self.config.core.jobs()
    }

    /// the local cache as an object database
    pub fn odb(&self) -> Result<ObjectDb> {
        ObjectDb::local(self.cache_path(), self.config.core.hash)
    }

    pub fn state(&self) -> Result<State> {
        State::open(self.state_path())
    }

    pub fn remote(&self, name: &str) -> Result<&Remote> {
        self.config
            .get_remote(name)
            .ok_or_else(|| Error::RemoteNotFound(name.to_string()))
    }

    /// object database of a configured remote
    pub fn remote_odb(&self, name: &str) -> Result<ObjectDb> {
        let remote = self.remote(name)?;
        ObjectDb::local(&remote.url, self.config.core.hash)
    }

    pub fn remote_index(&self, name: &str) -> Result<Index> {
        self.remote(name)?;
        Index::open(self.index_path(name))
    }

    /// forget a remote along with its index
    pub fn remove_remote(&mut self, name: &str) -> Result<()> {
        self.config.remove_remote(name)?;
        self.save_config()?;

        let index = self.index_path(name);
        match std::fs::remove_file(&index) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(index, e)),
        }
    }

    /// checkout options from the configuration
    pub fn checkout_options(&self) -> CheckoutOptions {
        CheckoutOptions {
            link_types: self.config.checkout.link_types.clone(),
            jobs: self.jobs(),
        }
    }

    /// acquire exclusive lock on repository
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<RepoLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::LockContention)?;

        Ok(RepoLock { _flock: flock })
    }

    /// try to acquire exclusive lock, returning None if already locked
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(RepoLock { _flock: flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }
}

/// guard that holds repository lock until dropped
pub struct RepoLock {
    _flock: Flock<File>,
}
