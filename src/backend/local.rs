use std::fs::{self, File, Permissions};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::libc;
use walkdir::WalkDir;

use super::{Backend, WriteStream};
use crate::error::{Error, IoResultExt, Result};
use crate::link::LinkType;

/// stored objects never carry write permission
const OBJECT_MODE: u32 = 0o444;

/// directory-backed storage
///
/// writes go to `<root>/tmp/<uuid>` first and are renamed into place after
/// fsync, so readers never observe a partially written location.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// open (creating if needed) a backend rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp")).with_path(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, location: &str) -> PathBuf {
        self.root.join(location)
    }

    fn tmp_path(&self) -> PathBuf {
        self.root.join("tmp").join(uuid::Uuid::new_v4().to_string())
    }
}

impl Backend for LocalBackend {
    fn open_read(&self, location: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path(location);
        let file = File::open(&path).with_path(&path)?;
        Ok(Box::new(file))
    }

    fn open_write(&self, location: &str) -> Result<Box<dyn WriteStream>> {
        let tmp_path = self.tmp_path();
        let file = File::create(&tmp_path).with_path(&tmp_path)?;
        Ok(Box::new(LocalWriteStream {
            file: Some(BufWriter::new(file)),
            tmp_path,
            final_path: self.path(location),
        }))
    }

    fn exists(&self, location: &str) -> bool {
        self.path(location).exists()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut locations = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                Error::io(
                    path,
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walkdir error")),
                )
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                continue;
            };

            // shard directories are two hex chars, which also skips tmp/
            let shard = relative.split('/').next().unwrap_or("");
            if shard.len() != 2 || !shard.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }

            if relative.starts_with(prefix) {
                locations.push(relative.to_string());
            }
        }

        locations.sort();
        Ok(locations)
    }

    fn remove(&self, location: &str) -> Result<()> {
        let path = self.path(location);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    fn local_path(&self, location: &str) -> Option<PathBuf> {
        Some(self.path(location))
    }

    fn link_from(&self, source: &Path, location: &str) -> Result<()> {
        let final_path = self.path(location);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        match fs::hard_link(source, &final_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => {
                return match e.raw_os_error() {
                    Some(libc::EXDEV) | Some(libc::EPERM) | Some(libc::EMLINK)
                    | Some(libc::EOPNOTSUPP) => Err(Error::UnsupportedLinkType(LinkType::Hardlink)),
                    _ => Err(Error::io(final_path, e)),
                };
            }
        }

        // shared inode: the caller's copy becomes read-only too
        fs::set_permissions(&final_path, Permissions::from_mode(OBJECT_MODE))
            .with_path(&final_path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

struct LocalWriteStream {
    file: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl Write for LocalWriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "stream already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl WriteStream for LocalWriteStream {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(writer) = self.file.take() else {
            return Ok(());
        };

        // atomic write: flush -> fsync -> read-only -> rename
        let file = writer
            .into_inner()
            .map_err(|e| Error::io(&self.tmp_path, e.into_error()))?;
        file.sync_all().with_path(&self.tmp_path)?;
        drop(file);

        fs::set_permissions(&self.tmp_path, Permissions::from_mode(OBJECT_MODE))
            .with_path(&self.tmp_path)?;

        let parent = self
            .final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        fs::create_dir_all(&parent).with_path(&parent)?;
        fs::rename(&self.tmp_path, &self.final_path).with_path(&self.final_path)?;

        fsync_dir(&parent)
    }
}

impl Drop for LocalWriteStream {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            // never committed
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// fsync a directory
fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}
