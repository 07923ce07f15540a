//! filesystem materialization strategies and capability caching

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::Path;
use std::str::FromStr;

use nix::libc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// mode given to copied and cloned files that carry no explicit mode
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// how a stored object is materialized at a checkout path,
/// cheapest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Reflink,
    Hardlink,
    Symlink,
    Copy,
}

impl LinkType {
    /// default preference order
    pub const PREFERENCE: [LinkType; 4] = [
        LinkType::Reflink,
        LinkType::Hardlink,
        LinkType::Symlink,
        LinkType::Copy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LinkType::Reflink => "reflink",
            LinkType::Hardlink => "hardlink",
            LinkType::Symlink => "symlink",
            LinkType::Copy => "copy",
        }
    }

    /// does this strategy need the object to live on a local filesystem
    ///
    /// only a copy can be streamed out of a store without local paths.
    pub fn needs_local_object(&self) -> bool {
        !matches!(self, LinkType::Copy)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LinkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reflink" => Ok(LinkType::Reflink),
            "hardlink" => Ok(LinkType::Hardlink),
            "symlink" => Ok(LinkType::Symlink),
            "copy" => Ok(LinkType::Copy),
            _ => Err(Error::UnknownLinkType(s.to_string())),
        }
    }
}

/// errno values meaning "this filesystem pair can't do that"
fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EXDEV)
            | Some(libc::EOPNOTSUPP)
            | Some(libc::ENOTTY)
            | Some(libc::EINVAL)
            | Some(libc::ENOSYS)
            | Some(libc::EPERM)
            | Some(libc::EMLINK)
    )
}

fn link_error(link: LinkType, path: &Path, err: io::Error) -> Error {
    if is_unsupported(&err) {
        Error::UnsupportedLinkType(link)
    } else {
        Error::io(path, err)
    }
}

/// copy-on-write clone of `src` to `dst`
#[cfg(target_os = "linux")]
pub fn reflink(src: &Path, dst: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;

    // _IOW(0x94, 9, int)
    const FICLONE: u64 = 0x4004_9409;

    let source = File::open(src).with_path(src)?;
    let target = File::create(dst).with_path(dst)?;

    let ret = unsafe { libc::ioctl(target.as_raw_fd(), FICLONE as _, source.as_raw_fd()) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        drop(target);
        let _ = fs::remove_file(dst);
        return Err(link_error(LinkType::Reflink, dst, err));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn reflink(_src: &Path, _dst: &Path) -> Result<()> {
    Err(Error::UnsupportedLinkType(LinkType::Reflink))
}

/// hardlink `dst` to the object at `src`
pub fn hardlink(src: &Path, dst: &Path) -> Result<()> {
    fs::hard_link(src, dst).map_err(|e| link_error(LinkType::Hardlink, dst, e))
}

/// symlink `dst` pointing at the object at `src`
pub fn symlink_to(src: &Path, dst: &Path) -> Result<()> {
    symlink(src, dst).map_err(|e| link_error(LinkType::Symlink, dst, e))
}

/// full byte copy of `src` to `dst`
pub fn copy(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).with_path(dst)?;
    Ok(())
}

/// set the mode of a freshly created (not shared) file
pub fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    let mode = mode.unwrap_or(DEFAULT_FILE_MODE) & 0o7777;
    fs::set_permissions(path, Permissions::from_mode(mode)).with_path(path)
}

/// remembered link capabilities
///
/// probing a strategy needs a real syscall, so the first attempt for a
/// (source device, destination device, link type) triple decides for all
/// later files on that pair.
#[derive(Debug, Default)]
pub struct LinkCache {
    known: Mutex<HashMap<(u64, u64, LinkType), bool>>,
    disabled: HashSet<LinkType>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// treat a strategy as unsupported everywhere, without probing
    pub fn disable(&mut self, link: LinkType) {
        self.disabled.insert(link);
    }

    /// Some(bool) when the answer is already known
    pub fn lookup(&self, src_dev: u64, dst_dev: u64, link: LinkType) -> Option<bool> {
        if self.disabled.contains(&link) {
            return Some(false);
        }
        // links never cross filesystems
        if src_dev != dst_dev && matches!(link, LinkType::Reflink | LinkType::Hardlink) {
            return Some(false);
        }
        self.known.lock().get(&(src_dev, dst_dev, link)).copied()
    }

    pub fn record(&self, src_dev: u64, dst_dev: u64, link: LinkType, supported: bool) {
        let mut known = self.known.lock();
        let previous = known.insert((src_dev, dst_dev, link), supported);
        if previous.is_none() {
            tracing::debug!(%link, src_dev, dst_dev, supported, "link capability probed");
        }
    }

    /// number of (device pair, link type) probes remembered
    pub fn probed(&self) -> usize {
        self.known.lock().len()
    }
}

/// device id of the filesystem holding `path`
pub fn device_of(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path).with_path(path)?.dev())
}
