use std::cmp::Ordering;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// content hash algorithm, chosen by configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    /// name as it appears in config files
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// length of a digest in hex characters
    pub fn hex_len(&self) -> usize {
        64
    }

    /// fresh incremental hasher
    pub fn digester(&self) -> Box<dyn Digester> {
        match self {
            HashAlgorithm::Sha256 => Box::new(Sha256Digester(Sha256::new())),
            HashAlgorithm::Blake3 => Box::new(Blake3Digester(blake3::Hasher::new())),
        }
    }

    /// hash a byte slice
    pub fn digest(&self, data: &[u8]) -> String {
        let mut d = self.digester();
        d.update(data);
        d.finalize()
    }

    /// hash everything a reader yields
    pub fn digest_reader<R: Read + ?Sized>(&self, reader: &mut R) -> std::io::Result<String> {
        let mut d = self.digester();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            d.update(&buf[..n]);
        }
        Ok(d.finalize())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            _ => Err(Error::UnknownHashAlgorithm(s.to_string())),
        }
    }
}

/// incremental content hasher
pub trait Digester: Send {
    fn update(&mut self, data: &[u8]);

    /// consume the hasher, returning the lowercase hex digest
    fn finalize(self: Box<Self>) -> String;
}

struct Sha256Digester(Sha256);

impl Digester for Sha256Digester {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

struct Blake3Digester(blake3::Hasher);

impl Digester for Blake3Digester {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// identifies an object by content hash
///
/// equality, hashing and ordering only look at (algorithm, value);
/// `is_dir` says whether the object is a serialized tree.
#[derive(Clone, Serialize, Deserialize)]
pub struct HashInfo {
    pub algorithm: HashAlgorithm,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dir: bool,
}

impl HashInfo {
    /// hash of a plain file object
    pub fn file(algorithm: HashAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into(),
            is_dir: false,
        }
    }

    /// hash of a tree object
    pub fn dir(algorithm: HashAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into(),
            is_dir: true,
        }
    }

    /// parse and validate a hex digest
    pub fn parse(algorithm: HashAlgorithm, value: &str, is_dir: bool) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value.len() != algorithm.hex_len() || hex::decode(&value).is_err() {
            return Err(Error::InvalidHash(value));
        }
        Ok(Self {
            algorithm,
            value,
            is_dir,
        })
    }

    /// parse the `Display` form, where trees carry a `.dir` suffix
    pub fn parse_display(algorithm: HashAlgorithm, s: &str) -> Result<Self> {
        let s = s.trim();
        match s.strip_suffix(".dir") {
            Some(value) => Self::parse(algorithm, value, true),
            None => Self::parse(algorithm, s, false),
        }
    }

    /// split into (shard prefix, remainder) for object store addressing
    pub fn to_path_components(&self) -> (&str, &str) {
        self.value.split_at(2.min(self.value.len()))
    }

    /// short form for log messages
    pub fn short(&self) -> &str {
        &self.value[..12.min(self.value.len())]
    }
}

impl PartialEq for HashInfo {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.value == other.value
    }
}

impl Eq for HashInfo {}

impl std::hash::Hash for HashInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.algorithm.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for HashInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HashInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.algorithm, &self.value).cmp(&(other.algorithm, &other.value))
    }
}

impl fmt::Display for HashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dir {
            write!(f, "{}.dir", self.value)
        } else {
            f.write_str(&self.value)
        }
    }
}

impl fmt::Debug for HashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir { "dir" } else { "file" };
        write!(f, "HashInfo({}:{} {})", self.algorithm, self.short(), kind)
    }
}
