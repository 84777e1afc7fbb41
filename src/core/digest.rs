//! Digest sets: several hash algorithms computed over one byte stream.
//!
//! A [`DigestSet`] is created per file, fed every chunk exactly once with
//! [`DigestSet::absorb`], and consumed by [`DigestSet::finalize`]. The source
//! is never re-read per algorithm.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported digest algorithms
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Blake3,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha256,
        Self::Sha512,
        Self::Blake3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    fn hasher(&self) -> Box<dyn StreamHasher> {
        match self {
            Self::Md5 => Box::new(Md5Hasher(md5::Context::new())),
            Self::Sha1 => Box::new(RustCryptoHasher(<sha1::Sha1 as sha1::Digest>::new())),
            Self::Sha256 => Box::new(RustCryptoHasher(<sha2::Sha256 as sha2::Digest>::new())),
            Self::Sha512 => Box::new(RustCryptoHasher(<sha2::Sha512 as sha2::Digest>::new())),
            Self::Blake3 => Box::new(Blake3Hasher(blake3::Hasher::new())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown digest algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Finalized digests of one stream, keyed by algorithm, as lowercase hex.
pub type Digests = BTreeMap<Algorithm, String>;

trait StreamHasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> String;
}

struct Md5Hasher(md5::Context);

impl StreamHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    fn finalize(self: Box<Self>) -> String {
        format!("{:x}", self.0.compute())
    }
}

/// Any RustCrypto hasher (sha1, sha2 family)
struct RustCryptoHasher<D>(D);

impl<D> StreamHasher for RustCryptoHasher<D>
where
    D: sha2::Digest + Send,
    sha2::digest::Output<D>: fmt::LowerHex,
{
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> String {
        format!("{:x}", sha2::Digest::finalize(self.0))
    }
}

struct Blake3Hasher(blake3::Hasher);

impl StreamHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// A group of hashers fed from a single read of the data.
pub struct DigestSet {
    hashers: Vec<(Algorithm, Box<dyn StreamHasher>)>,
    absorbed: u64,
}

impl DigestSet {
    pub fn new(algorithms: &[Algorithm]) -> Self {
        let mut hashers: Vec<(Algorithm, Box<dyn StreamHasher>)> = Vec::new();
        for algo in algorithms {
            if !hashers.iter().any(|(a, _)| a == algo) {
                hashers.push((*algo, algo.hasher()));
            }
        }
        Self {
            hashers,
            absorbed: 0,
        }
    }

    /// Feed one chunk to every hasher.
    pub fn absorb(&mut self, chunk: &[u8]) {
        for (_, hasher) in &mut self.hashers {
            hasher.update(chunk);
        }
        self.absorbed += chunk.len() as u64;
    }

    /// Total bytes absorbed so far.
    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }

    pub fn finalize(self) -> Digests {
        self.hashers
            .into_iter()
            .map(|(algo, hasher)| (algo, hasher.finalize()))
            .collect()
    }
}

/// Digests of an in-memory buffer, mostly useful for tests and small records.
pub fn digest_bytes(algorithms: &[Algorithm], data: &[u8]) -> Digests {
    let mut set = DigestSet::new(algorithms);
    set.absorb(data);
    set.finalize()
}
