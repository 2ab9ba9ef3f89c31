use std::{fmt, marker::PhantomData, str::FromStr};

use data_encoding::HEXLOWER;
use thiserror::Error;

/// The longest hex digest any supported algorithm produces (sha512).
pub const MAX_HEX_DIGEST_LEN: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid {algorithm} digest: {digest}")]
    InvalidDigest {
        algorithm: DigestAlgorithm,
        digest: String,
    },

    #[error("hex digest needs {needed} bytes, only {available} available")]
    BufferTooSmall { needed: usize, available: usize },
}

/// The digest algorithms a manifest can be built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
    Md5,
    Blake3,
}

impl DigestAlgorithm {
    /// Length of the raw digest, in bytes.
    pub const fn digest_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Blake3 => 32,
        }
    }

    /// Length of the lowercase hex representation.
    pub const fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    /// Returns a [Digester] computing digests with this algorithm.
    pub fn digester(self) -> Box<dyn Digester> {
        match self {
            DigestAlgorithm::Sha1 => Box::new(HashDigester::<sha1::Sha1>::new(self)),
            DigestAlgorithm::Sha256 => Box::new(HashDigester::<sha2::Sha256>::new(self)),
            DigestAlgorithm::Sha512 => Box::new(HashDigester::<sha2::Sha512>::new(self)),
            DigestAlgorithm::Md5 => Box::new(HashDigester::<md5::Md5>::new(self)),
            DigestAlgorithm::Blake3 => Box::new(HashDigester::<blake3::Hasher>::new(self)),
        }
    }

    /// Validates a hex digest for this algorithm and returns it lowercased.
    pub fn parse_hex_digest(&self, digest: &str) -> Result<String, Error> {
        let lowered = digest.to_ascii_lowercase();
        if lowered.len() != self.hex_len() || HEXLOWER.decode(lowered.as_bytes()).is_err() {
            return Err(Error::InvalidDigest {
                algorithm: *self,
                digest: digest.to_string(),
            });
        }
        Ok(lowered)
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(DigestAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(DigestAlgorithm::Sha512),
            "md5" => Ok(DigestAlgorithm::Md5),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            _ => Err(Error::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Blake3 => "blake3",
        })
    }
}

/// Computes and checks hex digests over byte buffers.
///
/// A [Digester] only exists for an available algorithm, obtaining one through
/// [DigestAlgorithm::digester] is its initialization.
pub trait Digester: Send + Sync {
    fn algorithm(&self) -> DigestAlgorithm;

    /// Writes the lowercase hex digest of `data` into the start of `out`,
    /// returning the written part.
    fn compute_into<'a>(&self, data: &[u8], out: &'a mut [u8]) -> Result<&'a [u8], Error>;

    fn hex_len(&self) -> usize {
        self.algorithm().hex_len()
    }

    /// Returns the lowercase hex digest of `data`.
    fn compute(&self, data: &[u8]) -> String {
        let mut out = [0u8; MAX_HEX_DIGEST_LEN];
        let hex = self
            .compute_into(data, &mut out)
            .expect("MAX_HEX_DIGEST_LEN fits every algorithm");
        // HEXLOWER only ever emits ASCII.
        String::from_utf8_lossy(hex).into_owned()
    }

    /// Checks `data` against `expected`, which must be the full-length hex
    /// digest. Shorter or longer digests never match.
    fn check(&self, data: &[u8], expected: &[u8]) -> bool {
        if expected.len() != self.hex_len() {
            return false;
        }
        let mut out = [0u8; MAX_HEX_DIGEST_LEN];
        match self.compute_into(data, &mut out) {
            Ok(computed) => computed == expected,
            Err(_) => false,
        }
    }
}

/// A [Digester] backed by any [digest::Digest] implementation.
pub struct HashDigester<D> {
    algorithm: DigestAlgorithm,
    _hasher: PhantomData<fn() -> D>,
}

impl<D> HashDigester<D>
where
    D: digest::Digest,
{
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        debug_assert_eq!(<D as digest::Digest>::output_size(), algorithm.digest_len());
        Self {
            algorithm,
            _hasher: PhantomData,
        }
    }
}

impl<D> Digester for HashDigester<D>
where
    D: digest::Digest,
{
    fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    fn compute_into<'a>(&self, data: &[u8], out: &'a mut [u8]) -> Result<&'a [u8], Error> {
        let needed = self.algorithm.hex_len();
        if out.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let digest = D::digest(data);
        let out = &mut out[..needed];
        HEXLOWER.encode_mut(&digest, out);
        Ok(out)
    }
}
