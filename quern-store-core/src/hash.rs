//! Multi-algorithm content hashing.
//!
//! SHA-1 and SHA-256 are backed by `ring`; MD5 (still accepted for the hash
//! declarations of fixed-output derivations) by the `md5` crate, which keeps
//! the same init-update-finish shape.

use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use ring::digest;
use thiserror::Error;

/// Largest digest size we ever store (SHA-256).
const MAX_HASH_SIZE: usize = 32;

/// A supported digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
}

impl Algorithm {
    /// Digest size in bytes.
    pub const fn size(&self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Sha1 => 20,
            Algorithm::Sha256 => 32,
        }
    }

    fn digest_algorithm(&self) -> &'static digest::Algorithm {
        match self {
            Algorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Algorithm::Sha256 => &digest::SHA256,
            Algorithm::Md5 => unreachable!("md5 does not go through ring"),
        }
    }

    /// One-shot digest of `data`.
    pub fn digest<D: AsRef<[u8]>>(&self, data: D) -> Hash {
        let mut ctx = Context::new(*self);
        ctx.update(data);
        ctx.finish()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[error("unknown hash algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Algorithm::Md5),
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            other => Err(UnknownAlgorithm(other.into())),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseHashError {
    #[error("hash '{0}' is not valid hex")]
    InvalidHex(String),
    #[error("hash has wrong length {length} for algorithm '{algorithm}'")]
    WrongLength { algorithm: Algorithm, length: usize },
}

/// A digest value together with the algorithm that produced it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    algorithm: Algorithm,
    data: [u8; MAX_HASH_SIZE],
}

impl Hash {
    pub fn from_slice(algorithm: Algorithm, bytes: &[u8]) -> Result<Hash, ParseHashError> {
        if bytes.len() != algorithm.size() {
            return Err(ParseHashError::WrongLength {
                algorithm,
                length: bytes.len(),
            });
        }
        let mut data = [0u8; MAX_HASH_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Hash { algorithm, data })
    }

    /// Parse a bare hex digest of `algorithm`.
    pub fn parse_hex(algorithm: Algorithm, hex: &str) -> Result<Hash, ParseHashError> {
        let bytes = HEXLOWER
            .decode(hex.to_ascii_lowercase().as_bytes())
            .map_err(|_| ParseHashError::InvalidHex(hex.into()))?;
        Hash::from_slice(algorithm, &bytes)
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.data[..self.algorithm.size()]
    }

    /// Lowercase hex rendering, the encoding stored in the database.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(self.digest_bytes())
    }

    /// XOR-fold the digest down to `new_size` bytes.  Store path digests are
    /// the 20-byte compression of a SHA-256; the result is only ever
    /// rendered, so it stays a plain byte vector.
    pub fn compress(&self, new_size: usize) -> Vec<u8> {
        let mut out = vec![0u8; new_size];
        for (i, b) in self.digest_bytes().iter().enumerate() {
            out[i % new_size] ^= b;
        }
        out
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

enum InnerContext {
    Md5(md5::Context),
    Ring(digest::Context),
}

/// A context for multi-step (init-update-finish) digest calculation.
pub struct Context(Algorithm, InnerContext);

impl Context {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Md5 => Context(algorithm, InnerContext::Md5(md5::Context::new())),
            _ => Context(
                algorithm,
                InnerContext::Ring(digest::Context::new(algorithm.digest_algorithm())),
            ),
        }
    }

    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        let data = data.as_ref();
        match &mut self.1 {
            InnerContext::Md5(ctx) => ctx.consume(data),
            InnerContext::Ring(ctx) => ctx.update(data),
        }
    }

    pub fn finish(self) -> Hash {
        match self.1 {
            InnerContext::Md5(ctx) => {
                Hash::from_slice(self.0, ctx.compute().as_ref()).expect("md5 digest size")
            }
            InnerContext::Ring(ctx) => {
                Hash::from_slice(self.0, ctx.finish().as_ref()).expect("ring digest size")
            }
        }
    }
}

/// Hash a byte string.
pub fn hash_string<D: AsRef<[u8]>>(algorithm: Algorithm, data: D) -> Hash {
    algorithm.digest(data)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    /// Values taken from RFC 1321 / RFC 3174 / RFC 4634.
    #[rstest]
    #[case::md5(Algorithm::Md5, "abc", "900150983cd24fb0d6963f7d28e17f72")]
    #[case::sha1(Algorithm::Sha1, "abc", "a9993e364706816aba3e25717850c26c9cd0d89d")]
    #[case::sha256(
        Algorithm::Sha256,
        "abc",
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    )]
    #[case::sha256_empty(
        Algorithm::Sha256,
        "",
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    )]
    fn test_digest(#[case] algorithm: Algorithm, #[case] input: &str, #[case] expected: &str) {
        assert_eq!(algorithm.digest(input).to_hex(), expected);
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = Algorithm::Sha256.digest("hello, world");
        let parsed = Hash::parse_hex(Algorithm::Sha256, &h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let one_shot = Algorithm::Sha256.digest("hello, world");
        let mut ctx = Context::new(Algorithm::Sha256);
        ctx.update("hello");
        ctx.update(", ");
        ctx.update("world");
        assert_eq!(one_shot, ctx.finish());
    }

    #[test]
    fn test_compress_to_20_bytes() {
        let full = Algorithm::Sha256.digest("abc");
        let folded = full.compress(20);
        assert_eq!(folded.len(), 20);
        let bytes = full.digest_bytes();
        assert_eq!(folded[0], bytes[0] ^ bytes[20]);
        assert_eq!(folded[19], bytes[19] ^ bytes[31]);
    }

    #[test]
    fn test_unknown_algorithm() {
        assert_eq!(
            "blake3".parse::<Algorithm>(),
            Err(UnknownAlgorithm("blake3".into()))
        );
    }
}
