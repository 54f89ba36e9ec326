//! Digest & algorithm registry (C1): compute and parse content digests
//! for the three algorithms this client accepts, without ever buffering
//! a whole blob to compute one.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha384, Sha512};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed digest: {0}")]
    BadFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Hex-encoded output width for this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// The default algorithm when none is specified by the caller.
pub const DEFAULT_ALGORITHM: Algorithm = Algorithm::Sha256;

/// `(algorithm, hex)`, serialized as `"<alg>:<hex>"`. Value-typed;
/// equality is byte-equality of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// `blobs/<alg>/<hex>` path fragment used by the OCI Image Layout.
    pub fn layout_path(&self) -> String {
        format!("{}/{}", self.algorithm.as_str(), self.hex)
    }

    /// `<alg>-<hex>`, the tag form used by the referrers tag-schema fallback.
    pub fn as_tag(&self) -> String {
        format!("{}-{}", self.algorithm.as_str(), self.hex)
    }

    fn new_unchecked(algorithm: Algorithm, hex: String) -> Self {
        Digest { algorithm, hex }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::BadFormat(s.to_string()))?;
        let algorithm: Algorithm = alg.parse()?;
        if hex.is_empty() || hex.len() != algorithm.hex_len() || !hex.bytes().all(is_lower_hex) {
            return Err(Error::BadFormat(s.to_string()));
        }
        Ok(Digest::new_unchecked(algorithm, hex.to_string()))
    }
}

impl TryFrom<&str> for Digest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Digest bytes already in memory using the default algorithm.
pub fn digest(bytes: impl AsRef<[u8]>) -> Digest {
    digest_with(DEFAULT_ALGORITHM, bytes)
}

pub fn digest_with(algorithm: Algorithm, bytes: impl AsRef<[u8]>) -> Digest {
    let hex = match algorithm {
        Algorithm::Sha256 => hex::encode(Sha256::digest(bytes.as_ref())),
        Algorithm::Sha384 => hex::encode(Sha384::digest(bytes.as_ref())),
        Algorithm::Sha512 => hex::encode(Sha512::digest(bytes.as_ref())),
    };
    Digest::new_unchecked(algorithm, hex)
}

/// Digest a stream incrementally, never buffering the whole thing.
pub fn digest_reader(algorithm: Algorithm, mut reader: impl Read) -> std::io::Result<Digest> {
    let mut buf = [0u8; 64 * 1024];
    macro_rules! hash_with {
        ($hasher:ty) => {{
            let mut hasher = <$hasher>::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }};
    }
    let hex = match algorithm {
        Algorithm::Sha256 => hash_with!(Sha256),
        Algorithm::Sha384 => hash_with!(Sha384),
        Algorithm::Sha512 => hash_with!(Sha512),
    };
    Ok(Digest::new_unchecked(algorithm, hex))
}

pub fn digest_path(path: impl AsRef<Path>) -> std::io::Result<Digest> {
    digest_path_with(DEFAULT_ALGORITHM, path)
}

pub fn digest_path_with(algorithm: Algorithm, path: impl AsRef<Path>) -> std::io::Result<Digest> {
    let file = std::fs::File::open(path)?;
    digest_reader(algorithm, std::io::BufReader::new(file))
}

/// An incremental hasher for callers that need to hash as bytes stream
/// through them (e.g. while simultaneously writing to disk).
pub enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(h) => Digest::new_unchecked(Algorithm::Sha256, hex::encode(h.finalize())),
            Hasher::Sha384(h) => Digest::new_unchecked(Algorithm::Sha384, hex::encode(h.finalize())),
            Hasher::Sha512(h) => Digest::new_unchecked(Algorithm::Sha512, hex::encode(h.finalize())),
        }
    }
}

impl TryFrom<&Digest> for oci_spec::image::Digest {
    type Error = Error;
    fn try_from(d: &Digest) -> Result<Self, Self::Error> {
        d.to_string()
            .parse()
            .map_err(|_| Error::BadFormat(d.to_string()))
    }
}

impl TryFrom<&oci_spec::image::Digest> for Digest {
    type Error = Error;
    fn try_from(d: &oci_spec::image::Digest) -> Result<Self, Self::Error> {
        d.to_string().parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_bytes() {
        // S2: pushing b"hello" yields this sha256 digest.
        let d = digest("hello");
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(
            d.to_string(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let s = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let d: Digest = s.parse().unwrap();
        assert_eq!(d.to_string(), s);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!("sha256:abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn test_parse_rejects_unsupported_algorithm() {
        assert!(matches!(
            "md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Digest>(),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_sha384_sha512_lengths() {
        let d384 = digest_with(Algorithm::Sha384, "abc");
        assert_eq!(d384.hex().len(), 96);
        let d512 = digest_with(Algorithm::Sha512, "abc");
        assert_eq!(d512.hex().len(), 128);
    }

    #[test]
    fn test_hasher_matches_oneshot() {
        let mut hasher = Hasher::new(Algorithm::Sha256);
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(hasher.finalize(), digest("hello"));
    }
}
