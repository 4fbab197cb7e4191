//! Self-describing integrity digests (`<algo>-<base64>`, ssri-style).

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::cache::CacheError;

/// Digest algorithms understood by the cache, weakest first so the derived
/// ordering picks the strongest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

impl FromStr for Algorithm {
    type Err = CacheError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(CacheError::UnknownAlgorithm(other.to_string())),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Self::Sha256(Sha256::new()),
            Algorithm::Sha384 => Self::Sha384(Sha384::new()),
            Algorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Sha384(hasher) => hasher.update(bytes),
            Self::Sha512(hasher) => hasher.update(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha256(hasher) => BASE64_STANDARD.encode(hasher.finalize()),
            Self::Sha384(hasher) => BASE64_STANDARD.encode(hasher.finalize()),
            Self::Sha512(hasher) => BASE64_STANDARD.encode(hasher.finalize()),
        }
    }
}

/// One `<algo>-<base64>` component of an integrity string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digest {
    pub algorithm: Algorithm,
    pub digest: String,
    options: Option<String>,
}

/// A parsed integrity string: one or more digests describing the same blob.
///
/// The digest with the strongest algorithm is the blob's canonical identity
/// and drives content-store path derivation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Integrity {
    digests: Vec<Digest>,
}

impl Integrity {
    /// Digest `data` with `algorithm`.
    #[must_use]
    pub fn from_data(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        Self {
            digests: vec![Digest {
                algorithm,
                digest: hasher.finish(),
                options: None,
            }],
        }
    }

    /// Reconstruct an integrity value from the hex form used in content
    /// paths.
    pub fn from_hex(algorithm: Algorithm, hex_digest: &str) -> Result<Self> {
        let raw = hex::decode(hex_digest).map_err(|_| {
            CacheError::InvalidIntegrity(format!("{}-{hex_digest}", algorithm.as_str()))
        })?;
        Ok(Self {
            digests: vec![Digest {
                algorithm,
                digest: BASE64_STANDARD.encode(raw),
                options: None,
            }],
        })
    }

    /// The digest whose algorithm is canonical for this value.
    #[must_use]
    pub fn strongest(&self) -> &Digest {
        self.digests
            .iter()
            .max_by_key(|digest| digest.algorithm)
            .expect("integrity holds at least one digest")
    }

    /// Algorithm and hex form of the strongest digest, used for path
    /// derivation.
    pub fn hex(&self) -> Result<(Algorithm, String)> {
        let strongest = self.strongest();
        let raw = BASE64_STANDARD
            .decode(strongest.digest.as_bytes())
            .map_err(|_| CacheError::InvalidIntegrity(self.to_string()))?;
        Ok((strongest.algorithm, hex::encode(raw)))
    }

    /// Stream `reader` through the strongest algorithm and compare.
    /// `Ok(true)` means the content matches, `Ok(false)` a mismatch; read
    /// errors propagate.
    pub fn check_reader(&self, mut reader: impl Read) -> Result<bool> {
        let strongest = self.strongest();
        let mut hasher = Hasher::new(strongest.algorithm);
        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = reader
                .read(&mut buf)
                .context("failed to stream content for integrity check")?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finish() == strongest.digest)
    }
}

impl FromStr for Integrity {
    type Err = CacheError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let mut digests = Vec::new();
        for part in value.split_whitespace() {
            let (algo, rest) = part
                .split_once('-')
                .ok_or_else(|| CacheError::InvalidIntegrity(value.to_string()))?;
            let algorithm = algo.parse::<Algorithm>()?;
            let (digest, options) = match rest.split_once('?') {
                Some((digest, options)) => (digest, Some(options.to_string())),
                None => (rest, None),
            };
            if digest.is_empty() {
                return Err(CacheError::InvalidIntegrity(value.to_string()));
            }
            digests.push(Digest {
                algorithm,
                digest: digest.to_string(),
                options,
            });
        }
        if digests.is_empty() {
            return Err(CacheError::InvalidIntegrity(value.to_string()));
        }
        Ok(Self { digests })
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, digest) in self.digests.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}-{}", digest.algorithm.as_str(), digest.digest)?;
            if let Some(options) = &digest.options {
                write!(f, "?{options}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders_round_trip() -> Result<()> {
        let raw = "sha512-z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg==";
        let integrity: Integrity = raw.parse()?;
        assert_eq!(integrity.to_string(), raw);
        Ok(())
    }

    #[test]
    fn keeps_option_suffixes() -> Result<()> {
        let raw = "sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=?priority=5";
        let integrity: Integrity = raw.parse()?;
        assert_eq!(integrity.to_string(), raw);
        Ok(())
    }

    #[test]
    fn strongest_digest_wins() -> Result<()> {
        let sha256 = Integrity::from_data(Algorithm::Sha256, b"data");
        let sha512 = Integrity::from_data(Algorithm::Sha512, b"data");
        let combined: Integrity = format!("{sha256} {sha512}").parse()?;
        assert_eq!(combined.strongest().algorithm, Algorithm::Sha512);
        assert_eq!(combined.strongest(), sha512.strongest());
        Ok(())
    }

    #[test]
    fn rejects_unknown_algorithms() {
        let err = "md5-AAAA".parse::<Integrity>().unwrap_err();
        assert!(matches!(err, CacheError::UnknownAlgorithm(name) if name == "md5"));
        assert!("".parse::<Integrity>().is_err());
        assert!("sha512".parse::<Integrity>().is_err());
    }

    #[test]
    fn checks_streams_against_the_strongest_digest() -> Result<()> {
        let integrity = Integrity::from_data(Algorithm::Sha512, b"foobarbaz");
        assert!(integrity.check_reader(&b"foobarbaz"[..])?);
        assert!(!integrity.check_reader(&b"foobarba"[..])?);
        Ok(())
    }

    #[test]
    fn hex_round_trips_through_from_hex() -> Result<()> {
        let integrity = Integrity::from_data(Algorithm::Sha384, b"blob");
        let (algorithm, hex_digest) = integrity.hex()?;
        assert_eq!(algorithm, Algorithm::Sha384);
        let rebuilt = Integrity::from_hex(algorithm, &hex_digest)?;
        assert_eq!(rebuilt, integrity);
        Ok(())
    }
}
