//! Content digests: parsing, incremental hashing and verification.
//!
//! A digest is written `algorithm:hex`, e.g.
//! `sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824`.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use sha2::{Digest as _, Sha256, Sha512};

/// Errors produced while parsing a digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// The text is not shaped like `algorithm:hex`, or the hex part does not
    /// fit the algorithm.
    #[error("invalid digest format: {0}")]
    InvalidFormat(String),

    /// The algorithm is well formed but not one this registry can verify.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Hash algorithms the registry can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the default for OCI content.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// The algorithm's name as used in the textual digest.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in an encoded hash.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start a new streaming hash.
    pub fn hasher(&self) -> Hasher {
        Hasher::new(*self)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `[a-z0-9]+([+._-][a-z0-9]+)*`
fn is_algorithm_component(s: &str) -> bool {
    !s.is_empty()
        && s.split(['+', '.', '_', '-']).all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        })
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other if is_algorithm_component(other) => {
                Err(DigestError::UnsupportedAlgorithm(other.to_owned()))
            }
            other => Err(DigestError::InvalidFormat(format!(
                "malformed algorithm {other:?}"
            ))),
        }
    }
}

/// An algorithm-tagged content hash.
///
/// Values are always valid: the hex part has exactly the length the algorithm
/// produces and is lowercase.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Build a digest from its parts, validating the hex encoding.
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() {
            return Err(DigestError::InvalidFormat(format!(
                "{algorithm} digest must have {} hex characters, got {}",
                algorithm.hex_len(),
                hex.len()
            )));
        }

        if !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidFormat(format!(
                "{algorithm} digest must be lowercase hex"
            )));
        }

        Ok(Self { algorithm, hex })
    }

    /// Hash `data` in one go.
    pub fn of(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finish()
    }

    /// The hash algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

/// Whether a computed digest matches the one a client claimed.
pub fn verify(claimed: &Digest, actual: &Digest) -> bool {
    claimed == actual
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::InvalidFormat(format!("missing ':' in {s:?}")))?;
        Digest::new(algorithm.parse()?, hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest").field(&format_args!("{self}")).finish()
    }
}

#[derive(Clone)]
enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Streaming hash accumulator.
///
/// Also usable as an [`tokio::io::AsyncWrite`] sink, so stored content can be
/// hashed by downloading it into the hasher.
#[derive(Clone)]
pub struct Hasher {
    state: HasherState,
    length: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm())
            .field("length", &self.length)
            .finish()
    }
}

impl Hasher {
    /// Start a new hash with `algorithm`.
    pub fn new(algorithm: Algorithm) -> Self {
        let state = match algorithm {
            Algorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            Algorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { state, length: 0 }
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> Algorithm {
        match self.state {
            HasherState::Sha256(_) => Algorithm::Sha256,
            HasherState::Sha512(_) => Algorithm::Sha512,
        }
    }

    /// Total bytes consumed so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether no bytes have been consumed yet.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
        self.length += data.len() as u64;
    }

    /// Finish hashing and produce the digest.
    pub fn finish(self) -> Digest {
        let (algorithm, hex) = match self.state {
            HasherState::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            HasherState::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

impl tokio::io::AsyncWrite for Hasher {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().update(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parse_canonical() {
        let digest: Digest = HELLO.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.hex().len(), 64);
        assert_eq!(digest.to_string(), HELLO);
    }

    #[test]
    fn parse_rejects_missing_separator() {
        let err = "sha256".parse::<Digest>().unwrap_err();
        assert!(matches!(err, DigestError::InvalidFormat(_)));
    }

    #[test]
    fn parse_rejects_unknown_algorithm() {
        let err = "md5:d41d8cd98f00b204e9800998ecf8427e"
            .parse::<Digest>()
            .unwrap_err();
        assert_eq!(err, DigestError::UnsupportedAlgorithm("md5".into()));

        let err = "tarsum.v1+sha256:abc".parse::<Digest>().unwrap_err();
        assert!(matches!(err, DigestError::UnsupportedAlgorithm(_)));

        let err = "SHA256:abc".parse::<Digest>().unwrap_err();
        assert!(matches!(err, DigestError::InvalidFormat(_)));
    }

    #[test]
    fn parse_rejects_bad_hex() {
        assert!("sha256:deadbeef".parse::<Digest>().is_err());
        assert!(HELLO.to_uppercase().replace("SHA256", "sha256").parse::<Digest>().is_err());
        let wrong_char = format!("sha256:{}", "g".repeat(64));
        assert!(wrong_char.parse::<Digest>().is_err());
        let sha512 = format!("sha512:{}", "a".repeat(64));
        assert!(sha512.parse::<Digest>().is_err());
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = Algorithm::Sha256.hasher();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(hasher.len(), 5);

        let streamed = hasher.finish();
        assert_eq!(streamed, Digest::of(Algorithm::Sha256, b"hello"));
        assert_eq!(streamed.to_string(), HELLO);
    }

    #[test]
    fn verify_is_structural() {
        let claimed: Digest = HELLO.parse().unwrap();
        assert!(verify(&claimed, &Digest::of(Algorithm::Sha256, b"hello")));
        assert!(!verify(&claimed, &Digest::of(Algorithm::Sha256, b"hello!")));
        assert!(!verify(&claimed, &Digest::of(Algorithm::Sha512, b"hello")));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let digest: Digest = HELLO.parse().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{HELLO}\""));

        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }

    #[tokio::test]
    async fn hasher_accepts_async_writes() {
        use tokio::io::AsyncWriteExt;

        let mut hasher = Algorithm::Sha256.hasher();
        hasher.write_all(b"hello").await.unwrap();
        hasher.shutdown().await.unwrap();
        assert_eq!(hasher.finish().to_string(), HELLO);
    }
}
