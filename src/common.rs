use std::fmt;
use serde::{Deserialize, Serialize};
use sha2::Digest;

/// Opaque chunk handle, allocated by the master.
pub type ChunkId = u64;

/// Lease generation for a chunk. Strictly increasing per chunk at the master.
pub type Epoch = u64;

/// Primary-assigned position of a mutation within one lease epoch.
pub type SeqNo = u64;

/// Identity of a node. On a real network this is the node's `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> ServerId {
        ServerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        ServerId(s.to_string())
    }
}

/// Correlates a pushed payload with the commit that later consumes it.
///
/// Tokens are generated by the client, one per mutation attempt. The digest
/// covers the client identity, a per-client attempt counter and the payload,
/// so two attempts never share a token even when they carry the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteToken(pub [u8; 32]);

impl WriteToken {
    pub fn generate(client: &str, attempt: u64, data: &[u8]) -> WriteToken {
        let mut hasher = sha2::Sha256::new();
        hasher.update(client.as_bytes());
        hasher.update(attempt.to_be_bytes());
        hasher.update(data);
        let mut token = [0u8; 32];
        token.copy_from_slice(hasher.finalize().as_slice());
        WriteToken(token)
    }
}

impl fmt::Display for WriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are plenty to tell tokens apart in logs.
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_differ_per_attempt() {
        let a = WriteToken::generate("client-0", 1, b"hello");
        let b = WriteToken::generate("client-0", 2, b"hello");
        let c = WriteToken::generate("client-1", 1, b"hello");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, WriteToken::generate("client-0", 1, b"hello"));
    }

    #[test]
    fn token_display_is_short_hex() {
        let t = WriteToken([0xab; 32]);
        assert_eq!(t.to_string(), "abababababababab");
    }
}
