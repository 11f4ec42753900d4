//! Paged-results continuation cookies.

use serde::{Deserialize, Serialize};

/// Where a cookie's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieOrigin {
    /// Issued by the server on a previous page; must be returned unmodified.
    Server,
    /// Built by the client to jump straight to a rank.
    Client,
}

/// An opaque continuation cookie.
///
/// The bytes are never interpreted or mutated by the paging logic. A cookie
/// carries its origin so server-issued and client-synthesized values cannot
/// be confused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    origin: CookieOrigin,
    bytes: Vec<u8>,
}

impl Cookie {
    pub fn from_server(bytes: Vec<u8>) -> Self {
        Self {
            origin: CookieOrigin::Server,
            bytes,
        }
    }

    /// A client-synthesized cookie asking the server to start at `rank`,
    /// encoded as the minimal big-endian representation of the rank.
    /// Rank 0 encodes as a single zero byte.
    pub fn seek(rank: u64) -> Self {
        let be = rank.to_be_bytes();
        let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
        Self {
            origin: CookieOrigin::Client,
            bytes: be[first..].to_vec(),
        }
    }

    pub fn origin(&self) -> CookieOrigin {
        self.origin
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// An empty server cookie signals the end of a paged result set.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The rank a client-synthesized cookie seeks to. Server cookies are
    /// opaque and always return `None`.
    pub fn seek_rank(&self) -> Option<u64> {
        if self.origin != CookieOrigin::Client || self.bytes.is_empty() || self.bytes.len() > 8 {
            return None;
        }
        Some(self.bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_encoding_is_minimal_big_endian() {
        assert_eq!(Cookie::seek(0).as_bytes(), &[0x00]);
        assert_eq!(Cookie::seek(5).as_bytes(), &[0x05]);
        assert_eq!(Cookie::seek(128).as_bytes(), &[0x80]);
        assert_eq!(Cookie::seek(256).as_bytes(), &[0x01, 0x00]);
        assert_eq!(Cookie::seek(0x0102_0304).as_bytes(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(Cookie::seek(u64::MAX).as_bytes().len(), 8);
    }

    #[test]
    fn test_seek_rank_only_for_client_cookies() {
        assert_eq!(Cookie::seek(990).seek_rank(), Some(990));
        assert_eq!(Cookie::seek(0).seek_rank(), Some(0));
        assert_eq!(Cookie::from_server(vec![0x03, 0xde]).seek_rank(), None);
    }

    #[test]
    fn test_origin_is_preserved() {
        assert_eq!(Cookie::seek(1).origin(), CookieOrigin::Client);
        let server = Cookie::from_server(vec![9, 9, 9]);
        assert_eq!(server.origin(), CookieOrigin::Server);
        assert_eq!(server.as_bytes(), &[9, 9, 9]);
        assert!(Cookie::from_server(Vec::new()).is_empty());
    }
}
