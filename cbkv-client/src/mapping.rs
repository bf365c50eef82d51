//! # Key Routing
//!
//! Maps a key to the vBucket that owns it and the node currently serving
//! that vBucket. Topology discovery is out of scope: a `VBucketMap` is
//! built from an already-resolved server list and ownership table.

use cbkv_common::VBucketId;

use crate::error::{ClientError, ClientResult};

/// Default number of vBuckets in a bucket.
pub const DEFAULT_VBUCKET_COUNT: usize = 1024;

/// Where an operation must be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// Index into the client's node list.
    pub node: usize,
    /// Shard carried in the request header.
    pub vbucket: VBucketId,
}

/// key -> (node, shard) contract.
pub trait KeyMapper: Send + Sync {
    /// Resolves the route for `key`.
    fn route(&self, key: &[u8]) -> ClientResult<Route>;

    /// Server addresses, indexed by `Route::node`.
    fn servers(&self) -> &[String];
}

/// CRC32-based vBucket map.
#[derive(Debug, Clone)]
pub struct VBucketMap {
    servers: Vec<String>,
    owners: Vec<usize>,
}

impl VBucketMap {
    /// Builds a map from an explicit ownership table (`owners[vb]` = server
    /// index).
    ///
    /// # Errors
    /// `Routing` when there are no servers, no vBuckets, more than 65536
    /// vBuckets, or an owner index out of range.
    pub fn new(servers: Vec<String>, owners: Vec<usize>) -> ClientResult<Self> {
        if servers.is_empty() {
            return Err(ClientError::Routing("server list is empty".into()));
        }
        if owners.is_empty() || owners.len() > u16::MAX as usize + 1 {
            return Err(ClientError::Routing(format!(
                "vbucket count {} out of range",
                owners.len()
            )));
        }
        if let Some(bad) = owners.iter().find(|owner| **owner >= servers.len()) {
            return Err(ClientError::Routing(format!("owner index {bad} has no server")));
        }
        Ok(VBucketMap { servers, owners })
    }

    /// Spreads `vbucket_count` vBuckets round-robin over `servers`.
    pub fn uniform(servers: Vec<String>, vbucket_count: usize) -> ClientResult<Self> {
        let count = servers.len().max(1);
        let owners = (0..vbucket_count).map(|vb| vb % count).collect();
        Self::new(servers, owners)
    }

    /// vBucket for `key`: `((crc32(key) >> 16) & 0x7fff) % count`.
    pub fn vbucket_for(&self, key: &[u8]) -> VBucketId {
        let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
        VBucketId((hash as usize % self.owners.len()) as u16)
    }

    /// Number of vBuckets.
    pub fn vbucket_count(&self) -> usize {
        self.owners.len()
    }
}

impl KeyMapper for VBucketMap {
    fn route(&self, key: &[u8]) -> ClientResult<Route> {
        let vbucket = self.vbucket_for(key);
        Ok(Route {
            node: self.owners[vbucket.get() as usize],
            vbucket,
        })
    }

    fn servers(&self) -> &[String] {
        &self.servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{i}:11210")).collect()
    }

    #[test]
    fn test_route_is_stable_and_in_range() {
        let map = VBucketMap::uniform(servers(3), 64).unwrap();
        let first = map.route(b"user::42").unwrap();
        let second = map.route(b"user::42").unwrap();
        assert_eq!(first, second);
        assert!((first.vbucket.get() as usize) < 64);
        assert_eq!(first.node, first.vbucket.get() as usize % 3);
    }

    #[test]
    fn test_vbucket_uses_crc32_high_bits() {
        let map = VBucketMap::uniform(servers(1), 1024).unwrap();
        let expected = ((crc32fast::hash(b"hello") >> 16) & 0x7fff) as usize % 1024;
        assert_eq!(map.vbucket_for(b"hello").get() as usize, expected);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(VBucketMap::new(Vec::new(), vec![0]).is_err());
        assert!(VBucketMap::new(servers(1), Vec::new()).is_err());
        assert!(VBucketMap::new(servers(2), vec![0, 2]).is_err());
    }
}
