//! Geo/ASN enrichment contract.
//!
//! The lookup database itself is an external collaborator; this module only
//! defines what the tracker consumes and the shared read-through cache in
//! front of it.

use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::locks;

/// Geo + ASN information for a single address. Any field may be empty.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub country_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub as_org: String,
}

/// Implemented by whatever backs geo enrichment (e.g. an MMDB reader).
pub trait GeoLookup: Send + Sync {
    /// `None` means "unavailable" for this address; callers tolerate it.
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Caches every answer, including misses, so each address hits the backend once.
pub struct GeoCache {
    backend: Arc<dyn GeoLookup>,
    cache: RwLock<HashMap<IpAddr, Option<GeoInfo>>>,
}

impl GeoCache {
    pub fn new(backend: Arc<dyn GeoLookup>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::with_capacity(4096)),
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        if let Some(hit) = locks::read(&self.cache).get(&ip) {
            return hit.clone();
        }

        let mut cache = locks::write(&self.cache);
        // Double-check after acquiring write lock
        if let Some(hit) = cache.get(&ip) {
            return hit.clone();
        }
        let result = self.backend.lookup(ip);
        cache.insert(ip, result.clone());
        result
    }

    pub fn len(&self) -> usize {
        locks::read(&self.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
