//! Resolve-once reverse DNS cache.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tracing::debug;

use crate::locks;

pub trait ReverseLookup: Send + Sync + 'static {
    /// `None` or an empty name means "no result".
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// The system resolver (getnameinfo).
pub struct SystemResolver;

impl ReverseLookup for SystemResolver {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        dns_lookup::lookup_addr(&ip).ok()
    }
}

pub struct HostnameCache {
    backend: Option<Arc<dyn ReverseLookup>>,
    names: Arc<RwLock<HashMap<IpAddr, String>>>,
}

impl HostnameCache {
    pub fn new(backend: Arc<dyn ReverseLookup>) -> Self {
        Self {
            backend: Some(backend),
            names: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Never resolves; every address is reported as itself.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            names: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cached hostname, or the address text while a lookup is pending or
    /// after it failed. The first call for an address dispatches exactly one
    /// background lookup.
    pub fn resolve(&self, ip: IpAddr) -> String {
        let Some(backend) = &self.backend else {
            return ip.to_string();
        };
        if let Some(name) = locks::read(&self.names).get(&ip) {
            return name.clone();
        }

        let placeholder = ip.to_string();
        // Nothing is cached without a runtime so a later caller can dispatch.
        let Ok(handle) = Handle::try_current() else {
            debug!(%ip, "No runtime available, deferring reverse lookup.");
            return placeholder;
        };
        {
            let mut names = locks::write(&self.names);
            // Double-check after acquiring write lock
            if let Some(name) = names.get(&ip) {
                return name.clone();
            }
            names.insert(ip, placeholder.clone());
        }

        let backend = backend.clone();
        let names = self.names.clone();
        handle.spawn_blocking(move || {
            let Some(name) = backend.lookup(ip) else {
                return;
            };
            let name = name.trim_end_matches('.');
            if name.is_empty() {
                return;
            }
            locks::write(&names).insert(ip, name.to_string());
        });
        placeholder
    }

    pub fn len(&self) -> usize {
        locks::read(&self.names).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
