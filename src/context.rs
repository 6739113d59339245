use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::block::ServerAddress;
use crate::cluster::Cluster;
use crate::config::{Config, InvalidConfig};

/// Client-wide state shared by every file handle: configuration, the
/// cluster collaborator, the address-locality cache and the permit pool
/// bounding concurrent hedged attempts.
#[derive(Debug)]
pub struct ClientContext<C> {
    pub config: Config,
    cluster: C,
    local_addrs: LocalAddressCache,
    hedge_permits: Semaphore,
}

impl<C: Cluster> ClientContext<C> {
    pub fn new(config: Config, cluster: C) -> Result<Self, InvalidConfig> {
        config.validate()?;
        let hedge_permits = Semaphore::new(config.hedged_read_limit.get());
        Ok(Self {
            config,
            cluster,
            local_addrs: LocalAddressCache::new(),
            hedge_permits,
        })
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub fn is_local_address(&self, addr: &ServerAddress) -> bool {
        self.local_addrs.is_local(addr)
    }

    pub(crate) async fn hedge_permit(&self) -> SemaphorePermit<'_> {
        self.hedge_permits
            .acquire()
            .await
            .expect("semaphore is never closed")
    }
}

/// Memo of which server hosts are local to this client. Owned by the
/// context (not process-global) so tests can construct isolated instances;
/// used only for statistics categorization.
#[derive(Debug)]
struct LocalAddressCache {
    hostname: Option<String>,
    known: RwLock<HashMap<String, bool>>,
}

impl LocalAddressCache {
    fn new() -> Self {
        Self {
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            known: RwLock::new(HashMap::new()),
        }
    }

    fn is_local(&self, addr: &ServerAddress) -> bool {
        if let Some(&known) = self.known.read().get(&addr.host) {
            return known;
        }
        let local = addr.host == "localhost"
            || addr.host == "127.0.0.1"
            || addr.host == "::1"
            || Some(addr.host.as_str()) == self.hostname.as_deref();
        self.known.write().insert(addr.host.clone(), local);
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_local() {
        let cache = LocalAddressCache::new();
        let addr = ServerAddress {
            host: "127.0.0.1".to_owned(),
            port: 9000,
        };
        assert!(cache.is_local(&addr));
        // Second lookup hits the memo.
        assert!(cache.is_local(&addr));
    }

    #[test]
    fn remote_host_is_not_local() {
        let cache = LocalAddressCache::new();
        let addr = ServerAddress {
            host: "definitely-not-this-host.example".to_owned(),
            port: 9000,
        };
        assert!(!cache.is_local(&addr));
    }
}
