//! Replica selection and per-handle quarantine of failed servers.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::block::{LocatedBlock, ServerAddress, ServerCandidate};

/// Servers recently observed to fail for one file handle. Pure bookkeeping,
/// shared by all reads on the handle; cleared wholesale when a metadata
/// refresh gives quarantined servers another chance.
#[derive(Debug, Default)]
pub(crate) struct DeadServerTracker {
    dead: RwLock<HashSet<ServerAddress>>,
}

impl DeadServerTracker {
    pub(crate) fn mark_dead(&self, addr: &ServerAddress) {
        if self.dead.write().insert(addr.clone()) {
            tracing::debug!(server = %addr, "quarantined server");
        }
    }

    pub(crate) fn is_dead(&self, addr: &ServerAddress) -> bool {
        self.dead.read().contains(addr)
    }

    pub(crate) fn remove(&self, addr: &ServerAddress) {
        self.dead.write().remove(addr);
    }

    pub(crate) fn clear_all(&self) {
        let mut dead = self.dead.write();
        if !dead.is_empty() {
            tracing::debug!(count = dead.len(), "clearing server quarantine");
            dead.clear();
        }
    }
}

/// Pick the next server to try for `record`: the first candidate, in
/// metadata-assigned priority order, that is neither quarantined nor in the
/// caller's ignore set. `None` means the known candidates are exhausted; the
/// caller escalates to its refresh-and-retry policy rather than failing.
pub(crate) fn choose_server(
    record: &LocatedBlock,
    dead: &DeadServerTracker,
    ignore: &HashSet<ServerAddress>,
) -> Option<ServerCandidate> {
    record
        .servers
        .iter()
        .find(|c| !dead.is_dead(&c.addr) && !ignore.contains(&c.addr))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{AccessToken, BlockId, StorageClass};

    fn record(servers: &[&str]) -> LocatedBlock {
        LocatedBlock {
            block: BlockId {
                id: 1,
                generation: 1,
            },
            offset: 0,
            len: 100,
            servers: servers
                .iter()
                .map(|host| ServerCandidate {
                    addr: ServerAddress {
                        host: (*host).to_owned(),
                        port: 9000,
                    },
                    storage: StorageClass::Disk,
                    identity: format!("id-{host}"),
                })
                .collect(),
            token: AccessToken::default(),
            complete: true,
            erasure_coded: false,
        }
    }

    fn addr(host: &str) -> ServerAddress {
        ServerAddress {
            host: host.to_owned(),
            port: 9000,
        }
    }

    #[test]
    fn chooses_in_priority_order() {
        let record = record(&["a", "b", "c"]);
        let dead = DeadServerTracker::default();
        let chosen = choose_server(&record, &dead, &HashSet::new()).unwrap();
        assert_eq!(chosen.addr, addr("a"));
    }

    #[test]
    fn dead_servers_are_skipped_until_cleared() {
        let record = record(&["a", "b"]);
        let dead = DeadServerTracker::default();
        dead.mark_dead(&addr("a"));
        let chosen = choose_server(&record, &dead, &HashSet::new()).unwrap();
        assert_eq!(chosen.addr, addr("b"));

        dead.mark_dead(&addr("b"));
        assert!(choose_server(&record, &dead, &HashSet::new()).is_none());

        dead.clear_all();
        let chosen = choose_server(&record, &dead, &HashSet::new()).unwrap();
        assert_eq!(chosen.addr, addr("a"));
    }

    #[test]
    fn ignore_set_is_honored() {
        let record = record(&["a", "b"]);
        let dead = DeadServerTracker::default();
        let ignore = HashSet::from([addr("a")]);
        let chosen = choose_server(&record, &dead, &ignore).unwrap();
        assert_eq!(chosen.addr, addr("b"));
    }
}
