//! Persistent storage of bonded peer state.

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::gatt::Cache;
use crate::host::{Event, Host, Transport};
use crate::le::Peer;

/// Interface to peer data storage. Entries are keyed by the local identity
/// index and the peer identity address.
pub trait PeerStore: Debug + Send + Sync {
    type Value;

    /// Saves peer data. Returns `false` if the data could not be saved.
    fn save(&self, peer: Peer, v: &Self::Value) -> bool;

    /// Loads peer data.
    fn load(&self, peer: Peer) -> Option<Self::Value>;

    /// Removes peer data.
    fn remove(&self, peer: Peer);

    /// Removes all peer data.
    fn clear(&self);
}

/// Storage of the database hash ([Vol 3] Part G, Section 7.3).
pub trait HashStore: Debug + Send + Sync {
    /// Saves the database hash.
    fn save_hash(&self, hash: u128) -> bool;

    /// Loads the last saved database hash.
    fn load_hash(&self) -> Option<u128>;
}

/// Volatile store that keeps peer data in memory.
#[derive(Debug, Default)]
pub struct MemStore {
    peers: Mutex<BTreeMap<Peer, Cache>>,
    hash: Mutex<Option<u128>>,
}

impl PeerStore for MemStore {
    type Value = Cache;

    fn save(&self, peer: Peer, v: &Cache) -> bool {
        self.peers.lock().insert(peer, v.clone());
        true
    }

    fn load(&self, peer: Peer) -> Option<Cache> {
        self.peers.lock().get(&peer).cloned()
    }

    fn remove(&self, peer: Peer) {
        self.peers.lock().remove(&peer);
    }

    fn clear(&self) {
        self.peers.lock().clear();
    }
}

impl HashStore for MemStore {
    fn save_hash(&self, hash: u128) -> bool {
        *self.hash.lock() = Some(hash);
        true
    }

    fn load_hash(&self) -> Option<u128> {
        *self.hash.lock()
    }
}

/// Applies a persistence event to a store. Returns `false` if the event is
/// not a persistence event or the store failed to save it.
pub fn persist<S>(s: &S, ev: &Event) -> bool
where
    S: PeerStore<Value = Cache> + HashStore + ?Sized,
{
    match *ev {
        Event::PersistPeer { peer, ref cache } => {
            debug!("Saving GATT state of {peer}");
            s.save(peer, cache)
        }
        Event::PersistHash(hash) => s.save_hash(hash),
        Event::ClearPeer(peer) => {
            s.remove(peer);
            true
        }
        _ => false,
    }
}

impl<T: Transport> Host<T> {
    /// Restores the state of bonded peers and compares the stored database
    /// hash with the current one.
    pub fn load<S>(&mut self, s: &S, bonded: impl IntoIterator<Item = Peer>)
    where
        S: PeerStore<Value = Cache> + HashStore + ?Sized,
    {
        for peer in bonded {
            match s.load(peer) {
                Some(cache) => self.restore(peer, &cache),
                None => warn!("No stored GATT state for {peer}"),
            }
        }
        self.load_hash(s.load_hash());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::att::Handle;
    use crate::gatt::ClientFeatures;
    use crate::host::tests::TestHost;

    #[test]
    fn persist_events() {
        let s = MemStore::default();
        let mut h = TestHost::new();
        let conn = h.connect(true);
        let peer = h.peer(conn).unwrap();
        h.recv_att(conn, &[0x12, 0x04, 0x00, 0x02, 0x00]);
        h.advance(Duration::from_millis(100));
        while let Some(ev) = h.next_event() {
            persist(&s, &ev);
        }
        let cache = s.load(peer).unwrap();
        assert_eq!(cache.ccc, vec![(Handle::new(0x04).unwrap(), 0x02)]);

        // A new host restores the peer and sees an unchanged hash
        let mut h2 = TestHost::new();
        s.save_hash(h2.db().hash());
        h2.load(&s, [peer]);
        assert_eq!(h2.peer_cache(peer), cache);
        assert_eq!(h2.next_event(), None);

        h2.forget(peer);
        assert!(persist(&s, &h2.next_event().unwrap()));
        assert_eq!(s.load(peer), None);
    }

    #[test]
    fn mem_store() {
        let s = MemStore::default();
        let peer = Peer::default();
        let c = Cache {
            features: ClientFeatures::ROBUST_CACHING,
            ..Cache::default()
        };
        assert!(s.save(peer, &c));
        assert_eq!(s.load(peer), Some(c));
        s.clear();
        assert_eq!(s.load(peer), None);
        assert_eq!(s.load_hash(), None);
    }
}
