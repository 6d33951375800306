//! File system storage backend.

use std::path::{Path, PathBuf};
use std::{fs, io};

use tracing::{debug, error, warn};

use crate::gatt::Cache;
use crate::le::{Addr, Peer};
use crate::store::{HashStore, PeerStore};

/// GATT server state stored in a file system directory. Each bonded peer
/// has one JSON file and the database hash is kept in a separate file.
#[derive(Clone, Debug)]
pub struct GattStore(Dir);

impl GattStore {
    const NAME: &'static str = "gatts";

    /// Creates or opens a store in the specified root directory.
    #[inline(always)]
    #[must_use]
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self(Dir(root.as_ref().join(Self::NAME)))
    }

    /// Creates or opens a store in the current user's local data directory.
    /// Returns [`None`] if the user directory cannot be determined.
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>) -> Option<Self> {
        let dir = dirs::data_local_dir()?.join(app.as_ref()).join(Self::NAME);
        Some(Self(Dir(dir)))
    }
}

impl PeerStore for GattStore {
    type Value = Cache;

    #[inline(always)]
    fn save(&self, peer: Peer, v: &Self::Value) -> bool {
        self.0.save(&Dir::peer_file(peer), v)
    }

    #[inline(always)]
    fn load(&self, peer: Peer) -> Option<Self::Value> {
        self.0.load(&Dir::peer_file(peer))
    }

    #[inline(always)]
    fn remove(&self, peer: Peer) {
        self.0.remove(&Dir::peer_file(peer));
    }

    #[inline(always)]
    fn clear(&self) {
        self.0.clear();
    }
}

impl HashStore for GattStore {
    fn save_hash(&self, hash: u128) -> bool {
        self.0.save(Dir::HASH, &format!("{hash:032X}"))
    }

    fn load_hash(&self) -> Option<u128> {
        let s: String = self.0.load(Dir::HASH)?;
        u128::from_str_radix(&s, 16)
            .map_err(|e| warn!("Invalid database hash {s:?} ({e})"))
            .ok()
    }
}

/// Database in a file system directory.
#[derive(Clone, Debug)]
#[repr(transparent)]
struct Dir(PathBuf);

impl Dir {
    const HASH: &'static str = "hash";

    /// Returns the file name for the specified peer.
    fn peer_file(peer: Peer) -> String {
        let (typ, raw) = match peer.addr {
            Addr::Public(ref raw) => ('P', raw.as_le_bytes()),
            Addr::Random(ref raw) => ('R', raw.as_le_bytes()),
        };
        format!(
            "{:02X}-{typ}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            peer.id, raw[5], raw[4], raw[3], raw[2], raw[1], raw[0]
        )
    }

    /// Saves data to a file.
    fn save(&self, name: &str, v: &impl serde::ser::Serialize) -> bool {
        let s = match serde_json::to_string_pretty(v) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize {name} ({e})");
                return false;
            }
        };
        if let Err(e) = fs::create_dir_all(&self.0) {
            warn!("Failed to create database directory: {} ({e})", self.0.display());
        }
        // Replace atomically
        let path = self.0.join(name);
        let tmp = path.with_extension("tmp");
        match fs::write(&tmp, s.as_bytes()).and_then(|_| fs::rename(&tmp, &path)) {
            Ok(_) => {
                debug!("Wrote: {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write: {} ({e})", path.display());
                false
            }
        }
    }

    /// Loads data from a file.
    fn load<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.0.join(name);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => return None,
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return None;
            }
        };
        serde_json::from_str(&s)
            .map_err(|e| error!("Invalid file contents: {} ({e})", path.display()))
            .ok()
    }

    /// Removes a file.
    fn remove(&self, name: &str) {
        let path = self.0.join(name);
        match fs::remove_file(&path) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", path.display()),
        }
    }

    /// Removes all files.
    fn clear(&self) {
        match fs::remove_dir_all(&self.0) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", self.0.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::Builder;

    use super::*;
    use crate::att::{Handle, HandleRange};
    use crate::gatt::ClientFeatures;
    use crate::le::RawAddr;

    #[test]
    fn save_load() {
        const PEER: Peer = Peer::new(Addr::Random(RawAddr::from_le_bytes([0x55, 0x44, 0x33, 0x22, 0x11, 0xC0])));
        let tmp = (Builder::new().prefix("gattic-test-")).tempdir().unwrap();
        let db = GattStore::open(tmp.path());
        let cache = Cache {
            features: ClientFeatures::ROBUST_CACHING,
            aware: false,
            ccc: vec![(Handle::new(0x04).unwrap(), 0x02)],
            sc: Some(HandleRange::new(Handle::new(9).unwrap(), Handle::MAX)),
        };
        assert_eq!(db.load(PEER), None);
        assert!(db.save(PEER, &cache));
        assert!(tmp.path().join("gatts/00-R-C01122334455").exists());
        assert_eq!(db.load(PEER), Some(cache));

        assert!(db.save_hash(0x0123_4567_89AB_CDEF_0011_2233_4455_6677));
        assert_eq!(db.load_hash(), Some(0x0123_4567_89AB_CDEF_0011_2233_4455_6677));
        db.remove(PEER);
        assert_eq!(db.load(PEER), None);
        db.clear();
        assert_eq!(db.load_hash(), None);
    }
}
