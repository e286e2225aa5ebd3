use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use crate::{TorrentHandle, ID};

// Live coordinators in this process, keyed by info-hash. An entry is inserted
// when a torrent starts and removed on every coordinator exit path, which is
// what makes download() idempotent.

fn table() -> &'static Mutex<HashMap<ID, TorrentHandle>> {
    static TABLE: OnceLock<Mutex<HashMap<ID, TorrentHandle>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn insert(info_hash: ID, handle: TorrentHandle) {
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(info_hash, handle);
}

pub fn find(info_hash: &ID) -> Option<TorrentHandle> {
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(info_hash)
        .cloned()
}

pub fn remove(info_hash: &ID) {
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(info_hash);
}
