//! The refcounted in-memory cache of directory-metadata objects.
//!
//! Directory metadata repeats heavily across large trees, so bulk operations
//! (checkout, traversal) reserve the cache for their duration.  There is no
//! eviction and no TTL; the map simply lives while at least one reservation
//! is outstanding.

use std::collections::HashMap;
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::objects::DirMeta;

#[derive(Debug, Default)]
pub(crate) struct DirmetaCache {
    refcount: u32,
    map: Option<HashMap<Checksum, Arc<DirMeta>>>,
}

impl DirmetaCache {
    /// Take a reservation, lazily creating the map on the 0 -> 1 transition.
    pub(crate) fn reserve(&mut self) {
        self.refcount += 1;
        if self.refcount == 1 {
            debug_assert!(self.map.is_none());
            self.map = Some(HashMap::new());
        }
    }

    /// Drop a reservation, freeing the map when none remain.
    pub(crate) fn release(&mut self) {
        debug_assert!(self.refcount > 0);
        self.refcount -= 1;
        if self.refcount == 0 {
            self.map = None;
        }
    }

    pub(crate) fn lookup(&self, checksum: &Checksum) -> Option<Arc<DirMeta>> {
        self.map.as_ref()?.get(checksum).cloned()
    }

    /// Insert on miss; a no-op unless reserved.
    pub(crate) fn insert(&mut self, checksum: Checksum, dirmeta: Arc<DirMeta>) {
        if let Some(map) = self.map.as_mut() {
            map.insert(checksum, dirmeta);
        }
    }
}
