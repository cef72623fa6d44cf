// This file is part of the non-uniform MS tile engine.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The single read/write gateway to a tile store: an LRU cache keyed by
//! (tile position, content kind) in front of whatever `Store<T>` backs it.

use std::collections::{HashMap, VecDeque};

use ms_errors::Result;
use ms_tile_store::{ContentKind, Store, Tile, TilePos};

/// Wraps a `Store<T>` with an LRU cache. `cache_size == 0` disables caching
/// entirely (every call goes straight to the store) -- required while a
/// manager is being used to read back tiles it is concurrently writing,
/// since a stale cached copy would hide the write.
pub struct TileManager<T: Clone> {
    store: Box<dyn Store<T>>,
    height: i64,
    cache_size: usize,
    cache: HashMap<(TilePos, ContentKind), Tile<T>>,
    lru: VecDeque<(TilePos, ContentKind)>,
}

impl<T: Clone + 'static> TileManager<T> {
    pub fn new(store: Box<dyn Store<T>>, height: i64, cache_size: usize) -> Self {
        TileManager {
            store,
            height,
            cache_size,
            cache: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub fn set_cache_size(&mut self, size: usize) {
        self.cache_size = size;
        if size == 0 {
            self.cache.clear();
            self.lru.clear();
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    /// Direct access to the underlying store, bypassing the cache -- used by
    /// the selection/hill-id writers that need read-after-write visibility.
    pub fn store_mut(&mut self) -> &mut dyn Store<T> {
        self.store.as_mut()
    }

    pub fn load_tile(&mut self, pos: TilePos, kind: ContentKind) -> Result<Tile<T>> {
        if self.cache_size == 0 {
            return self.store.load(pos, kind, self.height);
        }

        if let Some(tile) = self.cache.get(&(pos, kind)) {
            log::trace!("cache hit for tile {pos:?}/{kind:?}");
            let tile = tile.clone();
            self.touch(pos, kind);
            return Ok(tile);
        }

        log::trace!("cache miss for tile {pos:?}/{kind:?}, loading from store");
        let tile = self.store.load(pos, kind, self.height)?;
        self.insert_cache(pos, kind, tile.clone());
        Ok(tile)
    }

    pub fn save_tile(&mut self, tile: &Tile<T>, kind: ContentKind) -> Result<bool> {
        let ok = self.store.save(tile, kind)?;
        if self.cache_size > 0 {
            self.insert_cache(tile.pos, kind, tile.clone());
        }
        Ok(ok)
    }

    pub fn contains(&self, pos: TilePos, kind: ContentKind) -> Result<bool> {
        self.store.contains(pos, kind)
    }

    fn touch(&mut self, pos: TilePos, kind: ContentKind) {
        if let Some(i) = self.lru.iter().position(|k| *k == (pos, kind)) {
            self.lru.remove(i);
        }
        self.lru.push_back((pos, kind));
    }

    fn insert_cache(&mut self, pos: TilePos, kind: ContentKind, tile: Tile<T>) {
        if self.cache.len() >= self.cache_size && !self.cache.contains_key(&(pos, kind)) {
            if let Some(oldest) = self.lru.pop_front() {
                self.cache.remove(&oldest);
            }
        }
        self.cache.insert((pos, kind), tile);
        self.touch(pos, kind);
    }

    /// An independent manager over an independent store connection, for
    /// handing to a worker thread (SQLite enforces one connection per
    /// thread; the memory store is deep-copied). The clone starts with an
    /// empty cache of the same size.
    pub fn try_clone(&self) -> Result<TileManager<T>> {
        Ok(TileManager {
            store: self.store.try_clone_store()?,
            height: self.height,
            cache_size: self.cache_size,
            cache: HashMap::new(),
            lru: VecDeque::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_tile_store::{Point, StoreMemory};

    fn point(mz: f64, intensity: f64) -> ms_tile_store::Point {
        Point { mz, intensity }
    }

    fn manager(cache_size: usize) -> TileManager<Point> {
        TileManager::new(Box::new(StoreMemory::new()), 4, cache_size)
    }

    #[test]
    fn cache_size_zero_always_reads_through_to_store() {
        let mut mgr = manager(0);
        let mut tile = Tile::new((0, 0), 4);
        tile.set_scan_slot(0, vec![point(1.0, 1.0)]);
        mgr.save_tile(&tile, ContentKind::Ms1Raw).unwrap();

        // mutate the store directly; a cached manager would miss this.
        let mut updated = Tile::new((0, 0), 4);
        updated.set_scan_slot(0, vec![point(2.0, 2.0)]);
        mgr.store_mut().save(&updated, ContentKind::Ms1Raw).unwrap();

        let loaded = mgr.load_tile((0, 0), ContentKind::Ms1Raw).unwrap();
        assert_eq!(loaded.scan_slot(0)[0].mz, 2.0);
    }

    #[test]
    fn cache_evicts_oldest_entry_on_overflow() {
        let mut mgr = manager(2);
        for i in 0..3 {
            let tile = Tile::new((i, 0), 4);
            mgr.save_tile(&tile, ContentKind::Ms1Raw).unwrap();
        }
        assert_eq!(mgr.cache.len(), 2);
        assert!(!mgr.cache.contains_key(&((0, 0), ContentKind::Ms1Raw)));
        assert!(mgr.cache.contains_key(&((2, 0), ContentKind::Ms1Raw)));
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let mut mgr = manager(2);
        mgr.save_tile(&Tile::new((0, 0), 4), ContentKind::Ms1Raw).unwrap();
        mgr.save_tile(&Tile::new((1, 0), 4), ContentKind::Ms1Raw).unwrap();
        // touch (0,0) so (1,0) becomes the oldest.
        mgr.load_tile((0, 0), ContentKind::Ms1Raw).unwrap();
        mgr.save_tile(&Tile::new((2, 0), 4), ContentKind::Ms1Raw).unwrap();

        assert!(mgr.cache.contains_key(&((0, 0), ContentKind::Ms1Raw)));
        assert!(!mgr.cache.contains_key(&((1, 0), ContentKind::Ms1Raw)));
    }

    #[test]
    fn clone_is_independent_of_the_original() {
        let mut mgr = manager(4);
        mgr.save_tile(&Tile::new((0, 0), 4), ContentKind::Ms1Raw).unwrap();

        let mut cloned = mgr.try_clone().unwrap();
        cloned.save_tile(&Tile::new((9, 9), 4), ContentKind::Ms1Raw).unwrap();

        assert!(!mgr.contains((9, 9), ContentKind::Ms1Raw).unwrap());
        assert!(cloned.contains((0, 0), ContentKind::Ms1Raw).unwrap());
    }
}
