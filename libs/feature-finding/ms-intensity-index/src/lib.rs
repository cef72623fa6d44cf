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

//! Per-tile maximum-intensity tracking over a search rectangle: one entry
//! per tile, held in two views (by tile position, by intensity), built in
//! parallel over horizontal tile bands and recomputed tile-by-tile once
//! points are marked as processed elsewhere.

use std::collections::{BTreeMap, HashMap};

use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use smallvec::SmallVec;

use ms_errors::Result;
use ms_tile_manager::TileManager;
use ms_tile_range::{TileRange, TileRect};
use ms_tile_store::{ContentKind, Point, Tile, TilePos};

/// Sentinel for a tile with no unselected points left -- recorded rather
/// than omitted, so a fully-exhausted tile still has a position in
/// `by_position` for bookkeeping.
pub const INVALID_INTENSITY: f64 = -1.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensityIndexEntry {
    pub pos: TilePos,
    pub scan_index: i64,
    pub internal_index: i64,
    pub intensity: f64,
    pub mz: f64,
}

impl IntensityIndexEntry {
    fn invalid(pos: TilePos) -> Self {
        IntensityIndexEntry { pos, scan_index: 0, internal_index: 0, intensity: INVALID_INTENSITY, mz: 0.0 }
    }
}

/// Tie-break rule for two candidate maxima: higher intensity wins outright;
/// on an exact tie, higher mz wins.
pub fn is_maxima(candidate: Point, current_maximum: Point) -> bool {
    if candidate.intensity >= current_maximum.intensity {
        if candidate.intensity == current_maximum.intensity {
            return candidate.mz >= current_maximum.mz;
        }
        return true;
    }
    false
}

fn scan_tile_for_max(tile: &Tile<Point>, selection: Option<&Tile<bool>>) -> Option<(Point, i64, i64)> {
    let mut best: Option<(Point, i64, i64)> = None;
    for offset in 0..tile.height() {
        let slot = tile.scan_slot(offset);
        let sel_slot = selection.map(|s| s.scan_slot(offset));
        for (i, p) in slot.iter().enumerate() {
            if let Some(sel) = sel_slot {
                if sel.get(i).copied().unwrap_or(false) {
                    continue;
                }
            }
            let better = match best {
                None => true,
                Some((cur, _, _)) => is_maxima(*p, cur),
            };
            if better {
                best = Some((*p, offset, i as i64));
            }
        }
    }
    best
}

/// By-intensity ordered multimap, ties broken by higher mz via `is_maxima`'s
/// rule at read time. Ports the original's `IntensityPriorityQueue`. Most
/// buckets hold exactly one tile position -- exact-intensity collisions
/// across tiles are the exception, not the rule -- so each bucket is a
/// `SmallVec` rather than a heap-allocated `Vec`.
#[derive(Default)]
pub struct ByIntensity {
    map: BTreeMap<OrderedFloat<f64>, SmallVec<[TilePos; 4]>>,
}

impl ByIntensity {
    pub fn new() -> Self {
        ByIntensity::default()
    }

    pub fn insert(&mut self, intensity: f64, pos: TilePos) {
        self.map.entry(OrderedFloat(intensity)).or_default().push(pos);
    }

    pub fn remove(&mut self, intensity: f64, pos: TilePos) {
        if let Some(positions) = self.map.get_mut(&OrderedFloat(intensity)) {
            positions.retain(|&p| p != pos);
            if positions.is_empty() {
                self.map.remove(&OrderedFloat(intensity));
            }
        }
    }

    /// The highest recorded intensity and every tile position sharing it,
    /// excluding the `INVALID_INTENSITY` sentinel bucket.
    pub fn top(&self) -> Option<(f64, &[TilePos])> {
        self.map
            .iter()
            .next_back()
            .filter(|(k, _)| k.0 > INVALID_INTENSITY)
            .map(|(k, positions)| (k.0, positions.as_slice()))
    }
}

pub struct IntensityIndex {
    by_position: HashMap<TilePos, IntensityIndexEntry>,
    by_intensity: ByIntensity,
}

impl IntensityIndex {
    fn from_entries(entries: HashMap<TilePos, IntensityIndexEntry>) -> Self {
        let mut by_intensity = ByIntensity::new();
        for entry in entries.values() {
            by_intensity.insert(entry.intensity, entry.pos);
        }
        IntensityIndex { by_position: entries, by_intensity }
    }

    pub fn entry(&self, pos: TilePos) -> Option<&IntensityIndexEntry> {
        self.by_position.get(&pos)
    }

    pub fn max_intensity(&self) -> Option<(f64, &[TilePos])> {
        self.by_intensity.top()
    }

    /// Builds the index over `rect` by splitting it into `worker_count`
    /// equal-height horizontal bands. All but the last band run on a spawned
    /// thread against an independently cloned manager; the main thread
    /// processes the last band itself and joins the rest. Every thread
    /// writes its band's results straight into a shared, mutex-guarded map.
    pub fn create_index_for_tiles(
        manager: &mut TileManager<Point>,
        range: TileRange,
        kind: ContentKind,
        rect: TileRect,
        worker_count: usize,
    ) -> Result<IntensityIndex> {
        let worker_count = worker_count.max(1);
        let bands = split_into_bands(rect, worker_count);
        let results: Mutex<HashMap<TilePos, IntensityIndexEntry>> = Mutex::new(HashMap::new());

        let (last_band, lead_bands) = bands.split_last().expect("at least one band");

        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            for band in lead_bands {
                let mut worker_manager = manager.try_clone()?;
                let band = *band;
                let results = &results;
                handles.push(scope.spawn(move || -> Result<()> {
                    let partial = index_tile_rect(&mut worker_manager, range, kind, band, None)?;
                    results.lock().extend(partial);
                    Ok(())
                }));
            }

            let partial = index_tile_rect(manager, range, kind, *last_band, None)?;
            results.lock().extend(partial);

            for handle in handles {
                handle.join().expect("intensity-index worker thread panicked")?;
            }
            Ok(())
        })?;

        log::debug!("built intensity index over {} tile(s) across {worker_count} worker(s)", rect.width * rect.height);
        Ok(IntensityIndex::from_entries(results.into_inner()))
    }

    /// Recomputes the listed tiles' entries, skipping points already marked
    /// selected. Called by the cluster finder after every extracted cluster.
    pub fn update_index_for_tiles(
        &mut self,
        manager: &mut TileManager<Point>,
        selection_manager: &mut TileManager<bool>,
        range: TileRange,
        kind: ContentKind,
        positions: &[TilePos],
    ) -> Result<()> {
        for &pos in positions {
            let tile = manager.load_tile(pos, kind)?;
            let selection = selection_manager.load_tile(pos, kind)?;
            let entry = match scan_tile_for_max(&tile, Some(&selection)) {
                Some((point, scan_index, internal_index)) => {
                    IntensityIndexEntry { pos, scan_index, internal_index, intensity: point.intensity, mz: point.mz }
                }
                None => IntensityIndexEntry::invalid(pos),
            };
            if let Some(old) = self.by_position.remove(&pos) {
                self.by_intensity.remove(old.intensity, pos);
            }
            self.by_intensity.insert(entry.intensity, pos);
            self.by_position.insert(pos, entry);
        }
        Ok(())
    }
}

fn index_tile_rect(
    manager: &mut TileManager<Point>,
    range: TileRange,
    kind: ContentKind,
    rect: TileRect,
    selection_manager: Option<&mut TileManager<bool>>,
) -> Result<HashMap<TilePos, IntensityIndexEntry>> {
    let _ = range;
    let mut out = HashMap::new();
    let mut selection_manager = selection_manager;
    for ty in rect.y..=rect.bottom() {
        for tx in rect.x..=rect.right() {
            let pos = (tx, ty);
            let tile = manager.load_tile(pos, kind)?;
            let selection = match selection_manager.as_deref_mut() {
                Some(sel_mgr) => Some(sel_mgr.load_tile(pos, kind)?),
                None => None,
            };
            let entry = match scan_tile_for_max(&tile, selection.as_ref()) {
                Some((point, scan_index, internal_index)) => {
                    IntensityIndexEntry { pos, scan_index, internal_index, intensity: point.intensity, mz: point.mz }
                }
                None => IntensityIndexEntry::invalid(pos),
            };
            out.insert(pos, entry);
        }
    }
    Ok(out)
}

fn split_into_bands(rect: TileRect, worker_count: usize) -> Vec<TileRect> {
    let worker_count = worker_count.min(rect.height.max(1) as usize).max(1);
    let base = rect.height / worker_count as i64;
    let remainder = rect.height % worker_count as i64;
    let mut bands = Vec::with_capacity(worker_count);
    let mut y = rect.y;
    for i in 0..worker_count {
        let extra = if (i as i64) < remainder { 1 } else { 0 };
        let height = base + extra;
        if height <= 0 {
            continue;
        }
        bands.push(TileRect { x: rect.x, y, width: rect.width, height });
        y += height;
    }
    if bands.is_empty() {
        bands.push(rect);
    }
    bands
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_tile_store::{Store, StoreMemory};

    fn point(mz: f64, intensity: f64) -> Point {
        Point { mz, intensity }
    }

    fn sample_range() -> TileRange {
        let mut range = TileRange::new();
        range.set_mz(0.0, 100.0).unwrap();
        range.set_mz_tile_length(50.0);
        range.set_scan_index(0, 7).unwrap();
        range.set_scan_index_length(4);
        range
    }

    fn manager_with(tiles: &[(TilePos, Vec<(i64, Vec<Point>)>)]) -> TileManager<Point> {
        let mut store: StoreMemory<Point> = StoreMemory::new();
        for (pos, slots) in tiles {
            let mut tile = Tile::new(*pos, 4);
            for (offset, data) in slots {
                tile.set_scan_slot(*offset, data.clone());
            }
            store.save(&tile, ContentKind::Ms1Raw).unwrap();
        }
        TileManager::new(Box::new(store), 4, 8)
    }

    #[test]
    fn is_maxima_breaks_ties_toward_higher_mz() {
        let a = point(10.0, 5.0);
        let b = point(20.0, 5.0);
        assert!(is_maxima(b, a));
        assert!(!is_maxima(a, b));
        assert!(is_maxima(point(5.0, 6.0), a));
    }

    #[test]
    fn create_index_for_tiles_finds_the_global_maximum_per_tile() {
        let mut manager = manager_with(&[
            ((0, 0), vec![(0, vec![point(1.0, 10.0), point(2.0, 50.0)]), (1, vec![point(3.0, 5.0)])]),
            ((1, 0), vec![(0, vec![point(60.0, 99.0)])]),
        ]);
        let range = sample_range();
        let rect = TileRect { x: 0, y: 0, width: 2, height: 1 };
        let index = IntensityIndex::create_index_for_tiles(&mut manager, range, ContentKind::Ms1Raw, rect, 2).unwrap();

        let e0 = index.entry((0, 0)).unwrap();
        assert_eq!(e0.intensity, 50.0);
        assert_eq!(e0.mz, 2.0);

        let e1 = index.entry((1, 0)).unwrap();
        assert_eq!(e1.intensity, 99.0);

        let (max_intensity, positions) = index.max_intensity().unwrap();
        assert_eq!(max_intensity, 99.0);
        assert_eq!(positions, &[(1, 0)]);
    }

    #[test]
    fn update_index_for_tiles_ignores_selected_points() {
        let mut manager = manager_with(&[((0, 0), vec![(0, vec![point(1.0, 10.0), point(2.0, 50.0)])])]);
        let range = sample_range();
        let rect = TileRect { x: 0, y: 0, width: 1, height: 1 };
        let mut index = IntensityIndex::create_index_for_tiles(&mut manager, range, ContentKind::Ms1Raw, rect, 1).unwrap();
        assert_eq!(index.entry((0, 0)).unwrap().intensity, 50.0);

        let mut selection_store: StoreMemory<bool> = StoreMemory::new();
        let mut selected = Tile::new((0, 0), 4);
        selected.set_scan_slot(0, vec![false, true]);
        selection_store.save(&selected, ContentKind::Ms1Raw).unwrap();
        let mut selection_manager = TileManager::new(Box::new(selection_store), 4, 0);

        index
            .update_index_for_tiles(&mut manager, &mut selection_manager, range, ContentKind::Ms1Raw, &[(0, 0)])
            .unwrap();

        let updated = index.entry((0, 0)).unwrap();
        assert_eq!(updated.intensity, 10.0);
    }

    #[test]
    fn update_index_for_tiles_reports_invalid_when_every_point_is_selected() {
        let mut manager = manager_with(&[((0, 0), vec![(0, vec![point(1.0, 10.0)])])]);
        let range = sample_range();
        let rect = TileRect { x: 0, y: 0, width: 1, height: 1 };
        let mut index = IntensityIndex::create_index_for_tiles(&mut manager, range, ContentKind::Ms1Raw, rect, 1).unwrap();

        let mut selection_store: StoreMemory<bool> = StoreMemory::new();
        let mut selected = Tile::new((0, 0), 4);
        selected.set_scan_slot(0, vec![true]);
        selection_store.save(&selected, ContentKind::Ms1Raw).unwrap();
        let mut selection_manager = TileManager::new(Box::new(selection_store), 4, 0);

        index
            .update_index_for_tiles(&mut manager, &mut selection_manager, range, ContentKind::Ms1Raw, &[(0, 0)])
            .unwrap();

        assert_eq!(index.entry((0, 0)).unwrap().intensity, INVALID_INTENSITY);
        assert!(index.max_intensity().is_none());
    }

    #[test]
    fn split_into_bands_covers_the_rect_exactly() {
        let rect = TileRect { x: 0, y: 0, width: 3, height: 5 };
        let bands = split_into_bands(rect, 3);
        let total_height: i64 = bands.iter().map(|b| b.height).sum();
        assert_eq!(total_height, 5);
        assert_eq!(bands.last().unwrap().bottom(), rect.bottom());
    }
}
