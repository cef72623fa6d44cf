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

//! Streaming ingestion from a `ScanReader` into a tile store, plus the
//! scan-number/scan-index/scan-time converter every higher layer needs, plus
//! the auxiliary selection-bit and hill-id tile builders.

use ms_errors::{Error, Result};
use ms_scan_reader::ScanInfo;
use ms_scan_reader::ScanReader;
use ms_tile_iter::SequentialTileIterator;
use ms_tile_manager::TileManager;
use ms_tile_range::{TileRange, TileRect};
use ms_tile_store::{ContentKind, Point, Store, StoreMemory, Tile, TilePos};

/// A monotonically increasing `(scan_number, retention_time)` table.
/// `scan_index` is the 0-based position in this table; callers are expected
/// to hand over entries already in ascending scan-number/time order (that
/// ordering is the whole definition of `scan_index`, not something this type
/// derives).
#[derive(Clone, Debug, Default)]
pub struct ScanIndexConverter {
    entries: Vec<ScanInfo>,
}

impl ScanIndexConverter {
    pub fn new(entries: Vec<ScanInfo>) -> Self {
        ScanIndexConverter { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_scan_number(&self, scan_index: i64) -> Option<i64> {
        let idx = usize::try_from(scan_index).ok()?;
        self.entries.get(idx).map(|e| e.scan_number)
    }

    pub fn to_scan_index(&self, scan_number: i64) -> Option<i64> {
        let idx = self.entries.partition_point(|e| e.scan_number < scan_number);
        if idx < self.entries.len() && self.entries[idx].scan_number == scan_number {
            Some(idx as i64)
        } else {
            None
        }
    }

    pub fn scan_index_to_scan_time(&self, scan_index: i64) -> Option<f64> {
        let idx = usize::try_from(scan_index).ok()?;
        self.entries.get(idx).map(|e| e.retention_time_minutes)
    }

    /// Picks the closest entry by retention time -- a nearest-neighbor
    /// lookup, not an interpolation.
    pub fn time_to_scan_index(&self, time: f64) -> Option<i64> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|e| e.retention_time_minutes < time);
        let candidate = if idx == 0 {
            0
        } else if idx >= self.entries.len() {
            self.entries.len() - 1
        } else {
            let before = self.entries[idx - 1].retention_time_minutes;
            let after = self.entries[idx].retention_time_minutes;
            if (time - before).abs() <= (after - time).abs() {
                idx - 1
            } else {
                idx
            }
        };
        Some(candidate as i64)
    }
}

/// Builder tuning knobs; the flush threshold default mirrors the original's
/// `CACHE_SIZE_MB = 256`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NonUniformTileBuilderOptions {
    pub flush_threshold_bytes: u64,
}

impl Default for NonUniformTileBuilderOptions {
    fn default() -> Self {
        NonUniformTileBuilderOptions {
            flush_threshold_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Two f64s per point, matching the original's `sizeof(double) * 2` memory
/// accounting for a pooled tile part.
const POINT_BYTES: u64 = 16;

/// Streams every scan in `range`'s scan-index span out of `reader`, splits
/// each scan's mz-sorted point list into per-tile parts with a running
/// two-pointer cursor, and pools the parts in memory until `options`'
/// threshold is crossed, at which point the pool is flushed into `store`'s
/// partial table and cleared. A final flush and one `defragment` call leave
/// `store` holding final per-tile data.
pub fn build_tiles(
    range: TileRange,
    reader: &dyn ScanReader,
    converter: &ScanIndexConverter,
    store: &mut dyn Store<Point>,
    kind: ContentKind,
    options: NonUniformTileBuilderOptions,
) -> Result<()> {
    let tile_count_x = range.tile_count_x();
    let height = range.scan_index_tile_length();
    let part_overhead_bytes = std::mem::size_of::<Vec<Point>>() as u64;

    let mut pool: StoreMemory<Point> = StoreMemory::new();
    let mut write_pass: u32 = 0;
    let mut point_bytes_in_memory: u64 = 0;
    let mut part_overhead_in_memory: u64 = 0;

    let centroided = matches!(kind, ContentKind::Ms1Centroided);

    for scan_index in range.scan_index_min()..=range.scan_index_max() {
        let scan_number = converter
            .to_scan_number(scan_index)
            .ok_or_else(|| Error::bad_parameter(format!("scan index {scan_index} has no scan number")))?;
        let scan_data = reader.scan_data(scan_number, centroided)?;
        let tile_y = range.tile_y(scan_index);
        let offset = range.tile_offset(scan_index);

        let mut last_end = 0usize;
        for tile_x in 0..tile_count_x {
            let mz_start = range.mz_at(tile_x);
            let mz_end = range.mz_at(tile_x + 1);

            // mz exactly at mz_end belongs to the next tile (right-open).
            let lower = last_end + scan_data[last_end..].partition_point(|p| p.mz < mz_start);
            let upper = lower + scan_data[lower..].partition_point(|p| p.mz < mz_end);
            let part: Vec<Point> = scan_data[lower..upper]
                .iter()
                .map(|p| Point { mz: p.mz, intensity: p.intensity })
                .collect();
            last_end = upper;

            point_bytes_in_memory += part.len() as u64 * POINT_BYTES;
            part_overhead_in_memory += part_overhead_bytes;
            if point_bytes_in_memory + part_overhead_in_memory > options.flush_threshold_bytes {
                write_pass += 1;
                flush_pool(&mut pool, store, kind, write_pass)?;
                point_bytes_in_memory = 0;
                part_overhead_in_memory = 0;
            }

            let pos = (tile_x, tile_y);
            let mut tile = pool.load(pos, kind, height)?;
            tile.set_scan_slot(offset, part);
            pool.save(&tile, kind)?;
        }
    }

    write_pass += 1;
    flush_pool(&mut pool, store, kind, write_pass)?;
    store.defragment(height)?;
    log::debug!("built {kind:?} tiles in {write_pass} write pass(es)");
    Ok(())
}

fn flush_pool(
    pool: &mut StoreMemory<Point>,
    dst: &mut dyn Store<Point>,
    kind: ContentKind,
    write_pass: u32,
) -> Result<()> {
    dst.begin_partial()?;
    for (drained_kind, _pos, tile) in pool.drain_tiles() {
        debug_assert_eq!(drained_kind, kind);
        dst.save_partial(&tile, kind, write_pass)?;
    }
    dst.end_partial()?;
    Ok(())
}

/// Builds selection-bit or hill-id tiles shaped like the existing MS1 tiles
/// in `tile_area`: one `T::default()` per point, written by iterating the
/// MS1 store sequentially and saving each auxiliary tile as soon as its last
/// scan offset has been visited.
pub fn build_auxiliary_tiles<T: Clone + Default + 'static>(
    ms1_manager: &mut TileManager<Point>,
    range: TileRange,
    kind: ContentKind,
    tile_area: TileRect,
    aux_store: &mut dyn Store<T>,
) -> Result<()> {
    let height = range.scan_index_tile_length();
    let mut it = SequentialTileIterator::new(ms1_manager, range, kind, tile_area)?;
    let mut current_pos: Option<TilePos> = None;
    let mut tile: Tile<T> = Tile::new((tile_area.x, tile_area.y), height);

    while let Some((tx, ty, scan_index)) = it.next()? {
        let pos = (tx, ty);
        if current_pos != Some(pos) {
            tile = Tile::new(pos, height);
            current_pos = Some(pos);
        }

        let scan_part_len = it.value().len();
        let offset = range.tile_offset(scan_index);
        tile.set_scan_slot(offset, vec![T::default(); scan_part_len]);

        if it.is_last_visited_scan_index_in_tile() {
            aux_store.save(&tile, kind)?;
        }
    }
    Ok(())
}
