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

//! Three access patterns over a tile manager: a direct-addressed random
//! iterator, a row-major sequential walk of a tile rectangle, and an
//! mz-clipping wrapper around the sequential walk. A fourth, the part
//! iterator, clips a single already-loaded scan slot to an mz window.

use ms_errors::Result;
use ms_tile_manager::TileManager;
use ms_tile_range::{TileRange, TileRect};
use ms_tile_store::{ContentKind, Point, Tile, TilePos};

/// Direct-addressed access: `move_to` fetches (or re-fetches from cache) the
/// tile containing a given scan index and exposes that scan's slot.
pub struct RandomTileIterator<'a, T: Clone> {
    manager: &'a mut TileManager<T>,
    range: TileRange,
    kind: ContentKind,
    pos: Option<TilePos>,
    tile: Option<Tile<T>>,
    scan_index: i64,
}

impl<'a, T: Clone + 'static> RandomTileIterator<'a, T> {
    pub fn new(manager: &'a mut TileManager<T>, range: TileRange, kind: ContentKind) -> Self {
        RandomTileIterator {
            manager,
            range,
            kind,
            pos: None,
            tile: None,
            scan_index: 0,
        }
    }

    pub fn move_to(&mut self, tile_x: i64, tile_y: i64, scan_index: i64) -> Result<()> {
        let pos = (tile_x, tile_y);
        if self.pos != Some(pos) {
            self.tile = Some(self.manager.load_tile(pos, self.kind)?);
            self.pos = Some(pos);
        }
        self.scan_index = scan_index;
        Ok(())
    }

    pub fn value(&self) -> &[T] {
        let offset = self.range.tile_offset(self.scan_index);
        self.tile.as_ref().expect("move_to called before value").scan_slot(offset)
    }

    /// Remaining scan slots, including this one, before the current tile row
    /// runs out.
    pub fn num_contiguous_rows(&self, scan_index: i64) -> i64 {
        self.range.scan_index_tile_length() - self.range.tile_offset(scan_index)
    }
}

/// Row-major walk of every `(tile_x, tile_y, scan_index)` triple in a tile
/// rectangle: tile rows outer, tile columns inner, scan index innermost.
/// Guarantees each tile is fetched from the manager at most once.
pub struct SequentialTileIterator<'a, T: Clone> {
    manager: &'a mut TileManager<T>,
    range: TileRange,
    kind: ContentKind,
    rect: TileRect,
    restrict: Option<(i64, i64)>,
    tx: i64,
    ty: i64,
    scan_index: i64,
    tile_scan_end: i64,
    tile: Option<Tile<T>>,
    last_in_tile: bool,
    finished: bool,
}

impl<'a, T: Clone + 'static> SequentialTileIterator<'a, T> {
    pub fn new(manager: &'a mut TileManager<T>, range: TileRange, kind: ContentKind, rect: TileRect) -> Result<Self> {
        let mut iter = SequentialTileIterator {
            manager,
            range,
            kind,
            rect,
            restrict: None,
            tx: rect.x,
            ty: rect.y,
            scan_index: 0,
            tile_scan_end: -1,
            tile: None,
            last_in_tile: false,
            finished: false,
        };
        iter.rewind()?;
        Ok(iter)
    }

    pub fn restrict_scan_index_interval(&mut self, start: i64, end: i64) -> Result<()> {
        self.restrict = Some((start, end));
        self.rewind()
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.tx = self.rect.x;
        self.ty = self.rect.y;
        self.finished = false;
        self.load_current_tile()
    }

    fn load_current_tile(&mut self) -> Result<()> {
        self.tile = Some(self.manager.load_tile((self.tx, self.ty), self.kind)?);
        let (start_raw, end_exclusive) = self.range.scan_index_interval(self.ty);
        let mut start = start_raw;
        let mut end = end_exclusive - 1;
        if let Some((rs, re)) = self.restrict {
            start = start.max(rs);
            end = end.min(re);
        }
        self.scan_index = start;
        self.tile_scan_end = end;
        Ok(())
    }

    /// `true` exactly when the most recently yielded triple was the final
    /// scan index visited within its tile.
    pub fn is_last_visited_scan_index_in_tile(&self) -> bool {
        self.last_in_tile
    }

    pub fn value(&self) -> &[T] {
        let offset = self.range.tile_offset(self.scan_index - 1);
        self.tile.as_ref().expect("next() not yet called").scan_slot(offset)
    }

    pub fn next(&mut self) -> Result<Option<(i64, i64, i64)>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.scan_index > self.tile_scan_end {
                self.tx += 1;
                if self.tx > self.rect.right() {
                    self.tx = self.rect.x;
                    self.ty += 1;
                }
                if self.ty > self.rect.bottom() {
                    self.finished = true;
                    return Ok(None);
                }
                self.load_current_tile()?;
                continue;
            }
            let result = (self.tx, self.ty, self.scan_index);
            self.last_in_tile = self.scan_index == self.tile_scan_end;
            self.scan_index += 1;
            return Ok(Some(result));
        }
    }
}

/// Clips points in [lo, hi] from an ascending-mz-sorted slot, the "part
/// iterator" of spec.md §4.F, expressed as a pure function over an
/// already-materialized slice.
pub fn clip_to_mz_range(points: &[Point], lo: f64, hi: f64) -> &[Point] {
    let start = points.partition_point(|p| p.mz < lo);
    let end = points.partition_point(|p| p.mz <= hi);
    &points[start..end]
}

/// Layers mz clipping on top of the sequential walk: each emitted scan slot
/// is clipped to `[mz_start, mz_end]`, except tiles whose full mz span is
/// already contained in the requested range, which are returned unclipped.
pub struct MzScanIndexRectIterator<'a> {
    inner: SequentialTileIterator<'a, Point>,
    range: TileRange,
    mz_start: f64,
    mz_end: f64,
}

impl<'a> MzScanIndexRectIterator<'a> {
    pub fn new(
        manager: &'a mut TileManager<Point>,
        range: TileRange,
        kind: ContentKind,
        rect: TileRect,
        mz_start: f64,
        mz_end: f64,
    ) -> Result<Self> {
        let inner = SequentialTileIterator::new(manager, range, kind, rect)?;
        Ok(MzScanIndexRectIterator {
            inner,
            range,
            mz_start,
            mz_end,
        })
    }

    pub fn restrict_scan_index_interval(&mut self, start: i64, end: i64) -> Result<()> {
        self.inner.restrict_scan_index_interval(start, end)
    }

    pub fn is_last_visited_scan_index_in_tile(&self) -> bool {
        self.inner.is_last_visited_scan_index_in_tile()
    }

    pub fn next(&mut self) -> Result<Option<(i64, i64, i64)>> {
        self.inner.next()
    }

    fn tile_fully_inside_mz_range(&self, tile_x: i64) -> bool {
        let (lo, hi) = self.range.mz_tile_interval(tile_x);
        lo >= self.mz_start && hi <= self.mz_end
    }

    pub fn value(&self, tile_x: i64) -> &[Point] {
        let full = self.inner.value();
        if self.tile_fully_inside_mz_range(tile_x) {
            full
        } else {
            clip_to_mz_range(full, self.mz_start, self.mz_end)
        }
    }
}
