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

//! A feature-finding session: the bundle of collaborators a hill finder and
//! cluster finder share over one search run -- the raw-data device, the
//! selection and (optional) hill-id bitmaps, and the max-intensity index
//! built over the search rectangle.

use ms_document::TileDevice;
use ms_errors::{Error, Result};
use ms_intensity_index::IntensityIndex;
use ms_tile_iter::RandomTileIterator;
use ms_tile_manager::TileManager;
use ms_tile_range::{TileRange, TileRect};
use ms_tile_store::{ContentKind, Point, PointRef, StoreMemory, TilePos};

const DEFAULT_INDEX_WORKER_COUNT: usize = 4;

/// Binds the raw-data device, the selection/hill-id bitmap managers, and the
/// max-intensity index for one feature-finding run over a tile rectangle.
pub struct FeatureFindingSession {
    device: TileDevice<Point>,
    selection_manager: TileManager<bool>,
    hill_index_manager: Option<TileManager<i64>>,
    index: IntensityIndex,
    rect: TileRect,
    worker_count: usize,
}

impl FeatureFindingSession {
    /// Constructs the selection store (all bits unset), optionally the
    /// hill-id store (all zero), and the intensity index, all over `rect`.
    /// Selection and hill-id managers run with `cache_size == 0`: the finder
    /// repeatedly reads back selections it just wrote, so a cache would hide
    /// its own writes.
    pub fn new(mut device: TileDevice<Point>, rect: TileRect, track_hill_ids: bool) -> Result<Self> {
        let selection_manager = TileManager::new(Box::new(StoreMemory::<bool>::new()), device.manager.height(), 0);
        let hill_index_manager =
            track_hill_ids.then(|| TileManager::new(Box::new(StoreMemory::<i64>::new()), device.manager.height(), 0));

        let index = IntensityIndex::create_index_for_tiles(
            &mut device.manager,
            device.range,
            device.kind,
            rect,
            DEFAULT_INDEX_WORKER_COUNT,
        )?;

        Ok(FeatureFindingSession {
            device,
            selection_manager,
            hill_index_manager,
            index,
            rect,
            worker_count: DEFAULT_INDEX_WORKER_COUNT,
        })
    }

    pub fn device(&mut self) -> &mut TileDevice<Point> {
        &mut self.device
    }

    /// The device's coordinate mapping, copied out so a caller can compute
    /// tile positions without holding a borrow of the session.
    pub fn range(&self) -> TileRange {
        self.device.range
    }

    pub fn kind(&self) -> ContentKind {
        self.device.kind
    }

    pub fn selection_tile_manager(&mut self) -> &mut TileManager<bool> {
        &mut self.selection_manager
    }

    pub fn hill_index_manager(&mut self) -> Option<&mut TileManager<i64>> {
        self.hill_index_manager.as_mut()
    }

    pub fn search_area(&self) -> TileRect {
        self.rect
    }

    /// Rebuilds the index over a new tile rectangle, aligned to whole tiles
    /// by the caller before this is invoked.
    pub fn set_search_area(&mut self, rect: TileRect) -> Result<()> {
        self.index = IntensityIndex::create_index_for_tiles(
            &mut self.device.manager,
            self.device.range,
            self.device.kind,
            rect,
            self.worker_count,
        )?;
        self.rect = rect;
        Ok(())
    }

    pub fn update_index_for_tiles(&mut self, positions: &[TilePos]) -> Result<()> {
        self.index.update_index_for_tiles(
            &mut self.device.manager,
            &mut self.selection_manager,
            self.device.range,
            self.device.kind,
            positions,
        )
    }

    /// The current global maximum: `(mz, intensity, point_ref)`. When
    /// several tiles share the top intensity, each candidate's actual mz is
    /// fetched by random-iterating its recorded `(scan_index, internal_index)`
    /// and the highest-mz candidate wins. This is the full point reference a
    /// hill/cluster finder needs to seed a hill; `max_intensity` below
    /// exposes the narrower `(mz, intensity, tile_pos)` view older callers use.
    pub fn max_intensity_point(&mut self) -> Result<Option<(f64, f64, PointRef)>> {
        let (intensity, positions) = match self.index.max_intensity() {
            Some((intensity, positions)) => (intensity, positions.to_vec()),
            None => return Ok(None),
        };

        let kind = self.device.kind;
        let range = self.device.range;
        let mut iter = RandomTileIterator::new(&mut self.device.manager, range, kind);

        let mut best: Option<(f64, PointRef)> = None;
        for pos in positions {
            let entry = self
                .index
                .entry(pos)
                .ok_or_else(|| Error::bad_parameter(format!("intensity index missing entry for tile {pos:?}")))?;
            iter.move_to(pos.0, pos.1, entry.scan_index)?;
            let mz = iter
                .value()
                .get(entry.internal_index as usize)
                .map(|p| p.mz)
                .ok_or_else(|| Error::bad_parameter("intensity index entry points past the end of its tile slot"))?;
            let better = match best {
                None => true,
                Some((best_mz, _)) => mz > best_mz,
            };
            if better {
                best = Some((
                    mz,
                    PointRef { pos, scan_index: entry.scan_index, internal_index: entry.internal_index },
                ));
            }
        }

        let (mz, point_ref) = best.expect("max_intensity positions is non-empty when Some was returned");
        Ok(Some((mz, intensity, point_ref)))
    }

    pub fn max_intensity(&mut self) -> Result<Option<(f64, f64, TilePos)>> {
        Ok(self.max_intensity_point()?.map(|(mz, intensity, point_ref)| (mz, intensity, point_ref.pos)))
    }
}
