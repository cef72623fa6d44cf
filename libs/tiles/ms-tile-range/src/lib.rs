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

//! Pure coordinate mapping between (mz, scan index) world space and the
//! integer tile grid. No I/O, no storage -- just the arithmetic every
//! other tile crate builds on.

use log::warn;
use ms_errors::{Error, Result};

/// A half-open `[start, end)` interval over an orderable scalar.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval<T> {
    start: T,
    end: T,
}

impl<T: Copy + PartialOrd> Interval<T> {
    pub fn new(start: T, end: T) -> Self {
        Interval { start, end }
    }

    pub fn start(&self) -> T {
        self.start
    }

    pub fn end(&self) -> T {
        self.end
    }

    pub fn set_start(&mut self, start: T) {
        self.start = start;
    }

    pub fn set_end(&mut self, end: T) {
        self.end = end;
    }

    pub fn is_empty(&self) -> bool {
        !(self.start < self.end)
    }

    pub fn contains_value(&self, v: T) -> bool {
        self.start <= v && v < self.end
    }

    /// True if `other` is entirely within `self`.
    pub fn contains(&self, other: &Interval<T>) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersected(&self, other: &Interval<T>) -> Interval<T> {
        let start = if self.start > other.start { self.start } else { other.start };
        let end = if self.end < other.end { self.end } else { other.end };
        Interval { start, end }
    }
}

pub type MzInterval = Interval<f64>;
pub type ScanIndexInterval = Interval<i64>;

/// A rectangular region in (mz, scan index) world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MzScanIndexRect {
    pub mz: MzInterval,
    pub scan_index: ScanIndexInterval,
}

impl MzScanIndexRect {
    pub fn new(mz: MzInterval, scan_index: ScanIndexInterval) -> Self {
        MzScanIndexRect { mz, scan_index }
    }

    pub fn is_empty(&self) -> bool {
        self.mz.is_empty() && self.scan_index.is_empty()
    }

    pub fn contains(&self, other: &MzScanIndexRect) -> bool {
        self.mz.contains(&other.mz) && self.scan_index.contains(&other.scan_index)
    }

    pub fn intersected(&self, other: &MzScanIndexRect) -> MzScanIndexRect {
        MzScanIndexRect {
            mz: self.mz.intersected(&other.mz),
            scan_index: self.scan_index.intersected(&other.scan_index),
        }
    }
}

/// An integer tile-index rectangle: `tile_count_x` columns starting at `x`,
/// `tile_count_y` rows starting at `y`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl TileRect {
    pub fn right(&self) -> i64 {
        self.x + self.width - 1
    }

    pub fn bottom(&self) -> i64 {
        self.y + self.height - 1
    }
}

/// Coordinate mapping for a non-uniform tile grid: tile edges are
/// integer-aligned in mz, and fixed-height in scan index.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TileRange {
    mz_min: f64,
    mz_max: f64,
    mz_tile_width: f64,

    scan_index_min: i64,
    scan_index_max: i64,
    scan_index_tile_height: i64,
}

impl TileRange {
    pub fn new() -> Self {
        TileRange::default()
    }

    /// Floors `mz_start` and ceils `mz_end` so tile edges stay integer-aligned.
    pub fn set_mz(&mut self, mz_start: f64, mz_end: f64) -> Result<()> {
        if mz_start > mz_end {
            return Err(Error::bad_parameter("mz_start must be <= mz_end"));
        }
        self.mz_min = mz_start.floor();
        self.mz_max = mz_end.ceil();
        Ok(())
    }

    pub fn set_scan_index(&mut self, scan_index_start: i64, scan_index_end: i64) -> Result<()> {
        if scan_index_start > scan_index_end {
            return Err(Error::bad_parameter("scan_index_start must be <= scan_index_end"));
        }
        self.scan_index_min = scan_index_start;
        self.scan_index_max = scan_index_end;
        Ok(())
    }

    pub fn set_mz_tile_length(&mut self, length: f64) {
        self.mz_tile_width = length;
    }

    pub fn mz_tile_length(&self) -> f64 {
        self.mz_tile_width
    }

    pub fn set_scan_index_length(&mut self, length: i64) {
        self.scan_index_tile_height = length;
    }

    pub fn scan_index_tile_length(&self) -> i64 {
        self.scan_index_tile_height
    }

    pub fn mz_min(&self) -> f64 {
        self.mz_min
    }

    pub fn mz_max(&self) -> f64 {
        self.mz_max
    }

    pub fn scan_index_min(&self) -> i64 {
        self.scan_index_min
    }

    pub fn scan_index_max(&self) -> i64 {
        self.scan_index_max
    }

    fn compute_size(min: f64, max: f64, step: f64) -> i64 {
        if step <= 0.0 {
            return 0;
        }
        ((max - min + step) / step).floor() as i64
    }

    pub fn tile_count_x(&self) -> i64 {
        Self::compute_size(self.mz_min, self.mz_max, self.mz_tile_width)
    }

    pub fn tile_count_y(&self) -> i64 {
        Self::compute_size(self.scan_index_min as f64, self.scan_index_max as f64, self.scan_index_tile_height as f64)
    }

    /// First mz value belonging to tile `tile_x`.
    pub fn mz_at(&self, tile_x: i64) -> f64 {
        self.mz_min + tile_x as f64 * self.mz_tile_width
    }

    pub fn mz_tile_interval(&self, tile_x: i64) -> (f64, f64) {
        (self.mz_at(tile_x), self.mz_at(tile_x + 1))
    }

    pub fn scan_index_at(&self, tile_y: i64) -> i64 {
        self.scan_index_min + tile_y * self.scan_index_tile_height
    }

    pub fn last_scan_index_at(&self, tile_y: i64) -> i64 {
        self.scan_index_at(tile_y + 1) - 1
    }

    pub fn scan_index_interval(&self, tile_y: i64) -> (i64, i64) {
        (self.scan_index_at(tile_y), self.scan_index_at(tile_y + 1))
    }

    pub fn tile_offset(&self, scan_index: i64) -> i64 {
        scan_index - self.scan_index_at(self.tile_y(scan_index))
    }

    pub fn last_tile_offset(&self) -> i64 {
        self.scan_index_tile_height - 1
    }

    pub fn has_scan_index(&self, tile_y: i64, scan_index: i64) -> bool {
        tile_y == self.tile_y(scan_index)
    }

    /// Maps an mz value to its tile column, correcting the floor-division
    /// estimate for floating-point edge effects at tile boundaries.
    pub fn tile_x(&self, mz: f64) -> i64 {
        let mut tile_x = ((mz - self.mz_min) / self.mz_tile_width).floor() as i64;
        let lo = self.mz_at(tile_x);
        let hi = self.mz_at(tile_x + 1);
        if lo <= mz && mz < hi {
            tile_x
        } else if mz < lo {
            tile_x -= 1;
            tile_x
        } else if mz >= hi {
            tile_x += 1;
            tile_x
        } else {
            warn!("unexpected state computing tile_x for mz {mz}");
            tile_x
        }
    }

    pub fn tile_y(&self, scan_index: i64) -> i64 {
        scan_index.div_euclid(self.scan_index_tile_height)
    }

    pub fn tile_rect(&self, mz_min: f64, mz_max: f64, scan_index_start: i64, scan_index_end: i64) -> TileRect {
        let tile_x_start = self.tile_x(mz_min);
        let tile_x_end = self.tile_x(mz_max);
        let tile_y_start = self.tile_y(scan_index_start);
        let tile_y_end = self.tile_y(scan_index_end);
        TileRect {
            x: tile_x_start,
            y: tile_y_start,
            width: tile_x_end - tile_x_start + 1,
            height: tile_y_end - tile_y_start + 1,
        }
    }

    pub fn tile_rect_for_area(&self, area: &MzScanIndexRect) -> TileRect {
        self.tile_rect(area.mz.start(), area.mz.end(), area.scan_index.start(), area.scan_index.end())
    }

    pub fn area(&self) -> MzScanIndexRect {
        MzScanIndexRect {
            mz: MzInterval::new(self.mz_min, self.mz_max),
            scan_index: ScanIndexInterval::new(self.scan_index_min, self.scan_index_max),
        }
    }

    pub fn from_tile_rect(&self, rect: &TileRect) -> MzScanIndexRect {
        MzScanIndexRect {
            mz: MzInterval::new(self.mz_at(rect.x), self.mz_at(rect.right() + 1)),
            scan_index: ScanIndexInterval::new(self.scan_index_at(rect.y), self.last_scan_index_at(rect.bottom())),
        }
    }

    pub fn contains(&self, area: &MzScanIndexRect) -> bool {
        self.area().contains(area)
    }

    pub fn is_null(&self) -> bool {
        let scan_index_is_null = self.scan_index_min == 0 && self.scan_index_max == 0 && self.scan_index_tile_height == 0;
        if !scan_index_is_null {
            return false;
        }
        self.mz_min == 0.0 && self.mz_max == 0.0 && self.mz_tile_width == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_range() -> TileRange {
        let mut range = TileRange::new();
        range.set_mz(0.0, 1000.0).unwrap();
        range.set_mz_tile_length(100.0);
        range.set_scan_index(0, 999).unwrap();
        range.set_scan_index_length(64);
        range
    }

    #[test]
    fn set_mz_floors_and_ceils() {
        let mut range = TileRange::new();
        range.set_mz(10.4, 20.1).unwrap();
        assert_eq!(range.mz_min(), 10.0);
        assert_eq!(range.mz_max(), 21.0);
    }

    #[test]
    fn set_mz_rejects_reversed_range() {
        let mut range = TileRange::new();
        assert!(range.set_mz(5.0, 1.0).is_err());
    }

    #[test]
    fn tile_x_round_trips_through_mz_at() {
        let range = sample_range();
        for k in 0..range.tile_count_x() {
            let mz = range.mz_at(k);
            assert_eq!(range.tile_x(mz), k);
        }
    }

    #[test]
    fn tile_x_boundary_classification() {
        let range = sample_range();
        assert_eq!(range.tile_x(99.999999999), 0);
        assert_eq!(range.tile_x(100.0), 1);
        assert_eq!(range.tile_x(199.999999999), 1);
    }

    #[test]
    fn tile_offset_stays_within_tile_height() {
        let range = sample_range();
        for scan_index in 0..300 {
            let offset = range.tile_offset(scan_index);
            assert!(offset >= 0 && offset < range.scan_index_tile_length());
        }
    }

    #[test]
    fn tile_rect_covers_requested_area() {
        let range = sample_range();
        let rect = range.tile_rect(50.0, 250.0, 10, 200);
        assert_eq!(rect.x, 0);
        assert_eq!(rect.right(), 2);
        assert_eq!(rect.y, 0);
        assert_eq!(rect.bottom(), 3);
    }

    #[test]
    fn is_null_true_for_default() {
        assert!(TileRange::new().is_null());
    }

    #[test]
    fn is_null_false_after_configuration() {
        assert!(!sample_range().is_null());
    }
}
