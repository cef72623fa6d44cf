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

//! An ordered 2-D point sequence with a `sorted_ascending_x` invariant, plus
//! the binary-search and linear-merge evaluators, area/centroid/critical-point
//! algorithms layered on top of it.

use std::ops::{Add, Div, Mul, Sub};

use log::warn;
use ms_errors::{Error, Result};

/// A single (x, y) sample. Ordering is by x or by y only, never lexicographic.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f64> for Point {
    type Output = Point;
    fn div(self, rhs: f64) -> Point {
        Point::new(self.x / rhs, self.y / rhs)
    }
}

pub fn less_x(a: &Point, b: &Point) -> std::cmp::Ordering {
    a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal)
}

pub fn less_y(a: &Point, b: &Point) -> std::cmp::Ordering {
    a.y.partial_cmp(&b.y).unwrap_or(std::cmp::Ordering::Equal)
}

/// A query segment used by [`PlotBase::find_intersection_points`].
#[derive(Clone, Copy, Debug)]
pub struct Line2d {
    pub a: Point,
    pub b: Point,
}

impl Line2d {
    pub fn new(a: Point, b: Point) -> Self {
        Line2d { a, b }
    }

    fn matches_endpoint(&self, p: Point) -> bool {
        p == self.a || p == self.b
    }
}

bitflags::bitflags! {
    /// Which kinds of crossing [`PlotBase::find_intersection_points`] reports.
    pub struct IntersectionFlags: u32 {
        const MID_POINTS = 0b01;
        const END_POINTS = 0b10;
        const ALL_POINTS = Self::MID_POINTS.bits | Self::END_POINTS.bits;
    }
}

/// How [`PlotBase::compute_area_fast`] treats trapezoids with a net-negative area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeAreaMethod {
    /// Signed areas are kept as-is, including negative ones.
    KeepNegativeAreas,
    /// Signed areas are kept per-trapezoid, but the final sum is clamped to zero.
    KeepNegativeAreasButClampTotal,
    /// Each trapezoid's negative area is zeroed before summing.
    IgnoreNegativeAreas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FindPeakOption {
    FindMax,
    FindMin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CentroidAlgorithmMethod {
    /// Choose the local maximum value as-is -- poor but robust.
    NaiveMaxValue,
    /// Weight the two neighbors using absolute intensity.
    WeightedAverage,
    /// Weight the two neighbors using intensity relative to the triplet's minimum. Best.
    WeightedAverageRelativeWeight,
}

const OUT_OF_BOUNDS_FUDGE: f64 = 1e-30;

fn interpolate_at(p0: Point, p1: Point, x: f64) -> f64 {
    if p1.x == p0.x {
        return p0.y;
    }
    p0.y + (p1.y - p0.y) * (x - p0.x) / (p1.x - p0.x)
}

fn fuzzy_compare(a: f64, b: f64, tol: f64) -> bool {
    if a == 0.0 && b == 0.0 {
        return true;
    }
    let denom = a.abs().max(b.abs());
    (a - b).abs() / denom <= tol
}

/// Ordered 2-D point sequence with a `sorted_ascending_x` invariant.
///
/// Appending a point less than the current last point clears the flag;
/// sorting sets it. Binary-search evaluation and the linear-merge evaluator
/// both require the flag set, falling back to a linear scan otherwise.
#[derive(Clone, Debug, Default)]
pub struct PlotBase {
    points: Vec<Point>,
    sorted_ascending_x: bool,
}

impl PlotBase {
    pub fn new() -> Self {
        PlotBase {
            points: Vec::new(),
            sorted_ascending_x: true,
        }
    }

    pub fn from_points(points: Vec<Point>) -> Self {
        let sorted_ascending_x = is_sorted_ascending_x(&points);
        PlotBase {
            points,
            sorted_ascending_x,
        }
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.sorted_ascending_x = true;
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Appends one point to end of list. If unsorted relative to the current
    /// last point, clears the sorted flag unless `sort_by_x` is requested.
    pub fn add_point(&mut self, point: Point, sort_by_x: bool) {
        if let Some(last) = self.points.last() {
            if point.x < last.x {
                self.sorted_ascending_x = false;
            }
        }
        self.points.push(point);
        if sort_by_x {
            self.sort_point_list_by_x(true);
        }
    }

    pub fn add_points(&mut self, points: &[Point]) {
        for &p in points {
            self.add_point(p, false);
        }
    }

    pub fn remove_point(&mut self, idx: usize) -> Option<Point> {
        if idx < self.points.len() {
            Some(self.points.remove(idx))
        } else {
            None
        }
    }

    /// Resizes the list, padding with `Point::default()` when growing.
    /// Tracks whether growth/truncation could have invalidated the sorted flag.
    pub fn resize_point_list(&mut self, size: usize) {
        if size == self.points.len() {
            return;
        }
        let previous_size = self.points.len();
        let previous_last = self.points.last().copied();
        self.points.resize(size, Point::default());

        if self.sorted_ascending_x {
            if self.points.len() > previous_size {
                if let Some(last) = previous_last {
                    if last.x > 0.0 {
                        self.sorted_ascending_x = false;
                    }
                }
            }
        } else if self.points.len() < previous_size {
            self.sorted_ascending_x = is_sorted_ascending_x(&self.points);
        }
    }

    pub fn sort_point_list_by_x(&mut self, ascending: bool) {
        if ascending {
            self.points.sort_by(less_x);
        } else {
            self.points.sort_by(|a, b| less_x(b, a));
        }
        self.sorted_ascending_x = ascending;
    }

    pub fn is_sorted_ascending_x(&self) -> bool {
        is_sorted_ascending_x(&self.points)
    }

    /// Call only when certain the points are ascending by x; skips the scan.
    pub fn set_sorted_ascending_x_unchecked(&mut self, val: bool) {
        self.sorted_ascending_x = val;
    }

    /// Average x-spacing assuming uniformly spaced points; 0 for <= 1 points.
    pub fn delta(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        (self.points.last().unwrap().x - self.points[0].x) / (self.points.len() - 1) as f64
    }

    pub fn get_x_bound(&self) -> Option<(f64, f64)> {
        if self.points.is_empty() {
            return None;
        }
        let mut lo = self.points[0].x;
        let mut hi = self.points[0].x;
        for p in &self.points {
            lo = lo.min(p.x);
            hi = hi.max(p.x);
        }
        Some((lo, hi))
    }

    /// Largest index i with `points[i].x <= xloc`.
    ///
    /// `oob_right_returns_none`: when `xloc` is beyond the last point, return
    /// `None` if true, otherwise the last index. Always `None` when `xloc` is
    /// left of the first point.
    fn index_less_or_equal(&self, xloc: f64, oob_right_returns_none: bool) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        if xloc < self.points[0].x {
            return None;
        }
        if xloc > self.points.last().unwrap().x {
            return if oob_right_returns_none {
                None
            } else {
                Some(self.points.len() - 1)
            };
        }
        // binary search for rightmost index with points[idx].x <= xloc
        let mut lo = 0usize;
        let mut hi = self.points.len() - 1;
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.points[mid].x <= xloc {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Some(lo)
    }

    /// Linear scan from `search_start_idx` for the last index strictly less than `xloc`.
    fn index_less_than_linear_from(&self, xloc: f64, search_start_idx: usize) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let mut idx = search_start_idx.min(self.points.len() - 1);
        if self.points[idx].x >= xloc {
            return if idx == 0 { None } else { Some(idx - 1) };
        }
        while idx + 1 < self.points.len() && self.points[idx + 1].x < xloc {
            idx += 1;
        }
        Some(idx)
    }

    /// Evaluates y at `x`. With the sorted flag set this binary-searches;
    /// otherwise it falls back to a linear scan for the first crossing.
    pub fn evaluate(&self, x: f64, interpolate: bool, use_boundary_value: bool) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let first = self.points[0];
        let last = *self.points.last().unwrap();
        if x < first.x {
            return if use_boundary_value { first.y } else { 0.0 };
        }
        if x > last.x {
            return if use_boundary_value { last.y } else { 0.0 };
        }

        if self.sorted_ascending_x {
            let idx = match self.index_less_or_equal(x, true) {
                Some(idx) => idx,
                None => return 0.0,
            };
            if idx < self.points.len() - 1 {
                let p0 = self.points[idx];
                let p1 = self.points[idx + 1];
                if interpolate {
                    interpolate_at(p0, p1, x)
                } else if (p0.x - x).abs() < (p1.x - x).abs() {
                    p0.y
                } else {
                    p1.y
                }
            } else {
                self.points[idx].y
            }
        } else {
            for (i, point) in self.points.iter().enumerate() {
                if x <= point.x {
                    if i == 0 {
                        return point.y;
                    }
                    let prev = self.points[i - 1];
                    return if interpolate {
                        interpolate_at(prev, *point, x)
                    } else if (prev.x - x).abs() < (point.x - x).abs() {
                        prev.y
                    } else {
                        point.y
                    };
                }
            }
            0.0
        }
    }

    /// Linear-complexity parallel traversal of two sorted sequences: `self`'s
    /// points and `sorted_xs`. Out-of-domain x maps to 0. Where `self` holds
    /// duplicate x-values, the **last** duplicate is used as the left bracket
    /// (this resolves a documented ambiguity in the originating tool: it would
    /// otherwise inconsistently pick the first or last duplicate).
    pub fn evaluate_linear(&self, sorted_xs: &[f64]) -> Vec<f64> {
        let n = self.points.len();
        if sorted_xs.is_empty() || n == 0 {
            return vec![0.0; sorted_xs.len()];
        }
        let first = self.points[0].x;
        let last = self.points[n - 1].x;
        let mut out = vec![0.0; sorted_xs.len()];
        let mut idx = 0usize;
        for (k, &x) in sorted_xs.iter().enumerate() {
            if x < first || x > last {
                continue;
            }
            // Advances through any run of equal x so the left bracket is the
            // last duplicate, not the first.
            while idx + 1 < n && self.points[idx + 1].x <= x {
                idx += 1;
            }
            if idx + 1 >= n {
                out[k] = self.points[idx].y;
            } else {
                out[k] = interpolate_at(self.points[idx], self.points[idx + 1], x);
            }
        }
        out
    }

    pub fn evaluate_list(&self, points: &mut [Point]) {
        for p in points.iter_mut() {
            p.y = self.evaluate(p.x, true, false);
        }
    }

    fn compute_area_trapezoid(p1: Point, p2: Point, method: ComputeAreaMethod) -> f64 {
        if (p1.y > 0.0 && p2.y < 0.0) || (p1.y < 0.0 && p2.y > 0.0) {
            // zero crossing: split into two triangles against the x-axis
            let t = p1.y / (p1.y - p2.y);
            let crossing_x = p1.x + t * (p2.x - p1.x);
            let h1 = crossing_x - p1.x;
            let h2 = p2.x - crossing_x;
            let mut area_a = h1.abs() * p1.y;
            let mut area_b = h2.abs() * p2.y;
            if method == ComputeAreaMethod::IgnoreNegativeAreas {
                if area_a < 0.0 {
                    area_a = 0.0;
                }
                if area_b < 0.0 {
                    area_b = 0.0;
                }
            }
            return 0.5 * (area_a + area_b);
        }
        let h = p2.x - p1.x;
        let mut area = h * (p1.y + p2.y) * 0.5;
        if method == ComputeAreaMethod::IgnoreNegativeAreas && area < 0.0 {
            area = 0.0;
        }
        area
    }

    /// Trapezoid area between `(t_start, evaluate(t_start))`, intervening
    /// sample points strictly inside `(t_start, t_end)`, and
    /// `(t_end, evaluate(t_end))`.
    pub fn compute_area_fast(&self, t_start: f64, t_end: f64, method: ComputeAreaMethod) -> f64 {
        if self.points.is_empty() || t_start == t_end {
            return 0.0;
        }
        let (t_start, t_end) = if t_end < t_start {
            (t_end, t_start)
        } else {
            (t_start, t_end)
        };

        if !self.sorted_ascending_x {
            let mut sorted = self.clone();
            sorted.sort_point_list_by_x(true);
            return sorted.compute_area_fast(t_start, t_end, method);
        }

        let first = self.points[0];
        let last = *self.points.last().unwrap();
        if t_start >= last.x || t_end <= first.x {
            return 0.0;
        }

        let start = if t_start < first.x {
            first
        } else {
            Point::new(t_start, self.evaluate(t_start, true, false))
        };
        let end = if t_end > last.x {
            last
        } else {
            Point::new(t_end, self.evaluate(t_end, true, false))
        };

        let start_idx = self.index_less_or_equal(t_start, false).unwrap_or(0);
        let mut first_index: Option<usize> = None;
        let mut last_index: Option<usize> = None;
        for (i, point) in self.points.iter().enumerate().skip(start_idx) {
            if start.x < point.x && point.x < end.x {
                if first_index.is_none() {
                    first_index = Some(i);
                }
                last_index = Some(i);
            } else if point.x > end.x {
                break;
            }
        }

        let mut total_area = match (first_index, last_index) {
            (Some(first_i), Some(last_i)) => {
                let mut sum = 0.0;
                for i in first_i..last_i {
                    sum += Self::compute_area_trapezoid(self.points[i], self.points[i + 1], method);
                }
                sum += Self::compute_area_trapezoid(start, self.points[first_i], method);
                sum += Self::compute_area_trapezoid(self.points[last_i], end, method);
                sum
            }
            _ => Self::compute_area_trapezoid(start, end, method),
        };

        if method == ComputeAreaMethod::KeepNegativeAreasButClampTotal && total_area < 0.0 {
            total_area = 0.0;
        }
        total_area
    }

    pub fn compute_area_seconds_unit(&self, t_start: f64, t_end: f64, method: ComputeAreaMethod) -> f64 {
        self.compute_area_fast(t_start, t_end, method) * 60.0
    }

    /// Critical-point detection with plateau tolerance: a run of equal y is
    /// classified by walking left to the first unequal sample.
    pub fn get_max_index_list(&self, range: Option<(usize, usize)>) -> Vec<usize> {
        self.get_extrema_index_list(range, true)
    }

    pub fn get_min_index_list(&self, range: Option<(usize, usize)>) -> Vec<usize> {
        self.get_extrema_index_list(range, false)
    }

    fn get_extrema_index_list(&self, range: Option<(usize, usize)>, want_max: bool) -> Vec<usize> {
        let n = self.points.len();
        let mut out = Vec::new();
        if n == 0 {
            return out;
        }
        let (start, end) = range.unwrap_or((0, n - 1));
        let is_extreme = |a: f64, b: f64| if want_max { a < b } else { a > b };
        let is_counter = |a: f64, b: f64| if want_max { a > b } else { a < b };

        if start == 0 && n > 1 {
            let b = self.points[0].y;
            let c = self.points[1].y;
            if is_counter(b, c) {
                out.push(0);
            }
        }
        for i in (start + 1)..end {
            let a = self.points[i - 1].y;
            let b = self.points[i].y;
            let c = self.points[i + 1].y;
            if is_extreme(a, b) && is_counter(b, c) {
                out.push(i);
            } else if a == b && is_counter(b, c) {
                for j in (0..i.saturating_sub(1)).rev() {
                    let aj = self.points[j].y;
                    if is_extreme(aj, b) {
                        out.push(i);
                        break;
                    } else if is_counter(aj, b) {
                        break;
                    }
                }
            }
        }
        if n > 1 && end == n - 1 {
            let a = self.points[n - 2].y;
            let b = self.points[n - 1].y;
            if is_counter(b, a) {
                out.push(n - 1);
            } else if a == b {
                for j in (0..n.saturating_sub(2)).rev() {
                    let aj = self.points[j].y;
                    if is_counter(aj, b) {
                        out.push(n - 1);
                        break;
                    } else if is_extreme(aj, b) {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Merge of [`get_min_index_list`] and [`get_max_index_list`], always alternating.
    pub fn get_min_max_index_list(&self, range: Option<(usize, usize)>) -> Vec<usize> {
        let mins = self.get_min_index_list(range);
        let maxs = self.get_max_index_list(range);
        let mut merged = Vec::with_capacity(mins.len() + maxs.len());
        let (mut i, mut j) = (0, 0);
        while i < mins.len() && j < maxs.len() {
            if mins[i] <= maxs[j] {
                merged.push(mins[i]);
                i += 1;
            } else {
                merged.push(maxs[j]);
                j += 1;
            }
        }
        merged.extend_from_slice(&mins[i..]);
        merged.extend_from_slice(&maxs[j..]);
        merged
    }

    pub fn make_points_from_index(&self, idx_list: &[usize]) -> Result<Vec<Point>> {
        let mut points = Vec::with_capacity(idx_list.len());
        for &idx in idx_list {
            let p = *self
                .points
                .get(idx)
                .ok_or_else(|| Error::bad_parameter(format!("index {idx} out of bounds")))?;
            points.push(p);
        }
        Ok(points)
    }

    /// Classical "peakfinder" walk over the alternating critical-point list:
    /// a new peak must exceed the running candidate by `selectivity` and
    /// then be confirmed by a subsequent drop of at least `selectivity`.
    pub fn find_peaks_index(
        &self,
        selectivity: f64,
        option: FindPeakOption,
        range: Option<(usize, usize)>,
    ) -> Result<Vec<usize>> {
        let crit_idx = self.get_min_max_index_list(range);
        let mut crit_points = self.make_points_from_index(&crit_idx)?;
        if option == FindPeakOption::FindMin {
            for p in crit_points.iter_mut() {
                p.y = -p.y;
            }
        }
        if crit_points.is_empty() {
            return Ok(Vec::new());
        }

        let min_mag = crit_points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let mut temp_mag = min_mag;
        let mut temp_loc: Option<usize> = None;
        let mut found_peak = false;
        let mut left_min = min_mag;
        let mut out = Vec::new();

        for i in 0..crit_points.len().saturating_sub(1) {
            let y = crit_points[i].y;
            if found_peak {
                temp_mag = min_mag;
                found_peak = false;
            }
            if y > temp_mag && y > left_min + selectivity {
                temp_loc = Some(crit_idx[i]);
                temp_mag = y;
                continue;
            }
            if !found_peak && temp_mag > selectivity + y {
                found_peak = true;
                left_min = y;
                if let Some(loc) = temp_loc {
                    out.push(loc);
                }
            } else if y < left_min {
                left_min = y;
            }
        }

        if crit_points.len() > 1 {
            let i = crit_points.len() - 1;
            let y = crit_points[i].y;
            if y > temp_mag && y > left_min + selectivity {
                out.push(crit_idx[i]);
            } else if !found_peak && temp_mag > min_mag {
                if let Some(loc) = temp_loc {
                    out.push(loc);
                }
            }
        }
        Ok(out)
    }

    /// For each local maximum, a 3-point weighted centroid over its two
    /// neighbors. `RelativeWeight` subtracts the triplet's minimum before
    /// weighting; `NaiveMaxValue` returns the local-max point unchanged.
    pub fn make_centroided_points(&self, method: CentroidAlgorithmMethod) -> Result<Vec<Point>> {
        let idx_list = self.get_max_index_list(None);
        if method == CentroidAlgorithmMethod::NaiveMaxValue {
            return self.make_points_from_index(&idx_list);
        }

        let n = self.points.len();
        let mut out = Vec::with_capacity(idx_list.len());
        for index in idx_list {
            if index > 0 && index < n - 1 {
                let p1 = self.points[index - 1];
                let p2 = self.points[index];
                let p3 = self.points[index + 1];
                let mut w1 = p1.y.max(0.0);
                let mut w2 = p2.y.max(0.0);
                let mut w3 = p3.y.max(0.0);
                if method == CentroidAlgorithmMethod::WeightedAverageRelativeWeight {
                    let lowest = w1.min(w2).min(w3);
                    w1 -= lowest;
                    w2 -= lowest;
                    w3 -= lowest;
                }
                let denom = w1 + w2 + w3;
                if denom > 1e-5 {
                    let x = (p1.x * w1 + p2.x * w2 + p3.x * w3) / denom;
                    let y = self.evaluate(x, true, false);
                    out.push(Point::new(x, y));
                } else {
                    out.push(self.points[index]);
                }
            } else {
                out.push(self.points[index]);
            }
        }
        Ok(out)
    }

    /// Walks segments in the query's x-range and reports exact-match,
    /// transverse, and parallel-overlap crossings with `line`. A
    /// near-zero determinant (within `1e-30`) is treated as non-intersecting.
    pub fn find_intersection_points(
        &self,
        line: Line2d,
        flags: IntersectionFlags,
    ) -> (Vec<Point>, Vec<usize>, Vec<IntersectionFlags>) {
        let mut out_points = Vec::new();
        let mut out_idx = Vec::new();
        let mut out_flags = Vec::new();
        let n = self.points.len();
        if n == 0 {
            return (out_points, out_idx, out_flags);
        }

        let query = if line.a.x > line.b.x {
            Line2d::new(line.b, line.a)
        } else {
            line
        };

        let first = self.points[0];
        let start_idx = self.index_less_or_equal(query.a.x, true).unwrap_or(if query.a.x < first.x {
            0
        } else {
            n - 1
        });
        let mut end_idx = self
            .index_less_or_equal(query.b.x, true)
            .map(|i| i + 1)
            .unwrap_or(if query.b.x < first.x { 0 } else { n - 1 });
        if end_idx >= n {
            end_idx = n - 1;
        }

        for i in start_idx..end_idx {
            let p0 = self.points[i];
            let p1 = self.points[i + 1];

            if p0 == query.a && p1 == query.b {
                if flags.contains(IntersectionFlags::END_POINTS) {
                    out_points.push(p0);
                    out_idx.push(i);
                    out_flags.push(IntersectionFlags::END_POINTS);
                    if i == end_idx - 1 {
                        out_points.push(p1);
                        out_idx.push(i);
                        out_flags.push(IntersectionFlags::END_POINTS);
                    }
                }
                continue;
            }

            let det = (query.a.x - query.b.x) * (p0.y - p1.y) - (query.a.y - query.b.y) * (p0.x - p1.x);
            if det.abs() <= OUT_OF_BOUNDS_FUDGE {
                // parallel: emit endpoints if line2 sits on top of the query line
                if flags.intersects(IntersectionFlags::MID_POINTS | IntersectionFlags::END_POINTS) {
                    let dir_query = query.b - query.a;
                    let dir_seg = p0 - query.a;
                    let cross = dir_query.x * dir_seg.y - dir_query.y * dir_seg.x;
                    if cross.abs() <= OUT_OF_BOUNDS_FUDGE {
                        out_points.push(p0);
                        out_idx.push(i);
                        out_flags.push(IntersectionFlags::MID_POINTS | IntersectionFlags::END_POINTS);
                        if i == end_idx - 1 {
                            out_points.push(p1);
                            out_idx.push(i + 1);
                            out_flags.push(IntersectionFlags::MID_POINTS | IntersectionFlags::END_POINTS);
                        }
                    }
                }
                continue;
            }

            let t = ((query.a.x - p0.x) * (p0.y - p1.y) - (query.a.y - p0.y) * (p0.x - p1.x)) / det;
            let u = ((query.a.x - p0.x) * (query.a.y - query.b.y) - (query.a.y - p0.y) * (query.a.x - query.b.x)) / det;
            let intersect = Point::new(
                query.a.x + t * (query.b.x - query.a.x),
                query.a.y + t * (query.b.y - query.a.y),
            );

            if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
                if flags.contains(IntersectionFlags::MID_POINTS) {
                    out_points.push(intersect);
                    out_idx.push(i);
                    out_flags.push(IntersectionFlags::MID_POINTS);
                }
            } else if flags.contains(IntersectionFlags::END_POINTS) {
                if query.matches_endpoint(p0) {
                    out_points.push(p0);
                    out_idx.push(i);
                    out_flags.push(IntersectionFlags::END_POINTS);
                }
                if i == end_idx - 1 && query.matches_endpoint(p1) {
                    out_points.push(p1);
                    out_idx.push(i + 1);
                    out_flags.push(IntersectionFlags::END_POINTS);
                }
            }
        }
        (out_points, out_idx, out_flags)
    }

    pub fn average_sample_width(&self) -> Result<f64> {
        if self.points.len() < 2 {
            warn!("average_sample_width called on a plot with {} points", self.points.len());
            return Err(Error::bad_parameter("need at least 2 points to average sample width"));
        }
        let first = self.points[0].x;
        let last = self.points.last().unwrap().x;
        Ok((last - first) / (self.points.len() - 1) as f64)
    }

    /// Subtracts `other`'s curve, evaluated at each of this plot's x
    /// positions, from this plot's y-values. `other` is treated as zero
    /// outside its own domain.
    pub fn subtract_by(&mut self, other: &[Point]) {
        let other_plot = PlotBase::from_points(other.to_vec());
        for p in self.points.iter_mut() {
            let v = other_plot.evaluate(p.x, true, false);
            p.y -= v;
        }
    }

    pub fn apply_random_y_scale(&mut self, scale_amount: f64) {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for p in self.points.iter_mut() {
            let r: f64 = rng.gen_range(0.0..1.0);
            p.y *= 1.0 + r * scale_amount;
        }
    }

    /// True if each half of the series has (recursively) nearly equal
    /// duration and every consecutive sample delta agrees within `negligible_ratio`.
    pub fn is_uniform(&self, negligible_ratio: f64) -> bool {
        if self.points.len() < 3 {
            return true;
        }
        if !is_globally_uniform(&self.points, negligible_ratio) {
            return false;
        }
        let mut min_duration = self.points[1].x - self.points[0].x;
        let mut max_duration = min_duration;
        for i in 1..self.points.len() {
            let duration = self.points[i].x - self.points[i - 1].x;
            min_duration = min_duration.min(duration);
            max_duration = max_duration.max(duration);
        }
        fuzzy_compare(min_duration, max_duration, negligible_ratio)
    }

    /// Uniform re-sample at `sampling_interval` spacing, via [`Self::evaluate`].
    pub fn make_resampled_plot(&self, sampling_interval: f64) -> Result<PlotBase> {
        if sampling_interval <= 0.0 {
            return Err(Error::bad_parameter("sampling_interval must be positive"));
        }
        let Some((lo, hi)) = self.get_x_bound() else {
            return Ok(PlotBase::new());
        };
        let n = ((hi - lo) / sampling_interval).floor() as usize + 1;
        self.make_resampled_plot_target_size(n)
    }

    pub fn make_resampled_plot_target_size(&self, target_number_of_points: usize) -> Result<PlotBase> {
        let points = self.make_resampled_points(target_number_of_points)?;
        Ok(PlotBase::from_points(points))
    }

    pub fn make_resampled_plot_max_points(&self, max_number_of_points: usize) -> Result<Vec<Point>> {
        self.make_resampled_points(max_number_of_points)
    }

    fn make_resampled_points(&self, n: usize) -> Result<Vec<Point>> {
        if n == 0 {
            return Err(Error::bad_parameter("resample target size must be positive"));
        }
        let Some((lo, hi)) = self.get_x_bound() else {
            return Ok(Vec::new());
        };
        if n == 1 {
            return Ok(vec![Point::new(lo, self.evaluate(lo, true, false))]);
        }
        let step = (hi - lo) / (n - 1) as f64;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let x = lo + step * i as f64;
            out.push(Point::new(x, self.evaluate(x, true, false)));
        }
        Ok(out)
    }
}

fn is_sorted_ascending_x(points: &[Point]) -> bool {
    points.windows(2).all(|w| w[0].x <= w[1].x)
}

fn is_globally_uniform(points: &[Point], negligible_ratio: f64) -> bool {
    fn helper(points: &[Point], start: usize, end: usize, negligible_ratio: f64) -> bool {
        let n = end - start;
        if n < 3 {
            return true;
        }
        let half = n / 2;
        let mid = start + half;
        let first_duration = points[mid].x - points[start].x;
        let second_duration = points[end - 1].x - points[mid].x;
        let local_tol = negligible_ratio / half as f64;
        if !fuzzy_compare(first_duration, second_duration, local_tol) {
            return false;
        }
        helper(points, start, mid, negligible_ratio) && helper(points, mid, end, negligible_ratio)
    }
    helper(points, 0, points.len(), negligible_ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plot(pairs: &[(f64, f64)]) -> PlotBase {
        let mut p = PlotBase::new();
        for &(x, y) in pairs {
            p.add_point(Point::new(x, y), false);
        }
        p
    }

    #[test]
    fn evaluate_linear_exact_boundaries_s1() {
        let p = plot(&[(0.0, 100.0), (100.0, 200.0)]);
        assert_relative_eq!(p.evaluate(0.0, true, false), 100.0);
        assert_relative_eq!(p.evaluate(50.0, true, false), 150.0);
        assert_relative_eq!(p.evaluate(100.0, true, false), 200.0);
        for x in [-1e8, -100.0, -1e-5] {
            assert_eq!(p.evaluate(x, true, false), 0.0);
        }
        for x in [100.0001, 200.0, 1e8] {
            assert_eq!(p.evaluate(x, true, false), 0.0);
        }
    }

    #[test]
    fn evaluate_linear_matches_evaluate_on_sorted_xs() {
        let p = plot(&[(0.0, 0.0), (1.0, 10.0), (2.0, 0.0), (3.0, 10.0)]);
        let xs = vec![-1.0, 0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 4.0];
        let fast = p.evaluate_linear(&xs);
        let slow: Vec<f64> = xs.iter().map(|&x| p.evaluate(x, true, false)).collect();
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn evaluate_linear_last_duplicate_wins() {
        // Two points share x=1.0; the bracket should use the *second* (y=20) as the left point.
        let p = plot(&[(0.0, 0.0), (1.0, 10.0), (1.0, 20.0), (2.0, 40.0)]);
        let out = p.evaluate_linear(&[1.5]);
        assert_relative_eq!(out[0], 30.0);
    }

    #[test]
    fn make_centroided_points_plateau_scenario_s2() {
        let p = plot(&[
            (0.0, 0.0),
            (5.0, 10.0),
            (10.0, -2.0),
            (15.0, 10.0),
            (20.0, 0.0),
            (25.0, 10.0),
            (30.0, 5.0),
        ]);
        let centroids = p
            .make_centroided_points(CentroidAlgorithmMethod::WeightedAverageRelativeWeight)
            .unwrap();
        assert_eq!(centroids.len(), 3);
        assert_relative_eq!(centroids[0].x, 5.0);
        assert_relative_eq!(centroids[0].y, 10.0);
        assert_relative_eq!(centroids[1].x, 15.0);
        assert_relative_eq!(centroids[1].y, 10.0);
        assert_relative_eq!(centroids[2].x, 26.666_666_666_666_668, epsilon = 1e-9);
        assert_relative_eq!(centroids[2].y, 8.333_333_333_333_334, epsilon = 1e-9);
    }

    #[test]
    fn sort_point_list_by_x_sets_sorted_flag() {
        let mut p = plot(&[(3.0, 1.0), (1.0, 2.0), (2.0, 3.0)]);
        assert!(!p.is_sorted_ascending_x());
        p.sort_point_list_by_x(true);
        assert!(p.is_sorted_ascending_x());
        assert_eq!(p.points()[0].x, 1.0);
    }

    #[test]
    fn find_peaks_index_pure_sinusoid() {
        let mut pts = Vec::new();
        let n = 2000;
        for i in 0..=n {
            let t = i as f64 / n as f64 * 4.0 * std::f64::consts::PI;
            pts.push(Point::new(t, t.sin()));
        }
        let p = PlotBase::from_points(pts);
        let peaks = p.find_peaks_index(0.1, FindPeakOption::FindMax, None).unwrap();
        let peak_xs: Vec<f64> = peaks.iter().map(|&i| p.points()[i].x).collect();
        let expected: Vec<f64> = (0..2)
            .map(|k| std::f64::consts::FRAC_PI_2 + 2.0 * std::f64::consts::PI * k as f64)
            .collect();
        assert_eq!(peak_xs.len(), expected.len());
        for (a, b) in peak_xs.iter().zip(expected.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-2);
        }
    }

    #[test]
    fn compute_area_fast_trapezoid() {
        let p = plot(&[(0.0, 0.0), (10.0, 10.0)]);
        let area = p.compute_area_fast(0.0, 10.0, ComputeAreaMethod::KeepNegativeAreas);
        assert_relative_eq!(area, 50.0);
    }

    #[test]
    fn is_uniform_true_for_evenly_spaced_points() {
        let p = plot(&[(0.0, 1.0), (1.0, 2.0), (2.0, 3.0), (3.0, 4.0), (4.0, 5.0)]);
        assert!(p.is_uniform(0.01));
    }

    #[test]
    fn is_uniform_false_for_unevenly_spaced_points() {
        let p = plot(&[(0.0, 1.0), (1.0, 2.0), (5.0, 3.0), (6.0, 4.0)]);
        assert!(!p.is_uniform(0.01));
    }

    #[test]
    fn average_sample_width_rejects_short_lists() {
        let p = plot(&[(0.0, 1.0)]);
        assert!(p.average_sample_width().is_err());
    }

    #[test]
    fn subtract_by_zero_outside_domain() {
        let mut p = plot(&[(0.0, 10.0), (5.0, 10.0), (10.0, 10.0)]);
        p.subtract_by(&[(4.0, 3.0), (6.0, 3.0)].map(|(x, y)| Point::new(x, y)));
        assert_relative_eq!(p.points()[0].y, 10.0); // x=0 outside [4,6] domain -> subtract 0
        assert_relative_eq!(p.points()[1].y, 7.0); // x=5 inside -> subtract 3
    }
}
