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

//! Time-warp alignment between two runs: knot placement over a pair of
//! resampled/normalized series, a banded dynamic-programming core that maps
//! knots in A to knots in B, and piecewise-linear `warp`/`unwarp` lookups
//! over the resulting anchor pairs.

use log::debug;
use ms_errors::{Error, Result};
use ms_plot_base::{Point, PlotBase};

#[derive(Clone, Debug, PartialEq)]
pub struct TimeWarpOptions {
    pub number_of_segments: i64,
    pub stretch_penalty: f64,
    pub start_time_offset_b: f64,
    pub global_skew: i64,
    pub normalize_scale_factor: i64,
    pub number_of_samples_per_segment: i64,
    pub max_total_number_of_points: usize,
    pub mz_match_ppm: f64,
    pub anchor_time_list: Vec<f64>,
}

impl Default for TimeWarpOptions {
    fn default() -> Self {
        TimeWarpOptions {
            number_of_segments: 600,
            stretch_penalty: 0.0,
            start_time_offset_b: 0.0,
            global_skew: 500,
            normalize_scale_factor: 0,
            number_of_samples_per_segment: 4,
            max_total_number_of_points: 10_000,
            mz_match_ppm: 100.0,
            anchor_time_list: Vec::new(),
        }
    }
}

/// A pair of equal-length, ascending-sorted anchor arrays: `anchors_a[i]`
/// corresponds to `anchors_b[i]`. Mapping between the two time bases is
/// piecewise-linear between knots, constant-offset outside them.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeWarp2D {
    anchors_a: Vec<f64>,
    anchors_b: Vec<f64>,
}

impl TimeWarp2D {
    pub fn from_anchors(anchors_a: Vec<f64>, anchors_b: Vec<f64>) -> Result<Self> {
        if anchors_a.is_empty() || anchors_b.is_empty() {
            return Err(Error::bad_parameter("anchor lists must be non-empty"));
        }
        if anchors_a.len() != anchors_b.len() {
            return Err(Error::bad_parameter("anchor lists must be the same length"));
        }
        Ok(TimeWarp2D { anchors_a, anchors_b })
    }

    pub fn anchors(&self) -> (&[f64], &[f64]) {
        (&self.anchors_a, &self.anchors_b)
    }

    /// Maps a time in A's domain to its corresponding time in B.
    pub fn warp(&self, t: f64) -> f64 {
        piecewise_linear(&self.anchors_a, &self.anchors_b, t)
    }

    /// Maps a time in B's domain back to A.
    pub fn unwarp(&self, t: f64) -> f64 {
        piecewise_linear(&self.anchors_b, &self.anchors_a, t)
    }

    /// Resamples/normalizes both series, places knots on A, runs the banded
    /// DP core to find each knot's counterpart in B, and converts the
    /// resulting index pairs back to world times.
    pub fn construct(series_a: &[(f64, f64)], series_b: &[(f64, f64)], options: &TimeWarpOptions) -> Result<Self> {
        if series_a.is_empty() || series_b.is_empty() {
            return Err(Error::bad_parameter("time warp requires non-empty input series"));
        }
        let (xs_a, ys_a, xs_b, ys_b) = preprocess(series_a, series_b, options)?;
        let anchor_override = (!options.anchor_time_list.is_empty()).then(|| options.anchor_time_list.as_slice());
        let knots_a = place_knots(&xs_a, options, anchor_override);
        let knots_b = warp_core(&ys_a, &ys_b, &knots_a, options)?;

        let anchors_a: Vec<f64> = knots_a.iter().map(|&i| xs_a[i]).collect();
        let anchors_b: Vec<f64> = knots_b.iter().map(|&j| xs_b[j]).collect();
        debug!("constructed time warp with {} knots", anchors_a.len());
        TimeWarp2D::from_anchors(anchors_a, anchors_b)
    }

    /// Partitions both series at `constraints_a`/`constraints_b` (plus each
    /// series' endpoints), runs an independent sub-warp per partition, and
    /// concatenates their anchors. A partition with no samples on either side
    /// contributes nothing.
    pub fn construct_with_constraints(
        series_a: &[(f64, f64)],
        series_b: &[(f64, f64)],
        constraints_a: &[f64],
        constraints_b: &[f64],
        options: &TimeWarpOptions,
    ) -> Result<Self> {
        if constraints_a.len() != constraints_b.len() {
            return Err(Error::bad_parameter("constraint lists must be the same length"));
        }
        if series_a.is_empty() || series_b.is_empty() {
            return Err(Error::bad_parameter("time warp requires non-empty input series"));
        }

        let mut bounds_a = vec![series_a.first().unwrap().0];
        bounds_a.extend(constraints_a.iter().copied());
        bounds_a.push(series_a.last().unwrap().0);

        let mut bounds_b = vec![series_b.first().unwrap().0];
        bounds_b.extend(constraints_b.iter().copied());
        bounds_b.push(series_b.last().unwrap().0);

        let mut anchors_a = Vec::new();
        let mut anchors_b = Vec::new();
        for (ra, rb) in bounds_a.windows(2).zip(bounds_b.windows(2)) {
            let part_a: Vec<(f64, f64)> = series_a.iter().copied().filter(|p| p.0 >= ra[0] && p.0 <= ra[1]).collect();
            let part_b: Vec<(f64, f64)> = series_b.iter().copied().filter(|p| p.0 >= rb[0] && p.0 <= rb[1]).collect();
            if part_a.is_empty() || part_b.is_empty() {
                continue;
            }
            let sub = TimeWarp2D::construct(&part_a, &part_b, options)?;
            anchors_a.extend(sub.anchors_a);
            anchors_b.extend(sub.anchors_b);
        }
        TimeWarp2D::from_anchors(anchors_a, anchors_b)
    }
}

/// Direct piecewise-linear lookup between two equal-length anchor arrays,
/// bypassing resampling and knot placement entirely -- the mapping scenario
/// tests exercise directly, where `source`/`target` already line up 1:1.
pub fn map_time(source: &[f64], target: &[f64], t: f64) -> Result<f64> {
    Ok(piecewise_linear(source, target, t))
}

fn piecewise_linear(xs: &[f64], ys: &[f64], t: f64) -> f64 {
    let n = xs.len();
    if n == 0 {
        return t;
    }
    if n == 1 {
        return t + (ys[0] - xs[0]);
    }
    if t < xs[0] {
        return t + (ys[0] - xs[0]);
    }
    let last = n - 1;
    if t > xs[last] {
        return t + (ys[last] - xs[last]);
    }
    if t == xs[last] {
        return ys[last];
    }
    let i = xs.partition_point(|&x| x <= t).saturating_sub(1).min(last - 1);
    let fraction = (t - xs[i]) / (xs[i + 1] - xs[i]);
    ys[i] + fraction * (ys[i + 1] - ys[i])
}

/// Resamples A down to `max_total_number_of_points` (forcing a resample
/// regardless of size when it isn't uniformly spaced), resamples B to A's
/// resulting length under the same rule, then scales both to unit maximum
/// when `max(|A|)/max(|B|) > normalize_scale_factor` (0 meaning "always").
fn preprocess(series_a: &[(f64, f64)], series_b: &[(f64, f64)], options: &TimeWarpOptions) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>)> {
    let plot_a = PlotBase::from_points(series_a.iter().map(|&(x, y)| Point::new(x, y)).collect());
    let plot_b = PlotBase::from_points(series_b.iter().map(|&(x, y)| Point::new(x + options.start_time_offset_b, y)).collect());

    const UNIFORM_TOLERANCE: f64 = 1e-6;

    let plot_a = if plot_a.len() > options.max_total_number_of_points {
        PlotBase::from_points(plot_a.make_resampled_plot_max_points(options.max_total_number_of_points)?)
    } else if !plot_a.is_uniform(UNIFORM_TOLERANCE) {
        plot_a.make_resampled_plot_target_size(plot_a.len())?
    } else {
        plot_a
    };

    let plot_b = if plot_b.len() != plot_a.len() || !plot_b.is_uniform(UNIFORM_TOLERANCE) {
        plot_b.make_resampled_plot_target_size(plot_a.len())?
    } else {
        plot_b
    };

    let mut ys_a: Vec<f64> = plot_a.points().iter().map(|p| p.y).collect();
    let mut ys_b: Vec<f64> = plot_b.points().iter().map(|p| p.y).collect();
    let xs_a: Vec<f64> = plot_a.points().iter().map(|p| p.x).collect();
    let xs_b: Vec<f64> = plot_b.points().iter().map(|p| p.x).collect();

    let max_a = ys_a.iter().cloned().fold(0.0f64, f64::max);
    let max_b = ys_b.iter().cloned().fold(0.0f64, f64::max);
    let ratio = if max_b > 0.0 { max_a / max_b } else { f64::INFINITY };
    let threshold = options.normalize_scale_factor as f64;
    if threshold <= 0.0 || ratio > threshold {
        if max_a > 0.0 {
            for y in ys_a.iter_mut() {
                *y /= max_a;
            }
        }
        if max_b > 0.0 {
            for y in ys_b.iter_mut() {
                *y /= max_b;
            }
        }
    }

    Ok((xs_a, ys_a, xs_b, ys_b))
}

/// Evenly spaced knot indices on A, plus a terminal knot at the last index;
/// or, when `anchor_times` is given, the index nearest each anchor time
/// (plus the terminal knot if not already covered).
///
/// `number_of_samples_per_segment`, when positive (the default), overrides
/// `number_of_segments` entirely as `A.len() / samples_per_segment` with no
/// subsequent cap -- matching `TimeWarp2D::constructWarp`, which only falls
/// back to the flat `numberOfSegments` option when samples-per-segment is
/// disabled (`<= 0`).
fn place_knots(xs_a: &[f64], options: &TimeWarpOptions, anchor_times: Option<&[f64]>) -> Vec<usize> {
    let last = xs_a.len() - 1;
    if let Some(anchors) = anchor_times {
        let mut idxs: Vec<usize> = anchors.iter().map(|&t| nearest_index(xs_a, t)).collect();
        idxs.push(last);
        idxs.sort_unstable();
        idxs.dedup();
        return idxs;
    }

    let segment_count = if options.number_of_samples_per_segment > 0 {
        (xs_a.len() / options.number_of_samples_per_segment as usize).max(1)
    } else {
        options.number_of_segments.max(1) as usize
    };

    let mut idxs = Vec::with_capacity(segment_count + 1);
    for i in 0..segment_count {
        idxs.push((i * last) / segment_count);
    }
    idxs.push(last);
    idxs.sort_unstable();
    idxs.dedup();
    idxs
}

fn nearest_index(xs: &[f64], t: f64) -> usize {
    let idx = xs.partition_point(|&x| x < t);
    if idx == 0 {
        0
    } else if idx >= xs.len() {
        xs.len() - 1
    } else if (xs[idx] - t).abs() < (t - xs[idx - 1]).abs() {
        idx
    } else {
        idx - 1
    }
}

/// Banded dynamic-programming core: maps each knot index in A to a knot
/// index in B, searching within `± global_skew` of the proportional
/// expected position, scored by the squared difference of local windowed
/// averages (normalized by `mz_match_ppm`) plus a stretch penalty on
/// deviation from the expected knot-to-knot spacing. Enforces strictly
/// increasing B indices.
fn warp_core(ys_a: &[f64], ys_b: &[f64], knots_a: &[usize], options: &TimeWarpOptions) -> Result<Vec<usize>> {
    let len_a = ys_a.len();
    let len_b = ys_b.len();
    if len_a == 0 || len_b == 0 {
        return Err(Error::bad_parameter("warp core requires non-empty series"));
    }

    let skew = options.global_skew.max(0);
    let tolerance = (options.mz_match_ppm * 1e-6).max(1e-9);
    const WINDOW_HALF_WIDTH: usize = 2;

    let mut knots_b = Vec::with_capacity(knots_a.len());
    let mut prev_j: i64 = -1;
    let mut prev_expected_j: i64 = -1;

    for &ia in knots_a {
        let expected_j = if len_a > 1 {
            ((ia as f64 / (len_a - 1) as f64) * (len_b - 1) as f64).round() as i64
        } else {
            0
        };
        let lo = (expected_j - skew).max(prev_j + 1).max(0);
        let hi = (expected_j + skew).min(len_b as i64 - 1).max(lo);

        let wa = windowed_average(ys_a, ia, WINDOW_HALF_WIDTH);
        let mut best_j = lo;
        let mut best_cost = f64::INFINITY;
        for j in lo..=hi {
            let wb = windowed_average(ys_b, j as usize, WINDOW_HALF_WIDTH);
            let normalized_diff = (wa - wb) / tolerance;
            let stretch = if prev_j >= 0 {
                let expected_delta = (expected_j - prev_expected_j) as f64;
                let actual_delta = (j - prev_j) as f64;
                options.stretch_penalty * (actual_delta - expected_delta).powi(2)
            } else {
                0.0
            };
            let cost = normalized_diff * normalized_diff + stretch;
            if cost < best_cost {
                best_cost = cost;
                best_j = j;
            }
        }

        knots_b.push(best_j as usize);
        prev_j = best_j;
        prev_expected_j = expected_j;
    }
    Ok(knots_b)
}

fn windowed_average(ys: &[f64], center: usize, half_width: usize) -> f64 {
    let lo = center.saturating_sub(half_width);
    let hi = (center + half_width).min(ys.len() - 1);
    let slice = &ys[lo..=hi];
    slice.iter().sum::<f64>() / slice.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn s6_time_warp_anchor_round_trip() {
        let time_source = [0.02, 0.04, 0.07, 0.09, 0.10, 0.14, 0.16, 0.18, 0.20, 0.24];
        let scan_index_target: Vec<f64> = (0..10).map(|i| i as f64).collect();

        assert_close(map_time(&time_source, &scan_index_target, 0.02).unwrap(), 0.0);
        assert_close(map_time(&time_source, &scan_index_target, 0.03).unwrap(), 0.5);
        assert_close(map_time(&time_source, &scan_index_target, 0.24).unwrap(), 9.0);

        let warp = TimeWarp2D::from_anchors(time_source.to_vec(), scan_index_target.clone()).unwrap();
        let there = warp.warp(0.03);
        let back = warp.unwarp(there);
        assert_close(back, 0.03);
    }

    #[test]
    fn warp_extrapolates_by_constant_offset_outside_the_anchor_range() {
        let warp = TimeWarp2D::from_anchors(vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]).unwrap();
        assert_close(warp.warp(0.0), 9.0);
        assert_close(warp.warp(4.0), 40.0);
    }

    #[test]
    fn from_anchors_rejects_mismatched_lengths() {
        assert!(TimeWarp2D::from_anchors(vec![1.0, 2.0], vec![1.0]).is_err());
    }

    #[test]
    fn construct_produces_monotonic_anchors_for_two_identical_series() {
        let series: Vec<(f64, f64)> = (0..200).map(|i| (i as f64 * 0.01, (i as f64 * 0.1).sin().abs())).collect();
        let options = TimeWarpOptions { number_of_samples_per_segment: 10, global_skew: 20, ..Default::default() };
        let warp = TimeWarp2D::construct(&series, &series, &options).unwrap();
        let (a, b) = warp.anchors();
        assert_eq!(a.len(), b.len());
        for w in a.windows(2) {
            assert!(w[1] >= w[0]);
        }
        for w in b.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn construct_rejects_empty_series() {
        let options = TimeWarpOptions::default();
        assert!(TimeWarp2D::construct(&[], &[(0.0, 1.0)], &options).is_err());
    }

    #[test]
    fn construct_with_constraints_partitions_and_concatenates() {
        let series_a: Vec<(f64, f64)> = (0..100).map(|i| (i as f64 * 0.1, 1.0)).collect();
        let series_b: Vec<(f64, f64)> = (0..100).map(|i| (i as f64 * 0.1, 1.0)).collect();
        let options = TimeWarpOptions { number_of_samples_per_segment: 10, global_skew: 10, ..Default::default() };
        let warp = TimeWarp2D::construct_with_constraints(&series_a, &series_b, &[5.0], &[5.0], &options).unwrap();
        let (a, _) = warp.anchors();
        assert!(!a.is_empty());
    }
}
