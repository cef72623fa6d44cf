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

//! A uniformly-spaced 1-D numeric grid: `start_x + i * scale_x` for
//! `i in 0..len`. Smoothing, stop-list masking, normalization, resampling,
//! and centroiding all live here; the non-uniform counterpart is
//! [`ms_plot_base::PlotBase`].

use std::cell::{Ref, RefCell};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use log::warn;
use ms_errors::{Error, Result};
use ms_plot_base::{less_x, CentroidAlgorithmMethod, Point, PlotBase};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulateOp {
    Add,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResampleMethod {
    /// Copy as-is when the target size would not reduce resolution.
    LowerResolutionNotResampled,
    AlwaysResample,
}

#[derive(Clone, Default)]
struct XCache {
    key: Option<(u64, u64, usize)>,
    xs: Vec<f64>,
}

/// A uniform-grid 1-D signal: `y[i]` sampled at world position
/// `start_x + i * scale_x`.
#[derive(Clone)]
pub struct GridUniform {
    start_x: f64,
    scale_x: f64,
    y: Vec<f64>,
    x_cache: RefCell<XCache>,
}

fn io_err(e: std::io::Error) -> Error {
    Error::FileOpen {
        path: PathBuf::new(),
        source: e,
    }
}

fn gaussian_kernel_unnormalized(sigma_pixels: f64, radius: isize) -> Vec<f64> {
    (-radius..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma_pixels).powi(2)).exp())
        .collect()
}

fn normalize_kernel_to_one(kernel: &mut [f64]) {
    let sum: f64 = kernel.iter().sum();
    if sum.abs() > 1e-300 {
        for v in kernel.iter_mut() {
            *v /= sum;
        }
    }
}

fn convolve_zero_pad(y: &[f64], kernel: &[f64]) -> Vec<f64> {
    let radius = (kernel.len() / 2) as isize;
    let n = y.len() as isize;
    let mut out = vec![0.0; y.len()];
    for i in 0..n {
        let mut acc = 0.0;
        for (k, &kv) in kernel.iter().enumerate() {
            let j = i + k as isize - radius;
            if j >= 0 && j < n {
                acc += y[j as usize] * kv;
            }
        }
        out[i as usize] = acc;
    }
    out
}

impl GridUniform {
    /// Builds a grid of exactly `size` samples spanning `[start_x, end_x]`.
    pub fn from_size(start_x: f64, end_x: f64, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::bad_parameter("grid size must be positive"));
        }
        if end_x < start_x {
            return Err(Error::bad_parameter("reversed range"));
        }
        let scale_x = if size > 1 {
            (end_x - start_x) / (size - 1) as f64
        } else {
            1.0
        };
        Ok(GridUniform {
            start_x,
            scale_x,
            y: vec![0.0; size],
            x_cache: RefCell::new(XCache::default()),
        })
    }

    /// Builds a grid spanning `[start_x, end_x]` at a fixed step, rounding
    /// the span down to a whole number of steps.
    pub fn from_step(start_x: f64, end_x: f64, step: f64) -> Result<Self> {
        if step <= 0.0 {
            return Err(Error::bad_parameter("step must be positive"));
        }
        if end_x < start_x {
            return Err(Error::bad_parameter("reversed range"));
        }
        let size = ((end_x - start_x) / step).floor() as usize + 1;
        Ok(GridUniform {
            start_x,
            scale_x: step,
            y: vec![0.0; size],
            x_cache: RefCell::new(XCache::default()),
        })
    }

    pub fn start_x(&self) -> f64 {
        self.start_x
    }

    pub fn scale_x(&self) -> f64 {
        self.scale_x
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn y_mut(&mut self) -> &mut [f64] {
        &mut self.y
    }

    /// World x-position of index `i`.
    pub fn ix(&self, i: usize) -> f64 {
        self.start_x + i as f64 * self.scale_x
    }

    fn x_positions(&self) -> Ref<'_, Vec<f64>> {
        let key = (self.start_x.to_bits(), self.scale_x.to_bits(), self.y.len());
        if self.x_cache.borrow().key != Some(key) {
            let xs: Vec<f64> = (0..self.y.len()).map(|i| self.ix(i)).collect();
            let mut cache = self.x_cache.borrow_mut();
            cache.key = Some(key);
            cache.xs = xs;
        }
        Ref::map(self.x_cache.borrow(), |c| &c.xs)
    }

    /// Evaluates the grid at world position `x`, linearly interpolating
    /// between the floor and ceil neighbors. Out-of-range `x` clamps to the
    /// nearest edge sample.
    pub fn evaluate(&self, x: f64) -> f64 {
        if self.y.is_empty() {
            return 0.0;
        }
        let pos = (x - self.start_x) / self.scale_x;
        let last = self.y.len() - 1;
        if pos <= 0.0 {
            return self.y[0];
        }
        if pos >= last as f64 {
            return self.y[last];
        }
        let lo = pos.floor() as usize;
        let frac = pos - lo as f64;
        self.y[lo] * (1.0 - frac) + self.y[lo + 1] * frac
    }

    /// Converts to an ordered point list, e.g. to reuse `PlotBase`'s
    /// critical-point and centroiding algorithms.
    ///
    /// Drops the final sample (PMI-395): the source observed an occasional
    /// `#INF` value there and worked around it by never plotting it rather
    /// than tracking down whether it was a vendor artifact or a genuine
    /// computation bug. That workaround is preserved here rather than
    /// "fixed", since spec.md §9 leaves the root cause an open question.
    pub fn to_plot_base(&self) -> PlotBase {
        let xs = self.x_positions();
        let len = self.y.len().saturating_sub(1);
        let points: Vec<Point> = xs
            .iter()
            .zip(self.y.iter())
            .take(len)
            .map(|(&x, &y)| Point::new(x, y))
            .collect();
        PlotBase::from_points(points)
    }

    /// Gaussian smoothing with `sigma_world` in world units, zero-padded at
    /// the boundary.
    pub fn smooth(&mut self, sigma_world: f64) {
        if sigma_world <= 0.0 || self.y.is_empty() {
            return;
        }
        let sigma_pixels = sigma_world / self.scale_x;
        let radius = (3.0 * sigma_pixels).floor().max(0.0) as isize;
        let mut kernel = gaussian_kernel_unnormalized(sigma_pixels, radius);
        normalize_kernel_to_one(&mut kernel);
        self.y = convolve_zero_pad(&self.y, &kernel);
    }

    /// Difference-of-Gaussians smoothing: `g(sigma1) - w2 * g(sigma2)`,
    /// renormalized to sum to 1. `sigma1`/`sigma2` are swapped if reversed;
    /// `w2` is clamped to `<= 0.9`.
    pub fn smooth_mexican_hat(&mut self, sigma1: f64, sigma2: f64, w2: f64) {
        if self.y.is_empty() {
            return;
        }
        let (s1, s2) = if sigma1 <= sigma2 { (sigma1, sigma2) } else { (sigma2, sigma1) };
        let w2 = w2.min(0.9);
        let p1 = s1 / self.scale_x;
        let p2 = s2 / self.scale_x;
        let radius = (3.0 * p2).floor().max(0.0) as isize;
        let g1 = gaussian_kernel_unnormalized(p1, radius);
        let g2 = gaussian_kernel_unnormalized(p2, radius);
        let mut kernel: Vec<f64> = g1.iter().zip(g2.iter()).map(|(a, b)| a - w2 * b).collect();
        normalize_kernel_to_one(&mut kernel);
        self.y = convolve_zero_pad(&self.y, &kernel);
    }

    /// Masks every y-value inside `[mz - tol, mz + tol]` with the sample
    /// just left of that window, for each stop mass. `tol` is raised to
    /// `scale_x` if smaller. Stop masses must be at least `4 * tol` apart.
    pub fn apply_stop_list(&mut self, tol: f64, sorted_mz_list: &[f64]) -> Result<()> {
        if self.y.is_empty() || sorted_mz_list.is_empty() {
            return Ok(());
        }
        let tol = tol.max(self.scale_x);
        for pair in sorted_mz_list.windows(2) {
            if pair[1] - pair[0] < 4.0 * tol {
                return Err(Error::bad_parameter("stop list entries must be at least 4*tol apart"));
            }
        }
        let last = self.y.len() - 1;
        for &mz in sorted_mz_list {
            let lo_pos = ((mz - tol - self.start_x) / self.scale_x).ceil();
            let hi_pos = ((mz + tol - self.start_x) / self.scale_x).floor();
            if hi_pos < 0.0 || lo_pos > last as f64 {
                continue;
            }
            let lo_idx = lo_pos.max(0.0) as usize;
            let hi_idx = (hi_pos.min(last as f64) as usize).min(last);
            if lo_idx > hi_idx {
                continue;
            }
            let replacement = if lo_idx == 0 { self.y[0] } else { self.y[lo_idx - 1] };
            for v in &mut self.y[lo_idx..=hi_idx] {
                *v = replacement;
            }
        }
        Ok(())
    }

    /// Scales all y-values so the maximum becomes `new_max`. No-op if the
    /// current maximum is `<= 0`.
    pub fn normalize(&mut self, new_max: f64) {
        let max = self.y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max <= 0.0 {
            return;
        }
        let factor = new_max / max;
        for v in self.y.iter_mut() {
            *v *= factor;
        }
    }

    /// The `fraction`-quantile of `|y|`, selected in O(n) rather than fully
    /// sorted. `0.25` is the conventional noise-floor estimate.
    pub fn noise_sigma(&self, fraction: f64) -> f64 {
        if self.y.is_empty() {
            return 0.0;
        }
        let mut magnitudes: Vec<f64> = self.y.iter().map(|v| v.abs()).collect();
        let n = magnitudes.len();
        let idx = ((fraction * (n - 1) as f64).round() as usize).min(n - 1);
        magnitudes.select_nth_unstable_by(idx, |a, b| a.partial_cmp(b).unwrap());
        magnitudes[idx]
    }

    /// Adds or subtracts `plot`, linearly evaluated at this grid's x
    /// positions, from `y`.
    pub fn accumulate_plot(&mut self, plot: &PlotBase, op: AccumulateOp) {
        let xs = self.x_positions().clone();
        let sampled = plot.evaluate_linear(&xs);
        match op {
            AccumulateOp::Add => {
                for (v, s) in self.y.iter_mut().zip(sampled.iter()) {
                    *v += s;
                }
            }
            AccumulateOp::Sub => {
                for (v, s) in self.y.iter_mut().zip(sampled.iter()) {
                    *v -= s;
                }
            }
        }
    }

    /// Elementwise add/subtract against another grid of matching geometry
    /// (start and scale within `1e-10`).
    pub fn accumulate_grid(&mut self, other: &GridUniform, op: AccumulateOp) -> Result<()> {
        if (self.start_x - other.start_x).abs() > 1e-10 || (self.scale_x - other.scale_x).abs() > 1e-10 {
            return Err(Error::bad_parameter("grid geometry mismatch"));
        }
        let n = self.y.len().min(other.y.len());
        match op {
            AccumulateOp::Add => {
                for i in 0..n {
                    self.y[i] += other.y[i];
                }
            }
            AccumulateOp::Sub => {
                for i in 0..n {
                    self.y[i] -= other.y[i];
                }
            }
        }
        Ok(())
    }

    /// Builds a new grid at `new_size` cells spanning this grid's current
    /// bound. With `LowerResolutionNotResampled` and a `new_size` at least
    /// this grid's size, returns a clone instead of resampling.
    pub fn create_resample(&self, method: ResampleMethod, new_size: usize) -> Result<GridUniform> {
        if new_size == 0 {
            return Err(Error::bad_parameter("resample target size must be positive"));
        }
        if method == ResampleMethod::LowerResolutionNotResampled && new_size >= self.y.len() {
            return Ok(self.clone());
        }
        let lo = self.ix(0);
        let hi = self.ix(self.y.len().saturating_sub(1));
        let mut out = GridUniform::from_size(lo, hi, new_size)?;
        for i in 0..new_size {
            let x = out.ix(i);
            out.y[i] = self.evaluate(x);
        }
        Ok(out)
    }

    /// Smooths with sigma=2, estimates the noise floor, and rejects the
    /// whole spectrum (empty result) if the smoothed maximum is under 10x
    /// noise. Local maxima on the smoothed signal become centroids (via
    /// relative-weight averaging), re-sampled against the original
    /// unsmoothed signal, then greedily kept highest-first subject to
    /// `min_distance` between kept centroids.
    pub fn make_centroided_plot(&self, top_k: usize, min_distance: f64) -> Result<PlotBase> {
        if self.y.is_empty() {
            return Ok(PlotBase::new());
        }
        let mut smoothed = self.clone();
        smoothed.smooth(2.0);
        let noise = smoothed.noise_sigma(0.25);
        let max_y = smoothed.y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max_y < 10.0 * noise {
            warn!("rejecting spectrum: max {max_y} below 10x noise floor {noise}");
            return Ok(PlotBase::new());
        }

        let smoothed_plot = smoothed.to_plot_base();
        let mut centroids = smoothed_plot.make_centroided_points(CentroidAlgorithmMethod::WeightedAverageRelativeWeight)?;

        let original_plot = self.to_plot_base();
        for p in centroids.iter_mut() {
            p.y = original_plot.evaluate(p.x, true, false);
        }

        centroids.sort_by(|a, b| b.y.partial_cmp(&a.y).unwrap());
        let mut kept: Vec<Point> = Vec::new();
        for c in centroids {
            if kept.len() >= top_k {
                break;
            }
            if kept.iter().all(|k| (k.x - c.x).abs() >= min_distance) {
                kept.push(c);
            }
        }
        kept.sort_by(less_x);
        Ok(PlotBase::from_points(kept))
    }

    /// Loads `start_x,scale_x` on the first line, then one sample per line
    /// (either `y` or `x,y`; the x column, when present, is informational
    /// only -- grid geometry is authoritative). Blank lines are skipped.
    pub fn load_from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut lines = std::io::BufReader::new(reader).lines();
        let header = lines
            .next()
            .ok_or_else(|| Error::bad_parameter("empty grid file"))?
            .map_err(io_err)?;
        let mut header_parts = header.split(',');
        let start_x: f64 = header_parts
            .next()
            .ok_or_else(|| Error::bad_parameter("missing start_x"))?
            .trim()
            .parse()
            .map_err(|_| Error::bad_parameter("invalid start_x"))?;
        let scale_x: f64 = header_parts
            .next()
            .ok_or_else(|| Error::bad_parameter("missing scale_x"))?
            .trim()
            .parse()
            .map_err(|_| Error::bad_parameter("invalid scale_x"))?;

        let mut y = Vec::new();
        for line in lines {
            let line = line.map_err(io_err)?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.split(',');
            let first: f64 = parts
                .next()
                .unwrap()
                .trim()
                .parse()
                .map_err(|_| Error::bad_parameter("invalid sample value"))?;
            match parts.next() {
                Some(second) => {
                    let value: f64 = second.trim().parse().map_err(|_| Error::bad_parameter("invalid sample value"))?;
                    y.push(value);
                }
                None => y.push(first),
            }
        }
        Ok(GridUniform {
            start_x,
            scale_x,
            y,
            x_cache: RefCell::new(XCache::default()),
        })
    }

    pub fn save_to_writer<W: std::io::Write>(&self, mut writer: W, include_x: bool) -> Result<()> {
        writeln!(writer, "{},{}", self.start_x, self.scale_x).map_err(io_err)?;
        if include_x {
            let xs = self.x_positions().clone();
            for (x, y) in xs.iter().zip(self.y.iter()) {
                writeln!(writer, "{x},{y}").map_err(io_err)?;
            }
        } else {
            for y in &self.y {
                writeln!(writer, "{y}").map_err(io_err)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn to_plot_base_drops_the_final_sample() {
        let g = GridUniform::from_size(0.0, 9.0, 10).unwrap();
        let plot = g.to_plot_base();
        assert_eq!(plot.len(), 9);
    }

    #[test]
    fn from_size_rejects_reversed_range_and_zero_size() {
        assert!(GridUniform::from_size(10.0, 0.0, 5).is_err());
        assert!(GridUniform::from_size(0.0, 10.0, 0).is_err());
    }

    #[test]
    fn evaluate_clamps_at_boundaries_and_interpolates_inside() {
        let mut g = GridUniform::from_size(0.0, 10.0, 11).unwrap();
        for (i, v) in g.y_mut().iter_mut().enumerate() {
            *v = i as f64;
        }
        assert_relative_eq!(g.evaluate(-5.0), 0.0);
        assert_relative_eq!(g.evaluate(15.0), 10.0);
        assert_relative_eq!(g.evaluate(3.5), 3.5);
    }

    #[test]
    fn normalize_scales_to_new_max_and_skips_nonpositive_max() {
        let mut g = GridUniform::from_size(0.0, 4.0, 5).unwrap();
        g.y_mut().copy_from_slice(&[1.0, 2.0, 4.0, 2.0, 1.0]);
        g.normalize(8.0);
        assert_relative_eq!(g.y()[2], 8.0);
        assert_relative_eq!(g.y()[0], 2.0);

        let mut all_negative = GridUniform::from_size(0.0, 2.0, 3).unwrap();
        all_negative.y_mut().copy_from_slice(&[-1.0, -2.0, -1.0]);
        all_negative.normalize(5.0);
        assert_relative_eq!(all_negative.y()[1], -2.0);
    }

    #[test]
    fn smooth_preserves_total_mass_away_from_boundary() {
        let mut g = GridUniform::from_size(0.0, 99.0, 100).unwrap();
        g.y_mut()[50] = 100.0;
        let total_before: f64 = g.y().iter().sum();
        g.smooth(2.0);
        let total_after: f64 = g.y().iter().sum();
        assert_relative_eq!(total_before, total_after, epsilon = 1e-6);
    }

    #[test]
    fn apply_stop_list_rejects_too_close_stops() {
        let mut g = GridUniform::from_size(0.0, 100.0, 101).unwrap();
        assert!(g.apply_stop_list(1.0, &[10.0, 11.0]).is_err());
    }

    #[test]
    fn apply_stop_list_masks_window_with_left_sample() {
        let mut g = GridUniform::from_size(0.0, 20.0, 21).unwrap();
        for (i, v) in g.y_mut().iter_mut().enumerate() {
            *v = i as f64;
        }
        g.apply_stop_list(1.0, &[10.0]).unwrap();
        assert_relative_eq!(g.y()[9], 9.0);
        assert_relative_eq!(g.y()[10], 9.0);
        assert_relative_eq!(g.y()[11], 9.0);
    }

    #[test]
    fn accumulate_plot_matches_direct_evaluate_linear() {
        let mut g = GridUniform::from_size(0.0, 10.0, 11).unwrap();
        let plot = PlotBase::from_points(vec![Point::new(0.0, 0.0), Point::new(5.0, 10.0), Point::new(10.0, 0.0)]);
        g.accumulate_plot(&plot, AccumulateOp::Add);

        let xs: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let expected = plot.evaluate_linear(&xs);
        for (got, want) in g.y().iter().zip(expected.iter()) {
            assert_relative_eq!(got, want, epsilon = 1e-9);
        }
    }

    #[test]
    fn accumulate_grid_rejects_mismatched_geometry() {
        let mut a = GridUniform::from_size(0.0, 10.0, 11).unwrap();
        let b = GridUniform::from_size(0.0, 20.0, 11).unwrap();
        assert!(a.accumulate_grid(&b, AccumulateOp::Add).is_err());
    }

    #[test]
    fn create_resample_lower_resolution_not_resampled_returns_clone() {
        let g = GridUniform::from_size(0.0, 10.0, 11).unwrap();
        let same = g.create_resample(ResampleMethod::LowerResolutionNotResampled, 20).unwrap();
        assert_eq!(same.len(), g.len());
    }

    #[test]
    fn create_resample_always_resample_changes_size() {
        let mut g = GridUniform::from_size(0.0, 10.0, 11).unwrap();
        for (i, v) in g.y_mut().iter_mut().enumerate() {
            *v = i as f64;
        }
        let resampled = g.create_resample(ResampleMethod::AlwaysResample, 21).unwrap();
        assert_eq!(resampled.len(), 21);
        assert_relative_eq!(resampled.evaluate(5.0), 5.0);
    }

    #[test]
    fn file_round_trip_single_column() {
        let mut g = GridUniform::from_size(0.0, 4.0, 5).unwrap();
        g.y_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut buf = Vec::new();
        g.save_to_writer(&mut buf, false).unwrap();
        let loaded = GridUniform::load_from_reader(&buf[..]).unwrap();
        assert_relative_eq!(loaded.start_x(), 0.0);
        assert_relative_eq!(loaded.scale_x(), 1.0);
        assert_eq!(loaded.y(), g.y());
    }

    #[test]
    fn make_centroided_plot_rejects_low_snr_spectrum() {
        let g = GridUniform::from_size(0.0, 10.0, 11).unwrap();
        let centroided = g.make_centroided_plot(5, 1.0).unwrap();
        assert!(centroided.is_empty());
    }
}
