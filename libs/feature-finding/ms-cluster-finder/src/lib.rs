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

//! Cluster finding: from the session's current intensity maximum, determine
//! a charge and monoisotope offset, grow a parent hill and its isotope
//! neighbors, and assemble a `Feature` across charge states. Charge and
//! monoisotope determination are pluggable capability sets; the defaults
//! here use isotope-spacing detection rather than a learned model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use ms_errors::{Error, Result};
use ms_ff_session::FeatureFindingSession;
use ms_hill_finder::{Hill, HillFinder, HillFinderOptions, ISODIFF};
use ms_tile_builder::ScanIndexConverter;
use ms_tile_store::{Point, PointRef, TilePos};

/// Mass of a proton, used to convert between mz and uncharged mass:
/// `uncharged_mass = mz * charge - charge * PROTON_MASS`.
pub const PROTON_MASS: f64 = 1.007276466879;

/// Charge determination: a capability set rather than a trait object tied to
/// one concrete model, so a neural-network lookup table can stand in for the
/// isotope-spacing default without touching the cluster finder's loop.
pub trait ChargeDeterminator {
    fn determine_charge(&self, cross_section: &[Point], mz: f64) -> Option<i32>;
    fn search_radius(&self) -> f64;
}

/// Monoisotope offset determination: returns the number of isotope steps
/// (negative when the seed is not itself the monoisotope) and a confidence
/// score in `[0, 1]`.
pub trait MonoisotopeDeterminator {
    fn determine_monoisotope_offset(&self, cross_section: &[Point], mz: f64, charge: i32) -> (i32, f64);
    fn search_radius(&self) -> f64;
}

/// Detects charge by looking for a point near `mz + ISODIFF/charge` in the
/// cross-section, for `charge` in `1..=max_charge`, preferring the lowest
/// charge with a match.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IsotopeSpacingChargeDeterminator {
    pub max_charge: i32,
    pub mz_tolerance: f64,
}

impl Default for IsotopeSpacingChargeDeterminator {
    fn default() -> Self {
        IsotopeSpacingChargeDeterminator { max_charge: 6, mz_tolerance: 0.01 }
    }
}

impl ChargeDeterminator for IsotopeSpacingChargeDeterminator {
    fn determine_charge(&self, cross_section: &[Point], mz: f64) -> Option<i32> {
        for charge in 1..=self.max_charge {
            let spacing = ISODIFF / charge as f64;
            let target = mz + spacing;
            if cross_section.iter().any(|p| (p.mz - target).abs() <= self.mz_tolerance) {
                return Some(charge);
            }
        }
        None
    }

    fn search_radius(&self) -> f64 {
        ISODIFF + self.mz_tolerance
    }
}

/// Walks leftward from the seed looking for contiguous isotope peaks at
/// `mz - k*ISODIFF/charge`; the offset is the negative of how many
/// contiguous matches were found, the score the fraction of the attempted
/// steps (up to `max_steps`) that matched.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IsotopeSpacingMonoisotopeDeterminator {
    pub max_steps: i32,
    pub mz_tolerance: f64,
}

impl Default for IsotopeSpacingMonoisotopeDeterminator {
    fn default() -> Self {
        IsotopeSpacingMonoisotopeDeterminator { max_steps: 4, mz_tolerance: 0.01 }
    }
}

impl MonoisotopeDeterminator for IsotopeSpacingMonoisotopeDeterminator {
    fn determine_monoisotope_offset(&self, cross_section: &[Point], mz: f64, charge: i32) -> (i32, f64) {
        let spacing = ISODIFF / charge as f64;
        let mut matched = 0;
        for k in 1..=self.max_steps {
            let target = mz - k as f64 * spacing;
            if cross_section.iter().any(|p| (p.mz - target).abs() <= self.mz_tolerance) {
                matched = k;
            } else {
                break;
            }
        }
        let score = matched as f64 / self.max_steps as f64;
        (-matched, score)
    }

    fn search_radius(&self) -> f64 {
        self.max_steps as f64 * ISODIFF + self.mz_tolerance
    }
}

/// `unchargedMass -> (left, right)` isotope window, each extended by 1 on
/// both sides. Table and ceiling lookup (`lowerBound`: first breakpoint
/// `>= mass`) taken verbatim from the averagine interval map in
/// `NonUniformHillClusterFinder.cpp`'s `searchRadiusFromMass`.
fn averagine_isotope_window(uncharged_mass: f64) -> (i32, i32) {
    const TABLE: &[(f64, i32, i32)] = &[
        (99.0, 0, 0),
        (299.0, 0, 2),
        (799.0, 0, 3),
        (1399.0, 0, 4),
        (1699.0, 0, 5),
        (3099.0, 0, 6),
        (3999.0, 1, 6),
        (4499.0, 2, 6),
        (6299.0, 2, 7),
        (6799.0, 3, 7),
        (7499.0, 4, 7),
        (9399.0, 5, 7),
        (9899.0, 5, 8),
        (12199.0, 6, 8),
        (12499.0, 7, 8),
        (99900.0, 9, 9),
    ];
    let window = TABLE
        .iter()
        .find(|&&(threshold, _, _)| uncharged_mass <= threshold)
        .map(|&(_, left, right)| (left, right))
        .unwrap_or((3, 3));
    (window.0 + 1, window.1 + 1)
}

fn neighbor_mzs(monoisotopic_mz: f64, charge: i32, left: i32, right: i32) -> Vec<f64> {
    let spacing = ISODIFF / charge as f64;
    (-left..=right).filter(|&k| k != 0).map(|k| monoisotopic_mz + k as f64 * spacing).collect()
}

/// Projects an observed mz from one charge state to another via the shared
/// uncharged mass: `mz_to = (mz_from*from - from*H + to*H) / to`.
fn mass_adjust(mz: f64, from_charge: i32, to_charge: i32) -> f64 {
    let uncharged = mz * from_charge as f64 - from_charge as f64 * PROTON_MASS;
    (uncharged + to_charge as f64 * PROTON_MASS) / to_charge as f64
}

/// Reads every non-selected point at `scan_index` within `mz ± radius`,
/// spanning however many tile columns the window straddles, sorted by mz.
fn cross_section(session: &mut FeatureFindingSession, mz: f64, scan_index: i64, radius: f64) -> Result<Vec<Point>> {
    let range = session.range();
    let kind = session.kind();
    let mz_lo = mz - radius;
    let mz_hi = mz + radius;
    let tile_x_lo = range.tile_x(mz_lo);
    let tile_x_hi = range.tile_x(mz_hi);
    let tile_y = range.tile_y(scan_index);
    let offset = range.tile_offset(scan_index);

    let mut points = Vec::new();
    for tile_x in tile_x_lo..=tile_x_hi {
        let tile = session.device().manager.load_tile((tile_x, tile_y), kind)?;
        points.extend_from_slice(tile.scan_slot(offset));
    }
    points.retain(|p| p.mz >= mz_lo && p.mz <= mz_hi);
    points.sort_by(|a, b| a.mz.partial_cmp(&b.mz).unwrap());
    Ok(points)
}

/// A cosine similarity comparator fixed to one reference XIC, built once per
/// parent hill and reused for every candidate neighbor.
pub struct CosineCorrelator {
    reference: HashMap<i64, f64>,
    reference_norm: f64,
}

impl CosineCorrelator {
    pub fn new(reference_xic: &[(i64, f64)]) -> Self {
        let reference: HashMap<i64, f64> = reference_xic.iter().copied().collect();
        let reference_norm = reference.values().map(|v| v * v).sum::<f64>().sqrt();
        CosineCorrelator { reference, reference_norm }
    }

    pub fn similarity(&self, other_xic: &[(i64, f64)]) -> f64 {
        if self.reference_norm == 0.0 {
            return 0.0;
        }
        let other: HashMap<i64, f64> = other_xic.iter().copied().collect();
        let other_norm = other.values().map(|v| v * v).sum::<f64>().sqrt();
        if other_norm == 0.0 {
            return 0.0;
        }
        let dot: f64 = self.reference.iter().map(|(s, v)| v * other.get(s).copied().unwrap_or(0.0)).sum();
        dot / (self.reference_norm * other_norm)
    }
}

/// An isotope envelope sharing a charge and monoisotopic mz; `hills[0]` is
/// the parent (maximum intensity), the rest are correlated neighbors.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub charge: i32,
    pub monoisotopic_mz: f64,
    pub hills: Vec<Hill>,
}

/// One chemical compound observed at one apex time, aggregating its
/// clusters across charge states; `clusters[0]` is the primary.
#[derive(Clone, Debug)]
pub struct Feature {
    pub id: i64,
    pub uncharged_mass: f64,
    pub apex_time: f64,
    pub clusters: Vec<Cluster>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterFinderOptions {
    pub min_intensity: f64,
    pub percent_progress_limit: Option<f64>,
    pub cosine_similarity_threshold: f64,
    pub max_secondary_charge: i32,
    pub hill_finder: HillFinderOptions,
}

impl Default for ClusterFinderOptions {
    fn default() -> Self {
        ClusterFinderOptions {
            min_intensity: 0.0,
            percent_progress_limit: None,
            cosine_similarity_threshold: 0.90,
            max_secondary_charge: 10,
            hill_finder: HillFinderOptions::default(),
        }
    }
}

pub struct ClusterFinder {
    options: ClusterFinderOptions,
    charge_determinator: Box<dyn ChargeDeterminator>,
    mono_determinator: Box<dyn MonoisotopeDeterminator>,
    hill_finder: HillFinder,
    next_feature_id: i64,
    stop: Arc<AtomicBool>,
}

impl ClusterFinder {
    pub fn new(
        options: ClusterFinderOptions,
        charge_determinator: Box<dyn ChargeDeterminator>,
        mono_determinator: Box<dyn MonoisotopeDeterminator>,
    ) -> Self {
        ClusterFinder {
            hill_finder: HillFinder::new(options.hill_finder),
            options,
            charge_determinator,
            mono_determinator,
            next_feature_id: 1,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A shared cancellation flag; an external caller (or progress callback)
    /// can signal `stop.store(true, Ordering::Relaxed)` between clusters.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn run(&mut self, session: &mut FeatureFindingSession, converter: &ScanIndexConverter) -> Result<Vec<Feature>> {
        self.hill_finder.reset_id();
        let total_points = session.device().total_point_count(session.search_area())?;
        let mut processed_points = 0usize;
        let mut features = Vec::new();

        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let (mz, intensity, tile_point) = match session.max_intensity_point()? {
                Some(v) => v,
                None => break,
            };
            if intensity < self.options.min_intensity {
                break;
            }
            if let Some(limit) = self.options.percent_progress_limit {
                if total_points > 0 && (processed_points as f64 / total_points as f64) >= limit {
                    break;
                }
            }

            let scan_index = tile_point.scan_index;
            let search_radius = self.charge_determinator.search_radius().max(self.mono_determinator.search_radius());
            let section = cross_section(session, mz, scan_index, search_radius)?;
            let charge = self.charge_determinator.determine_charge(&section, mz).unwrap_or(1);
            let (offset, _score) = self.mono_determinator.determine_monoisotope_offset(&section, mz, charge);
            let monoisotopic_mz = mz + offset as f64 * ISODIFF / charge as f64;
            let uncharged_mass = monoisotopic_mz * charge as f64 - charge as f64 * PROTON_MASS;
            let (left, right) = averagine_isotope_window(uncharged_mass);

            let mut touched_positions: Vec<TilePos> = Vec::new();

            let main_candidates = neighbor_mzs(monoisotopic_mz, charge, left, right);
            let main_cluster = self.build_cluster(session, converter, monoisotopic_mz, scan_index, charge, &main_candidates, Some(tile_point))?;

            let main_cluster = match main_cluster {
                Some(cluster) => cluster,
                None => {
                    // make_default_hill only returns null-equivalent when its seed
                    // point has vanished between max_intensity_point() and here,
                    // which would be a session invariant violation.
                    warn!("default hill for seed {tile_point:?} was empty; aborting this seed");
                    self.hill_finder.mark_points_as_processed(session, &[tile_point])?;
                    touched_positions.push(tile_point.pos);
                    processed_points += 1;
                    session.update_index_for_tiles(&touched_positions)?;
                    continue;
                }
            };

            let mut clusters = Vec::new();
            for hill in &main_cluster.hills {
                processed_points += hill.points.len();
                touched_positions.extend(hill.points.iter().map(|p| p.pos));
            }
            clusters.push(main_cluster);

            for other_charge in 1..=self.options.max_secondary_charge {
                if other_charge == charge {
                    continue;
                }
                let projected_mz = mass_adjust(monoisotopic_mz, charge, other_charge);
                let candidates = neighbor_mzs(projected_mz, other_charge, left, right);
                if let Some(cluster) = self.build_cluster(session, converter, projected_mz, scan_index, other_charge, &candidates, None)? {
                    for hill in &cluster.hills {
                        processed_points += hill.points.len();
                        touched_positions.extend(hill.points.iter().map(|p| p.pos));
                    }
                    clusters.push(cluster);
                }
            }

            touched_positions.sort();
            touched_positions.dedup();
            session.update_index_for_tiles(&touched_positions)?;

            let apex_time = converter.scan_index_to_scan_time(scan_index).unwrap_or(0.0);
            let id = self.next_feature_id;
            self.next_feature_id += 1;
            features.push(Feature { id, uncharged_mass, apex_time, clusters });
        }

        Ok(features)
    }

    /// Builds a parent hill at `(mz, scan_index)` (falling back to
    /// `make_default_hill` only when `seed_point` is given, i.e. for the main
    /// charge), then a neighbor hill per candidate mz kept when its cosine
    /// similarity to the parent's XIC clears the threshold. Marks every kept
    /// hill's points as processed and gives each a fresh id.
    fn build_cluster(
        &mut self,
        session: &mut FeatureFindingSession,
        converter: &ScanIndexConverter,
        mz: f64,
        scan_index: i64,
        charge: i32,
        candidate_mzs: &[f64],
        seed_point: Option<PointRef>,
    ) -> Result<Option<Cluster>> {
        let mut parent = match self.hill_finder.explain_peak(session, converter, mz, scan_index)? {
            Some(hill) => hill,
            None => match seed_point {
                Some(tile_point) => self.hill_finder.make_default_hill(session, mz, tile_point)?,
                None => return Ok(None),
            },
        };
        if parent.points.is_empty() {
            return Err(Error::from(anyhow::anyhow!("default hill produced no points for a valid seed point")));
        }
        parent.id = self.hill_finder.next_id();

        let correlator = CosineCorrelator::new(&parent.xic);
        let mut hills = vec![parent.clone()];
        let mut all_points: Vec<PointRef> = parent.points.clone();

        for &candidate_mz in candidate_mzs {
            if let Some(mut neighbor) = self.hill_finder.explain_neighbor(session, candidate_mz, parent.scan_index_range)? {
                let similarity = correlator.similarity(&neighbor.xic);
                if similarity >= self.options.cosine_similarity_threshold {
                    neighbor.cosine_similarity_to_parent = similarity;
                    neighbor.id = self.hill_finder.next_id();
                    all_points.extend(neighbor.points.iter().copied());
                    hills.push(neighbor);
                }
            }
        }

        self.hill_finder.mark_points_as_processed(session, &all_points)?;
        Ok(Some(Cluster { charge, monoisotopic_mz: mz, hills }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_document::TileDevice;
    use ms_hill_finder::HillFinderAlgorithm;
    use ms_tile_manager::TileManager;
    use ms_tile_range::{TileRange, TileRect};
    use ms_tile_store::{ContentKind, Store, StoreMemory, Tile};

    fn point(mz: f64, intensity: f64) -> Point {
        Point { mz, intensity }
    }

    fn sample_range() -> TileRange {
        let mut range = TileRange::new();
        range.set_mz(0.0, 2000.0).unwrap();
        range.set_mz_tile_length(2000.0);
        range.set_scan_index(0, 9).unwrap();
        range.set_scan_index_length(10);
        range
    }

    fn converter() -> ScanIndexConverter {
        ScanIndexConverter::new((0..10).map(|i| ms_scan_reader::ScanInfo { scan_number: i, retention_time_minutes: i as f64 * 0.1 }).collect())
    }

    #[test]
    fn mass_adjust_round_trips_through_two_charges() {
        let mz1 = 500.25;
        let mz2 = mass_adjust(mz1, 1, 2);
        let back = mass_adjust(mz2, 2, 1);
        assert!((back - mz1).abs() < 1e-9);
    }

    #[test]
    fn averagine_window_widens_with_mass() {
        let (l1, r1) = averagine_isotope_window(500.0);
        let (l2, r2) = averagine_isotope_window(7000.0);
        assert!(l2 >= l1);
        assert!(r2 >= r1);
    }

    #[test]
    fn isotope_spacing_charge_determinator_detects_charge_two() {
        let cross_section = vec![point(500.0, 100.0), point(500.0 + ISODIFF / 2.0, 60.0)];
        let det = IsotopeSpacingChargeDeterminator::default();
        assert_eq!(det.determine_charge(&cross_section, 500.0), Some(2));
    }

    #[test]
    fn isotope_spacing_monoisotope_determinator_finds_two_steps_left() {
        let det = IsotopeSpacingMonoisotopeDeterminator::default();
        let seed_mz = 500.0;
        let spacing = ISODIFF;
        let cross_section = vec![
            point(seed_mz - 2.0 * spacing, 10.0),
            point(seed_mz - spacing, 40.0),
            point(seed_mz, 100.0),
        ];
        let (offset, score) = det.determine_monoisotope_offset(&cross_section, seed_mz, 1);
        assert_eq!(offset, -2);
        assert!(score > 0.0);
    }

    #[test]
    fn cosine_correlator_gives_one_for_identical_shapes() {
        let xic = vec![(0, 10.0), (1, 20.0), (2, 10.0)];
        let correlator = CosineCorrelator::new(&xic);
        assert!((correlator.similarity(&xic) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_correlator_gives_zero_for_disjoint_shapes() {
        let a = vec![(0, 10.0), (1, 0.0)];
        let b = vec![(0, 0.0), (1, 10.0)];
        let correlator = CosineCorrelator::new(&a);
        assert_eq!(correlator.similarity(&b), 0.0);
    }

    fn single_peak_session() -> FeatureFindingSession {
        let range = sample_range();
        let mut store: StoreMemory<Point> = StoreMemory::new();
        let mut tile = Tile::new((0, 0), 10);
        tile.set_scan_slot(4, vec![point(500.0, 1000.0)]);
        store.save(&tile, ContentKind::Ms1Centroided).unwrap();
        let manager = TileManager::new(Box::new(store), 10, 8);
        let device = TileDevice::new(manager, range, ContentKind::Ms1Centroided);
        let rect = TileRect { x: 0, y: 0, width: 1, height: 1 };
        FeatureFindingSession::new(device, rect, false).unwrap()
    }

    #[test]
    fn run_consumes_a_single_isolated_peak_into_one_feature() {
        let mut session = single_peak_session();
        let converter = converter();
        let options = ClusterFinderOptions {
            hill_finder: HillFinderOptions { mz_tolerance: 0.1, algorithm: HillFinderAlgorithm::ZeroBounded, ..Default::default() },
            ..Default::default()
        };
        let mut finder = ClusterFinder::new(
            options,
            Box::new(IsotopeSpacingChargeDeterminator::default()),
            Box::new(IsotopeSpacingMonoisotopeDeterminator::default()),
        );
        let features = finder.run(&mut session, &converter).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].clusters[0].charge, 1);

        // The point is fully consumed: a second run finds nothing left.
        let more = finder.run(&mut session, &converter).unwrap();
        assert!(more.is_empty());
    }

    #[test]
    fn run_terminates_immediately_below_min_intensity() {
        let mut session = single_peak_session();
        let converter = converter();
        let options = ClusterFinderOptions { min_intensity: 1_000_000.0, ..Default::default() };
        let mut finder = ClusterFinder::new(
            options,
            Box::new(IsotopeSpacingChargeDeterminator::default()),
            Box::new(IsotopeSpacingMonoisotopeDeterminator::default()),
        );
        let features = finder.run(&mut session, &converter).unwrap();
        assert!(features.is_empty());
    }
}
