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

//! The scan-retrieval interface expected from an MS-vendor file reader.
//!
//! The original source reaches this through a process-wide
//! `MSReader::Instance()` singleton. That is deliberately not modeled here:
//! callers (the tile builder, the document facade) take a `&dyn ScanReader`
//! by explicit handle, so ownership and lifetime stay visible at every call
//! site instead of hiding behind global state.

use ms_errors::Result;

/// One entry of the scan index for a given MS level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanInfo {
    pub scan_number: i64,
    pub retention_time_minutes: f64,
}

/// A single (mz, intensity) point of a profile or centroided spectrum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanPoint {
    pub mz: f64,
    pub intensity: f64,
}

/// A time and mz window used to request an extracted-ion chromatogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct XicWindow {
    pub time_start: f64,
    pub time_end: f64,
    pub mz_start: f64,
    pub mz_end: f64,
}

/// One (time, summed intensity) sample of an extracted-ion chromatogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct XicPoint {
    pub time: f64,
    pub intensity: f64,
}

/// External collaborator: an MS-vendor file reader.
///
/// Implementations are responsible for their own thread safety; this crate
/// only ever calls them sequentially during a build (spec's concurrency
/// model reserves parallelism for the max-intensity finder).
pub trait ScanReader {
    fn open_file(&mut self, path: &std::path::Path) -> Result<()>;

    /// All scans at the given MS level, in ascending scan-number order.
    fn scan_info_list_at_level(&self, ms_level: u8) -> Result<Vec<ScanInfo>>;

    /// The full (mz, intensity) list for one scan.
    fn scan_data(&self, scan_number: i64, centroided: bool) -> Result<Vec<ScanPoint>>;

    /// Optional fallback XIC computation directly from the reader, bypassing
    /// any tile index. `FunctionNotImplemented` for `ms_level != 1` is an
    /// expected, typed failure, not a panic.
    fn xic_data(&self, window: XicWindow, ms_level: u8) -> Result<Vec<XicPoint>> {
        let _ = window;
        Err(ms_errors::Error::not_implemented(format!(
            "xic_data at ms level {ms_level}"
        )))
    }
}

/// An in-memory reader used by tests throughout the workspace, standing in
/// for a real vendor reader the way a test harness normally would.
#[derive(Default, Clone)]
pub struct InMemoryScanReader {
    pub scans: Vec<ScanInfo>,
    pub profile: std::collections::HashMap<i64, Vec<ScanPoint>>,
    pub centroided: std::collections::HashMap<i64, Vec<ScanPoint>>,
}

impl InMemoryScanReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scan(
        &mut self,
        scan_number: i64,
        retention_time_minutes: f64,
        profile: Vec<ScanPoint>,
        centroided: Vec<ScanPoint>,
    ) {
        self.scans.push(ScanInfo {
            scan_number,
            retention_time_minutes,
        });
        self.profile.insert(scan_number, profile);
        self.centroided.insert(scan_number, centroided);
    }
}

impl ScanReader for InMemoryScanReader {
    fn open_file(&mut self, _path: &std::path::Path) -> Result<()> {
        Ok(())
    }

    fn scan_info_list_at_level(&self, _ms_level: u8) -> Result<Vec<ScanInfo>> {
        Ok(self.scans.clone())
    }

    fn scan_data(&self, scan_number: i64, centroided: bool) -> Result<Vec<ScanPoint>> {
        let map = if centroided {
            &self.centroided
        } else {
            &self.profile
        };
        Ok(map.get(&scan_number).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_reader_round_trips_pushed_scans() {
        let mut reader = InMemoryScanReader::new();
        reader.push_scan(
            1,
            0.1,
            vec![ScanPoint {
                mz: 100.0,
                intensity: 10.0,
            }],
            vec![ScanPoint {
                mz: 100.0,
                intensity: 10.0,
            }],
        );
        let infos = reader.scan_info_list_at_level(1).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].scan_number, 1);
        let data = reader.scan_data(1, true).unwrap();
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn default_xic_fallback_is_not_implemented() {
        let reader = InMemoryScanReader::new();
        let window = XicWindow {
            time_start: 0.0,
            time_end: 1.0,
            mz_start: 0.0,
            mz_end: 1.0,
        };
        let err = reader.xic_data(window, 2).unwrap_err();
        assert!(matches!(err, ms_errors::Error::FunctionNotImplemented(_)));
    }
}
