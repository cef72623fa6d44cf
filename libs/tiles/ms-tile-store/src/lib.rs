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

//! Tile persistence: a mapping from (tile position, content kind) to a tile,
//! with a memory backend and a SQLite backend, both implementing partial-tile
//! ingestion and defragmentation the same way.

use std::collections::HashMap;

use ms_errors::{Error, Result};
use ms_tile_range::TileRange;
use zerocopy::AsBytes;

/// Which flavor of MS1 data a tile holds. Selection and hill-id tiles are
/// keyed by the same kind as the MS1 data they shadow, not a kind of their
/// own -- a raw-data run and a centroided-data run track selection
/// independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Ms1Raw,
    Ms1Centroided,
}

impl ContentKind {
    fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Ms1Raw => "MS1Raw",
            ContentKind::Ms1Centroided => "MS1Centroided",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MS1Raw" => Ok(ContentKind::Ms1Raw),
            "MS1Centroided" => Ok(ContentKind::Ms1Centroided),
            other => Err(Error::missing_content(format!("unknown content kind {other}"))),
        }
    }
}

pub type TilePos = (i64, i64);

/// A reference to a single point: the tile it lives in, the scan index of
/// its slot, and its position within that slot. The feature-finding stack's
/// hills are lists of these rather than copies of the point data itself, so
/// marking a point processed or looking up its current value always goes
/// back through the tile it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PointRef {
    pub pos: TilePos,
    pub scan_index: i64,
    pub internal_index: i64,
}

/// One (mz, intensity) sample, the element type of an MS1 tile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub mz: f64,
    pub intensity: f64,
}

/// A tile: `scans.len()` == the range's scan-index tile length; each entry is
/// the (possibly empty) list of points/bits/ids for that scan's offset.
#[derive(Clone, Debug)]
pub struct Tile<T> {
    pub pos: TilePos,
    scans: Vec<Vec<T>>,
}

impl<T: Clone> Tile<T> {
    pub fn new(pos: TilePos, height: i64) -> Self {
        Tile {
            pos,
            scans: vec![Vec::new(); height.max(0) as usize],
        }
    }

    pub fn height(&self) -> i64 {
        self.scans.len() as i64
    }

    pub fn scan_slot(&self, offset: i64) -> &[T] {
        &self.scans[offset as usize]
    }

    pub fn set_scan_slot(&mut self, offset: i64, data: Vec<T>) {
        self.scans[offset as usize] = data;
    }

    pub fn is_empty(&self) -> bool {
        self.scans.iter().all(|s| s.is_empty())
    }

    pub fn total_point_count(&self) -> usize {
        self.scans.iter().map(|s| s.len()).sum()
    }

    /// Merges `other`'s non-empty slots into `self`, concatenating any slot
    /// written by both (defragmentation's merge rule).
    fn merge_from(&mut self, other: &Tile<T>) {
        for (offset, slot) in other.scans.iter().enumerate() {
            if slot.is_empty() {
                continue;
            }
            self.scans[offset].extend(slot.iter().cloned());
        }
    }
}

/// Persistence for tiles of element type `T`, parameterized the way the
/// original's memory/SQLite/generic hierarchy is: one trait, several
/// concrete stores.
pub trait Store<T: Clone> {
    fn save(&mut self, tile: &Tile<T>, kind: ContentKind) -> Result<bool>;

    /// Loads a tile, returning an empty tile of the given height if absent.
    fn load(&mut self, pos: TilePos, kind: ContentKind, height: i64) -> Result<Tile<T>>;

    fn contains(&self, pos: TilePos, kind: ContentKind) -> Result<bool>;

    fn begin_transaction(&mut self) -> Result<()>;
    fn end_transaction(&mut self) -> Result<()>;

    fn begin_partial(&mut self) -> Result<()>;
    fn save_partial(&mut self, tile: &Tile<T>, kind: ContentKind, write_pass: u32) -> Result<()>;
    fn end_partial(&mut self) -> Result<()>;

    /// Concatenates partial-tile parts grouped by `(kind, pos, write_pass)`
    /// into this store's own final tiles, then drops the partial table.
    /// Mirrors the original's `store->defragmentTiles(store)` call, where
    /// the partial source and the final destination are the same object.
    fn defragment(&mut self, height: i64) -> Result<()>;

    /// An independent store over independent storage (a fresh connection for
    /// SQLite, a deep copy for memory) so a worker thread never shares a
    /// store with its caller.
    fn try_clone_store(&self) -> Result<Box<dyn Store<T>>>;
}

/// In-memory store: two hash maps, one for final tiles, one for partial
/// parts awaiting defragmentation. Used for the MS1 stores when no SQLite
/// cache file is configured, and always for selection/hill-id tiles (those
/// are never persisted).
#[derive(Default)]
pub struct StoreMemory<T> {
    tiles: HashMap<(ContentKind, TilePos), Tile<T>>,
    partial: HashMap<(ContentKind, TilePos, u32), Tile<T>>,
}

impl<T: Clone> StoreMemory<T> {
    pub fn new() -> Self {
        StoreMemory {
            tiles: HashMap::new(),
            partial: HashMap::new(),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Drains every `(kind, pos) -> tile` entry, leaving the store empty.
    /// Used by the tile builder's in-memory pool: once pooled data crosses
    /// the flush threshold, each pooled tile is pushed into the real store's
    /// partial table and the pool starts over.
    pub fn drain_tiles(&mut self) -> Vec<(ContentKind, TilePos, Tile<T>)> {
        self.tiles
            .drain()
            .map(|((kind, pos), tile)| (kind, pos, tile))
            .collect()
    }
}

impl<T: Clone + 'static> Store<T> for StoreMemory<T> {
    fn save(&mut self, tile: &Tile<T>, kind: ContentKind) -> Result<bool> {
        self.tiles.insert((kind, tile.pos), tile.clone());
        Ok(true)
    }

    fn load(&mut self, pos: TilePos, kind: ContentKind, height: i64) -> Result<Tile<T>> {
        Ok(self
            .tiles
            .get(&(kind, pos))
            .cloned()
            .unwrap_or_else(|| Tile::new(pos, height)))
    }

    fn contains(&self, pos: TilePos, kind: ContentKind) -> Result<bool> {
        Ok(self.tiles.contains_key(&(kind, pos)))
    }

    fn begin_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_partial(&mut self) -> Result<()> {
        Ok(())
    }

    fn save_partial(&mut self, tile: &Tile<T>, kind: ContentKind, write_pass: u32) -> Result<()> {
        self.partial.insert((kind, tile.pos, write_pass), tile.clone());
        Ok(())
    }

    fn end_partial(&mut self) -> Result<()> {
        Ok(())
    }

    fn defragment(&mut self, height: i64) -> Result<()> {
        let mut by_pos: HashMap<(ContentKind, TilePos), Vec<(u32, Tile<T>)>> = HashMap::new();
        for ((kind, pos, pass), tile) in self.partial.drain() {
            by_pos.entry((kind, pos)).or_default().push((pass, tile));
        }
        for ((kind, pos), mut parts) in by_pos {
            parts.sort_by_key(|(pass, _)| *pass);
            let mut merged = self.tiles.remove(&(kind, pos)).unwrap_or_else(|| Tile::new(pos, height));
            for (_, part) in &parts {
                merged.merge_from(part);
            }
            self.tiles.insert((kind, pos), merged);
        }
        Ok(())
    }

    fn try_clone_store(&self) -> Result<Box<dyn Store<T>>> {
        Ok(Box::new(StoreMemory {
            tiles: self.tiles.clone(),
            partial: self.partial.clone(),
        }))
    }
}

/// The single-row table recording the tile range a store was built with, so
/// a later process can reopen a `.NonUniform.cache` file without being told
/// the range again.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileStoreInfo {
    pub mz_min: f64,
    pub mz_max: f64,
    pub mz_tile_length: f64,
    pub scan_index_min: i64,
    pub scan_index_max: i64,
    pub scan_index_tile_length: i64,
}

impl TileStoreInfo {
    pub fn from_range(range: &TileRange) -> Self {
        TileStoreInfo {
            mz_min: range.mz_min(),
            mz_max: range.mz_max(),
            mz_tile_length: range.mz_tile_length(),
            scan_index_min: range.scan_index_min(),
            scan_index_max: range.scan_index_max(),
            scan_index_tile_length: range.scan_index_tile_length(),
        }
    }

    pub fn to_range(self) -> Result<TileRange> {
        let mut range = TileRange::new();
        range.set_mz(self.mz_min, self.mz_max)?;
        range.set_mz_tile_length(self.mz_tile_length);
        range.set_scan_index(self.scan_index_min, self.scan_index_max)?;
        range.set_scan_index_length(self.scan_index_tile_length);
        Ok(range)
    }
}

/// SQLite-backed store for MS1 point tiles. Three parallel BLOBs per
/// (tile, kind) row: internal indices, mz values, intensities, plus a
/// per-scan offset table so a read can slice the flat arrays back into
/// per-scan-slot lists.
pub struct StoreSqlite {
    conn: rusqlite::Connection,
    path: Option<std::path::PathBuf>,
}

impl StoreSqlite {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(StoreSqlite {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(StoreSqlite { conn, path: None })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS NonUniformTilesInfo (
                Id INTEGER PRIMARY KEY,
                MzMin REAL, MzMax REAL, MzTileLength REAL,
                ScanIndexMin INTEGER, ScanIndexMax INTEGER, ScanIndexTileLength INTEGER
            );
            CREATE TABLE IF NOT EXISTS NonUniformTiles (
                TileX INTEGER, TileY INTEGER, Kind TEXT,
                InternalIndexBlob BLOB, MzBlob BLOB, IntensityBlob BLOB, OffsetsBlob BLOB,
                PRIMARY KEY (TileX, TileY, Kind)
            );
            CREATE TABLE IF NOT EXISTS NonUniformTilesPartial (
                TileX INTEGER, TileY INTEGER, Kind TEXT, WritePass INTEGER,
                InternalIndexBlob BLOB, MzBlob BLOB, IntensityBlob BLOB, OffsetsBlob BLOB
            );",
        )?;
        Ok(())
    }

    pub fn save_info(&self, info: &TileStoreInfo) -> Result<()> {
        self.conn.execute("DELETE FROM NonUniformTilesInfo", [])?;
        self.conn.execute(
            "INSERT INTO NonUniformTilesInfo
                (Id, MzMin, MzMax, MzTileLength, ScanIndexMin, ScanIndexMax, ScanIndexTileLength)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                info.mz_min,
                info.mz_max,
                info.mz_tile_length,
                info.scan_index_min,
                info.scan_index_max,
                info.scan_index_tile_length
            ],
        )?;
        Ok(())
    }

    pub fn load_info(&self) -> Result<TileStoreInfo> {
        self.conn
            .query_row(
                "SELECT MzMin, MzMax, MzTileLength, ScanIndexMin, ScanIndexMax, ScanIndexTileLength
                 FROM NonUniformTilesInfo LIMIT 1",
                [],
                |row| {
                    Ok(TileStoreInfo {
                        mz_min: row.get(0)?,
                        mz_max: row.get(1)?,
                        mz_tile_length: row.get(2)?,
                        scan_index_min: row.get(3)?,
                        scan_index_max: row.get(4)?,
                        scan_index_tile_length: row.get(5)?,
                    })
                },
            )
            .map_err(|_| Error::missing_content("NonUniformTilesInfo has no row"))
    }

    fn pack(tile: &Tile<Point>) -> (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut internal_index = Vec::new();
        let mut mz = Vec::new();
        let mut intensity = Vec::new();
        let mut offsets: Vec<i32> = vec![0];
        let mut running = 0i32;
        for offset in 0..tile.height() {
            let slot = tile.scan_slot(offset);
            for (i, p) in slot.iter().enumerate() {
                internal_index.push(i as i32);
                mz.push(p.mz);
                intensity.push(p.intensity);
            }
            running += slot.len() as i32;
            offsets.push(running);
        }
        (
            internal_index.as_bytes().to_vec(),
            mz.as_bytes().to_vec(),
            intensity.as_bytes().to_vec(),
            offsets.as_bytes().to_vec(),
        )
    }

    fn unpack(
        pos: TilePos,
        height: i64,
        internal_index: &[u8],
        mz: &[u8],
        intensity: &[u8],
        offsets: &[u8],
    ) -> Tile<Point> {
        let internal_index: &[i32] =
            zerocopy::LayoutVerified::new_slice(internal_index).unwrap().into_slice();
        let mz: &[f64] = zerocopy::LayoutVerified::new_slice(mz).unwrap().into_slice();
        let intensity: &[f64] = zerocopy::LayoutVerified::new_slice(intensity).unwrap().into_slice();
        let offsets: &[i32] = zerocopy::LayoutVerified::new_slice(offsets).unwrap().into_slice();
        let _ = internal_index;

        let mut tile = Tile::new(pos, height);
        for offset in 0..height as usize {
            let start = offsets[offset] as usize;
            let end = offsets[offset + 1] as usize;
            let slot: Vec<Point> = mz[start..end]
                .iter()
                .zip(intensity[start..end].iter())
                .map(|(&mz, &intensity)| Point { mz, intensity })
                .collect();
            tile.set_scan_slot(offset as i64, slot);
        }
        tile
    }
}

impl Store<Point> for StoreSqlite {
    fn save(&mut self, tile: &Tile<Point>, kind: ContentKind) -> Result<bool> {
        let (internal_index, mz, intensity, offsets) = Self::pack(tile);
        self.conn.execute(
            "INSERT OR REPLACE INTO NonUniformTiles
                (TileX, TileY, Kind, InternalIndexBlob, MzBlob, IntensityBlob, OffsetsBlob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                tile.pos.0,
                tile.pos.1,
                kind.as_str(),
                internal_index,
                mz,
                intensity,
                offsets
            ],
        )?;
        Ok(true)
    }

    fn load(&mut self, pos: TilePos, kind: ContentKind, height: i64) -> Result<Tile<Point>> {
        let row = self.conn.query_row(
            "SELECT InternalIndexBlob, MzBlob, IntensityBlob, OffsetsBlob
             FROM NonUniformTiles WHERE TileX = ?1 AND TileY = ?2 AND Kind = ?3",
            rusqlite::params![pos.0, pos.1, kind.as_str()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            },
        );
        match row {
            Ok((internal_index, mz, intensity, offsets)) => Ok(Self::unpack(
                pos,
                height,
                &internal_index,
                &mz,
                &intensity,
                &offsets,
            )),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Tile::new(pos, height)),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, pos: TilePos, kind: ContentKind) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM NonUniformTiles WHERE TileX = ?1 AND TileY = ?2 AND Kind = ?3",
            rusqlite::params![pos.0, pos.1, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn begin_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn begin_partial(&mut self) -> Result<()> {
        Ok(())
    }

    fn save_partial(&mut self, tile: &Tile<Point>, kind: ContentKind, write_pass: u32) -> Result<()> {
        let (internal_index, mz, intensity, offsets) = Self::pack(tile);
        self.conn.execute(
            "INSERT INTO NonUniformTilesPartial
                (TileX, TileY, Kind, WritePass, InternalIndexBlob, MzBlob, IntensityBlob, OffsetsBlob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                tile.pos.0,
                tile.pos.1,
                kind.as_str(),
                write_pass,
                internal_index,
                mz,
                intensity,
                offsets
            ],
        )?;
        Ok(())
    }

    fn end_partial(&mut self) -> Result<()> {
        Ok(())
    }

    fn defragment(&mut self, height: i64) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT TileX, TileY, Kind, WritePass, InternalIndexBlob, MzBlob, IntensityBlob, OffsetsBlob
             FROM NonUniformTilesPartial ORDER BY TileX, TileY, Kind, WritePass",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, Vec<u8>>(5)?,
                row.get::<_, Vec<u8>>(6)?,
                row.get::<_, Vec<u8>>(7)?,
            ))
        })?;

        let mut by_pos: HashMap<(ContentKind, TilePos), Tile<Point>> = HashMap::new();
        for row in rows {
            let (x, y, kind_str, _pass, internal_index, mz, intensity, offsets) = row?;
            let kind = ContentKind::from_str(&kind_str)?;
            let part = Self::unpack((x, y), height, &internal_index, &mz, &intensity, &offsets);
            by_pos
                .entry((kind, (x, y)))
                .or_insert_with(|| Tile::new((x, y), height))
                .merge_from(&part);
        }
        drop(stmt);

        for ((kind, pos), mut tile) in by_pos {
            if let Ok(existing) = self.load(pos, kind, height) {
                if !existing.is_empty() {
                    let mut combined = existing;
                    combined.merge_from(&tile);
                    tile = combined;
                }
            }
            self.save(&tile, kind)?;
        }

        self.conn.execute("DELETE FROM NonUniformTilesPartial", [])?;
        Ok(())
    }

    fn try_clone_store(&self) -> Result<Box<dyn Store<Point>>> {
        match &self.path {
            Some(path) => Ok(Box::new(StoreSqlite::open(path)?)),
            None => {
                log::warn!("cloning an in-memory sqlite store opens an unrelated empty database");
                Ok(Box::new(StoreSqlite::open_in_memory()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(mz: f64, intensity: f64) -> Point {
        Point { mz, intensity }
    }

    #[test]
    fn memory_store_round_trips_a_full_tile() {
        let mut store: StoreMemory<Point> = StoreMemory::new();
        let mut tile = Tile::new((0, 0), 4);
        tile.set_scan_slot(0, vec![point(100.0, 10.0), point(101.0, 20.0)]);
        tile.set_scan_slot(2, vec![point(200.0, 5.0)]);

        store.save(&tile, ContentKind::Ms1Centroided).unwrap();
        assert!(store.contains((0, 0), ContentKind::Ms1Centroided).unwrap());

        let loaded = store.load((0, 0), ContentKind::Ms1Centroided, 4).unwrap();
        assert_eq!(loaded.scan_slot(0).len(), 2);
        assert_eq!(loaded.scan_slot(1).len(), 0);
        assert_eq!(loaded.scan_slot(2)[0].mz, 200.0);
    }

    #[test]
    fn load_missing_tile_returns_empty_shell() {
        let mut store: StoreMemory<Point> = StoreMemory::new();
        let loaded = store.load((5, 5), ContentKind::Ms1Raw, 8).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.height(), 8);
    }

    #[test]
    fn defragment_concatenates_partial_parts_by_write_pass() {
        let mut store: StoreMemory<Point> = StoreMemory::new();

        let mut pass0 = Tile::new((1, 0), 2);
        pass0.set_scan_slot(0, vec![point(10.0, 1.0)]);
        store.save_partial(&pass0, ContentKind::Ms1Raw, 0).unwrap();

        let mut pass1 = Tile::new((1, 0), 2);
        pass1.set_scan_slot(1, vec![point(20.0, 2.0)]);
        store.save_partial(&pass1, ContentKind::Ms1Raw, 1).unwrap();

        store.defragment(2).unwrap();

        let merged = store.load((1, 0), ContentKind::Ms1Raw, 2).unwrap();
        assert_eq!(merged.scan_slot(0)[0].mz, 10.0);
        assert_eq!(merged.scan_slot(1)[0].mz, 20.0);
        assert_eq!(store.tile_count(), 1);
    }

    #[test]
    fn defragment_concatenates_two_writes_to_same_offset() {
        let mut store: StoreMemory<i32> = StoreMemory::new();

        let mut pass0 = Tile::new((0, 0), 1);
        pass0.set_scan_slot(0, vec![1, 2]);
        store.save_partial(&pass0, ContentKind::Ms1Raw, 0).unwrap();

        let mut pass1 = Tile::new((0, 0), 1);
        pass1.set_scan_slot(0, vec![3]);
        store.save_partial(&pass1, ContentKind::Ms1Raw, 1).unwrap();

        store.defragment(1).unwrap();
        let merged = store.load((0, 0), ContentKind::Ms1Raw, 1).unwrap();
        assert_eq!(merged.scan_slot(0), &[1, 2, 3]);
    }

    #[test]
    fn memory_store_clone_is_independent() {
        let mut store: StoreMemory<Point> = StoreMemory::new();
        let mut tile = Tile::new((0, 0), 2);
        tile.set_scan_slot(0, vec![point(1.0, 1.0)]);
        store.save(&tile, ContentKind::Ms1Raw).unwrap();

        let mut clone = store.try_clone_store().unwrap();
        clone
            .save(&Tile::new((9, 9), 2), ContentKind::Ms1Raw)
            .unwrap();

        assert!(!store.contains((9, 9), ContentKind::Ms1Raw).unwrap());
        assert!(clone.contains((0, 0), ContentKind::Ms1Raw).unwrap());
    }

    #[test]
    fn sqlite_store_round_trips_info_row() {
        let mut range = TileRange::new();
        range.set_mz(380.0, 440.0).unwrap();
        range.set_mz_tile_length(30.0);
        range.set_scan_index(0, 999).unwrap();
        range.set_scan_index_length(64);

        let store = StoreSqlite::open_in_memory().unwrap();
        store.save_info(&TileStoreInfo::from_range(&range)).unwrap();
        let loaded = store.load_info().unwrap();
        assert_eq!(loaded.mz_min, 380.0);
        assert_eq!(loaded.scan_index_tile_length, 64);
    }

    #[test]
    fn sqlite_store_round_trips_a_tile() {
        let mut store = StoreSqlite::open_in_memory().unwrap();
        let mut tile: Tile<Point> = Tile::new((2, 3), 4);
        tile.set_scan_slot(0, vec![point(400.0, 1.0), point(401.5, 2.0)]);
        tile.set_scan_slot(3, vec![point(450.0, 3.0)]);

        store.save(&tile, ContentKind::Ms1Raw).unwrap();
        let loaded = store.load((2, 3), ContentKind::Ms1Raw, 4).unwrap();
        assert_eq!(loaded.scan_slot(0).len(), 2);
        assert_eq!(loaded.scan_slot(0)[1].mz, 401.5);
        assert_eq!(loaded.scan_slot(1).len(), 0);
        assert_eq!(loaded.scan_slot(3)[0].intensity, 3.0);
    }

    #[test]
    fn sqlite_defragment_merges_partial_passes_into_final_tile() {
        let mut store = StoreSqlite::open_in_memory().unwrap();
        let mut pass0: Tile<Point> = Tile::new((0, 0), 2);
        pass0.set_scan_slot(0, vec![point(1.0, 1.0)]);
        store.save_partial(&pass0, ContentKind::Ms1Raw, 0).unwrap();

        let mut pass1: Tile<Point> = Tile::new((0, 0), 2);
        pass1.set_scan_slot(1, vec![point(2.0, 2.0)]);
        store.save_partial(&pass1, ContentKind::Ms1Raw, 1).unwrap();

        store.defragment(2).unwrap();

        let merged = store.load((0, 0), ContentKind::Ms1Raw, 2).unwrap();
        assert_eq!(merged.scan_slot(0)[0].mz, 1.0);
        assert_eq!(merged.scan_slot(1)[0].mz, 2.0);
    }
}
