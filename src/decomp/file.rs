//! Persisted decomposition container.
//!
//! A decomposition built once can be saved and replayed across runs: the
//! file records every task's compute map plus the global dimensions, with
//! short map rows padded by a fill sentinel so the map is rectangular. The
//! write is collective (maps gather to the io root); the read is local,
//! every task parses the same file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::comm::{Communicator, Wait, tags};
use crate::error::PioError;
use crate::iosystem::PioContext;

/// Pads map rows shorter than the widest task's row.
pub const MAP_FILL: i64 = -1;

/// On-disk decomposition record.
///
/// `map` holds 1-based global offsets (`0` = hole) exactly as passed to
/// decomposition construction; rows are padded to `max_maplen` with
/// [`MAP_FILL`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompFile {
    pub title: String,
    pub history: String,
    pub source: String,
    pub version: String,
    pub ndims: usize,
    pub gdims: Vec<i64>,
    pub ntasks: usize,
    pub maplen: Vec<usize>,
    pub map: Vec<Vec<i64>>,
}

impl DecompFile {
    /// Assemble from per-task maps, padding rows to a rectangle.
    pub fn new(
        title: &str,
        history: &str,
        gdims: &[i64],
        task_maps: Vec<Vec<i64>>,
    ) -> Result<Self, PioError> {
        if gdims.is_empty() || task_maps.is_empty() {
            return Err(PioError::invalid(
                "decomposition file needs at least one dimension and one task",
            ));
        }
        let maplen: Vec<usize> = task_maps.iter().map(Vec::len).collect();
        let width = maplen.iter().copied().max().unwrap_or(0);
        let map = task_maps
            .into_iter()
            .map(|mut row| {
                row.resize(width, MAP_FILL);
                row
            })
            .collect();
        Ok(DecompFile {
            title: title.to_string(),
            history: history.to_string(),
            source: format!("{} library version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ndims: gdims.len(),
            gdims: gdims.to_vec(),
            ntasks: maplen.len(),
            maplen,
            map,
        })
    }

    /// One task's map with the fill padding stripped.
    pub fn task_map(&self, rank: usize) -> Result<&[i64], PioError> {
        let row = self
            .map
            .get(rank)
            .ok_or_else(|| PioError::DecompFile(format!("no map row for task {rank}")))?;
        let len = self.maplen[rank];
        row.get(..len)
            .ok_or_else(|| PioError::DecompFile(format!("map row for task {rank} shorter than its maplen")))
    }

    /// Structural checks after parsing an untrusted file.
    fn validate(&self) -> Result<(), PioError> {
        if self.gdims.len() != self.ndims {
            return Err(PioError::DecompFile(format!(
                "gdims has {} entries, ndims says {}",
                self.gdims.len(),
                self.ndims
            )));
        }
        if self.maplen.len() != self.ntasks || self.map.len() != self.ntasks {
            return Err(PioError::DecompFile(format!(
                "maplen/map rows ({}/{}) disagree with ntasks {}",
                self.maplen.len(),
                self.map.len(),
                self.ntasks
            )));
        }
        for (rank, row) in self.map.iter().enumerate() {
            if row.len() < self.maplen[rank] {
                return Err(PioError::DecompFile(format!(
                    "map row for task {rank} shorter than its maplen"
                )));
            }
        }
        Ok(())
    }

    pub fn to_writer<W: std::io::Write>(&self, w: W) -> Result<(), PioError> {
        serde_json::to_writer_pretty(w, self)?;
        Ok(())
    }

    pub fn from_reader<R: std::io::Read>(r: R) -> Result<Self, PioError> {
        let file: DecompFile = serde_json::from_reader(r)?;
        file.validate()?;
        Ok(file)
    }
}

impl<C: Communicator> PioContext<C> {
    /// Persist decomposition `ioid` to `path`; collective. Only the io root
    /// touches the filesystem.
    pub fn write_decomp_file<P: AsRef<Path>>(
        &self,
        path: P,
        ioid: i32,
        title: &str,
        history: &str,
    ) -> Result<(), PioError> {
        let desc = self.decomp(ioid)?;
        let rank = self.comm.rank();
        let root = self.iosystem().io_root();
        let task_maps = gather_maps(&self.comm, root, &desc.compmap)?;
        if rank == root {
            let file = DecompFile::new(title, history, &desc.gdims, task_maps)?;
            debug!(
                "rank {rank}: writing decomposition {ioid} ({} tasks, gdims {:?}) to {}",
                file.ntasks,
                file.gdims,
                path.as_ref().display()
            );
            let w = BufWriter::new(File::create(path)?);
            file.to_writer(w)?;
        }
        Ok(())
    }
}

/// Read a persisted decomposition; local, no communication.
pub fn read_decomp_file<P: AsRef<Path>>(path: P) -> Result<DecompFile, PioError> {
    let r = BufReader::new(File::open(path)?);
    DecompFile::from_reader(r)
}

/// Gather every rank's compute map at `root`, ordered by rank. Non-root
/// ranks get an empty vec back.
fn gather_maps<C: Communicator>(
    comm: &C,
    root: usize,
    compmap: &[i64],
) -> Result<Vec<Vec<i64>>, PioError> {
    let rank = comm.rank();
    let size = comm.size();
    let len_tag = tags::DECOMP_FILE;
    let map_tag = len_tag.offset(1);

    if rank != root {
        comm.isend(root, len_tag.as_u16(), &(compmap.len() as u64).to_le_bytes())
            .wait();
        if !compmap.is_empty() {
            let bytes: Vec<u8> = compmap.iter().flat_map(|v| v.to_le_bytes()).collect();
            comm.isend(root, map_tag.as_u16(), &bytes).wait();
        }
        return Ok(Vec::new());
    }

    let mut rows: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
    rows.insert(root, compmap.to_vec());
    for peer in (0..size).filter(|&p| p != root) {
        let mut lenbuf = [0u8; 8];
        if let Some(data) = comm.irecv(peer, len_tag.as_u16(), &mut lenbuf).wait() {
            if data.len() != lenbuf.len() {
                return Err(PioError::comm(
                    peer,
                    format!("map gather length header: got {} bytes", data.len()),
                ));
            }
            lenbuf.copy_from_slice(&data);
        }
        let len = u64::from_le_bytes(lenbuf) as usize;
        let mut row = vec![0i64; len];
        if len > 0 {
            let mut bytes = vec![0u8; len * 8];
            if let Some(data) = comm.irecv(peer, map_tag.as_u16(), &mut bytes).wait() {
                if data.len() != bytes.len() {
                    return Err(PioError::comm(
                        peer,
                        format!("map gather expected {} bytes, got {}", bytes.len(), data.len()),
                    ));
                }
                bytes.copy_from_slice(&data);
            }
            for (slot, chunk) in row.iter_mut().zip(bytes.chunks_exact(8)) {
                *slot = i64::from_le_bytes(chunk.try_into().map_err(|_| {
                    PioError::comm(peer, "short map chunk".to_string())
                })?);
            }
        }
        rows.insert(peer, row);
    }
    Ok(rows.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_rectangular_and_stripped_back() {
        let file = DecompFile::new(
            "t",
            "h",
            &[1, 3, 3],
            vec![vec![1, 2, 3], vec![4, 5], vec![6, 7], vec![8, 9]],
        )
        .unwrap();
        assert_eq!(file.maplen, vec![3, 2, 2, 2]);
        assert_eq!(file.map[1], vec![4, 5, MAP_FILL]);
        assert_eq!(file.task_map(1).unwrap(), &[4, 5]);
        assert_eq!(file.task_map(0).unwrap(), &[1, 2, 3]);
        assert!(file.task_map(4).is_err());
    }

    #[test]
    fn json_roundtrip_preserves_every_field() {
        let file = DecompFile::new("title", "hist", &[4, 4], vec![vec![1, 2], vec![0, 3]]).unwrap();
        let mut buf = Vec::new();
        file.to_writer(&mut buf).unwrap();
        let back = DecompFile::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn inconsistent_file_rejected() {
        let mut file =
            DecompFile::new("t", "h", &[2, 2], vec![vec![1, 2], vec![3, 4]]).unwrap();
        file.ntasks = 3;
        let mut buf = Vec::new();
        file.to_writer(&mut buf).unwrap();
        assert!(matches!(
            DecompFile::from_reader(buf.as_slice()),
            Err(PioError::DecompFile(_))
        ));
    }
}
