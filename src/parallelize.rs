//! Split the baselines of a dataset across independent jobs.
//!
//! Each job gets a text file listing its baseline-polarizations, one `ant1_ant2_pol` per line,
//! which it can read back with [`read_antpairpol_file`] and pass as the explicit list of
//! [`crate::VisHandle::iterate_by_baseline_group`].

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::{debug, warn};

use crate::{handle::VisHandle, key::AntPairPol, pol::Pol, KvisError};

/// Extension of antpairpol chunk files
pub const ANTPAIRPOL_EXT: &str = "antpairpols";

/// Split `antpairpols` into groups of `bls_per_chunk`, keeping their order. The last group
/// may be short.
///
/// # Errors
///
/// Will return [`KvisError::InvalidChunkSize`] if `bls_per_chunk` is zero.
pub fn antpairpol_chunks(
    antpairpols: &[AntPairPol],
    bls_per_chunk: usize,
) -> Result<Vec<Vec<AntPairPol>>, KvisError> {
    if bls_per_chunk == 0 {
        return Err(KvisError::InvalidChunkSize {
            group_size: bls_per_chunk,
        });
    }
    Ok(antpairpols
        .chunks(bls_per_chunk)
        .map(<[AntPairPol]>::to_vec)
        .collect())
}

/// Write one `<stem>.<chunk>.antpairpols` file into `dir` for each chunk of the baselines of
/// `source`, keeping only `pols` if given. Returns the paths written.
///
/// # Errors
///
/// Will return [`KvisError::MetadataUnavailable`] if the baselines of `source` can't be known
/// without reading it, [`KvisError::InvalidChunkSize`], or [`KvisError::Io`].
pub fn write_antpairpol_chunk_files(
    source: &Path,
    dir: &Path,
    bls_per_chunk: usize,
    pols: Option<&[Pol]>,
) -> Result<Vec<PathBuf>, KvisError> {
    let handle = VisHandle::open_path(source)?;
    let meta = handle.registry().require("write_antpairpol_chunk_files")?;
    let antpairpols = meta
        .antpairpols()
        .into_iter()
        .filter(|key| pols.map_or(true, |pols| pols.contains(&key.pol)))
        .collect_vec();
    if antpairpols.is_empty() {
        warn!("no baselines of {:?} match {:?}", source, pols);
    }
    let stem = source
        .file_stem()
        .map_or_else(|| "kvis".into(), |stem| stem.to_string_lossy());

    let mut paths = vec![];
    for (chunk_idx, chunk) in antpairpol_chunks(&antpairpols, bls_per_chunk)?
        .into_iter()
        .enumerate()
    {
        let path = dir.join(format!("{stem}.{chunk_idx}.{ANTPAIRPOL_EXT}"));
        let mut writer = BufWriter::new(File::create(&path)?);
        for key in chunk {
            writeln!(writer, "{key}")?;
        }
        writer.flush()?;
        paths.push(path);
    }
    debug!(
        "wrote {} antpairpols of {:?} into {} chunk files",
        antpairpols.len(),
        source,
        paths.len()
    );
    Ok(paths)
}

/// Read the baseline-polarizations listed in an antpairpol chunk file. Blank lines are
/// ignored.
///
/// # Errors
///
/// Will return [`KvisError::InvalidAntPairPol`] for a malformed line, or [`KvisError::Io`].
pub fn read_antpairpol_file(path: &Path) -> Result<Vec<AntPairPol>, KvisError> {
    fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::test_common::write_synthetic;

    #[test]
    fn test_chunks_are_ordered_and_ragged() {
        let keys = (0..5)
            .map(|ant| AntPairPol::new(0, ant, Pol::XX))
            .collect_vec();
        let chunks = antpairpol_chunks(&keys, 2).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![keys[4]]);
        assert_eq!(chunks.concat(), keys);
        assert!(matches!(
            antpairpol_chunks(&keys, 0),
            Err(KvisError::InvalidChunkSize { .. })
        ));
    }

    #[test]
    fn test_chunk_files() {
        let tmp_dir = tempdir().unwrap();
        let source = write_synthetic(tmp_dir.path(), "obs.kvb", &[(0, 1), (0, 2), (1, 2)], 2, 2);
        let paths =
            write_antpairpol_chunk_files(&source, tmp_dir.path(), 2, Some(&[Pol::YY])).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], tmp_dir.path().join("obs.1.antpairpols"));
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "0_1_yy\n0_2_yy\n");
        assert_eq!(
            read_antpairpol_file(&paths[1]).unwrap(),
            vec![AntPairPol::new(1, 2, Pol::YY)]
        );
    }

    #[test]
    fn test_malformed_line() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("bad.antpairpols");
        fs::write(&path, "0_1_xx\n\n0_one_xx\n").unwrap();
        assert!(matches!(
            read_antpairpol_file(&path),
            Err(KvisError::InvalidAntPairPol(_))
        ));
    }
}
