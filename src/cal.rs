//! Calibration solutions: per-antenna gains, flags and quality, and per-polarization total
//! quality.
//!
//! Calibration files are small, so a [`CalHandle`] only reads and writes them whole. An update
//! must provide every key that was read.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::IndexMap;
use log::{debug, trace};

use crate::{
    container::{Conjugate, DataContainer},
    io::{calsol::CalsolBackend, CalBackend},
    key::{AntPol, ContainerKey},
    marlu::{ndarray::Array2, Complex},
    pol::JonesPol,
    KvisError,
};

/// The axes of a set of calibration solutions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalMeta {
    /// Channel centre frequencies \[Hz\]
    pub freqs: Vec<f64>,
    /// Julian dates of each solution interval
    pub times: Vec<f64>,
    /// Antenna indices
    pub ants: Vec<usize>,
    /// Jones polarizations
    pub jones_pols: Vec<JonesPol>,
    /// Free-text processing history
    pub history: String,
}

impl CalMeta {
    /// The (times, channels) shape of every solution array.
    pub fn shape(&self) -> (usize, usize) {
        (self.times.len(), self.freqs.len())
    }

    /// Every antenna-polarization key, antenna-major.
    pub fn antpols(&self) -> Vec<AntPol> {
        self.ants
            .iter()
            .flat_map(|&ant| self.jones_pols.iter().map(move |&pol| AntPol::new(ant, pol)))
            .collect()
    }
}

/// The contents of a calibration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalSolutions {
    /// Complex gains
    pub gains: IndexMap<AntPol, Array2<Complex<f64>>>,
    /// Flags, true where the solution is bad
    pub flags: IndexMap<AntPol, Array2<bool>>,
    /// Per-antenna solution quality
    pub quality: IndexMap<AntPol, Array2<f64>>,
    /// Per-polarization total quality, for the polarizations that have one
    pub total_quality: IndexMap<JonesPol, Array2<f64>>,
}

/// The containers produced by [`CalHandle::read`]. All four share one [`CalMeta`].
#[derive(Debug, Clone)]
pub struct CalContainers {
    /// Complex gains
    pub gains: DataContainer<AntPol, Complex<f64>, CalMeta>,
    /// Solution flags
    pub flags: DataContainer<AntPol, bool, CalMeta>,
    /// Per-antenna quality
    pub quality: DataContainer<AntPol, f64, CalMeta>,
    /// Per-polarization total quality
    pub total_quality: DataContainer<JonesPol, f64, CalMeta>,
}

/// A calibration solutions file.
pub struct CalHandle {
    path: PathBuf,
    backend: Box<dyn CalBackend>,
    meta: Option<Arc<CalMeta>>,
    solutions: Option<CalSolutions>,
}

impl CalHandle {
    /// Bind a handle to a `.kcal` file. Nothing is read until [`CalHandle::read`].
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backend: Box::new(CalsolBackend),
            meta: None,
            solutions: None,
        }
    }

    /// The file this handle is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The metadata of the last read.
    pub fn meta(&self) -> Option<&Arc<CalMeta>> {
        self.meta.as_ref()
    }

    /// Read the whole file, replacing whatever was read before.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::BackendRead`] if the file can't be parsed.
    pub fn read(&mut self) -> Result<CalContainers, KvisError> {
        trace!("start read of {:?}", self.path);
        let (meta, solutions) = self.backend.read_full(&self.path)?;
        let meta = Arc::new(meta);
        let containers = CalContainers {
            gains: DataContainer::from_arrays(solutions.gains.clone(), Some(meta.clone()))?,
            flags: DataContainer::from_arrays(solutions.flags.clone(), Some(meta.clone()))?,
            quality: DataContainer::from_arrays(solutions.quality.clone(), Some(meta.clone()))?,
            total_quality: DataContainer::from_arrays(
                solutions.total_quality.clone(),
                Some(meta.clone()),
            )?,
        };
        debug!(
            "read {} antenna-polarizations from {:?}",
            containers.gains.len(),
            self.path
        );
        self.meta = Some(meta);
        self.solutions = Some(solutions);
        Ok(containers)
    }

    /// Copy new values into the in-memory solutions. Nothing is written to disk.
    ///
    /// Every container that is given must hold every key of the last read, and no others.
    /// Nothing is changed unless every container is valid.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::SubsetUndefined`] before any read,
    /// [`KvisError::IncompleteUpdate`] if a container lacks a key that was read,
    /// [`KvisError::KeyNotInSubset`] if it has a key that wasn't, or
    /// [`KvisError::ShapeMismatch`] if its arrays have the wrong shape.
    pub fn update(
        &mut self,
        gains: Option<&DataContainer<AntPol, Complex<f64>, CalMeta>>,
        flags: Option<&DataContainer<AntPol, bool, CalMeta>>,
        quality: Option<&DataContainer<AntPol, f64, CalMeta>>,
        total_quality: Option<&DataContainer<JonesPol, f64, CalMeta>>,
    ) -> Result<(), KvisError> {
        let (meta, solutions) = match (&self.meta, &mut self.solutions) {
            (Some(meta), Some(solutions)) => (meta, solutions),
            _ => {
                return Err(KvisError::SubsetUndefined {
                    operation: "update".to_string(),
                })
            }
        };
        let shape = meta.shape();
        if let Some(gains) = gains {
            check_complete("gains", gains, solutions.gains.keys(), shape)?;
        }
        if let Some(flags) = flags {
            check_complete("flags", flags, solutions.flags.keys(), shape)?;
        }
        if let Some(quality) = quality {
            check_complete("quality", quality, solutions.quality.keys(), shape)?;
        }
        if let Some(total_quality) = total_quality {
            check_complete(
                "total_quality",
                total_quality,
                solutions.total_quality.keys(),
                shape,
            )?;
        }

        if let Some(gains) = gains {
            copy_into(&mut solutions.gains, gains);
        }
        if let Some(flags) = flags {
            copy_into(&mut solutions.flags, flags);
        }
        if let Some(quality) = quality {
            copy_into(&mut solutions.quality, quality);
        }
        if let Some(total_quality) = total_quality {
            copy_into(&mut solutions.total_quality, total_quality);
        }
        Ok(())
    }

    /// Write the in-memory solutions to a new file.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::SubsetUndefined`] before any read, [`KvisError::FileExists`]
    /// if `path` exists and `overwrite` is false, or [`KvisError::BackendWrite`].
    pub fn write<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<(), KvisError> {
        match (&self.meta, &self.solutions) {
            (Some(meta), Some(solutions)) => {
                self.backend
                    .write_full(path.as_ref(), meta, solutions, overwrite)
            }
            _ => Err(KvisError::SubsetUndefined {
                operation: "write".to_string(),
            }),
        }
    }

    /// Calibration files can't be written in parts.
    ///
    /// # Errors
    ///
    /// Always returns [`KvisError::NotSupported`].
    pub fn partial_write<P: AsRef<Path>>(&self, path: P) -> Result<(), KvisError> {
        Err(KvisError::NotSupported {
            operation: format!("partial_write to {:?}", path.as_ref()),
            target: "calibration solutions".to_string(),
        })
    }
}

fn check_complete<'a, K: ContainerKey + 'a, T: Conjugate, M>(
    name: &str,
    container: &DataContainer<K, T, M>,
    read_keys: impl Iterator<Item = &'a K> + Clone,
    shape: (usize, usize),
) -> Result<(), KvisError> {
    if let Some(key) = container
        .keys()
        .find(|key| !read_keys.clone().any(|read| read == *key))
    {
        return Err(KvisError::KeyNotInSubset {
            key: key.to_string(),
        });
    }
    let missing: Vec<&K> = read_keys
        .filter(|key| container.get_stored(key).is_none())
        .collect();
    if let Some(example) = missing.first() {
        return Err(KvisError::IncompleteUpdate {
            container: name.to_string(),
            num_missing: missing.len(),
            example: example.to_string(),
        });
    }
    match container.shape() {
        Some(received) if received != shape => Err(KvisError::ShapeMismatch {
            argument: name.to_string(),
            function: "CalHandle::update".to_string(),
            expected: format!("{shape:?}"),
            received: format!("{received:?}"),
        }),
        _ => Ok(()),
    }
}

fn copy_into<K: ContainerKey, T: Conjugate, M>(
    target: &mut IndexMap<K, Array2<T>>,
    container: &DataContainer<K, T, M>,
) {
    for (key, array) in container.items() {
        if let Some(slot) = target.get_mut(key) {
            slot.clone_from(array);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::test_common::synthetic_calsols;

    fn write_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("fixture.kcal");
        let (meta, solutions) =
            synthetic_calsols(&[0, 1, 2], &[JonesPol::Jee, JonesPol::Jnn], 2, 3);
        CalsolBackend
            .write_full(&path, &meta, &solutions, false)
            .unwrap();
        path
    }

    #[test]
    fn test_read_shares_meta() {
        let tmp_dir = tempdir().unwrap();
        let mut handle = CalHandle::open(write_fixture(tmp_dir.path()));
        let cal = handle.read().unwrap();
        assert_eq!(cal.gains.len(), 6);
        assert_eq!(cal.total_quality.len(), 2);
        assert_eq!(cal.gains.shape(), Some((2, 3)));
        assert!(cal.gains.shares_meta_with(&cal.flags));
        assert!(cal.gains.shares_meta_with(&cal.quality));
        assert_eq!(cal.gains.meta().unwrap().ants, vec![0, 1, 2]);
    }

    #[test]
    fn test_update_then_write() {
        let tmp_dir = tempdir().unwrap();
        let mut handle = CalHandle::open(write_fixture(tmp_dir.path()));
        let mut cal = handle.read().unwrap();
        let key = AntPol::new(1, JonesPol::Jnn);
        cal.gains
            .get_stored_mut(&key)
            .unwrap()
            .fill(Complex::new(2.0, -1.0));
        handle.update(Some(&cal.gains), None, None, None).unwrap();

        let out = tmp_dir.path().join("out.kcal");
        handle.write(&out, false).unwrap();
        let reread = CalHandle::open(&out).read().unwrap();
        assert!(reread
            .gains
            .get(&key)
            .unwrap()
            .iter()
            .all(|&g| g == Complex::new(2.0, -1.0)));
        assert_eq!(reread.flags.get(&key).unwrap(), cal.flags.get(&key).unwrap());
    }

    #[test]
    fn test_update_requires_full_key_set() {
        let tmp_dir = tempdir().unwrap();
        let mut handle = CalHandle::open(write_fixture(tmp_dir.path()));
        let mut cal = handle.read().unwrap();
        cal.quality.remove(&AntPol::new(0, JonesPol::Jee));
        cal.gains
            .get_stored_mut(&AntPol::new(2, JonesPol::Jee))
            .unwrap()
            .fill(Complex::new(9.0, 9.0));
        assert!(matches!(
            handle.update(Some(&cal.gains), None, Some(&cal.quality), None),
            Err(KvisError::IncompleteUpdate { num_missing: 1, .. })
        ));
        // the gains were valid, but nothing is applied when any container is invalid
        let out = tmp_dir.path().join("unchanged.kcal");
        handle.write(&out, false).unwrap();
        let reread = CalHandle::open(&out).read().unwrap();
        assert_ne!(
            reread.gains.get(&AntPol::new(2, JonesPol::Jee)).unwrap()[(0, 0)],
            Complex::new(9.0, 9.0)
        );
    }

    #[test]
    fn test_update_rejects_foreign_keys() {
        let tmp_dir = tempdir().unwrap();
        let mut handle = CalHandle::open(write_fixture(tmp_dir.path()));
        let mut cal = handle.read().unwrap();
        cal.flags
            .set(AntPol::new(7, JonesPol::Jee), Array2::from_elem((2, 3), false))
            .unwrap();
        assert!(matches!(
            handle.update(None, Some(&cal.flags), None, None),
            Err(KvisError::KeyNotInSubset { .. })
        ));
    }

    #[test]
    fn test_partial_write_not_supported() {
        let tmp_dir = tempdir().unwrap();
        let mut handle = CalHandle::open(write_fixture(tmp_dir.path()));
        assert!(matches!(
            handle.partial_write(tmp_dir.path().join("x.kcal")),
            Err(KvisError::NotSupported { .. })
        ));
        handle.read().unwrap();
        assert!(matches!(
            handle.partial_write(tmp_dir.path().join("x.kcal")),
            Err(KvisError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_update_before_read() {
        let mut handle = CalHandle::open("/nonexistent.kcal");
        assert!(matches!(
            handle.update(None, None, None, None),
            Err(KvisError::SubsetUndefined { .. })
        ));
    }
}
