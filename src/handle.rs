//! Visibility datasets bound to one or more files.
//!
//! A [`VisHandle`] remembers exactly what its most recent [`VisHandle::read`] returned (the
//! [`SubsetRecord`]), keeps a private copy of those values, and uses the record to bound
//! [`VisHandle::update`] and [`VisHandle::partial_write`]. A read always replaces the previous
//! buffer and record.
//!
//! # Examples
//!
//! ```rust
//! use kvis::{
//!     marlu::{ndarray::Array2, Complex},
//!     AntPairPol, DataContainer, Pol, ReadSelectionBuilder, VisBuffer, VisFormat, VisHandle,
//!     VisMeta,
//! };
//! use indexmap::IndexMap;
//! use std::collections::BTreeMap;
//! use tempfile::tempdir;
//!
//! // describe a tiny dataset with one cross-correlation and one autocorrelation
//! let mut times_by_bl = IndexMap::new();
//! times_by_bl.insert((1, 2), vec![2459000.0, 2459000.0001]);
//! times_by_bl.insert((2, 2), vec![2459000.0, 2459000.0001]);
//! let lsts_by_bl = times_by_bl.clone();
//! let meta = VisMeta::new(vec![100e6, 101e6, 102e6], vec![Pol::XX], BTreeMap::new(), times_by_bl, lsts_by_bl).unwrap();
//! let keys = meta.antpairpols();
//! let mut buffer = VisBuffer::zeros(&keys, (2, 3));
//! buffer.data[&keys[0]].fill(Complex::new(1.0, 2.0));
//!
//! let tmp_dir = tempdir().unwrap();
//! let path = tmp_dir.path().join("tiny.kvb");
//! VisFormat::Blocked.backend().write_full(&path, &meta, &buffer, false).unwrap();
//!
//! // read one baseline back
//! let mut handle = VisHandle::open_path(&path).unwrap();
//! let selection = ReadSelectionBuilder::default()
//!     .bls(vec![AntPairPol::new(1, 2, Pol::XX)])
//!     .build()
//!     .unwrap();
//! let vis = handle.read(&selection).unwrap();
//! assert_eq!(vis.data.len(), 1);
//!
//! // the other orientation is the conjugate, in any case of the polarization
//! let key = "(2, 1, 'XX')".parse::<AntPairPol>().unwrap();
//! assert_eq!(vis.data.get(&key).unwrap()[(0, 0)], Complex::new(1.0, -2.0));
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use itertools::Itertools;
use log::{debug, trace, warn};

use crate::{
    container::{Conjugate, DataContainer},
    io::{Capabilities, FormatBackend, VisBuffer, VisFormat},
    key::{AntPairPol, ContainerKey},
    marlu::{ndarray::Array2, Complex},
    meta::{MetadataRegistry, VisMeta},
    selection::{ReadSelection, Region, Subset, SubsetRecord, SubsetRequest},
    KvisError,
};

/// Visibility data container
pub type VisData = DataContainer<AntPairPol, Complex<f32>, VisMeta>;
/// Visibility flag container
pub type VisFlags = DataContainer<AntPairPol, bool, VisMeta>;
/// Visibility sample count container
pub type VisNsamples = DataContainer<AntPairPol, f32, VisMeta>;

/// The containers produced by one read. All three share the same [`VisMeta`].
#[derive(Debug, Clone)]
pub struct VisContainers {
    /// Complex visibilities
    pub data: VisData,
    /// Flags
    pub flags: VisFlags,
    /// Sample counts
    pub nsamples: VisNsamples,
}

impl VisContainers {
    /// The metadata of the read that produced these containers.
    pub fn meta(&self) -> Option<&Arc<VisMeta>> {
        self.data.meta()
    }
}

/// A visibility dataset made of one or more files of the same format.
pub struct VisHandle {
    paths: Vec<PathBuf>,
    format: VisFormat,
    backend: Box<dyn FormatBackend>,
    registry: MetadataRegistry,
    file_ints: Vec<usize>,
    buffer: VisBuffer,
    record: Option<SubsetRecord>,
    version: u64,
    history: Vec<String>,
}

impl std::fmt::Debug for VisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisHandle")
            .field("paths", &self.paths)
            .field("format", &self.format)
            .field("metadata_known", &self.registry.is_known())
            .field("version", &self.version)
            .finish()
    }
}

impl VisHandle {
    /// Open a dataset made of `paths`, which are consecutive in time.
    ///
    /// Whole-file metadata is read straight away if the format can provide it.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::IncompatibleFiles`] if the files don't share channels,
    /// baselines and polarizations, or [`KvisError::BackendRead`] if a file can't be parsed.
    pub fn open<P: AsRef<Path>>(paths: &[P], format: VisFormat) -> Result<Self, KvisError> {
        let paths = paths
            .iter()
            .map(|path| path.as_ref().to_path_buf())
            .collect_vec();
        if paths.is_empty() {
            return Err(KvisError::NotSupported {
                operation: "opening a dataset without any files".to_string(),
                target: "VisHandle".to_string(),
            });
        }
        let backend = format.backend();
        let mut metas = vec![];
        for path in &paths {
            if let Some(meta) = backend.probe_metadata(path)? {
                metas.push(meta);
            }
        }
        check_compatible(&paths, &metas)?;
        let file_ints = metas.iter().map(VisMeta::num_ints).collect_vec();
        let registry = match VisMeta::concat_time(&metas) {
            Some(meta) if metas.len() == paths.len() => MetadataRegistry::known(Arc::new(meta)),
            _ => MetadataRegistry::unknown(),
        };
        debug!(
            "opened {} {} file(s), metadata {}",
            paths.len(),
            format,
            if registry.is_known() { "known" } else { "unknown" }
        );
        Ok(Self {
            paths,
            format,
            backend,
            registry,
            file_ints,
            buffer: VisBuffer::default(),
            record: None,
            version: 0,
            history: vec![],
        })
    }

    /// Open a single file, determining its format from the extension.
    ///
    /// # Errors
    ///
    /// See [`VisHandle::open`] and [`VisFormat::from_path`].
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, KvisError> {
        let format = VisFormat::from_path(&path)?;
        Self::open(&[path], format)
    }

    /// The files of this dataset.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// The format of this dataset.
    pub fn format(&self) -> VisFormat {
        self.format
    }

    /// What the format of this dataset can do.
    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// The whole-dataset metadata.
    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    /// What the most recent read returned, if there has been one.
    pub fn last_subset(&self) -> Option<&SubsetRecord> {
        self.record.as_ref()
    }

    /// Add a line to the history of files written from this handle.
    pub fn add_to_history<S: Into<String>>(&mut self, text: S) {
        self.history.push(text.into());
    }

    /// Read part or all of the dataset, replacing the previous buffer and subset record.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::UnsupportedSelector`] if the format can't subset a selected
    /// axis, [`KvisError::KeyNotFound`] if a selected baseline isn't in the dataset,
    /// [`KvisError::SelectionNotFound`] if a selected polarization, frequency or time isn't,
    /// or [`KvisError::BackendRead`].
    pub fn read(&mut self, selection: &ReadSelection) -> Result<VisContainers, KvisError> {
        trace!("start read of {}", selection);
        let caps = self.backend.capabilities();
        let unsupported = |axis: &str| KvisError::UnsupportedSelector {
            format: self.format.to_string(),
            axis: axis.to_string(),
        };
        if !caps.freq_select && selection.selects_freqs() {
            return Err(unsupported("frequency"));
        }
        if !caps.time_select && selection.selects_times() {
            return Err(unsupported("time"));
        }

        let filter = selection.baseline_filter();
        let (meta, buffer, freq_idxs, time_idxs) = match self.registry.get().cloned() {
            Some(whole) => {
                let accepted = whole
                    .antpairpols()
                    .into_iter()
                    .filter(|key| filter.accepts(key))
                    .collect_vec();
                filter.check_found(&accepted)?;
                let antpairs = accepted.iter().map(AntPairPol::antpair).unique().collect_vec();
                let (freq_idxs, time_idxs) = selection.resolve_axes(&whole, &antpairs)?;
                let request = SubsetRequest {
                    bls: filter,
                    freq_idxs: freq_idxs.clone(),
                    time_idxs: None,
                };
                let (meta, buffer) = self.read_files(&request, time_idxs.as_deref())?;
                (
                    meta,
                    buffer,
                    freq_idxs.unwrap_or_else(|| (0..whole.num_freqs()).collect()),
                    time_idxs.unwrap_or_else(|| (0..whole.num_ints()).collect()),
                )
            }
            None => {
                let request = SubsetRequest {
                    bls: filter,
                    ..Default::default()
                };
                let (meta, buffer) = self.read_files(&request, None)?;
                request
                    .bls
                    .check_found(&buffer.keys().copied().collect_vec())?;
                let freq_idxs = (0..meta.num_freqs()).collect();
                let time_idxs = (0..meta.num_ints()).collect();
                (meta, buffer, freq_idxs, time_idxs)
            }
        };

        let meta = Arc::new(meta);
        let shape = buffer
            .shape()
            .unwrap_or((time_idxs.len(), freq_idxs.len()));
        let containers = VisContainers {
            data: DataContainer::from_arrays(buffer.data.clone(), Some(meta.clone()))?,
            flags: DataContainer::from_arrays(buffer.flags.clone(), Some(meta.clone()))?,
            nsamples: DataContainer::from_arrays(buffer.nsamples.clone(), Some(meta.clone()))?,
        };
        self.version += 1;
        self.record = Some(SubsetRecord {
            version: self.version,
            subset: Subset {
                bls: buffer.keys().copied().collect(),
                freq_idxs,
                time_idxs,
            },
            shape,
            meta,
        });
        self.buffer = buffer;
        debug!(
            "read {} keys with shape {:?} (read #{})",
            self.buffer.len(),
            shape,
            self.version
        );
        Ok(containers)
    }

    /// Read `request` from every file, restricting the time axis of each file to its share of
    /// the dataset-wide `time_idxs`, and join the results in time.
    fn read_files(
        &self,
        request: &SubsetRequest,
        time_idxs: Option<&[usize]>,
    ) -> Result<(VisMeta, VisBuffer), KvisError> {
        let mut metas = vec![];
        let mut buffers = vec![];
        let mut offset = 0;
        for (file_idx, path) in self.paths.iter().enumerate() {
            let mut file_request = request.clone();
            if let Some(time_idxs) = time_idxs {
                let num_ints = self.file_ints.get(file_idx).copied().unwrap_or_default();
                let local = time_idxs
                    .iter()
                    .filter(|&&idx| idx >= offset && idx < offset + num_ints)
                    .map(|&idx| idx - offset)
                    .collect_vec();
                offset += num_ints;
                if local.is_empty() {
                    continue;
                }
                file_request.time_idxs = Some(local);
            }
            let (meta, buffer) = self.backend.read_subset(path, &file_request)?;
            metas.push(meta);
            buffers.push(buffer);
        }
        if !self.registry.is_known() {
            check_compatible(&self.paths, &metas)?;
        }
        match VisMeta::concat_time(&metas) {
            Some(meta) => Ok((meta, VisBuffer::concat_time(&buffers)?)),
            None => Err(KvisError::SelectionNotFound {
                axis: "time".to_string(),
                value: "any integration".to_string(),
            }),
        }
    }

    /// Copy the values of the given containers into the buffer of the last read. Nothing is
    /// written to disk.
    ///
    /// Keys may be given in either orientation; values for the reverse of a stored key are
    /// conjugated before they are stored. Nothing is changed unless every container is valid.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::SubsetUndefined`] before any read, [`KvisError::KeyNotInSubset`]
    /// for keys that weren't read, or [`KvisError::ShapeMismatch`].
    pub fn update(
        &mut self,
        data: Option<&VisData>,
        flags: Option<&VisFlags>,
        nsamples: Option<&VisNsamples>,
    ) -> Result<(), KvisError> {
        let record = self.record.as_ref().ok_or_else(|| KvisError::SubsetUndefined {
            operation: "update".to_string(),
        })?;
        if let Some(data) = data {
            check_update("data", data, &self.buffer.data, record.shape)?;
        }
        if let Some(flags) = flags {
            check_update("flags", flags, &self.buffer.flags, record.shape)?;
        }
        if let Some(nsamples) = nsamples {
            check_update("nsamples", nsamples, &self.buffer.nsamples, record.shape)?;
        }

        if let Some(data) = data {
            apply_update(data, &mut self.buffer.data);
        }
        if let Some(flags) = flags {
            apply_update(flags, &mut self.buffer.flags);
        }
        if let Some(nsamples) = nsamples {
            apply_update(nsamples, &mut self.buffer.nsamples);
        }
        Ok(())
    }

    /// The metadata of the last read with this handle's history lines appended.
    fn meta_for_output(&self, meta: &VisMeta) -> VisMeta {
        self.history
            .iter()
            .fold(meta.clone(), |meta, line| meta.appended_history(line))
    }

    /// Write the buffer of the last read to a new file of this dataset's format.
    ///
    /// # Errors
    ///
    /// See [`VisHandle::write_as`]
    pub fn write<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<(), KvisError> {
        self.write_as(path, self.format, overwrite)
    }

    /// Write the buffer of the last read to a new file of any format.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::SubsetUndefined`] before any read, [`KvisError::FileExists`]
    /// if `path` exists and `overwrite` is false, or [`KvisError::BackendWrite`].
    pub fn write_as<P: AsRef<Path>>(
        &self,
        path: P,
        format: VisFormat,
        overwrite: bool,
    ) -> Result<(), KvisError> {
        let record = self.record.as_ref().ok_or_else(|| KvisError::SubsetUndefined {
            operation: "write".to_string(),
        })?;
        let meta = self.meta_for_output(&record.meta);
        debug!(
            "writing {} keys to {:?} as {}",
            self.buffer.len(),
            path.as_ref(),
            format
        );
        format
            .backend()
            .write_full(path.as_ref(), &meta, &self.buffer, overwrite)
    }

    /// Create an empty file with the shape of the whole dataset, ready for
    /// [`VisHandle::partial_write`].
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::MetadataUnavailable`] if the dataset's extents are unknown,
    /// [`KvisError::NotSupported`] if the format can't be written in parts, or
    /// [`KvisError::FileExists`].
    pub fn initialize_output<P: AsRef<Path>>(
        &self,
        path: P,
        overwrite: bool,
    ) -> Result<(), KvisError> {
        let whole = self.registry.require("initialize_output")?;
        let meta = self.meta_for_output(whole);
        self.backend
            .allocate_output(path.as_ref(), &meta, overwrite)
    }

    /// Write the subset of the last read into the same place of a file created by
    /// [`VisHandle::initialize_output`].
    ///
    /// The subset is located in the destination by the values of its keys, frequencies and
    /// times. Once it is known to fit, any containers given are applied with
    /// [`VisHandle::update`]. Nothing is changed if the destination doesn't fit.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::SubsetUndefined`] before any read, [`KvisError::NotSupported`]
    /// if the format can't be written in parts, [`KvisError::RegionOutOfBounds`] if the subset
    /// isn't in the destination, or any error of [`VisHandle::update`].
    pub fn partial_write<P: AsRef<Path>>(
        &mut self,
        path: P,
        data: Option<&VisData>,
        flags: Option<&VisFlags>,
        nsamples: Option<&VisNsamples>,
    ) -> Result<(), KvisError> {
        let path = path.as_ref();
        let undefined = || KvisError::SubsetUndefined {
            operation: "partial_write".to_string(),
        };
        let record = self.record.as_ref().ok_or_else(undefined)?;
        if !self.backend.capabilities().region_write {
            return Err(KvisError::NotSupported {
                operation: "partial_write".to_string(),
                target: format!("the {} format", self.format),
            });
        }
        let dest = self
            .backend
            .probe_metadata(path)?
            .ok_or_else(|| KvisError::NotSupported {
                operation: "partial_write".to_string(),
                target: format!("{path:?}, which can't describe itself"),
            })?;
        let (region, swapped) = map_region(path, record, &dest)?;

        // the buffer is only changed once the destination is known to fit
        self.update(data, flags, nsamples)?;
        let record = self.record.as_ref().ok_or_else(undefined)?;

        let mut dest_buffer = VisBuffer::default();
        for ((src_key, dest_key), swap) in record.subset.bls.iter().zip(&region.bls).zip(swapped) {
            let missing = || KvisError::KeyNotInSubset {
                key: src_key.to_string(),
            };
            let data = self.buffer.data.get(src_key).ok_or_else(missing)?;
            let flags = self.buffer.flags.get(src_key).ok_or_else(missing)?;
            let nsamples = self.buffer.nsamples.get(src_key).ok_or_else(missing)?;
            let data = if swap {
                data.map(Conjugate::conjugate)
            } else {
                data.clone()
            };
            dest_buffer.insert(*dest_key, data, flags.clone(), nsamples.clone());
        }
        debug!(
            "partial write of read #{} to {:?}: {} keys, {} channels, {} integrations",
            record.version,
            path,
            region.bls.len(),
            region.freq_idxs.len(),
            region.time_idxs.len()
        );
        self.backend.write_region(path, &region, &dest_buffer)
    }
}

/// Check that every file after the first could be joined with the first in time.
fn check_compatible(paths: &[PathBuf], metas: &[VisMeta]) -> Result<(), KvisError> {
    if let Some((first, rest)) = metas.split_first() {
        for (path, meta) in paths.iter().skip(1).zip(rest) {
            if let Some(reason) = first.incompatibility(meta) {
                return Err(KvisError::IncompatibleFiles {
                    path: path.clone(),
                    reason,
                });
            }
        }
    }
    Ok(())
}

/// Locate the subset of `record` in the destination `dest` by value. Also returns whether each
/// key is stored the other way around in the destination.
fn map_region(
    path: &Path,
    record: &SubsetRecord,
    dest: &VisMeta,
) -> Result<(Region, Vec<bool>), KvisError> {
    let out_of_bounds = |axis: &str, value: String| KvisError::RegionOutOfBounds {
        path: path.to_path_buf(),
        axis: axis.to_string(),
        value,
    };

    let mut freq_idxs = Vec::with_capacity(record.meta.num_freqs());
    for &freq in record.meta.freqs() {
        freq_idxs.push(
            dest.freq_index(freq)
                .ok_or_else(|| out_of_bounds("frequency", format!("{freq} Hz")))?,
        );
    }

    let mut bls = Vec::with_capacity(record.subset.bls.len());
    let mut swapped = Vec::with_capacity(record.subset.bls.len());
    let mut time_idxs: Option<Vec<usize>> = None;
    for key in &record.subset.bls {
        let dest_key = dest
            .stored_antpairpol(key)
            .ok_or_else(|| out_of_bounds("baseline", key.to_string()))?;
        let src_times = record
            .meta
            .bl_times(key.antpair())
            .ok_or_else(|| out_of_bounds("baseline", key.to_string()))?;
        let mut rows = Vec::with_capacity(src_times.len());
        for &time in src_times {
            rows.push(
                dest.time_row(dest_key.antpair(), time)
                    .ok_or_else(|| out_of_bounds("time", format!("{time} of {key}")))?,
            );
        }
        match &time_idxs {
            Some(existing) if existing != &rows => {
                return Err(out_of_bounds(
                    "time",
                    format!("{key} maps to different integrations than the other baselines"),
                ))
            }
            Some(_) => (),
            None => time_idxs = Some(rows),
        }
        swapped.push(dest_key != *key);
        bls.push(dest_key);
    }

    let time_idxs = time_idxs.unwrap_or_default();
    if time_idxs.len() != record.shape.0 || freq_idxs.len() != record.shape.1 {
        warn!(
            "region {}x{} doesn't match the recorded shape {:?}",
            time_idxs.len(),
            freq_idxs.len(),
            record.shape
        );
    }
    Ok((
        Region {
            bls,
            freq_idxs,
            time_idxs,
        },
        swapped,
    ))
}

/// Check that every key of `container` was read, in either orientation, with the right shape.
fn check_update<T: Conjugate, M>(
    name: &str,
    container: &DataContainer<AntPairPol, T, M>,
    buffer: &indexmap::IndexMap<AntPairPol, Array2<T>>,
    shape: (usize, usize),
) -> Result<(), KvisError> {
    for key in container.keys() {
        let stored = buffer.contains_key(key)
            || key.reversed().map_or(false, |rev| buffer.contains_key(&rev));
        if !stored {
            return Err(KvisError::KeyNotInSubset {
                key: key.to_string(),
            });
        }
    }
    match container.shape() {
        Some(received) if received != shape => Err(KvisError::ShapeMismatch {
            argument: name.to_string(),
            function: "VisHandle::update".to_string(),
            expected: format!("{shape:?}"),
            received: format!("{received:?}"),
        }),
        _ => Ok(()),
    }
}

fn apply_update<T: Conjugate, M>(
    container: &DataContainer<AntPairPol, T, M>,
    buffer: &mut indexmap::IndexMap<AntPairPol, Array2<T>>,
) {
    for (key, array) in container.items() {
        if let Some(slot) = buffer.get_mut(key) {
            slot.clone_from(array);
        } else if let Some(slot) = key.reversed().and_then(|rev| buffer.get_mut(&rev)) {
            *slot = array.map(T::conjugate);
        }
    }
}
