//! Chunked iteration over a [`VisHandle`].
//!
//! A [`ChunkCursor`] is a pull-based state machine that owns its plan and holds no borrow of
//! the handle between steps, so the body of a chunk loop is free to call
//! [`VisHandle::partial_write`] for the chunk it was just given.
//!
//! ```rust,no_run
//! use kvis::VisHandle;
//!
//! let mut handle = VisHandle::open_path("/tmp/input.kvb").unwrap();
//! handle.initialize_output("/tmp/output.kvb", true).unwrap();
//! let mut cursor = handle.iterate_by_frequency_group(300, None).unwrap();
//! while let Some(chunk) = cursor.next_chunk(&mut handle) {
//!     let mut vis = chunk.unwrap();
//!     for (_, flags) in vis.flags.items() {
//!         assert_eq!(flags.ndim(), 2);
//!     }
//!     for key in vis.data.keys().copied().collect::<Vec<_>>() {
//!         vis.data.get_stored_mut(&key).unwrap().mapv_inplace(|v| v * 2.0);
//!     }
//!     handle
//!         .partial_write("/tmp/output.kvb", Some(&vis.data), None, None)
//!         .unwrap();
//! }
//! ```

use std::ops::Range;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;

use crate::{
    handle::{VisContainers, VisHandle},
    key::{AntPair, AntPairPol},
    selection::ReadSelection,
    KvisError,
};

/// The items a dataset is chunked over, in iteration order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkItems {
    /// Antenna pairs, each read with every polarization
    Antpairs(Vec<AntPair>),
    /// Individual baseline-polarizations
    AntPairPols(Vec<AntPairPol>),
    /// Channel indices
    FreqChans(Vec<usize>),
    /// Channel centre frequencies \[Hz\]
    Freqs(Vec<f64>),
    /// Integration indices
    TimeIdxs(Vec<usize>),
    /// Julian dates
    Times(Vec<f64>),
}

impl ChunkItems {
    /// The number of items.
    pub fn len(&self) -> usize {
        match self {
            Self::Antpairs(items) => items.len(),
            Self::AntPairPols(items) => items.len(),
            Self::FreqChans(items) | Self::TimeIdxs(items) => items.len(),
            Self::Freqs(items) | Self::Times(items) => items.len(),
        }
    }

    /// Whether there are no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The name of the chunked axis.
    pub fn axis(&self) -> &'static str {
        match self {
            Self::Antpairs(_) | Self::AntPairPols(_) => "baseline",
            Self::FreqChans(_) | Self::Freqs(_) => "frequency",
            Self::TimeIdxs(_) | Self::Times(_) => "time",
        }
    }

    /// A read selection of the items in `range`.
    fn selection(&self, range: Range<usize>) -> ReadSelection {
        let mut selection = ReadSelection::default();
        match self {
            Self::Antpairs(items) => selection.antpairs = Some(items[range].to_vec()),
            Self::AntPairPols(items) => selection.bls = Some(items[range].to_vec()),
            Self::FreqChans(items) => selection.freq_chans = Some(items[range].to_vec()),
            Self::Freqs(items) => selection.freqs = Some(items[range].to_vec()),
            Self::TimeIdxs(items) => selection.time_idxs = Some(items[range].to_vec()),
            Self::Times(items) => selection.times = Some(items[range].to_vec()),
        }
        selection
    }
}

/// Groups of `group_size` consecutive items, the last of which may be short.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    items: ChunkItems,
    group_size: usize,
}

impl ChunkPlan {
    /// Plan chunks of `group_size` items.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::InvalidChunkSize`] if `group_size` is zero.
    pub fn new(items: ChunkItems, group_size: usize) -> Result<Self, KvisError> {
        if group_size == 0 {
            return Err(KvisError::InvalidChunkSize { group_size });
        }
        Ok(Self { items, group_size })
    }

    /// The items being chunked.
    pub fn items(&self) -> &ChunkItems {
        &self.items
    }

    /// The number of items per chunk.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// The number of chunks, `ceil(items / group_size)`.
    pub fn num_chunks(&self) -> usize {
        (self.items.len() + self.group_size - 1) / self.group_size
    }

    /// The item range of chunk `chunk_idx`.
    pub fn range(&self, chunk_idx: usize) -> Option<Range<usize>> {
        let start = chunk_idx.checked_mul(self.group_size)?;
        if start >= self.items.len() {
            return None;
        }
        Some(start..(start + self.group_size).min(self.items.len()))
    }

    /// The read selection of chunk `chunk_idx`.
    pub fn selection(&self, chunk_idx: usize) -> Option<ReadSelection> {
        self.range(chunk_idx)
            .map(|range| self.items.selection(range))
    }
}

/// Steps through a [`ChunkPlan`], one read per step.
#[derive(Debug)]
pub struct ChunkCursor {
    plan: ChunkPlan,
    next: usize,
    progress: ProgressBar,
}

const PROGRESS_TEMPLATE: &str =
    "{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})";

impl ChunkCursor {
    /// A cursor at the first chunk of `plan`, without progress reporting.
    pub fn new(plan: ChunkPlan) -> Self {
        let progress = ProgressBar::with_draw_target(
            Some(plan.num_chunks() as u64),
            ProgressDrawTarget::hidden(),
        );
        progress.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        progress.set_message(format!("{} chunks", plan.items().axis()));
        Self {
            plan,
            next: 0,
            progress,
        }
    }

    /// Draw a progress bar on stderr.
    pub fn with_progress(self, draw_progress: bool) -> Self {
        if draw_progress {
            self.progress
                .set_draw_target(ProgressDrawTarget::stderr());
        }
        self
    }

    /// The plan being followed.
    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// The number of chunks not yet read.
    pub fn remaining(&self) -> usize {
        self.plan.num_chunks().saturating_sub(self.next)
    }

    /// Move to the next chunk without reading it, returning its selection.
    pub fn next_selection(&mut self) -> Option<ReadSelection> {
        let selection = self.plan.selection(self.next)?;
        self.next += 1;
        self.progress.inc(1);
        if self.remaining() == 0 {
            self.progress.finish();
        }
        Some(selection)
    }

    /// Read the next chunk from `handle`, or `None` once every chunk has been read.
    pub fn next_chunk(
        &mut self,
        handle: &mut VisHandle,
    ) -> Option<Result<VisContainers, KvisError>> {
        let selection = self.next_selection()?;
        debug!("reading chunk {}/{}", self.next, self.plan.num_chunks());
        Some(handle.read(&selection))
    }

    /// Read every remaining chunk, passing each to `body` along with the handle.
    ///
    /// # Errors
    ///
    /// Stops at the first error of a read or of `body`.
    pub fn for_each<F>(mut self, handle: &mut VisHandle, mut body: F) -> Result<(), KvisError>
    where
        F: FnMut(&mut VisHandle, VisContainers) -> Result<(), KvisError>,
    {
        while let Some(chunk) = self.next_chunk(handle) {
            body(handle, chunk?)?;
        }
        Ok(())
    }
}

impl VisHandle {
    fn chunk_cursor(&self, items: ChunkItems, group_size: usize) -> Result<ChunkCursor, KvisError> {
        let plan = ChunkPlan::new(items, group_size)?;
        debug!(
            "planned {} {} chunks of up to {} items",
            plan.num_chunks(),
            plan.items().axis(),
            group_size
        );
        Ok(ChunkCursor::new(plan))
    }

    /// Iterate over groups of baselines.
    ///
    /// Without `antpairpols`, every antenna pair of the dataset is visited in file order and
    /// read with all of its polarizations.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::InvalidChunkSize`] if `group_size` is zero, or
    /// [`KvisError::MetadataUnavailable`] if no list is given and the dataset's baselines
    /// aren't known before reading.
    pub fn iterate_by_baseline_group(
        &self,
        group_size: usize,
        antpairpols: Option<Vec<AntPairPol>>,
    ) -> Result<ChunkCursor, KvisError> {
        if group_size == 0 {
            return Err(KvisError::InvalidChunkSize { group_size });
        }
        let items = match antpairpols {
            Some(antpairpols) => ChunkItems::AntPairPols(antpairpols),
            None => ChunkItems::Antpairs(
                self.registry()
                    .require("iterate_by_baseline_group")?
                    .baselines(),
            ),
        };
        self.chunk_cursor(items, group_size)
    }

    /// Iterate over groups of channels.
    ///
    /// Without `freqs`, every channel of the dataset is visited in order.
    ///
    /// # Errors
    ///
    /// As for [`VisHandle::iterate_by_baseline_group`]
    pub fn iterate_by_frequency_group(
        &self,
        group_size: usize,
        freqs: Option<Vec<f64>>,
    ) -> Result<ChunkCursor, KvisError> {
        if group_size == 0 {
            return Err(KvisError::InvalidChunkSize { group_size });
        }
        let items = match freqs {
            Some(freqs) => ChunkItems::Freqs(freqs),
            None => ChunkItems::FreqChans(
                (0..self
                    .registry()
                    .require("iterate_by_frequency_group")?
                    .num_freqs())
                    .collect(),
            ),
        };
        self.chunk_cursor(items, group_size)
    }

    /// Iterate over groups of integrations.
    ///
    /// Without `times`, every integration index of the dataset is visited in order.
    ///
    /// # Errors
    ///
    /// As for [`VisHandle::iterate_by_baseline_group`]
    pub fn iterate_by_time_group(
        &self,
        group_size: usize,
        times: Option<Vec<f64>>,
    ) -> Result<ChunkCursor, KvisError> {
        if group_size == 0 {
            return Err(KvisError::InvalidChunkSize { group_size });
        }
        let items = match times {
            Some(times) => ChunkItems::Times(times),
            None => ChunkItems::TimeIdxs(
                (0..self.registry().require("iterate_by_time_group")?.num_ints()).collect(),
            ),
        };
        self.chunk_cursor(items, group_size)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use itertools::Itertools;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        io::VisFormat,
        pol::Pol,
        test_common::{synthetic_buffer, synthetic_meta, write_synthetic},
    };

    #[test]
    fn test_plan_ragged_last_chunk() {
        let plan = ChunkPlan::new(ChunkItems::FreqChans((0..1024).collect()), 300).unwrap();
        assert_eq!(plan.num_chunks(), 4);
        let sizes = (0..plan.num_chunks())
            .map(|idx| plan.range(idx).unwrap().len())
            .collect_vec();
        assert_eq!(sizes, vec![300, 300, 300, 124]);
        assert_eq!(plan.range(4), None);
        let last = plan.selection(3).unwrap();
        assert_eq!(last.freq_chans, Some((900..1024).collect()));
    }

    #[test]
    fn test_plan_rejects_zero() {
        assert!(matches!(
            ChunkPlan::new(ChunkItems::TimeIdxs(vec![0]), 0),
            Err(KvisError::InvalidChunkSize { .. })
        ));
    }

    #[test]
    fn test_explicit_list_keeps_order() {
        let items = ChunkItems::Freqs(vec![3e8, 1e8, 2e8]);
        let plan = ChunkPlan::new(items, 2).unwrap();
        assert_eq!(plan.selection(0).unwrap().freqs, Some(vec![3e8, 1e8]));
        assert_eq!(plan.selection(1).unwrap().freqs, Some(vec![2e8]));
    }

    #[test]
    fn test_frequency_chunks_cover_file() {
        let tmp_dir = tempdir().unwrap();
        let path = write_synthetic(tmp_dir.path(), "in.kvb", &[(0, 1), (1, 2)], 7, 3);
        let out = tmp_dir.path().join("out.kvb");
        let mut handle = VisHandle::open_path(&path).unwrap();
        handle.initialize_output(&out, false).unwrap();

        let cursor = handle.iterate_by_frequency_group(3, None).unwrap();
        assert_eq!(cursor.remaining(), 3);
        let mut widths = vec![];
        cursor
            .for_each(&mut handle, |handle, vis| {
                widths.push(vis.data.shape().map(|(_, nfreqs)| nfreqs));
                handle.partial_write(&out, None, None, None)
            })
            .unwrap();
        assert_eq!(widths, vec![Some(3), Some(3), Some(1)]);

        let source = handle.read(&ReadSelection::default()).unwrap();
        let written = VisHandle::open_path(&out)
            .unwrap()
            .read(&ReadSelection::default())
            .unwrap();
        assert_eq!(written.data.into_arrays(), source.data.into_arrays());
        assert_eq!(written.flags.into_arrays(), source.flags.into_arrays());
        assert_eq!(written.nsamples.into_arrays(), source.nsamples.into_arrays());
    }

    #[test]
    fn test_baseline_chunks_are_disjoint_slices() {
        let tmp_dir = tempdir().unwrap();
        let path = write_synthetic(tmp_dir.path(), "pols.kvb", &[(0, 1), (0, 2), (1, 2)], 2, 2);
        let mut handle = VisHandle::open_path(&path).unwrap();
        let antpairpols = handle.registry().get().unwrap().antpairpols();
        assert_eq!(antpairpols.len(), 6);

        let mut cursor = handle
            .iterate_by_baseline_group(3, Some(antpairpols.clone()))
            .unwrap();
        let mut seen = HashSet::new();
        for expected in antpairpols.chunks(3) {
            let vis = cursor.next_chunk(&mut handle).unwrap().unwrap();
            let keys: HashSet<AntPairPol> = vis.data.keys().copied().collect();
            assert_eq!(keys, expected.iter().copied().collect());
            assert!(keys.is_disjoint(&seen));
            seen.extend(keys);
        }
        assert!(cursor.next_chunk(&mut handle).is_none());
        assert_eq!(seen, antpairpols.into_iter().collect());
    }

    #[test]
    fn test_progress_template_is_valid() {
        assert!(ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)
            .is_ok());
    }

    #[test]
    fn test_time_chunks() {
        let tmp_dir = tempdir().unwrap();
        let path = write_synthetic(tmp_dir.path(), "times.kvb", &[(0, 1)], 2, 5);
        let mut handle = VisHandle::open_path(&path).unwrap();
        let mut cursor = handle.iterate_by_time_group(2, None).unwrap();
        let mut rows = vec![];
        while let Some(chunk) = cursor.next_chunk(&mut handle) {
            rows.push(chunk.unwrap().data.shape().unwrap().0);
        }
        assert_eq!(rows, vec![2, 2, 1]);
        assert_eq!(cursor.remaining(), 0);
        assert!(cursor.next_chunk(&mut handle).is_none());
    }

    #[test]
    fn test_baseline_chunks_without_metadata() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("seq.kvs");
        let meta = synthetic_meta(&[(0, 1), (0, 2), (1, 2)], &[Pol::XX, Pol::YY], 2, 2);
        VisFormat::Sequential
            .backend()
            .write_full(&path, &meta, &synthetic_buffer(&meta), false)
            .unwrap();
        let mut handle = VisHandle::open_path(&path).unwrap();
        assert!(matches!(
            handle.iterate_by_baseline_group(2, None),
            Err(KvisError::MetadataUnavailable { .. })
        ));
        assert!(matches!(
            handle.iterate_by_frequency_group(0, None),
            Err(KvisError::InvalidChunkSize { .. })
        ));

        let bls = vec![
            AntPairPol::new(0, 2, Pol::YY),
            AntPairPol::new(2, 1, Pol::XX),
            AntPairPol::new(0, 1, Pol::XX),
        ];
        let mut cursor = handle.iterate_by_baseline_group(2, Some(bls)).unwrap();
        let first = cursor.next_chunk(&mut handle).unwrap().unwrap();
        assert_eq!(first.data.len(), 2);
        assert!(first.data.contains(&AntPairPol::new(1, 2, Pol::XX)));
        let second = cursor.next_chunk(&mut handle).unwrap().unwrap();
        assert_eq!(second.data.keys().collect_vec(), vec![&AntPairPol::new(0, 1, Pol::XX)]);
    }
}
