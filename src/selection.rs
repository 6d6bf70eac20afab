//! Selecting a subset of a visibility dataset by baseline, polarization, frequency and time.
//!
//! A [`ReadSelection`] is what callers hand to [`crate::VisHandle::read`]. It is resolved
//! against the dataset's metadata into a [`SubsetRequest`], which is what the format backends
//! understand: a filter on baseline-polarization keys, and optional frequency and time indices.
//!
//! After a read, the handle keeps a [`SubsetRecord`] of exactly what was read, so that a later
//! partial write can be mapped onto a [`Region`] of a destination file.
//!
//! # Examples
//!
//! ```rust
//! use kvis::{AntPairPol, Pol, ReadSelectionBuilder};
//!
//! let selection = ReadSelectionBuilder::default()
//!     .bls(vec![AntPairPol::new(1, 2, Pol::XX)])
//!     .freq_chans(vec![0, 1, 2, 3])
//!     .build()
//!     .unwrap();
//!
//! assert!(selection.times.is_none());
//! assert!(!selection.is_empty());
//! ```

use std::{
    collections::HashSet,
    fmt::{Debug, Display},
    sync::Arc,
};

use derive_builder::Builder;
use itertools::Itertools;

use crate::{
    key::{AntPair, AntPairPol},
    meta::VisMeta,
    pol::Pol,
    KvisError,
};

/// Which parts of a dataset to read. Every field is optional; an empty selection reads the
/// whole dataset.
#[derive(Builder, Debug, Default, Clone, PartialEq)]
#[builder(default, setter(into, strip_option))]
pub struct ReadSelection {
    /// Baseline-polarization keys to read, in either orientation
    pub bls: Option<Vec<AntPairPol>>,
    /// Antenna pairs to read, in either orientation, with every selected polarization
    pub antpairs: Option<Vec<AntPair>>,
    /// Polarizations to read
    pub pols: Option<Vec<Pol>>,
    /// Channel frequencies to read \[Hz\]
    pub freqs: Option<Vec<f64>>,
    /// Channel indices to read
    pub freq_chans: Option<Vec<usize>>,
    /// Integration Julian dates to read
    pub times: Option<Vec<f64>>,
    /// Integration indices to read
    pub time_idxs: Option<Vec<usize>>,
}

impl ReadSelection {
    /// Whether this selects the whole dataset.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether the frequency axis is subset.
    pub fn selects_freqs(&self) -> bool {
        self.freqs.is_some() || self.freq_chans.is_some()
    }

    /// Whether the time axis is subset.
    pub fn selects_times(&self) -> bool {
        self.times.is_some() || self.time_idxs.is_some()
    }

    /// The baseline part of this selection.
    pub(crate) fn baseline_filter(&self) -> BaselineFilter {
        BaselineFilter {
            keys: self.bls.clone(),
            antpairs: self.antpairs.clone(),
            pols: self.pols.clone(),
        }
    }

    /// Resolve the frequency and time selectors into sorted, deduplicated indices of `meta`.
    ///
    /// `antpairs` are the stored antenna pairs the read will return. Value-based time
    /// selections are resolved per baseline, and must land on the same integrations of every
    /// baseline.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::SelectionNotFound`] if a value or index doesn't exist, or
    /// [`KvisError::UnsupportedSelector`] if a time resolves to different integrations on
    /// different baselines.
    pub(crate) fn resolve_axes(
        &self,
        meta: &VisMeta,
        antpairs: &[AntPair],
    ) -> Result<(Option<Vec<usize>>, Option<Vec<usize>>), KvisError> {
        let freq_idxs = match (&self.freqs, &self.freq_chans) {
            (None, None) => None,
            (freqs, chans) => {
                let mut idxs = vec![];
                for &freq in freqs.iter().flatten() {
                    idxs.push(meta.freq_index(freq).ok_or_else(|| {
                        KvisError::SelectionNotFound {
                            axis: "frequency".to_string(),
                            value: format!("{freq}"),
                        }
                    })?);
                }
                for &chan in chans.iter().flatten() {
                    if chan >= meta.num_freqs() {
                        return Err(KvisError::SelectionNotFound {
                            axis: "channel".to_string(),
                            value: format!("{chan}"),
                        });
                    }
                    idxs.push(chan);
                }
                Some(sorted_unique(idxs))
            }
        };

        let time_idxs = match (&self.times, &self.time_idxs) {
            (None, None) => None,
            (times, time_idxs) => {
                let mut idxs = vec![];
                for &time in times.iter().flatten() {
                    let rows: Vec<Option<usize>> = antpairs
                        .iter()
                        .map(|&antpair| meta.time_row(antpair, time))
                        .unique()
                        .collect();
                    match rows.as_slice() {
                        [Some(row)] => idxs.push(*row),
                        [] | [None] => {
                            return Err(KvisError::SelectionNotFound {
                                axis: "time".to_string(),
                                value: format!("{time}"),
                            })
                        }
                        _ => {
                            return Err(KvisError::UnsupportedSelector {
                                format: "any".to_string(),
                                axis: format!(
                                    "time {time} (it falls on different integrations of different baselines)"
                                ),
                            })
                        }
                    }
                }
                for &idx in time_idxs.iter().flatten() {
                    if idx >= meta.num_ints() {
                        return Err(KvisError::SelectionNotFound {
                            axis: "time index".to_string(),
                            value: format!("{idx}"),
                        });
                    }
                    idxs.push(idx);
                }
                Some(sorted_unique(idxs))
            }
        };

        Ok((freq_idxs, time_idxs))
    }
}

impl Display for ReadSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "everything");
        }
        let mut parts = vec![];
        if let Some(bls) = &self.bls {
            parts.push(format!("{} bls", bls.len()));
        }
        if let Some(antpairs) = &self.antpairs {
            parts.push(format!("{} antpairs", antpairs.len()));
        }
        if let Some(pols) = &self.pols {
            parts.push(format!("pols {}", pols.iter().join(",")));
        }
        if let Some(freqs) = &self.freqs {
            parts.push(format!("{} freqs", freqs.len()));
        }
        if let Some(chans) = &self.freq_chans {
            parts.push(format!("{} chans", chans.len()));
        }
        if let Some(times) = &self.times {
            parts.push(format!("{} times", times.len()));
        }
        if let Some(time_idxs) = &self.time_idxs {
            parts.push(format!("{} time idxs", time_idxs.len()));
        }
        write!(f, "{}", parts.join(", "))
    }
}

fn sorted_unique(mut idxs: Vec<usize>) -> Vec<usize> {
    idxs.sort_unstable();
    idxs.dedup();
    idxs
}

/// A filter on baseline-polarization keys. Every constraint that is set must be met, and each
/// constraint matches a key in either orientation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BaselineFilter {
    /// Keys to accept
    pub keys: Option<Vec<AntPairPol>>,
    /// Antenna pairs to accept
    pub antpairs: Option<Vec<AntPair>>,
    /// Polarizations to accept
    pub pols: Option<Vec<Pol>>,
}

impl BaselineFilter {
    /// A filter that accepts exactly these keys.
    pub fn keys(keys: Vec<AntPairPol>) -> Self {
        Self {
            keys: Some(keys),
            ..Default::default()
        }
    }

    /// Whether every key is accepted.
    pub fn is_everything(&self) -> bool {
        self.keys.is_none() && self.antpairs.is_none() && self.pols.is_none()
    }

    /// Whether `key`, as stored in a file, is accepted.
    pub fn accepts(&self, key: &AntPairPol) -> bool {
        let swapped = key.swapped();
        let keys_ok = self
            .keys
            .as_ref()
            .map_or(true, |keys| keys.contains(key) || keys.contains(&swapped));
        let antpairs_ok = self.antpairs.as_ref().map_or(true, |antpairs| {
            antpairs.contains(&key.antpair()) || antpairs.contains(&swapped.antpair())
        });
        let pols_ok = self
            .pols
            .as_ref()
            .map_or(true, |pols| pols.contains(&key.pol));
        keys_ok && antpairs_ok && pols_ok
    }

    /// Check that every key, antenna pair and polarization that was asked for was found.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::KeyNotFound`] for a missing key or antenna pair, and
    /// [`KvisError::SelectionNotFound`] for a missing polarization.
    pub fn check_found(&self, found: &[AntPairPol]) -> Result<(), KvisError> {
        let found: HashSet<AntPairPol> = found
            .iter()
            .flat_map(|key| [*key, key.swapped()])
            .collect();
        for key in self.keys.iter().flatten() {
            if !found.contains(key) {
                return Err(KvisError::KeyNotFound {
                    key: key.to_string(),
                });
            }
        }
        let found_antpairs: HashSet<AntPair> = found.iter().map(AntPairPol::antpair).collect();
        for antpair in self.antpairs.iter().flatten() {
            if !found_antpairs.contains(antpair) {
                return Err(KvisError::KeyNotFound {
                    key: format!("{}_{}", antpair.0, antpair.1),
                });
            }
        }
        let found_pols: HashSet<Pol> = found.iter().map(|key| key.pol).collect();
        for pol in self.pols.iter().flatten() {
            if !found_pols.contains(pol) {
                return Err(KvisError::SelectionNotFound {
                    axis: "polarization".to_string(),
                    value: pol.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A resolved request for a subset of one file, as handed to a format backend.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubsetRequest {
    /// Which baseline-polarization keys to read
    pub bls: BaselineFilter,
    /// Sorted channel indices to read, or all of them
    pub freq_idxs: Option<Vec<usize>>,
    /// Sorted integration indices to read, or all of them
    pub time_idxs: Option<Vec<usize>>,
}

impl SubsetRequest {
    /// Whether this requests the whole file.
    pub fn is_everything(&self) -> bool {
        self.bls.is_everything() && self.freq_idxs.is_none() && self.time_idxs.is_none()
    }
}

/// The subset of a dataset that a read produced, in the source's orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct Subset {
    /// The keys that were read, in the order they were read
    pub bls: Vec<AntPairPol>,
    /// The channel indices that were read
    pub freq_idxs: Vec<usize>,
    /// The integration indices that were read
    pub time_idxs: Vec<usize>,
}

/// Everything a handle remembers about its most recent read.
#[derive(Debug, Clone)]
pub struct SubsetRecord {
    /// Incremented on every read of the same handle
    pub version: u64,
    /// What was read
    pub subset: Subset,
    /// The (integrations, channels) shape of every array that was read
    pub shape: (usize, usize),
    /// The metadata of what was read
    pub meta: Arc<VisMeta>,
}

/// A region of a destination file, in the destination's own keys and indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Destination keys, in the destination's orientation
    pub bls: Vec<AntPairPol>,
    /// Destination channel indices
    pub freq_idxs: Vec<usize>,
    /// Destination integration indices
    pub time_idxs: Vec<usize>,
}

impl Region {
    /// The (integrations, channels) shape of each array in this region.
    pub fn shape(&self) -> (usize, usize) {
        (self.time_idxs.len(), self.freq_idxs.len())
    }
}
