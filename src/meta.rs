//! Descriptions of the axes of a visibility dataset.
//!
//! [`VisMeta`] is an immutable description of the frequency, time, LST, antenna, baseline and
//! polarization axes of a dataset (or of a subset of one). Not every baseline necessarily
//! samples the same times, so times and LSTs are stored per baseline, and the dataset-wide
//! [`VisMeta::times`] axis is the sorted union of every baseline's times.
//!
//! [`MetadataRegistry`] holds the whole-file [`VisMeta`] captured when a dataset is opened, or
//! nothing at all for formats that can't describe a file without scanning it.

use std::{collections::BTreeMap, sync::Arc};

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    key::{AntPair, AntPairPol},
    marlu::{LatLngHeight, XyzGeodetic},
    pol::Pol,
    KvisError,
};

/// Frequencies closer than this are the same channel \[Hz\].
pub const FREQ_TOLERANCE_HZ: f64 = 1e-3;

/// Times closer than this are the same integration \[days\].
pub const TIME_TOLERANCE_DAYS: f64 = 1e-7;

/// The axes of a visibility dataset.
#[derive(Debug, Clone)]
pub struct VisMeta {
    freqs: Vec<f64>,
    channel_width: f64,
    integration_time: f64,
    antpos: BTreeMap<usize, XyzGeodetic>,
    pols: Vec<Pol>,
    times_by_bl: IndexMap<AntPair, Vec<f64>>,
    lsts_by_bl: IndexMap<AntPair, Vec<f64>>,
    times: Vec<f64>,
    lsts: Vec<f64>,
    telescope: Option<LatLngHeight>,
    history: String,
}

impl VisMeta {
    /// Describe a dataset.
    ///
    /// - `freqs` are channel centre frequencies in Hz.
    /// - `times_by_bl` and `lsts_by_bl` give the Julian date and LST (radians) of every
    ///   integration of every baseline. The order of `times_by_bl` is the baseline order of the
    ///   dataset.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::ShapeMismatch`] if baselines have different numbers of
    /// integrations, or if the LSTs don't line up with the times.
    pub fn new(
        freqs: Vec<f64>,
        pols: Vec<Pol>,
        antpos: BTreeMap<usize, XyzGeodetic>,
        times_by_bl: IndexMap<AntPair, Vec<f64>>,
        lsts_by_bl: IndexMap<AntPair, Vec<f64>>,
    ) -> Result<Self, KvisError> {
        let num_ints = times_by_bl.values().next().map_or(0, Vec::len);
        for (antpair, times) in times_by_bl.iter() {
            let lsts = lsts_by_bl.get(antpair);
            if times.len() != num_ints || lsts.map(Vec::len) != Some(num_ints) {
                return Err(KvisError::ShapeMismatch {
                    argument: format!("times/lsts of baseline {:?}", antpair),
                    function: "VisMeta::new".to_string(),
                    expected: format!("{} integrations", num_ints),
                    received: format!(
                        "{} times, {:?} lsts",
                        times.len(),
                        lsts.map(Vec::len)
                    ),
                });
            }
        }
        if lsts_by_bl.len() != times_by_bl.len() {
            return Err(KvisError::ShapeMismatch {
                argument: "lsts_by_bl".to_string(),
                function: "VisMeta::new".to_string(),
                expected: format!("{} baselines", times_by_bl.len()),
                received: format!("{} baselines", lsts_by_bl.len()),
            });
        }

        let channel_width = match freqs.as_slice() {
            [first, second, ..] => second - first,
            _ => 0.0,
        };
        let integration_time = match times_by_bl.values().next().map(Vec::as_slice) {
            Some([first, second, ..]) => (second - first) * 86400.0,
            _ => 0.0,
        };
        let (times, lsts) = unique_times(&times_by_bl, &lsts_by_bl);

        Ok(Self {
            freqs,
            channel_width,
            integration_time,
            antpos,
            pols,
            times_by_bl,
            lsts_by_bl,
            times,
            lsts,
            telescope: None,
            history: String::new(),
        })
    }

    /// Override the channel width \[Hz\] derived from the frequencies.
    pub fn with_channel_width(mut self, channel_width: f64) -> Self {
        self.channel_width = channel_width;
        self
    }

    /// Override the integration time \[s\] derived from the times.
    pub fn with_integration_time(mut self, integration_time: f64) -> Self {
        self.integration_time = integration_time;
        self
    }

    /// Attach the telescope's location.
    pub fn with_telescope(mut self, telescope: Option<LatLngHeight>) -> Self {
        self.telescope = telescope;
        self
    }

    /// Replace the history.
    pub fn with_history<S: Into<String>>(mut self, history: S) -> Self {
        self.history = history.into();
        self
    }

    /// A copy of this description with `line` appended to the history.
    pub fn appended_history(&self, line: &str) -> Self {
        let mut result = self.clone();
        if !result.history.is_empty() && !result.history.ends_with('\n') {
            result.history.push('\n');
        }
        result.history.push_str(line);
        result
    }

    /// Channel centre frequencies \[Hz\]
    pub fn freqs(&self) -> &[f64] {
        &self.freqs
    }

    /// Channel width \[Hz\]
    pub fn channel_width(&self) -> f64 {
        self.channel_width
    }

    /// Integration time \[s\]
    pub fn integration_time(&self) -> f64 {
        self.integration_time
    }

    /// Unique, sorted Julian dates of every integration in the dataset.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// LSTs \[radians\] matching [`VisMeta::times`].
    pub fn lsts(&self) -> &[f64] {
        &self.lsts
    }

    /// Antenna positions, keyed by antenna index.
    pub fn antenna_positions(&self) -> &BTreeMap<usize, XyzGeodetic> {
        &self.antpos
    }

    /// The antenna pairs in dataset order.
    pub fn baselines(&self) -> Vec<AntPair> {
        self.times_by_bl.keys().copied().collect()
    }

    /// The polarizations in dataset order.
    pub fn polarizations(&self) -> &[Pol] {
        &self.pols
    }

    /// Every baseline-polarization key, baseline-major.
    pub fn antpairpols(&self) -> Vec<AntPairPol> {
        self.times_by_bl
            .keys()
            .cartesian_product(self.pols.iter())
            .map(|(&(ant1, ant2), &pol)| AntPairPol::new(ant1, ant2, pol))
            .collect()
    }

    /// The Julian dates of each integration of each baseline.
    pub fn times_by_baseline(&self) -> &IndexMap<AntPair, Vec<f64>> {
        &self.times_by_bl
    }

    /// The LSTs of each integration of each baseline.
    pub fn lsts_by_baseline(&self) -> &IndexMap<AntPair, Vec<f64>> {
        &self.lsts_by_bl
    }

    /// The telescope location, if known.
    pub fn telescope(&self) -> Option<LatLngHeight> {
        self.telescope
    }

    /// The free-text processing history.
    pub fn history(&self) -> &str {
        &self.history
    }

    /// The number of frequency channels.
    pub fn num_freqs(&self) -> usize {
        self.freqs.len()
    }

    /// The number of integrations of each baseline.
    pub fn num_ints(&self) -> usize {
        self.times_by_bl.values().next().map_or(0, Vec::len)
    }

    /// The number of baselines.
    pub fn num_bls(&self) -> usize {
        self.times_by_bl.len()
    }

    /// The antenna pair as it is stored in this dataset (either `antpair` or its reverse).
    pub fn stored_antpair(&self, antpair: AntPair) -> Option<AntPair> {
        let reversed = (antpair.1, antpair.0);
        if self.times_by_bl.contains_key(&antpair) {
            Some(antpair)
        } else if self.times_by_bl.contains_key(&reversed) {
            Some(reversed)
        } else {
            None
        }
    }

    /// The key as it is stored in this dataset, if it is stored in either orientation.
    pub fn stored_antpairpol(&self, key: &AntPairPol) -> Option<AntPairPol> {
        if self.times_by_bl.contains_key(&key.antpair()) && self.pols.contains(&key.pol) {
            return Some(*key);
        }
        let swapped = key.swapped();
        (self.times_by_bl.contains_key(&swapped.antpair()) && self.pols.contains(&swapped.pol))
            .then_some(swapped)
    }

    /// The times of one baseline, in either orientation.
    pub fn bl_times(&self, antpair: AntPair) -> Option<&[f64]> {
        self.stored_antpair(antpair)
            .and_then(|stored| self.times_by_bl.get(&stored))
            .map(Vec::as_slice)
    }

    /// The index of the channel at `freq`.
    pub fn freq_index(&self, freq: f64) -> Option<usize> {
        self.freqs
            .iter()
            .position(|&f| (f - freq).abs() <= FREQ_TOLERANCE_HZ)
    }

    /// The integration index of `time` on the given baseline.
    pub fn time_row(&self, antpair: AntPair, time: f64) -> Option<usize> {
        self.bl_times(antpair)?
            .iter()
            .position(|&t| (t - time).abs() <= TIME_TOLERANCE_DAYS)
    }

    /// A description of a subset of this dataset.
    ///
    /// The antenna positions, channel width, integration time, telescope and history are kept
    /// as they are.
    pub fn restrict(
        &self,
        antpairs: &[AntPair],
        pols: &[Pol],
        freq_idxs: &[usize],
        time_idxs: &[usize],
    ) -> Self {
        let pick = |values: &Vec<f64>| time_idxs.iter().map(|&idx| values[idx]).collect_vec();
        let times_by_bl: IndexMap<AntPair, Vec<f64>> = antpairs
            .iter()
            .filter_map(|antpair| {
                self.times_by_bl
                    .get(antpair)
                    .map(|times| (*antpair, pick(times)))
            })
            .collect();
        let lsts_by_bl: IndexMap<AntPair, Vec<f64>> = antpairs
            .iter()
            .filter_map(|antpair| {
                self.lsts_by_bl
                    .get(antpair)
                    .map(|lsts| (*antpair, pick(lsts)))
            })
            .collect();
        let (times, lsts) = unique_times(&times_by_bl, &lsts_by_bl);
        Self {
            freqs: freq_idxs.iter().map(|&idx| self.freqs[idx]).collect(),
            channel_width: self.channel_width,
            integration_time: self.integration_time,
            antpos: self.antpos.clone(),
            pols: pols.to_vec(),
            times_by_bl,
            lsts_by_bl,
            times,
            lsts,
            telescope: self.telescope,
            history: self.history.clone(),
        }
    }

    /// Describe why `other` can't be concatenated in time with `self`, if it can't.
    pub fn incompatibility(&self, other: &Self) -> Option<String> {
        if self.freqs.len() != other.freqs.len()
            || self
                .freqs
                .iter()
                .zip(other.freqs.iter())
                .any(|(a, b)| (a - b).abs() > FREQ_TOLERANCE_HZ)
        {
            return Some(format!(
                "frequencies differ ({} channels vs {})",
                self.freqs.len(),
                other.freqs.len()
            ));
        }
        if !self.times_by_bl.keys().eq(other.times_by_bl.keys()) {
            return Some("baselines differ".to_string());
        }
        if self.pols != other.pols {
            return Some(format!(
                "polarizations differ ({:?} vs {:?})",
                self.pols, other.pols
            ));
        }
        None
    }

    /// Join descriptions of consecutive pieces of the same dataset along the time axis.
    ///
    /// The axes other than time are taken from the first part. Returns `None` if `parts` is
    /// empty.
    pub fn concat_time(parts: &[Self]) -> Option<Self> {
        let (first, rest) = parts.split_first()?;
        let mut result = first.clone();
        for part in rest {
            for (antpair, times) in result.times_by_bl.iter_mut() {
                if let Some(more) = part.times_by_bl.get(antpair) {
                    times.extend_from_slice(more);
                }
            }
            for (antpair, lsts) in result.lsts_by_bl.iter_mut() {
                if let Some(more) = part.lsts_by_bl.get(antpair) {
                    lsts.extend_from_slice(more);
                }
            }
        }
        let (times, lsts) = unique_times(&result.times_by_bl, &result.lsts_by_bl);
        result.times = times;
        result.lsts = lsts;
        Some(result)
    }
}

/// The sorted union of all baseline times, with the LST of each time's first occurrence.
fn unique_times(
    times_by_bl: &IndexMap<AntPair, Vec<f64>>,
    lsts_by_bl: &IndexMap<AntPair, Vec<f64>>,
) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = times_by_bl
        .iter()
        .flat_map(|(antpair, times)| {
            let lsts = lsts_by_bl.get(antpair);
            times
                .iter()
                .enumerate()
                .map(move |(idx, &time)| (time, lsts.map_or(f64::NAN, |lsts| lsts[idx])))
        })
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.dedup_by(|later, earlier| (later.0 - earlier.0).abs() <= TIME_TOLERANCE_DAYS);
    pairs.into_iter().unzip()
}

/// The whole-file metadata of a dataset, if its format can provide it.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    meta: Option<Arc<VisMeta>>,
}

impl MetadataRegistry {
    /// A registry for a dataset whose extents are known.
    pub fn known(meta: Arc<VisMeta>) -> Self {
        Self { meta: Some(meta) }
    }

    /// A registry for a dataset whose extents can't be determined without a full scan.
    pub fn unknown() -> Self {
        Self { meta: None }
    }

    /// Whether whole-file metadata is available.
    pub fn is_known(&self) -> bool {
        self.meta.is_some()
    }

    /// The whole-file metadata, if known.
    pub fn get(&self) -> Option<&Arc<VisMeta>> {
        self.meta.as_ref()
    }

    /// The whole-file metadata, or an error naming what needed it.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::MetadataUnavailable`] if the metadata is unknown.
    pub fn require(&self, needed_for: &str) -> Result<&Arc<VisMeta>, KvisError> {
        self.meta
            .as_ref()
            .ok_or_else(|| KvisError::MetadataUnavailable {
                needed_for: needed_for.to_string(),
            })
    }

    /// See [`VisMeta::freqs`]
    pub fn frequencies(&self) -> Option<&[f64]> {
        self.meta.as_deref().map(VisMeta::freqs)
    }

    /// See [`VisMeta::times`]
    pub fn times(&self) -> Option<&[f64]> {
        self.meta.as_deref().map(VisMeta::times)
    }

    /// See [`VisMeta::lsts`]
    pub fn lsts(&self) -> Option<&[f64]> {
        self.meta.as_deref().map(VisMeta::lsts)
    }

    /// See [`VisMeta::antenna_positions`]
    pub fn antenna_positions(&self) -> Option<&BTreeMap<usize, XyzGeodetic>> {
        self.meta.as_deref().map(VisMeta::antenna_positions)
    }

    /// See [`VisMeta::baselines`]
    pub fn baselines(&self) -> Option<Vec<AntPair>> {
        self.meta.as_deref().map(VisMeta::baselines)
    }

    /// See [`VisMeta::polarizations`]
    pub fn polarizations(&self) -> Option<&[Pol]> {
        self.meta.as_deref().map(VisMeta::polarizations)
    }

    /// See [`VisMeta::times_by_baseline`]
    pub fn times_by_baseline(&self) -> Option<&IndexMap<AntPair, Vec<f64>>> {
        self.meta.as_deref().map(VisMeta::times_by_baseline)
    }

    /// See [`VisMeta::lsts_by_baseline`]
    pub fn lsts_by_baseline(&self) -> Option<&IndexMap<AntPair, Vec<f64>>> {
        self.meta.as_deref().map(VisMeta::lsts_by_baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::synthetic_meta;

    #[test]
    fn test_new_derives_axes() {
        let meta = synthetic_meta(&[(0, 0), (0, 1), (1, 1)], &[Pol::XX, Pol::YY], 4, 3);
        assert_eq!(meta.num_freqs(), 4);
        assert_eq!(meta.num_ints(), 3);
        assert_eq!(meta.num_bls(), 3);
        assert_eq!(meta.times().len(), 3);
        assert_eq!(meta.lsts().len(), 3);
        assert!(meta.times().windows(2).all(|w| w[0] < w[1]));
        assert!((meta.integration_time() - 10.0).abs() < 1e-3);
        assert_eq!(meta.antpairpols().len(), 6);
        assert_eq!(meta.antpairpols()[1], AntPairPol::new(0, 0, Pol::YY));
    }

    #[test]
    fn test_new_rejects_ragged_baselines() {
        let mut times_by_bl = IndexMap::new();
        times_by_bl.insert((0, 1), vec![1.0, 2.0]);
        times_by_bl.insert((0, 2), vec![1.0]);
        let lsts_by_bl = times_by_bl.clone();
        assert!(matches!(
            VisMeta::new(
                vec![1e8],
                vec![Pol::XX],
                BTreeMap::new(),
                times_by_bl,
                lsts_by_bl
            ),
            Err(KvisError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_unique_times_with_offset_baselines() {
        let mut times_by_bl = IndexMap::new();
        times_by_bl.insert((0, 1), vec![10.0, 11.0]);
        times_by_bl.insert((0, 2), vec![10.5, 11.0]);
        let mut lsts_by_bl = IndexMap::new();
        lsts_by_bl.insert((0, 1), vec![0.1, 0.2]);
        lsts_by_bl.insert((0, 2), vec![0.15, 0.2]);
        let meta = VisMeta::new(
            vec![1e8],
            vec![Pol::XX],
            BTreeMap::new(),
            times_by_bl,
            lsts_by_bl,
        )
        .unwrap();
        assert_eq!(meta.times(), &[10.0, 10.5, 11.0]);
        assert_eq!(meta.lsts(), &[0.1, 0.15, 0.2]);
        assert_eq!(meta.time_row((2, 0), 11.0), Some(1));
        assert_eq!(meta.bl_times((2, 0)), Some(&[10.5, 11.0][..]));
    }

    #[test]
    fn test_restrict() {
        let meta = synthetic_meta(&[(0, 1), (0, 2), (1, 2)], &[Pol::XX, Pol::YY], 8, 5);
        let sub = meta.restrict(&[(1, 2)], &[Pol::YY], &[2, 3, 7], &[0, 4]);
        assert_eq!(sub.baselines(), vec![(1, 2)]);
        assert_eq!(sub.polarizations(), &[Pol::YY]);
        assert_eq!(sub.freqs(), &[meta.freqs()[2], meta.freqs()[3], meta.freqs()[7]]);
        assert_eq!(sub.times(), &[meta.times()[0], meta.times()[4]]);
        assert_eq!(sub.antenna_positions().len(), meta.antenna_positions().len());
    }

    #[test]
    fn test_concat_time() {
        let meta = synthetic_meta(&[(0, 1), (1, 2)], &[Pol::XX], 2, 6);
        let first = meta.restrict(&meta.baselines(), &[Pol::XX], &[0, 1], &[0, 1, 2]);
        let second = meta.restrict(&meta.baselines(), &[Pol::XX], &[0, 1], &[3, 4, 5]);
        assert_eq!(first.incompatibility(&second), None);
        let joined = VisMeta::concat_time(&[first, second]).unwrap();
        assert_eq!(joined.times(), meta.times());
        assert_eq!(joined.num_ints(), 6);

        let other_pols = meta.restrict(&meta.baselines(), &[], &[0, 1], &[0]);
        assert!(meta.incompatibility(&other_pols).is_some());
    }

    #[test]
    fn test_registry_unknown() {
        let registry = MetadataRegistry::unknown();
        assert!(!registry.is_known());
        assert!(registry.frequencies().is_none());
        assert!(registry.times_by_baseline().is_none());
        assert!(matches!(
            registry.require("iterating by frequency"),
            Err(KvisError::MetadataUnavailable { .. })
        ));
    }
}
