//! A dictionary of waterfalls, indexed by baseline or antenna keys.
//!
//! A [`DataContainer`] maps keys to two dimensional arrays of shape `(Nint, Nfreq)`. Every
//! array in a container has the same shape. Baseline keys are conjugation-aware: if `(i, j,
//! xy)` is stored, asking for `(j, i, yx)` gives the complex conjugate of the stored waterfall
//! (or the unchanged waterfall for real-valued containers such as flags and sample counts).
//!
//! Containers produced by the same read share their descriptive metadata through an [`Arc`],
//! while each container owns an independent copy of its payload.
//!
//! # Examples
//!
//! ```rust
//! use kvis::{AntPairPol, DataContainer, Pol, marlu::{Complex, ndarray::Array2}};
//!
//! let mut data: DataContainer<AntPairPol, Complex<f32>> = DataContainer::new();
//! let waterfall = Array2::from_elem((2, 3), Complex::new(1.0, 2.0));
//! data.set(AntPairPol::new(1, 2, Pol::XX), waterfall).unwrap();
//!
//! let reversed = data.get(&"2_1_XX".parse().unwrap()).unwrap();
//! assert_eq!(reversed[(0, 0)], Complex::new(1.0, -2.0));
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    key::{AntPair, AntPairPol, ContainerKey},
    marlu::{ndarray::Array2, Complex},
    pol::Pol,
    KvisError,
};

/// Values that know how to turn into their complex conjugate.
///
/// Real values are their own conjugate.
pub trait Conjugate: Clone {
    /// The complex conjugate of this value.
    fn conjugate(&self) -> Self;
}

impl Conjugate for Complex<f32> {
    fn conjugate(&self) -> Self {
        self.conj()
    }
}

impl Conjugate for Complex<f64> {
    fn conjugate(&self) -> Self {
        self.conj()
    }
}

macro_rules! impl_real_conjugate {
    ($($t:ty),*) => {
        $(
            impl Conjugate for $t {
                fn conjugate(&self) -> Self {
                    *self
                }
            }
        )*
    };
}

impl_real_conjugate!(bool, u8, i32, u32, f32, f64);

/// An insertion-ordered map of keys to waterfalls that all share a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct DataContainer<K: ContainerKey, T, M = ()> {
    arrays: IndexMap<K, Array2<T>>,
    shape: Option<(usize, usize)>,
    meta: Option<Arc<M>>,
}

impl<K: ContainerKey, T, M> Default for DataContainer<K, T, M> {
    fn default() -> Self {
        Self {
            arrays: IndexMap::new(),
            shape: None,
            meta: None,
        }
    }
}

impl<K: ContainerKey, T: Conjugate, M> DataContainer<K, T, M> {
    /// An empty container without metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty container that carries `meta`.
    pub fn with_meta(meta: Arc<M>) -> Self {
        Self {
            meta: Some(meta),
            ..Self::default()
        }
    }

    /// Build a container from owned arrays, checking that every array has the same shape.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::ShapeMismatch`] if the arrays have different shapes.
    pub fn from_arrays<I>(arrays: I, meta: Option<Arc<M>>) -> Result<Self, KvisError>
    where
        I: IntoIterator<Item = (K, Array2<T>)>,
    {
        let mut result = Self {
            meta,
            ..Self::default()
        };
        for (key, array) in arrays {
            result.set(key, array)?;
        }
        Ok(result)
    }

    /// The descriptive metadata shared by this container, if any.
    pub fn meta(&self) -> Option<&Arc<M>> {
        self.meta.as_ref()
    }

    /// Whether both containers point at the very same metadata.
    pub fn shares_meta_with<U>(&self, other: &DataContainer<K, U, M>) -> bool {
        match (&self.meta, &other.meta) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The shape shared by every waterfall, or `None` if the container is empty.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape
    }

    /// The number of stored keys.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Whether `key` is stored in either orientation.
    pub fn contains(&self, key: &K) -> bool {
        self.arrays.contains_key(key)
            || key
                .reversed()
                .map_or(false, |rev| self.arrays.contains_key(&rev))
    }

    /// The stored keys, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> + Clone + '_ {
        self.arrays.keys()
    }

    /// The stored keys and waterfalls, in insertion order.
    pub fn items(&self) -> impl Iterator<Item = (&K, &Array2<T>)> + Clone + '_ {
        self.arrays.iter()
    }

    /// Get a copy of the waterfall for `key`, conjugating it if only the reverse of `key` is
    /// stored.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::KeyNotFound`] if neither orientation of `key` is stored.
    pub fn get(&self, key: &K) -> Result<Array2<T>, KvisError> {
        if let Some(array) = self.arrays.get(key) {
            return Ok(array.clone());
        }
        match key.reversed().and_then(|rev| self.arrays.get(&rev)) {
            Some(array) => Ok(array.map(T::conjugate)),
            None => Err(KvisError::KeyNotFound {
                key: key.to_string(),
            }),
        }
    }

    /// The waterfall stored under exactly `key`, without any conjugation.
    pub fn get_stored(&self, key: &K) -> Option<&Array2<T>> {
        self.arrays.get(key)
    }

    /// A mutable reference to the waterfall stored under exactly `key`.
    pub fn get_stored_mut(&mut self, key: &K) -> Option<&mut Array2<T>> {
        self.arrays.get_mut(key)
    }

    /// The key under which `key` is stored, if it is stored in either orientation.
    pub fn stored_key(&self, key: &K) -> Option<K> {
        if self.arrays.contains_key(key) {
            return Some(*key);
        }
        key.reversed().filter(|rev| self.arrays.contains_key(rev))
    }

    /// Store `array` under `key`.
    ///
    /// If the reverse of `key` is already stored, the conjugate of `array` replaces the stored
    /// waterfall, so a baseline only ever exists in one orientation.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::ShapeMismatch`] if the shape of `array` differs from the
    /// shape of the waterfalls already in the container.
    pub fn set(&mut self, key: K, array: Array2<T>) -> Result<(), KvisError> {
        let dim = array.dim();
        match self.shape {
            Some(shape) if shape != dim => {
                return Err(KvisError::ShapeMismatch {
                    argument: "array".to_string(),
                    function: "DataContainer::set".to_string(),
                    expected: format!("{:?}", shape),
                    received: format!("{:?}", dim),
                });
            }
            _ => self.shape = Some(dim),
        }
        let only_reverse_stored = key
            .reversed()
            .filter(|rev| !self.arrays.contains_key(&key) && self.arrays.contains_key(rev));
        match only_reverse_stored {
            Some(rev) => {
                self.arrays.insert(rev, array.map(T::conjugate));
            }
            None => {
                self.arrays.insert(key, array);
            }
        }
        Ok(())
    }

    /// Remove `key` (in either orientation), returning the waterfall as it was stored.
    pub fn remove(&mut self, key: &K) -> Option<Array2<T>> {
        let stored = self.stored_key(key)?;
        let removed = self.arrays.shift_remove(&stored);
        if self.arrays.is_empty() {
            self.shape = None;
        }
        removed
    }

    /// Consume the container, returning the stored waterfalls.
    pub fn into_arrays(self) -> IndexMap<K, Array2<T>> {
        self.arrays
    }
}

impl<T: Conjugate, M> DataContainer<AntPairPol, T, M> {
    /// The unique antenna pairs, in insertion order.
    pub fn antpairs(&self) -> Vec<AntPair> {
        self.arrays.keys().map(|key| key.antpair()).unique().collect()
    }

    /// The unique polarizations, in insertion order.
    pub fn pols(&self) -> Vec<Pol> {
        self.arrays.keys().map(|key| key.pol).unique().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::AntPol, marlu::ndarray::array, pol::JonesPol};

    fn waterfall(seed: f32) -> Array2<Complex<f32>> {
        Array2::from_shape_fn((2, 3), |(t, f)| {
            Complex::new(seed + t as f32, seed * 10.0 + f as f32)
        })
    }

    #[test]
    fn test_get_reversed_conjugates_for_every_case() {
        let mut data: DataContainer<AntPairPol, Complex<f32>> = DataContainer::new();
        let stored = waterfall(1.0);
        data.set(AntPairPol::new(1, 2, Pol::XX), stored.clone())
            .unwrap();

        for pol_str in ["xx", "XX", "Xx", "xX"] {
            let fwd = data
                .get(&AntPairPol::try_from((1, 2, pol_str)).unwrap())
                .unwrap();
            let rev = data
                .get(&AntPairPol::try_from((2, 1, pol_str)).unwrap())
                .unwrap();
            assert_eq!(fwd, stored);
            assert_eq!(rev, stored.map(|v| v.conj()));
        }
    }

    #[test]
    fn test_get_reversed_cross_pol() {
        let mut data: DataContainer<AntPairPol, Complex<f32>> = DataContainer::new();
        data.set(AntPairPol::new(0, 3, Pol::XY), waterfall(2.0))
            .unwrap();
        let rev = data.get(&AntPairPol::new(3, 0, Pol::YX)).unwrap();
        assert_eq!(rev, waterfall(2.0).map(|v| v.conj()));
        assert!(matches!(
            data.get(&AntPairPol::new(3, 0, Pol::XY)),
            Err(KvisError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_real_containers_do_not_conjugate() {
        let mut flags: DataContainer<AntPairPol, bool> = DataContainer::new();
        let stored = array![[true, false], [false, false]];
        flags
            .set(AntPairPol::new(1, 2, Pol::XX), stored.clone())
            .unwrap();
        assert_eq!(flags.get(&AntPairPol::new(2, 1, Pol::XX)).unwrap(), stored);
    }

    #[test]
    fn test_get_returns_independent_copy() {
        let mut data: DataContainer<AntPairPol, Complex<f32>> = DataContainer::new();
        let key = AntPairPol::new(1, 2, Pol::XX);
        data.set(key, waterfall(1.0)).unwrap();
        let mut copy = data.get(&key).unwrap();
        copy[(0, 0)] = Complex::new(-99.0, 0.0);
        assert_eq!(data.get(&key).unwrap(), waterfall(1.0));
    }

    #[test]
    fn test_missing_key() {
        let data: DataContainer<AntPairPol, f32> = DataContainer::new();
        match data.get(&AntPairPol::new(1, 2, Pol::XX)) {
            Err(KvisError::KeyNotFound { key }) => assert_eq!(key, "1_2_xx"),
            other => panic!("expected KeyNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_set_shape_mismatch() {
        let mut nsamples: DataContainer<AntPairPol, f32> = DataContainer::new();
        nsamples
            .set(AntPairPol::new(0, 1, Pol::XX), Array2::zeros((2, 3)))
            .unwrap();
        assert!(matches!(
            nsamples.set(AntPairPol::new(0, 2, Pol::XX), Array2::zeros((3, 3))),
            Err(KvisError::ShapeMismatch { .. })
        ));
        assert_eq!(nsamples.shape(), Some((2, 3)));
        assert_eq!(nsamples.len(), 1);
    }

    #[test]
    fn test_set_reversed_stores_under_existing_orientation() {
        let mut data: DataContainer<AntPairPol, Complex<f32>> = DataContainer::new();
        data.set(AntPairPol::new(1, 2, Pol::XY), waterfall(1.0))
            .unwrap();
        data.set(AntPairPol::new(2, 1, Pol::YX), waterfall(5.0))
            .unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(
            data.get_stored(&AntPairPol::new(1, 2, Pol::XY)).unwrap(),
            waterfall(5.0).map(|v| v.conj())
        );
    }

    #[test]
    fn test_keys_are_insertion_ordered_and_restartable() {
        let mut data: DataContainer<AntPairPol, f32> = DataContainer::new();
        let keys = [
            AntPairPol::new(5, 6, Pol::YY),
            AntPairPol::new(0, 1, Pol::XX),
            AntPairPol::new(2, 9, Pol::XX),
            AntPairPol::new(5, 6, Pol::XX),
            AntPairPol::new(0, 1, Pol::YY),
        ];
        for key in keys {
            data.set(key, Array2::zeros((1, 1))).unwrap();
        }
        let iter = data.keys();
        let first: Vec<_> = iter.clone().copied().collect();
        let second: Vec<_> = iter.copied().collect();
        assert_eq!(first, keys);
        assert_eq!(second, keys);
        assert_eq!(data.antpairs(), vec![(5, 6), (0, 1), (2, 9)]);
        assert_eq!(data.pols(), vec![Pol::YY, Pol::XX]);
    }

    #[test]
    fn test_remove_either_orientation() {
        let mut data: DataContainer<AntPairPol, f32> = DataContainer::new();
        data.set(AntPairPol::new(1, 2, Pol::XX), Array2::zeros((1, 2)))
            .unwrap();
        assert!(data.remove(&AntPairPol::new(2, 1, Pol::XX)).is_some());
        assert!(data.is_empty());
        assert_eq!(data.shape(), None);
    }

    #[test]
    fn test_shared_meta() {
        let meta = Arc::new("shared".to_string());
        let data: DataContainer<AntPol, Complex<f64>, String> =
            DataContainer::with_meta(Arc::clone(&meta));
        let flags: DataContainer<AntPol, bool, String> = DataContainer::with_meta(meta);
        assert!(data.shares_meta_with(&flags));

        let other: DataContainer<AntPol, bool, String> =
            DataContainer::with_meta(Arc::new("shared".to_string()));
        assert!(!data.shares_meta_with(&other));
        assert!(!data.contains(&AntPol::new(0, JonesPol::Jxx)));
    }
}
