//! Keys used to index [`crate::DataContainer`]s.

use std::{fmt::Display, hash::Hash, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    pol::{JonesPol, Pol},
    KvisError,
};

/// A pair of antenna indices.
pub type AntPair = (usize, usize);

lazy_static! {
    static ref RE_ANTPAIRPOL: Regex =
        Regex::new(r"^\(?\s*(\d+)\s*[_,]\s*(\d+)\s*[_,]\s*'?([A-Za-z]{2})'?\s*\)?$").unwrap();
}

/// Something that can index a [`crate::DataContainer`].
pub trait ContainerKey: Copy + Eq + Hash + std::fmt::Debug + Display {
    /// The key seen from the other end of the baseline, if that is a different key.
    fn reversed(&self) -> Option<Self>;
}

/// A baseline and the polarization of its correlation product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AntPairPol {
    /// The first antenna index
    pub ant1: usize,
    /// The second antenna index
    pub ant2: usize,
    /// The polarization
    pub pol: Pol,
}

impl AntPairPol {
    /// Create a new key.
    pub fn new(ant1: usize, ant2: usize, pol: Pol) -> Self {
        Self { ant1, ant2, pol }
    }

    /// The antenna pair of this key.
    pub fn antpair(&self) -> AntPair {
        (self.ant1, self.ant2)
    }

    /// The same physical baseline with the antennas swapped.
    pub fn swapped(&self) -> Self {
        Self {
            ant1: self.ant2,
            ant2: self.ant1,
            pol: self.pol.conj(),
        }
    }

    /// Whether this is an autocorrelation.
    pub fn is_auto(&self) -> bool {
        self.ant1 == self.ant2
    }
}

impl ContainerKey for AntPairPol {
    fn reversed(&self) -> Option<Self> {
        let swapped = self.swapped();
        (swapped != *self).then_some(swapped)
    }
}

impl Display for AntPairPol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.ant1, self.ant2, self.pol)
    }
}

impl FromStr for AntPairPol {
    type Err = KvisError;

    /// Parses `1_2_xx`, `1,2,XX` or `(1, 2, 'xx')`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = RE_ANTPAIRPOL
            .captures(s.trim())
            .ok_or_else(|| KvisError::InvalidAntPairPol(s.to_string()))?;
        let ant = |idx: usize| {
            caps[idx]
                .parse::<usize>()
                .map_err(|_| KvisError::InvalidAntPairPol(s.to_string()))
        };
        Ok(Self::new(ant(1)?, ant(2)?, caps[3].parse()?))
    }
}

impl From<(usize, usize, Pol)> for AntPairPol {
    fn from((ant1, ant2, pol): (usize, usize, Pol)) -> Self {
        Self::new(ant1, ant2, pol)
    }
}

impl TryFrom<(usize, usize, &str)> for AntPairPol {
    type Error = KvisError;

    fn try_from((ant1, ant2, pol): (usize, usize, &str)) -> Result<Self, Self::Error> {
        Ok(Self::new(ant1, ant2, pol.parse()?))
    }
}

/// An antenna and one of its feed polarizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AntPol {
    /// The antenna index
    pub ant: usize,
    /// The feed polarization
    pub pol: JonesPol,
}

impl AntPol {
    /// Create a new key.
    pub fn new(ant: usize, pol: JonesPol) -> Self {
        Self { ant, pol }
    }
}

impl ContainerKey for AntPol {
    fn reversed(&self) -> Option<Self> {
        None
    }
}

impl Display for AntPol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.ant, self.pol)
    }
}

impl TryFrom<(usize, &str)> for AntPol {
    type Error = KvisError;

    fn try_from((ant, pol): (usize, &str)) -> Result<Self, Self::Error> {
        Ok(Self::new(ant, pol.parse()?))
    }
}

impl ContainerKey for JonesPol {
    fn reversed(&self) -> Option<Self> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_antpairpol_parse_forms() {
        let expected = AntPairPol::new(1, 2, Pol::XX);
        for s in ["1_2_xx", "1_2_XX", "1,2,xx", "(1, 2, 'xx')", "(1,2,'Xx')"] {
            assert_eq!(s.parse::<AntPairPol>().unwrap(), expected, "{}", s);
        }
        assert_eq!(expected.to_string(), "1_2_xx");
    }

    #[test]
    fn test_antpairpol_parse_rejects_garbage() {
        for s in ["1_2", "a_2_xx", "1_2_xz", "1_2_xx_3"] {
            assert!(s.parse::<AntPairPol>().is_err(), "{}", s);
        }
    }

    #[test]
    fn test_reversed_conjugates_pol() {
        let key = AntPairPol::new(3, 5, Pol::XY);
        assert_eq!(key.reversed(), Some(AntPairPol::new(5, 3, Pol::YX)));
        // an autocorrelation of a parallel hand is its own reverse
        assert_eq!(AntPairPol::new(4, 4, Pol::EE).reversed(), None);
        // but a cross-hand autocorrelation is not
        assert_eq!(
            AntPairPol::new(4, 4, Pol::EN).reversed(),
            Some(AntPairPol::new(4, 4, Pol::NE))
        );
        assert_eq!(AntPol::new(1, JonesPol::Jxx).reversed(), None);
    }
}
