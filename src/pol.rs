//! Polarization strings.
//!
//! Polarizations are parsed case-insensitively from a fixed set of codes, so `"XX"`, `"xx"`
//! and `"Xx"` all produce [`Pol::XX`]. Correlation polarizations display in lower case,
//! pseudo-Stokes parameters as `pI`, `pQ`, `pU`, `pV`, and antenna (Jones) polarizations as
//! `Jxx`, `Jee`, etc.

use std::{collections::HashMap, fmt::Display, str::FromStr};

use lazy_static::lazy_static;

use crate::KvisError;

/// The polarization of a correlation product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Pol {
    XX,
    YY,
    XY,
    YX,
    EE,
    NN,
    EN,
    NE,
    RR,
    LL,
    RL,
    LR,
    PI,
    PQ,
    PU,
    PV,
}

/// The polarization of a single antenna feed, used for gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum JonesPol {
    Jxx,
    Jyy,
    Jee,
    Jnn,
    Jrr,
    Jll,
}

lazy_static! {
    static ref POL_STRS: HashMap<&'static str, Pol> = Pol::ALL
        .iter()
        .map(|&pol| (pol.as_str_lower(), pol))
        .collect();
    static ref JONES_POL_STRS: HashMap<&'static str, JonesPol> = JonesPol::ALL
        .iter()
        .map(|&pol| (pol.feed(), pol))
        .collect();
}

impl Pol {
    /// Every supported polarization.
    pub const ALL: [Pol; 16] = [
        Pol::XX,
        Pol::YY,
        Pol::XY,
        Pol::YX,
        Pol::EE,
        Pol::NN,
        Pol::EN,
        Pol::NE,
        Pol::RR,
        Pol::LL,
        Pol::RL,
        Pol::LR,
        Pol::PI,
        Pol::PQ,
        Pol::PU,
        Pol::PV,
    ];

    fn as_str_lower(self) -> &'static str {
        match self {
            Pol::XX => "xx",
            Pol::YY => "yy",
            Pol::XY => "xy",
            Pol::YX => "yx",
            Pol::EE => "ee",
            Pol::NN => "nn",
            Pol::EN => "en",
            Pol::NE => "ne",
            Pol::RR => "rr",
            Pol::LL => "ll",
            Pol::RL => "rl",
            Pol::LR => "lr",
            Pol::PI => "pi",
            Pol::PQ => "pq",
            Pol::PU => "pu",
            Pol::PV => "pv",
        }
    }

    /// The canonical string for this polarization.
    pub fn as_str(self) -> &'static str {
        match self {
            Pol::PI => "pI",
            Pol::PQ => "pQ",
            Pol::PU => "pU",
            Pol::PV => "pV",
            pol => pol.as_str_lower(),
        }
    }

    /// The polarization seen when the antennas of a baseline are swapped, e.g. `xy` -> `yx`.
    pub fn conj(self) -> Self {
        match self {
            Pol::XY => Pol::YX,
            Pol::YX => Pol::XY,
            Pol::EN => Pol::NE,
            Pol::NE => Pol::EN,
            Pol::RL => Pol::LR,
            Pol::LR => Pol::RL,
            pol => pol,
        }
    }

    /// Whether both feeds of this correlation are the same.
    pub fn is_parallel_hand(self) -> bool {
        matches!(
            self,
            Pol::XX | Pol::YY | Pol::EE | Pol::NN | Pol::RR | Pol::LL
        )
    }

    /// The Jones polarization of the feeds, if this is a parallel-hand correlation.
    pub fn jones_pol(self) -> Option<JonesPol> {
        match self {
            Pol::XX => Some(JonesPol::Jxx),
            Pol::YY => Some(JonesPol::Jyy),
            Pol::EE => Some(JonesPol::Jee),
            Pol::NN => Some(JonesPol::Jnn),
            Pol::RR => Some(JonesPol::Jrr),
            Pol::LL => Some(JonesPol::Jll),
            _ => None,
        }
    }
}

impl Display for Pol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Pol {
    type Err = KvisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        POL_STRS
            .get(s.trim().to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| KvisError::InvalidPol(s.to_string()))
    }
}

impl JonesPol {
    /// Every supported Jones polarization.
    pub const ALL: [JonesPol; 6] = [
        JonesPol::Jxx,
        JonesPol::Jyy,
        JonesPol::Jee,
        JonesPol::Jnn,
        JonesPol::Jrr,
        JonesPol::Jll,
    ];

    fn feed(self) -> &'static str {
        match self {
            JonesPol::Jxx => "xx",
            JonesPol::Jyy => "yy",
            JonesPol::Jee => "ee",
            JonesPol::Jnn => "nn",
            JonesPol::Jrr => "rr",
            JonesPol::Jll => "ll",
        }
    }

    /// The canonical string for this polarization.
    pub fn as_str(self) -> &'static str {
        match self {
            JonesPol::Jxx => "Jxx",
            JonesPol::Jyy => "Jyy",
            JonesPol::Jee => "Jee",
            JonesPol::Jnn => "Jnn",
            JonesPol::Jrr => "Jrr",
            JonesPol::Jll => "Jll",
        }
    }
}

impl Display for JonesPol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JonesPol {
    type Err = KvisError;

    /// Accepts `Jxx`, `jXX`, `xx` and single-feed codes like `x` or `E`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let feed = match lower.len() {
            3 => lower.strip_prefix('j').unwrap_or(lower.as_str()),
            _ => lower.as_str(),
        };
        let feed = if feed.len() == 1 {
            feed.repeat(2)
        } else {
            feed.to_string()
        };
        JONES_POL_STRS
            .get(feed.as_str())
            .copied()
            .ok_or_else(|| KvisError::InvalidPol(s.to_string()))
    }
}
