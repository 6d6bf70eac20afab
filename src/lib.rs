#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! kvis gives keyed, conjugation-aware access to radio interferometric visibilities and
//! antenna calibration solutions, and reads and writes them in parts.
//!
//! Visibilities are indexed by `(ant1, ant2, pol)` keys. Asking a container for the reverse
//! of a stored key returns the complex conjugate, with the conjugate polarization.
//!
//! # Examples
//!
//! Split a file into frequency chunks, touch each chunk and write it into place in a new file.
//!
//! ```rust
//! use kvis::{
//!     marlu::{ndarray::Array2, Complex},
//!     Pol, ReadSelection, VisBuffer, VisFormat, VisHandle, VisMeta,
//! };
//! use indexmap::IndexMap;
//! use std::collections::BTreeMap;
//! use tempfile::tempdir;
//!
//! let tmp_dir = tempdir().unwrap();
//! let input = tmp_dir.path().join("input.kvb");
//! let output = tmp_dir.path().join("output.kvb");
//!
//! // 1024 channels, 2 integrations, one baseline
//! let freqs = (0..1024).map(|chan| 100e6 + chan as f64 * 1e4).collect();
//! let mut times_by_bl = IndexMap::new();
//! times_by_bl.insert((1, 2), vec![2459000.0, 2459000.0001]);
//! let lsts_by_bl = times_by_bl.clone();
//! let meta = VisMeta::new(freqs, vec![Pol::XX], BTreeMap::new(), times_by_bl, lsts_by_bl).unwrap();
//! let buffer = VisBuffer::zeros(&meta.antpairpols(), (2, 1024));
//! VisFormat::Blocked.backend().write_full(&input, &meta, &buffer, false).unwrap();
//!
//! let mut handle = VisHandle::open_path(&input).unwrap();
//! handle.initialize_output(&output, false).unwrap();
//! let mut cursor = handle.iterate_by_frequency_group(300, None).unwrap();
//! let mut widths = vec![];
//! while let Some(chunk) = cursor.next_chunk(&mut handle) {
//!     let mut vis = chunk.unwrap();
//!     widths.push(vis.data.shape().unwrap().1);
//!     for (_, flags) in vis.flags.items() {
//!         assert!(!flags.iter().any(|&f| f));
//!     }
//!     let key = vis.data.keys().next().copied().unwrap();
//!     vis.data.get_stored_mut(&key).unwrap().fill(Complex::new(1.0, 1.0));
//!     handle.partial_write(&output, Some(&vis.data), None, None).unwrap();
//! }
//! assert_eq!(widths, vec![300, 300, 300, 124]);
//!
//! let written = VisHandle::open_path(&output)
//!     .unwrap()
//!     .read(&ReadSelection::default())
//!     .unwrap();
//! let key = "2_1_xx".parse().unwrap();
//! assert!(written.data.get(&key).unwrap().iter().all(|&v| v == Complex::new(1.0, -1.0)));
//! ```

use cfg_if::cfg_if;

pub use marlu;

pub mod autos;
pub mod cal;
pub mod chunk;
pub mod container;
pub mod error;
pub mod handle;
pub mod io;
pub mod key;
pub mod meta;
pub mod parallelize;
pub mod pol;
pub mod selection;

pub use autos::{extract_autos, GainConvention};
pub use cal::{CalContainers, CalHandle, CalMeta, CalSolutions};
pub use chunk::{ChunkCursor, ChunkItems, ChunkPlan};
pub use container::{Conjugate, DataContainer};
pub use error::KvisError;
pub use handle::{VisContainers, VisData, VisFlags, VisHandle, VisNsamples};
pub use io::{CalBackend, Capabilities, FormatBackend, VisBuffer, VisFormat};
pub use key::{AntPair, AntPairPol, AntPol, ContainerKey};
pub use meta::{MetadataRegistry, VisMeta};
pub use parallelize::{antpairpol_chunks, read_antpairpol_file, write_antpairpol_chunk_files};
pub use pol::{JonesPol, Pol};
pub use selection::{ReadSelection, ReadSelectionBuilder, Region, Subset, SubsetRecord};

cfg_if! {
    if #[cfg(feature = "cli")] {
        pub mod cli;
        pub use cli::KvisContext;
    }
}

#[cfg(test)]
pub(crate) mod test_common;
