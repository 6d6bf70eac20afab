use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    cal::{CalMeta, CalSolutions},
    io::{VisBuffer, VisFormat},
    key::AntPair,
    marlu::{ndarray::Array2, Complex, XyzGeodetic},
    meta::VisMeta,
    pol::{JonesPol, Pol},
};

/// Julian date of the first integration of synthetic datasets
pub const FIRST_JD: f64 = 2459000.5;
/// Integration time of synthetic datasets \[s\]
pub const INT_TIME_S: f64 = 10.0;

/// Metadata for a dataset of `nfreqs` 100kHz channels from 100MHz and `nints` 10s
/// integrations, with the same times on every baseline.
pub fn synthetic_meta(antpairs: &[AntPair], pols: &[Pol], nfreqs: usize, nints: usize) -> VisMeta {
    let freqs = (0..nfreqs).map(|i| 100e6 + i as f64 * 1e5).collect_vec();
    let times = (0..nints)
        .map(|i| FIRST_JD + i as f64 * INT_TIME_S / 86400.)
        .collect_vec();
    let lsts = (0..nints).map(|i| 0.5 + i as f64 * 7.3e-4).collect_vec();
    let antpos: BTreeMap<usize, XyzGeodetic> = antpairs
        .iter()
        .flat_map(|&(ant1, ant2)| [ant1, ant2])
        .unique()
        .map(|ant| {
            let ant_f = ant as f64;
            (
                ant,
                XyzGeodetic {
                    x: 10. * ant_f,
                    y: -3. * ant_f,
                    z: 0.5 * ant_f,
                },
            )
        })
        .collect();
    let times_by_bl: IndexMap<AntPair, Vec<f64>> =
        antpairs.iter().map(|&ap| (ap, times.clone())).collect();
    let lsts_by_bl: IndexMap<AntPair, Vec<f64>> =
        antpairs.iter().map(|&ap| (ap, lsts.clone())).collect();
    VisMeta::new(freqs, pols.to_vec(), antpos, times_by_bl, lsts_by_bl).unwrap()
}

/// Values for every baseline-polarization of `meta` that differ between keys and cells.
pub fn synthetic_buffer(meta: &VisMeta) -> VisBuffer {
    let shape = (meta.num_ints(), meta.num_freqs());
    let mut buffer = VisBuffer::default();
    for (key_idx, key) in meta.antpairpols().into_iter().enumerate() {
        let offset = 100. * (key_idx + 1) as f32;
        let data = Array2::from_shape_fn(shape, |(t, f)| {
            Complex::new(offset + t as f32, f as f32 + 0.5)
        });
        let flags = Array2::from_shape_fn(shape, |(t, f)| (t + f + key_idx) % 3 == 0);
        let nsamples = Array2::from_shape_fn(shape, |(t, f)| ((t * 7 + f + key_idx) % 5) as f32 + 1.);
        buffer.insert(key, data, flags, nsamples);
    }
    buffer
}

/// Write a synthetic dataset with XX and YY products to `dir/name`, in the format named by the
/// extension.
pub fn write_synthetic(
    dir: &Path,
    name: &str,
    antpairs: &[AntPair],
    nfreqs: usize,
    nints: usize,
) -> PathBuf {
    let path = dir.join(name);
    let meta = synthetic_meta(antpairs, &[Pol::XX, Pol::YY], nfreqs, nints);
    VisFormat::from_path(&path)
        .unwrap()
        .backend()
        .write_full(&path, &meta, &synthetic_buffer(&meta), false)
        .unwrap();
    path
}

/// Calibration solutions for every antenna and Jones polarization given, with a total quality
/// for every polarization.
pub fn synthetic_calsols(
    ants: &[usize],
    jones_pols: &[JonesPol],
    ntimes: usize,
    nfreqs: usize,
) -> (CalMeta, CalSolutions) {
    let meta = CalMeta {
        freqs: (0..nfreqs).map(|i| 150e6 + i as f64 * 4e4).collect(),
        times: (0..ntimes)
            .map(|i| FIRST_JD + i as f64 * 120. / 86400.)
            .collect(),
        ants: ants.to_vec(),
        jones_pols: jones_pols.to_vec(),
        history: "synthetic solutions".to_string(),
    };
    let shape = meta.shape();
    let mut solutions = CalSolutions::default();
    for (idx, key) in meta.antpols().into_iter().enumerate() {
        let scale = 1. + idx as f64 * 0.25;
        solutions.gains.insert(
            key,
            Array2::from_shape_fn(shape, |(t, f)| {
                Complex::new(scale + f as f64 * 0.01, -(t as f64) * 0.1)
            }),
        );
        solutions
            .flags
            .insert(key, Array2::from_shape_fn(shape, |(t, f)| (t + f + idx) % 4 == 0));
        solutions.quality.insert(
            key,
            Array2::from_shape_fn(shape, |(t, f)| (t + f) as f64 / 10.),
        );
    }
    for (idx, &jpol) in jones_pols.iter().enumerate() {
        solutions
            .total_quality
            .insert(jpol, Array2::from_elem(shape, 1. + idx as f64));
    }
    (meta, solutions)
}

