#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use kvis::{
    marlu::{ndarray::Array2, Complex, XyzGeodetic},
    AntPair, Pol, VisBuffer, VisFormat, VisMeta,
};

/// Julian date of the first integration
pub const FIRST_JD: f64 = 2459000.5;

/// Metadata with `nfreqs` 40kHz channels and `nints` 8s integrations.
pub fn get_meta(antpairs: &[AntPair], pols: &[Pol], nfreqs: usize, nints: usize) -> VisMeta {
    let freqs = (0..nfreqs).map(|chan| 150e6 + chan as f64 * 4e4).collect();
    let times: Vec<f64> = (0..nints)
        .map(|int| FIRST_JD + int as f64 * 8. / 86400.)
        .collect();
    let lsts: Vec<f64> = (0..nints).map(|int| 1.2 + int as f64 * 5.8e-4).collect();
    let mut antpos = BTreeMap::new();
    for &(ant1, ant2) in antpairs {
        for ant in [ant1, ant2] {
            antpos.insert(
                ant,
                XyzGeodetic {
                    x: ant as f64 * 14.,
                    y: ant as f64 * -2.,
                    z: 0.,
                },
            );
        }
    }
    let times_by_bl: IndexMap<AntPair, Vec<f64>> =
        antpairs.iter().map(|&ap| (ap, times.clone())).collect();
    let lsts_by_bl: IndexMap<AntPair, Vec<f64>> =
        antpairs.iter().map(|&ap| (ap, lsts.clone())).collect();
    VisMeta::new(freqs, pols.to_vec(), antpos, times_by_bl, lsts_by_bl)
        .unwrap()
        .with_history("integration test dataset")
}

/// Distinct values in every cell of every key.
pub fn get_buffer(meta: &VisMeta) -> VisBuffer {
    let shape = (meta.num_ints(), meta.num_freqs());
    let mut buffer = VisBuffer::default();
    for (key_idx, key) in meta.antpairpols().into_iter().enumerate() {
        buffer.insert(
            key,
            Array2::from_shape_fn(shape, |(t, f)| {
                Complex::new(key_idx as f32 + t as f32 * 0.5, f as f32 - 3.)
            }),
            Array2::from_shape_fn(shape, |(t, f)| (t * 3 + f + key_idx) % 7 == 0),
            Array2::from_shape_fn(shape, |(t, f)| ((t + f) % 4) as f32),
        );
    }
    buffer
}

/// Write a dataset to `dir/name` in the format given by the extension.
pub fn write_dataset(
    dir: &Path,
    name: &str,
    antpairs: &[AntPair],
    pols: &[Pol],
    nfreqs: usize,
    nints: usize,
) -> (PathBuf, VisMeta, VisBuffer) {
    let path = dir.join(name);
    let meta = get_meta(antpairs, pols, nfreqs, nints);
    let buffer = get_buffer(&meta);
    VisFormat::from_path(&path)
        .unwrap()
        .backend()
        .write_full(&path, &meta, &buffer, false)
        .unwrap();
    (path, meta, buffer)
}
