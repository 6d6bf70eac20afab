//! Extracting autocorrelations, optionally with calibration gains applied.

use std::{fmt::Display, path::Path, str::FromStr};

use itertools::{izip, Itertools};
use log::{debug, info};

use crate::{
    cal::CalHandle,
    handle::{VisData, VisFlags, VisHandle},
    key::{AntPairPol, AntPol},
    marlu::{
        ndarray::{ArrayView2, ArrayViewMut2, Axis},
        Complex,
    },
    meta::{VisMeta, FREQ_TOLERANCE_HZ, TIME_TOLERANCE_DAYS},
    selection::ReadSelection,
    KvisError,
};

/// How calibration gains relate raw visibilities to calibrated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GainConvention {
    /// calibrated = raw / (g_i g_j^*)
    #[default]
    Divide,
    /// calibrated = raw * (g_i g_j^*)
    Multiply,
}

impl Display for GainConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Divide => "divide",
                Self::Multiply => "multiply",
            }
        )
    }
}

impl FromStr for GainConvention {
    type Err = KvisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "divide" => Ok(Self::Divide),
            "multiply" => Ok(Self::Multiply),
            _ => Err(KvisError::InvalidGainConvention(s.to_string())),
        }
    }
}

/// Whether `key` is a parallel-hand autocorrelation.
pub fn is_auto_key(key: &AntPairPol) -> bool {
    key.is_auto() && key.pol.is_parallel_hand()
}

/// Apply the gain power `|g|^2` of an antenna to its autocorrelation in place.
///
/// `gains` and `gain_flags` must already be on the `[time][channel]` grid of `data`. Cells
/// with a flagged gain, or that aren't finite afterwards, are flagged.
///
/// # Errors
///
/// Will return [`KvisError::ShapeMismatch`] if the arrays don't all have the same shape.
pub fn apply_auto_gains(
    mut data: ArrayViewMut2<Complex<f32>>,
    mut flags: ArrayViewMut2<bool>,
    gains: ArrayView2<Complex<f64>>,
    gain_flags: ArrayView2<bool>,
    convention: GainConvention,
) -> Result<(), KvisError> {
    let expected = data.dim();
    for (argument, received) in [
        ("flags", flags.dim()),
        ("gains", gains.dim()),
        ("gain_flags", gain_flags.dim()),
    ] {
        if received != expected {
            return Err(KvisError::ShapeMismatch {
                argument: argument.to_string(),
                function: "apply_auto_gains".to_string(),
                expected: format!("{expected:?}"),
                received: format!("{received:?}"),
            });
        }
    }
    for (vis, flag, gain, &gain_flag) in izip!(
        data.iter_mut(),
        flags.iter_mut(),
        gains.iter(),
        gain_flags.iter()
    ) {
        let power = gain.norm_sqr();
        let scaled = match convention {
            GainConvention::Divide => Complex::new(vis.re as f64 / power, vis.im as f64 / power),
            GainConvention::Multiply => Complex::new(vis.re as f64 * power, vis.im as f64 * power),
        };
        *vis = Complex::new(scaled.re as f32, scaled.im as f32);
        if gain_flag || !vis.re.is_finite() || !vis.im.is_finite() {
            *flag = true;
        }
    }
    Ok(())
}

/// The selection of every parallel-hand autocorrelation of `meta`.
fn autos_selection(meta: &VisMeta) -> Result<ReadSelection, KvisError> {
    let autos = meta
        .antpairpols()
        .into_iter()
        .filter(is_auto_key)
        .collect_vec();
    if autos.is_empty() {
        return Err(KvisError::SelectionNotFound {
            axis: "baseline".to_string(),
            value: "any parallel-hand autocorrelation".to_string(),
        });
    }
    Ok(ReadSelection {
        bls: Some(autos),
        ..Default::default()
    })
}

/// Find the index of each of `wanted` in `available`, matching within `tolerance`. A single
/// available value applies to everything.
fn match_axis(
    axis: &str,
    wanted: &[f64],
    available: &[f64],
    tolerance: f64,
) -> Result<Vec<usize>, KvisError> {
    wanted
        .iter()
        .map(|&value| {
            if available.len() == 1 {
                return Ok(0);
            }
            available
                .iter()
                .position(|&a| (a - value).abs() <= tolerance)
                .ok_or_else(|| KvisError::SelectionNotFound {
                    axis: axis.to_string(),
                    value: value.to_string(),
                })
        })
        .collect()
}

/// Divide or multiply each autocorrelation in `data` by the gain power of its antenna.
fn calibrate_autos(
    data: &mut VisData,
    flags: &mut VisFlags,
    calfile: &Path,
    convention: GainConvention,
) -> Result<(), KvisError> {
    let mut cal = CalHandle::open(calfile);
    let solutions = cal.read()?;
    let cal_meta = solutions.gains.meta().cloned().unwrap_or_default();
    let vis_meta = data.meta().cloned().ok_or_else(|| KvisError::MetadataUnavailable {
        needed_for: "calibrating autocorrelations".to_string(),
    })?;
    let chans = match_axis(
        "calibration frequency",
        vis_meta.freqs(),
        &cal_meta.freqs,
        FREQ_TOLERANCE_HZ,
    )?;

    let keys = data.keys().copied().collect_vec();
    for key in keys {
        let jones_pol = key.pol.jones_pol().ok_or_else(|| KvisError::NotSupported {
            operation: "calibrating autocorrelations".to_string(),
            target: format!("polarization {}", key.pol),
        })?;
        let antpol = AntPol::new(key.ant1, jones_pol);
        let gains = solutions.gains.get(&antpol)?;
        let gain_flags = solutions.flags.get(&antpol)?;
        let bl_times = vis_meta.bl_times(key.antpair()).unwrap_or_default();
        let rows = match_axis(
            "calibration time",
            bl_times,
            &cal_meta.times,
            TIME_TOLERANCE_DAYS,
        )?;
        let gains = gains.select(Axis(0), &rows);
        let gains = gains.select(Axis(1), &chans);
        let gain_flags = gain_flags.select(Axis(0), &rows);
        let gain_flags = gain_flags.select(Axis(1), &chans);
        let missing = || KvisError::KeyNotFound {
            key: key.to_string(),
        };
        let vis = data.get_stored_mut(&key).ok_or_else(missing)?;
        let flag = flags.get_stored_mut(&key).ok_or_else(missing)?;
        apply_auto_gains(
            vis.view_mut(),
            flag.view_mut(),
            gains.view(),
            gain_flags.view(),
            convention,
        )?;
    }
    Ok(())
}

/// Copy the parallel-hand autocorrelations of `input` to a new file `output` of the same
/// format, optionally calibrating them with the gains in `calfile`.
///
/// # Errors
///
/// Will return [`KvisError::SelectionNotFound`] if `input` has no autocorrelations or the
/// calibration solutions don't cover its channels and times, [`KvisError::KeyNotFound`] if
/// an antenna has no solution, [`KvisError::FileExists`] if `output` exists and `overwrite`
/// is false, or any read or write error.
pub fn extract_autos(
    input: &Path,
    output: &Path,
    calfile: Option<&Path>,
    gain_convention: GainConvention,
    overwrite: bool,
) -> Result<(), KvisError> {
    let mut handle = VisHandle::open_path(input)?;
    let selection = match handle.registry().get() {
        Some(meta) => autos_selection(meta)?,
        None => {
            // nothing is known until the whole file has been seen once
            let everything = handle.read(&ReadSelection::default())?;
            let meta = everything.meta().cloned().ok_or_else(|| {
                KvisError::MetadataUnavailable {
                    needed_for: "extract_autos".to_string(),
                }
            })?;
            autos_selection(&meta)?
        }
    };
    let mut vis = handle.read(&selection)?;
    debug!("extracting {} autocorrelations from {:?}", vis.data.len(), input);

    if let Some(calfile) = calfile {
        info!(
            "applying gains from {:?} with the {} convention",
            calfile, gain_convention
        );
        calibrate_autos(&mut vis.data, &mut vis.flags, calfile, gain_convention)?;
        handle.update(Some(&vis.data), Some(&vis.flags), None)?;
        handle.add_to_history(format!(
            "autocorrelations calibrated with {} ({})",
            calfile.display(),
            gain_convention
        ));
    }
    handle.add_to_history(format!("autocorrelations extracted from {}", input.display()));
    handle.write(output, overwrite)
}
