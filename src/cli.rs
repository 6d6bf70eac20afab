//! Command Line Interface helpers for kvis

use std::{
    ffi::OsString,
    fmt::{Debug, Display},
    path::PathBuf,
};

use clap::{arg, command, Command, ErrorKind, ValueHint::FilePath};
use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use prettytable::{format as prettyformat, row, table, Table};
use thiserror::Error;

use crate::{
    autos::{extract_autos, GainConvention},
    handle::VisHandle,
    io::VisFormat,
    meta::VisMeta,
    parallelize::write_antpairpol_chunk_files,
    pol::Pol,
    selection::ReadSelection,
    KvisError,
};

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Errors that can occur while handling the command line.
#[derive(Error, Debug)]
pub enum CLIError {
    /// An argument clap accepted but kvis can't use.
    #[error("Invalid Command Line Argument {option}: expected {expected}, received {received}")]
    InvalidCommandLineArgument {
        /// The option the argument was given to
        option: String,
        /// What kind of value was expected
        expected: String,
        /// The value received
        received: String,
    },

    /// Clap couldn't parse the arguments, or help or version was requested.
    #[error(transparent)]
    ClapError(#[from] clap::Error),

    /// The requested operation failed.
    #[error(transparent)]
    Kvis(#[from] KvisError),
}

/// Write how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    writeln!(f, "             for target {}", TARGET)?;
    writeln!(f)?;
    Ok(())
}

/// A task requested on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum KvisCommand {
    /// Summarize visibility files.
    Info {
        /// Files that make up one dataset, in time order
        inputs: Vec<PathBuf>,
        /// Format of the files, otherwise determined from the extension
        format: Option<VisFormat>,
    },
    /// Write antpairpol chunk files for baseline-parallel jobs.
    ChunkBaselines {
        /// File whose baselines are split
        input: PathBuf,
        /// Directory the chunk files are written to
        dir: PathBuf,
        /// Baseline-polarizations per chunk
        bls_per_chunk: usize,
        /// Only list these polarizations
        pols: Option<Vec<Pol>>,
    },
    /// Copy the autocorrelations of a file.
    ExtractAutos {
        /// File to read
        input: PathBuf,
        /// File to write
        output: PathBuf,
        /// Calibration solutions to apply
        calfile: Option<PathBuf>,
        /// How the gains are applied
        gain_convention: GainConvention,
        /// Replace `output` if it exists
        overwrite: bool,
    },
    /// Rewrite a dataset in another format.
    Convert {
        /// Files that make up one dataset, in time order
        inputs: Vec<PathBuf>,
        /// File to write
        output: PathBuf,
        /// Format to write, otherwise determined from the extension of `output`
        format: Option<VisFormat>,
        /// Replace `output` if it exists
        overwrite: bool,
    },
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct KvisContext {
    /// What to do
    pub command: KvisCommand,
    /// The command line, quoted for the history of written files
    pub command_line: String,
}

impl Display for KvisContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;
        fmt_build_info(f)?;
        match &self.command {
            KvisCommand::Info { inputs, .. } => {
                writeln!(f, "Will summarize {} file(s)", inputs.len())?;
            }
            KvisCommand::ChunkBaselines {
                input,
                dir,
                bls_per_chunk,
                pols,
            } => {
                writeln!(
                    f,
                    "Will split the baselines of {} into chunks of {} in {}",
                    input.display(),
                    bls_per_chunk,
                    dir.display()
                )?;
                if let Some(pols) = pols {
                    writeln!(f, "Keeping polarizations {}", pols.iter().join(", "))?;
                }
            }
            KvisCommand::ExtractAutos {
                input,
                output,
                calfile,
                gain_convention,
                ..
            } => {
                writeln!(
                    f,
                    "Will extract autocorrelations of {} to {}",
                    input.display(),
                    output.display()
                )?;
                match calfile {
                    Some(calfile) => writeln!(
                        f,
                        "Will calibrate with {} ({})",
                        calfile.display(),
                        gain_convention
                    )?,
                    None => writeln!(f, "Will not calibrate")?,
                }
            }
            KvisCommand::Convert {
                inputs,
                output,
                format,
                ..
            } => {
                writeln!(
                    f,
                    "Will convert {} file(s) to {}{}",
                    inputs.len(),
                    output.display(),
                    format.map_or_else(String::new, |format| format!(" as {format}"))
                )?;
            }
        }
        Ok(())
    }
}

fn invalid_argument(option: &str, expected: &str, received: &str) -> CLIError {
    CLIError::InvalidCommandLineArgument {
        option: option.to_string(),
        expected: expected.to_string(),
        received: received.to_string(),
    }
}

fn parse_format(matches: &clap::ArgMatches) -> Result<Option<VisFormat>, CLIError> {
    matches
        .value_of("format")
        .map(|format| {
            format.parse::<VisFormat>().map_err(|_| {
                invalid_argument("--format <FORMAT>", &VisFormat::expected(), format)
            })
        })
        .transpose()
}

fn paths_of(matches: &clap::ArgMatches, name: &str) -> Vec<PathBuf> {
    matches
        .values_of(name)
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default()
}

impl KvisContext {
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, CLIError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let format_arg = || {
            arg!(--format <FORMAT> "Visibility format, otherwise determined from the extension")
                .required(false)
                .possible_values(["blocked", "kvb", "sequential", "kvs"])
        };
        let mut app = command!()
            .arg_required_else_help(true)
            .subcommand_required(true)
            .about("Keyed, chunk-aware access to visibilities and calibration solutions")
            .subcommands([
                Command::new("info")
                    .about("Summarize a dataset of one or more visibility files")
                    .args(&[
                        arg!(inputs: <PATHS>... "Visibility files, in time order")
                            .value_hint(FilePath),
                        format_arg(),
                    ]),
                Command::new("chunk-baselines")
                    .about("Write antpairpol chunk files for baseline-parallel processing")
                    .args(&[
                        arg!(input: <PATH> "Visibility file whose baselines are split")
                            .value_hint(FilePath),
                        arg!(-d --dir <DIR> "Directory to write the chunk files to"),
                        arg!(-n --"bls-per-chunk" <COUNT> "Baseline-polarizations per chunk"),
                        arg!(-p --pols <POLS>... "Only list these polarizations")
                            .multiple_values(true)
                            .required(false),
                    ]),
                Command::new("extract-autos")
                    .about("Copy the autocorrelations of a file, optionally calibrated")
                    .args(&[
                        arg!(input: <INPUT> "Visibility file to read").value_hint(FilePath),
                        arg!(output: <OUTPUT> "Visibility file to write").value_hint(FilePath),
                        arg!(-c --calfile <PATH> "Calibration solutions to apply")
                            .required(false)
                            .value_hint(FilePath),
                        arg!(-g --"gain-convention" <CONVENTION> "How gains relate raw and calibrated data")
                            .required(false)
                            .possible_values(["divide", "multiply"])
                            .default_value("divide"),
                        arg!(--clobber "Overwrite the output file if it exists"),
                    ]),
                Command::new("convert")
                    .about("Rewrite a dataset of one or more files as a single file")
                    .args(&[
                        arg!(inputs: <PATHS>... "Visibility files, in time order")
                            .value_hint(FilePath),
                        arg!(-o --output <PATH> "File to write").value_hint(FilePath),
                        format_arg(),
                        arg!(--clobber "Overwrite the output file if it exists"),
                    ]),
            ]);
        let matches = app.try_get_matches_from_mut(args)?;
        Ok(matches)
    }

    /// Parse an iterator of arguments, `args` into a `KvisContext`.
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - `CLIError::ClapError` if clap cannot parse `args`, or help or version was requested.
    /// - `CLIError::InvalidCommandLineArgument` if the arguments are invalid.
    pub fn from_args<I, T>(args: I) -> Result<Self, CLIError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);
        let args = args.into_iter().map(Into::into).collect_vec();
        let command_line = shlex::try_join(args.iter().map(|arg| arg.to_str().unwrap_or("?")))
            .unwrap_or_else(|_| args.iter().map(|arg| arg.to_string_lossy()).join(" "));

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let command = match matches.subcommand() {
            Some(("info", sub)) => KvisCommand::Info {
                inputs: paths_of(sub, "inputs"),
                format: parse_format(sub)?,
            },
            Some(("chunk-baselines", sub)) => {
                let count = sub.value_of("bls-per-chunk").unwrap_or_default();
                let bls_per_chunk = match count.parse::<usize>() {
                    Ok(count) if count > 0 => count,
                    _ => {
                        return Err(invalid_argument(
                            "--bls-per-chunk <COUNT>",
                            "a positive integer",
                            count,
                        ))
                    }
                };
                let pols = match sub.values_of("pols") {
                    Some(values) => Some(
                        values
                            .map(|pol| {
                                pol.parse::<Pol>().map_err(|_| {
                                    invalid_argument("--pols <POLS>", "a polarization", pol)
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    None => None,
                };
                KvisCommand::ChunkBaselines {
                    input: sub.value_of("input").map(PathBuf::from).unwrap_or_default(),
                    dir: sub.value_of("dir").map(PathBuf::from).unwrap_or_default(),
                    bls_per_chunk,
                    pols,
                }
            }
            Some(("extract-autos", sub)) => KvisCommand::ExtractAutos {
                input: sub.value_of("input").map(PathBuf::from).unwrap_or_default(),
                output: sub.value_of("output").map(PathBuf::from).unwrap_or_default(),
                calfile: sub.value_of("calfile").map(PathBuf::from),
                gain_convention: sub
                    .value_of("gain-convention")
                    .unwrap_or_default()
                    .parse()?,
                overwrite: sub.is_present("clobber"),
            },
            Some(("convert", sub)) => KvisCommand::Convert {
                inputs: paths_of(sub, "inputs"),
                output: sub.value_of("output").map(PathBuf::from).unwrap_or_default(),
                format: parse_format(sub)?,
                overwrite: sub.is_present("clobber"),
            },
            _ => unreachable!("a subcommand is required, enforced by clap"),
        };

        let result = Self {
            command,
            command_line,
        };
        info!("{}", &result);
        Ok(result)
    }

    /// Carry out the command.
    ///
    /// # Errors
    ///
    /// Will return `CLIError::Kvis` if the operation fails.
    pub fn run(self) -> Result<(), CLIError> {
        match self.command {
            KvisCommand::Info { inputs, format } => {
                let mut handle = open_dataset(&inputs, format)?;
                let meta = match handle.registry().get() {
                    Some(meta) => meta.clone(),
                    None => {
                        warn!("metadata of this format is only known after reading everything");
                        let vis = handle.read(&ReadSelection::default())?;
                        vis.meta().cloned().ok_or(KvisError::MetadataUnavailable {
                            needed_for: "info".to_string(),
                        })?
                    }
                };
                info!("summary of {}:\n{}", handle.format(), summary_table(&meta));
                info!("baselines:\n{}", baseline_table(&meta));
            }
            KvisCommand::ChunkBaselines {
                input,
                dir,
                bls_per_chunk,
                pols,
            } => {
                let paths =
                    write_antpairpol_chunk_files(&input, &dir, bls_per_chunk, pols.as_deref())?;
                info!("wrote {} chunk files to {}", paths.len(), dir.display());
            }
            KvisCommand::ExtractAutos {
                input,
                output,
                calfile,
                gain_convention,
                overwrite,
            } => {
                extract_autos(
                    &input,
                    &output,
                    calfile.as_deref(),
                    gain_convention,
                    overwrite,
                )?;
            }
            KvisCommand::Convert {
                inputs,
                output,
                format,
                overwrite,
            } => {
                let mut handle = open_dataset(&inputs, None)?;
                let format = match format {
                    Some(format) => format,
                    None => VisFormat::from_path(&output)?,
                };
                handle.read(&ReadSelection::default())?;
                handle.add_to_history(self.command_line);
                handle.write_as(&output, format, overwrite)?;
                info!("wrote {} as {}", output.display(), format);
            }
        }
        Ok(())
    }
}

fn open_dataset(inputs: &[PathBuf], format: Option<VisFormat>) -> Result<VisHandle, KvisError> {
    let format = match (format, inputs.first()) {
        (Some(format), _) => format,
        (None, Some(first)) => VisFormat::from_path(first)?,
        (None, None) => {
            return Err(KvisError::NotSupported {
                operation: "opening a dataset without any files".to_string(),
                target: "kvis".to_string(),
            })
        }
    };
    VisHandle::open(inputs, format)
}

/// A table of the extents of a dataset.
pub fn summary_table(meta: &VisMeta) -> Table {
    let freqs = meta.freqs();
    let times = meta.times();
    let mut table = table!(
        ["channels", freqs.len()],
        [
            "frequency [MHz]",
            match (freqs.first(), freqs.last()) {
                (Some(first), Some(last)) => format!("{:.4} - {:.4}", first / 1e6, last / 1e6),
                _ => "-".to_string(),
            }
        ],
        ["channel width [kHz]", format!("{:.3}", meta.channel_width() / 1e3)],
        ["integrations", meta.num_ints()],
        [
            "times [JD]",
            match (times.first(), times.last()) {
                (Some(first), Some(last)) => format!("{first:.6} - {last:.6}"),
                _ => "-".to_string(),
            }
        ],
        ["integration time [s]", format!("{:.3}", meta.integration_time())],
        ["baselines", meta.num_bls()],
        ["polarizations", meta.polarizations().iter().join(", ")],
        ["antennas", meta.antenna_positions().len()]
    );
    if let Some(telescope) = meta.telescope() {
        table.add_row(row![
            "telescope",
            format!(
                "lon {:.4} lat {:.4} height {:.1}",
                telescope.longitude_rad.to_degrees(),
                telescope.latitude_rad.to_degrees(),
                telescope.height_metres
            )
        ]);
    }
    table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    table
}

/// A table of the baselines of a dataset, with their time span.
pub fn baseline_table(meta: &VisMeta) -> Table {
    let mut table = table!(["", "ant1", "ant2", "first [JD]", "last [JD]"]);
    for (bl_idx, (&(ant1, ant2), times)) in meta.times_by_baseline().iter().enumerate() {
        table.add_row(row![r =>
            format!("bl{bl_idx}:"),
            ant1,
            ant2,
            times.first().map_or_else(|| "-".to_string(), |t| format!("{t:.6}")),
            times.last().map_or_else(|| "-".to_string(), |t| format!("{t:.6}"))
        ]);
    }
    table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    table
}

/// Parse `args` and run the command they describe, returning the exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let kvis_ctx = match KvisContext::from_args(args) {
        Ok(kvis_ctx) => kvis_ctx,
        Err(CLIError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };
    match kvis_ctx.run() {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::test_common::write_synthetic;

    #[test]
    fn test_parse_missing_input() {
        match KvisContext::from_args(["kvis", "convert", "-o", "out.kvb"]) {
            Err(CLIError::ClapError(inner)) => assert!(matches!(
                inner.kind(),
                clap::error::ErrorKind::MissingRequiredArgument { .. }
            )),
            Err(e) => panic!("expected missing required argument error, not {e}"),
            Ok(_) => panic!("expected error, but got Ok(_)"),
        }
    }

    #[test]
    fn test_parse_invalid_chunk_size() {
        let args = [
            "kvis",
            "chunk-baselines",
            "in.kvb",
            "--dir",
            "/tmp",
            "--bls-per-chunk",
            "0",
        ];
        assert!(matches!(
            KvisContext::from_args(args),
            Err(CLIError::InvalidCommandLineArgument { .. })
        ));
    }

    #[test]
    fn test_parse_extract_autos() {
        let args = [
            "kvis",
            "extract-autos",
            "in.kvs",
            "out.kvs",
            "-c",
            "gains.kcal",
            "-g",
            "multiply",
            "--clobber",
        ];
        let kvis_ctx = KvisContext::from_args(args).unwrap();
        assert_eq!(
            kvis_ctx.command,
            KvisCommand::ExtractAutos {
                input: "in.kvs".into(),
                output: "out.kvs".into(),
                calfile: Some("gains.kcal".into()),
                gain_convention: GainConvention::Multiply,
                overwrite: true,
            }
        );
        assert!(format!("{kvis_ctx}").contains("Will calibrate with gains.kcal (multiply)"));
    }

    #[test]
    fn test_convert_and_chunk_baselines() {
        let tmp_dir = tempdir().unwrap();
        let input = write_synthetic(tmp_dir.path(), "obs.kvb", &[(0, 1), (1, 1)], 3, 2);
        let output = tmp_dir.path().join("obs.kvs");
        let args = vec![
            "kvis".to_string(),
            "convert".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        assert_eq!(main_with_args(args), 0);
        let converted = VisHandle::open_path(&output)
            .unwrap()
            .read(&ReadSelection::default())
            .unwrap();
        assert_eq!(converted.data.len(), 4);
        assert!(converted.meta().unwrap().history().contains("convert"));

        let chunk_dir = tmp_dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();
        let args = vec![
            "kvis".to_string(),
            "chunk-baselines".to_string(),
            input.display().to_string(),
            "-d".to_string(),
            chunk_dir.display().to_string(),
            "-n".to_string(),
            "3".to_string(),
        ];
        assert_eq!(main_with_args(args), 0);
        assert!(chunk_dir.join("obs.0.antpairpols").exists());
        assert!(chunk_dir.join("obs.1.antpairpols").exists());
    }
}
