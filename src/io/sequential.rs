//! IO for the legacy sequential `.kvs` format.
//!
//! A `.kvs` file has a short preamble (frequencies, antenna positions and history) followed
//! by a stream of self-contained records, one per (baseline, polarization), each carrying its
//! own times, LSTs and payload. The stream ends with a zero marker.
//!
//! Nothing in the preamble says which baselines, polarizations or times are in the file, so
//! whole-file metadata can't be read on its own, and reads can only be restricted by baseline and
//! polarization.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use log::{debug, trace, warn};

use super::{
    buffer_arrays, check_clobber, error::IOError, read_complex_plane, read_f32_plane, read_f64s,
    read_flag_plane, read_magic, read_pol, read_text, read_usize, read_version,
    write_complex_values, write_code, write_f32_values, write_f64s, write_flag_values,
    write_magic, write_text, write_usize, Capabilities, FormatBackend, VisBuffer, VisFormat,
};
use crate::{
    key::{AntPair, AntPairPol},
    marlu::XyzGeodetic,
    meta::VisMeta,
    pol::Pol,
    selection::SubsetRequest,
    KvisError,
};

const MAGIC: &str = "KVISSEQ";
const VERSION: u32 = 1;
const RECORD_MARKER: u32 = 1;
const END_MARKER: u32 = 0;

/// Driver for `.kvs` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialBackend;

struct Preamble {
    freqs: Vec<f64>,
    channel_width: f64,
    integration_time: f64,
    antpos: BTreeMap<usize, XyzGeodetic>,
    history: String,
}

fn read_preamble<R: Read>(reader: &mut R) -> Result<Preamble, IOError> {
    read_magic(reader, MAGIC)?;
    read_version(reader, VERSION)?;
    let num_freqs = read_usize(reader)?;
    let channel_width = reader.read_f64::<LittleEndian>()?;
    let integration_time = reader.read_f64::<LittleEndian>()?;
    let freqs = read_f64s(reader, num_freqs)?;
    let num_ants = read_usize(reader)?;
    let mut antpos = BTreeMap::new();
    for _ in 0..num_ants {
        let ant = read_usize(reader)?;
        let xyz = read_f64s(reader, 3)?;
        antpos.insert(
            ant,
            XyzGeodetic {
                x: xyz[0],
                y: xyz[1],
                z: xyz[2],
            },
        );
    }
    let history = read_text(reader)?;
    Ok(Preamble {
        freqs,
        channel_width,
        integration_time,
        antpos,
        history,
    })
}

/// Read every record the filter accepts, skipping the payload of the others.
fn read_records<R: Read + Seek>(
    reader: &mut R,
    num_freqs: usize,
    request: &SubsetRequest,
) -> Result<(Vec<Pol>, IndexMap<AntPair, (Vec<f64>, Vec<f64>)>, VisBuffer), IOError> {
    let mut pols = vec![];
    let mut times_by_bl: IndexMap<AntPair, (Vec<f64>, Vec<f64>)> = IndexMap::new();
    let mut buffer = VisBuffer::default();
    loop {
        match reader.read_u32::<LittleEndian>()? {
            END_MARKER => break,
            RECORD_MARKER => (),
            marker => {
                return Err(IOError::BadHeaderValue {
                    field: "record marker",
                    expected: format!("{RECORD_MARKER} or {END_MARKER}"),
                    got: marker.to_string(),
                })
            }
        }
        let key = AntPairPol::new(read_usize(reader)?, read_usize(reader)?, read_pol(reader)?);
        let num_ints = read_usize(reader)?;
        let times = read_f64s(reader, num_ints)?;
        let lsts = read_f64s(reader, num_ints)?;
        let shape = (num_ints, num_freqs);
        if !request.bls.accepts(&key) {
            reader.seek(SeekFrom::Current((num_ints * num_freqs * 13) as i64))?;
            continue;
        }
        if buffer.data.contains_key(&key) {
            warn!("duplicate record for {}, keeping the last one", key);
        }
        let data = read_complex_plane(reader, shape)?;
        let nsamples = read_f32_plane(reader, shape)?;
        let flags = read_flag_plane(reader, shape)?;
        buffer.insert(key, data, flags, nsamples);
        if !pols.contains(&key.pol) {
            pols.push(key.pol);
        }
        times_by_bl.entry(key.antpair()).or_insert((times, lsts));
    }
    Ok((pols, times_by_bl, buffer))
}

fn write_file<W: Write>(writer: &mut W, meta: &VisMeta, buffer: &VisBuffer) -> Result<(), IOError> {
    write_magic(writer, MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    write_usize(writer, meta.num_freqs())?;
    writer.write_f64::<LittleEndian>(meta.channel_width())?;
    writer.write_f64::<LittleEndian>(meta.integration_time())?;
    write_f64s(writer, meta.freqs())?;
    write_usize(writer, meta.antenna_positions().len())?;
    for (&ant, xyz) in meta.antenna_positions() {
        write_usize(writer, ant)?;
        write_f64s(writer, &[xyz.x, xyz.y, xyz.z])?;
    }
    write_text(writer, meta.history())?;

    for key in buffer.keys() {
        let (data, flags, nsamples) = buffer_arrays(buffer, key)?;
        let (times, lsts) = match meta.stored_antpair(key.antpair()) {
            Some(antpair) => (
                &meta.times_by_baseline()[&antpair],
                &meta.lsts_by_baseline()[&antpair],
            ),
            None => {
                return Err(IOError::Inconsistent {
                    thing: format!("times of {key}"),
                    expected: "present in the metadata".to_string(),
                    found: "missing".to_string(),
                })
            }
        };
        if data.dim() != (times.len(), meta.num_freqs()) {
            return Err(IOError::Inconsistent {
                thing: format!("shape of {key}"),
                expected: format!("({}, {})", times.len(), meta.num_freqs()),
                found: format!("{:?}", data.dim()),
            });
        }
        writer.write_u32::<LittleEndian>(RECORD_MARKER)?;
        write_usize(writer, key.ant1)?;
        write_usize(writer, key.ant2)?;
        write_code(writer, key.pol.as_str())?;
        write_usize(writer, times.len())?;
        write_f64s(writer, times)?;
        write_f64s(writer, lsts)?;
        write_complex_values(writer, data.iter())?;
        write_f32_values(writer, nsamples.iter())?;
        write_flag_values(writer, flags.iter())?;
    }
    writer.write_u32::<LittleEndian>(END_MARKER)?;
    writer.flush()?;
    Ok(())
}

impl FormatBackend for SequentialBackend {
    fn format(&self) -> VisFormat {
        VisFormat::Sequential
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata_probe: false,
            freq_select: false,
            time_select: false,
            region_write: false,
        }
    }

    fn probe_metadata(&self, path: &Path) -> Result<Option<VisMeta>, KvisError> {
        // the preamble is still checked so that a bad file fails at open
        let mut reader = BufReader::new(
            File::open(path).map_err(|err| KvisError::backend_read(path, err.into()))?,
        );
        read_preamble(&mut reader).map_err(|err| KvisError::backend_read(path, err))?;
        Ok(None)
    }

    fn read_subset(
        &self,
        path: &Path,
        request: &SubsetRequest,
    ) -> Result<(VisMeta, VisBuffer), KvisError> {
        trace!("start read_subset of {:?}", path);
        let unsupported = |axis: &str| KvisError::UnsupportedSelector {
            format: self.format().to_string(),
            axis: axis.to_string(),
        };
        if request.freq_idxs.is_some() {
            return Err(unsupported("frequency"));
        }
        if request.time_idxs.is_some() {
            return Err(unsupported("time"));
        }

        let mut reader = BufReader::new(
            File::open(path).map_err(|err| KvisError::backend_read(path, err.into()))?,
        );
        let preamble =
            read_preamble(&mut reader).map_err(|err| KvisError::backend_read(path, err))?;
        let (pols, bl_times, buffer) = read_records(&mut reader, preamble.freqs.len(), request)
            .map_err(|err| KvisError::backend_read(path, err))?;
        debug!("read {} records from {:?}", buffer.len(), path);

        let (times_by_bl, lsts_by_bl) = bl_times
            .into_iter()
            .map(|(antpair, (times, lsts))| ((antpair, times), (antpair, lsts)))
            .unzip();
        let meta = VisMeta::new(preamble.freqs, pols, preamble.antpos, times_by_bl, lsts_by_bl)
            .map_err(|err| {
                KvisError::backend_read(
                    path,
                    IOError::Inconsistent {
                        thing: "record times".to_string(),
                        expected: "the same number of integrations in every record".to_string(),
                        found: err.to_string(),
                    },
                )
            })?
            .with_channel_width(preamble.channel_width)
            .with_integration_time(preamble.integration_time)
            .with_history(preamble.history);
        trace!("end read_subset of {:?}", path);
        Ok((meta, buffer))
    }

    fn write_full(
        &self,
        path: &Path,
        meta: &VisMeta,
        buffer: &VisBuffer,
        overwrite: bool,
    ) -> Result<(), KvisError> {
        trace!("start write_full to {:?}", path);
        check_clobber(path, overwrite)?;
        let file =
            File::create(path).map_err(|err| KvisError::backend_write(path, err.into()))?;
        write_file(&mut BufWriter::new(file), meta, buffer)
            .map_err(|err| KvisError::backend_write(path, err))?;
        trace!("end write_full to {:?}", path);
        Ok(())
    }
}
