//! IO for the blocked `.kvb` format.
//!
//! A `.kvb` file starts with a header that describes every axis of the dataset, followed by
//! one fixed-size payload block per (baseline, polarization), baseline-major. Each block holds
//! three row-major `[integration][channel]` planes: visibilities as interleaved f32 re/im
//! pairs, f32 sample counts, and u8 flags. All values are little-endian.
//!
//! A full write of a buffer that doesn't hold every (baseline, polarization) of its metadata
//! fills the missing blocks with zeros, flags them, and gives them no samples.
//!
//! Because every block has the same size, any (baseline, polarization, integration, channel)
//! maps to a fixed file offset, so the format supports subset reads on every axis and in-place
//! region writes into a file created with [`FormatBackend::allocate_output`].

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    iter,
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, trace};

use super::{
    buffer_arrays, check_clobber, error::IOError, read_code, read_complex_plane, read_f32_plane,
    read_f64s, read_flag_plane, read_magic, read_text, read_usize, read_version,
    write_complex_values, write_code, write_f32_values, write_f64s, write_flag_values,
    write_magic, write_text, write_usize, Capabilities, FormatBackend, VisBuffer, VisFormat,
};
use crate::{
    key::{AntPair, AntPairPol},
    marlu::{
        ndarray::{s, Array2},
        Complex, LatLngHeight, XyzGeodetic,
    },
    meta::VisMeta,
    pol::Pol,
    selection::{Region, SubsetRequest},
    KvisError,
};

const MAGIC: &str = "KVISBLK";
const VERSION: u32 = 1;

/// Bytes per (integration, channel) cell of a block: 8 data, 4 nsamples, 1 flag.
const CELL_BYTES: u64 = 13;

/// Driver for `.kvb` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedBackend;

/// Where things are in a `.kvb` file.
#[derive(Debug, Clone)]
struct Layout {
    payload_offset: u64,
    num_ints: usize,
    num_freqs: usize,
    bl_idxs: IndexMap<AntPair, usize>,
    pols: Vec<Pol>,
}

impl Layout {
    fn new(meta: &VisMeta, payload_offset: u64) -> Self {
        Self {
            payload_offset,
            num_ints: meta.num_ints(),
            num_freqs: meta.num_freqs(),
            bl_idxs: meta
                .baselines()
                .into_iter()
                .enumerate()
                .map(|(idx, antpair)| (antpair, idx))
                .collect(),
            pols: meta.polarizations().to_vec(),
        }
    }

    fn cells(&self) -> u64 {
        (self.num_ints * self.num_freqs) as u64
    }

    fn block_start(&self, key: &AntPairPol) -> Option<u64> {
        let bl_idx = *self.bl_idxs.get(&key.antpair())?;
        let pol_idx = self.pols.iter().position(|&pol| pol == key.pol)?;
        let block_idx = (bl_idx * self.pols.len() + pol_idx) as u64;
        Some(self.payload_offset + block_idx * self.cells() * CELL_BYTES)
    }

    fn file_len(&self) -> u64 {
        self.payload_offset
            + (self.bl_idxs.len() * self.pols.len()) as u64 * self.cells() * CELL_BYTES
    }

    fn cell(&self, row: usize, chan: usize) -> u64 {
        (row * self.num_freqs + chan) as u64
    }

    fn data_offset(&self, row: usize, chan: usize) -> u64 {
        self.cell(row, chan) * 8
    }

    fn nsamples_offset(&self, row: usize, chan: usize) -> u64 {
        self.cells() * 8 + self.cell(row, chan) * 4
    }

    fn flags_offset(&self, row: usize, chan: usize) -> u64 {
        self.cells() * 12 + self.cell(row, chan)
    }
}

fn read_header<R: Read + Seek>(reader: &mut R) -> Result<(VisMeta, Layout), IOError> {
    read_magic(reader, MAGIC)?;
    read_version(reader, VERSION)?;
    let num_freqs = read_usize(reader)?;
    let num_ints = read_usize(reader)?;
    let num_bls = read_usize(reader)?;
    let num_pols = read_usize(reader)?;
    let num_ants = read_usize(reader)?;
    let channel_width = reader.read_f64::<LittleEndian>()?;
    let integration_time = reader.read_f64::<LittleEndian>()?;
    let has_telescope = reader.read_u8()? != 0;
    let location = read_f64s(reader, 3)?;
    let telescope = has_telescope.then(|| LatLngHeight {
        longitude_rad: location[0],
        latitude_rad: location[1],
        height_metres: location[2],
    });
    let freqs = read_f64s(reader, num_freqs)?;

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

    let mut times_by_bl = IndexMap::new();
    let mut lsts_by_bl = IndexMap::new();
    for _ in 0..num_bls {
        let antpair = (read_usize(reader)?, read_usize(reader)?);
        times_by_bl.insert(antpair, read_f64s(reader, num_ints)?);
        lsts_by_bl.insert(antpair, read_f64s(reader, num_ints)?);
    }
    if times_by_bl.len() != num_bls {
        return Err(IOError::Inconsistent {
            thing: "baseline list".to_string(),
            expected: format!("{num_bls} unique baselines"),
            found: times_by_bl.len().to_string(),
        });
    }

    let mut pols = vec![];
    for _ in 0..num_pols {
        let code = read_code(reader)?;
        pols.push(code.parse().map_err(|_| IOError::BadHeaderValue {
            field: "polarization",
            expected: "a polarization code".to_string(),
            got: code,
        })?);
    }
    let history = read_text(reader)?;

    let meta = VisMeta::new(freqs, pols, antpos, times_by_bl, lsts_by_bl)
        .map_err(|err| IOError::Inconsistent {
            thing: "baseline times".to_string(),
            expected: format!("{num_ints} integrations per baseline"),
            found: err.to_string(),
        })?
        .with_channel_width(channel_width)
        .with_integration_time(integration_time)
        .with_telescope(telescope)
        .with_history(history);
    let layout = Layout::new(&meta, reader.stream_position()?);
    Ok((meta, layout))
}

fn write_header<W: Write>(writer: &mut W, meta: &VisMeta) -> Result<(), IOError> {
    write_magic(writer, MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    write_usize(writer, meta.num_freqs())?;
    write_usize(writer, meta.num_ints())?;
    write_usize(writer, meta.num_bls())?;
    write_usize(writer, meta.polarizations().len())?;
    write_usize(writer, meta.antenna_positions().len())?;
    writer.write_f64::<LittleEndian>(meta.channel_width())?;
    writer.write_f64::<LittleEndian>(meta.integration_time())?;
    match meta.telescope() {
        Some(location) => {
            writer.write_u8(1)?;
            write_f64s(
                writer,
                &[
                    location.longitude_rad,
                    location.latitude_rad,
                    location.height_metres,
                ],
            )?;
        }
        None => {
            writer.write_u8(0)?;
            write_f64s(writer, &[0.0; 3])?;
        }
    }
    write_f64s(writer, meta.freqs())?;
    for (&ant, xyz) in meta.antenna_positions() {
        write_usize(writer, ant)?;
        write_f64s(writer, &[xyz.x, xyz.y, xyz.z])?;
    }
    for (&(ant1, ant2), times) in meta.times_by_baseline() {
        write_usize(writer, ant1)?;
        write_usize(writer, ant2)?;
        write_f64s(writer, times)?;
        let lsts = meta
            .lsts_by_baseline()
            .get(&(ant1, ant2))
            .ok_or_else(|| IOError::Inconsistent {
                thing: format!("lsts of baseline ({ant1}, {ant2})"),
                expected: "present".to_string(),
                found: "missing".to_string(),
            })?;
        write_f64s(writer, lsts)?;
    }
    for pol in meta.polarizations() {
        write_code(writer, pol.as_str())?;
    }
    write_text(writer, meta.history())?;
    Ok(())
}

/// Read the `time_idxs` rows and `freq_idxs` columns of one plane of a block.
fn read_selected<T: Copy, R: Read + Seek>(
    reader: &mut R,
    row_start: impl Fn(usize) -> u64,
    num_freqs: usize,
    time_idxs: &[usize],
    freq_idxs: &[usize],
    read_row: fn(&mut R, (usize, usize)) -> Result<Array2<T>, IOError>,
) -> Result<Array2<T>, IOError> {
    let mut values = Vec::with_capacity(time_idxs.len() * freq_idxs.len());
    for &row in time_idxs {
        reader.seek(SeekFrom::Start(row_start(row)))?;
        let plane = read_row(reader, (1, num_freqs))?;
        values.extend(freq_idxs.iter().map(|&chan| plane[(0, chan)]));
    }
    Array2::from_shape_vec((time_idxs.len(), freq_idxs.len()), values).map_err(|err| {
        IOError::Inconsistent {
            thing: "selected plane".to_string(),
            expected: format!("{} x {}", time_idxs.len(), freq_idxs.len()),
            found: err.to_string(),
        }
    })
}

fn check_idxs(axis: &str, idxs: &[usize], len: usize) -> Result<(), KvisError> {
    match idxs.iter().find(|&&idx| idx >= len) {
        Some(idx) => Err(KvisError::SelectionNotFound {
            axis: axis.to_string(),
            value: idx.to_string(),
        }),
        None => Ok(()),
    }
}

impl BlockedBackend {
    fn open_header(path: &Path) -> Result<(BufReader<File>, VisMeta, Layout), KvisError> {
        let mut reader = BufReader::new(
            File::open(path).map_err(|err| KvisError::backend_read(path, err.into()))?,
        );
        let (meta, layout) =
            read_header(&mut reader).map_err(|err| KvisError::backend_read(path, err))?;
        Ok((reader, meta, layout))
    }

    fn read_blocks(
        reader: &mut BufReader<File>,
        layout: &Layout,
        keys: &[AntPairPol],
        time_idxs: &[usize],
        freq_idxs: &[usize],
    ) -> Result<VisBuffer, IOError> {
        let full = time_idxs.iter().copied().eq(0..layout.num_ints)
            && freq_idxs.iter().copied().eq(0..layout.num_freqs);
        let shape = (layout.num_ints, layout.num_freqs);
        let mut buffer = VisBuffer::default();
        for key in keys {
            let start = layout.block_start(key).ok_or_else(|| IOError::Inconsistent {
                thing: format!("block of {key}"),
                expected: "present".to_string(),
                found: "missing".to_string(),
            })?;
            if full {
                reader.seek(SeekFrom::Start(start))?;
                let data = read_complex_plane(reader, shape)?;
                let nsamples = read_f32_plane(reader, shape)?;
                let flags = read_flag_plane(reader, shape)?;
                buffer.insert(*key, data, flags, nsamples);
            } else {
                let data = read_selected(
                    reader,
                    |row| start + layout.data_offset(row, 0),
                    layout.num_freqs,
                    time_idxs,
                    freq_idxs,
                    read_complex_plane,
                )?;
                let nsamples = read_selected(
                    reader,
                    |row| start + layout.nsamples_offset(row, 0),
                    layout.num_freqs,
                    time_idxs,
                    freq_idxs,
                    read_f32_plane,
                )?;
                let flags = read_selected(
                    reader,
                    |row| start + layout.flags_offset(row, 0),
                    layout.num_freqs,
                    time_idxs,
                    freq_idxs,
                    read_flag_plane,
                )?;
                buffer.insert(*key, data, flags, nsamples);
            }
        }
        Ok(buffer)
    }

    fn write_payload<W: Write>(
        writer: &mut W,
        meta: &VisMeta,
        buffer: &VisBuffer,
    ) -> Result<(), IOError> {
        let shape = (meta.num_ints(), meta.num_freqs());
        let cells = shape.0 * shape.1;
        let mut padded = 0;
        for key in meta.antpairpols() {
            if !buffer.data.contains_key(&key)
                && !buffer.flags.contains_key(&key)
                && !buffer.nsamples.contains_key(&key)
            {
                // keys the buffer doesn't hold are filled in, flagged and with no samples
                write_complex_values(writer, iter::repeat(&Complex::default()).take(cells))?;
                write_f32_values(writer, iter::repeat(&0.0).take(cells))?;
                write_flag_values(writer, iter::repeat(&true).take(cells))?;
                padded += 1;
                continue;
            }
            let (data, flags, nsamples) = buffer_arrays(buffer, &key)?;
            if data.dim() != shape || flags.dim() != shape || nsamples.dim() != shape {
                return Err(IOError::Inconsistent {
                    thing: format!("shape of {key}"),
                    expected: format!("{shape:?}"),
                    found: format!("{:?}", data.dim()),
                });
            }
            write_complex_values(writer, data.iter())?;
            write_f32_values(writer, nsamples.iter())?;
            write_flag_values(writer, flags.iter())?;
        }
        if padded > 0 {
            debug!("filled {} blocks missing from the buffer with flagged zeros", padded);
        }
        Ok(())
    }

    fn write_region_payload(
        file: &mut File,
        layout: &Layout,
        region: &Region,
        starts: &[u64],
        buffer: &VisBuffer,
    ) -> Result<(), IOError> {
        // channels that are next to each other in the file are written in one go
        let runs = region
            .freq_idxs
            .iter()
            .enumerate()
            .chunk_by(|&(pos, chan)| *chan as isize - pos as isize)
            .into_iter()
            .map(|(_, run)| run.map(|(pos, &chan)| (pos, chan)).collect_vec())
            .collect_vec();
        let mut bytes = vec![];
        for (key, &start) in region.bls.iter().zip(starts) {
            let (data, flags, nsamples) = buffer_arrays(buffer, key)?;
            for (out_row, &row) in region.time_idxs.iter().enumerate() {
                for run in &runs {
                    let (first_pos, first_chan) = run[0];
                    let end = first_pos + run.len();

                    bytes.clear();
                    write_complex_values(
                        &mut bytes,
                        data.row(out_row).slice(s![first_pos..end]).iter(),
                    )?;
                    file.seek(SeekFrom::Start(start + layout.data_offset(row, first_chan)))?;
                    file.write_all(&bytes)?;

                    bytes.clear();
                    write_f32_values(
                        &mut bytes,
                        nsamples.row(out_row).slice(s![first_pos..end]).iter(),
                    )?;
                    file.seek(SeekFrom::Start(
                        start + layout.nsamples_offset(row, first_chan),
                    ))?;
                    file.write_all(&bytes)?;

                    bytes.clear();
                    write_flag_values(
                        &mut bytes,
                        flags.row(out_row).slice(s![first_pos..end]).iter(),
                    )?;
                    file.seek(SeekFrom::Start(start + layout.flags_offset(row, first_chan)))?;
                    file.write_all(&bytes)?;
                }
            }
        }
        file.flush()?;
        Ok(())
    }
}

impl FormatBackend for BlockedBackend {
    fn format(&self) -> VisFormat {
        VisFormat::Blocked
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata_probe: true,
            freq_select: true,
            time_select: true,
            region_write: true,
        }
    }

    fn probe_metadata(&self, path: &Path) -> Result<Option<VisMeta>, KvisError> {
        trace!("probing {:?}", path);
        let (_, meta, _) = Self::open_header(path)?;
        Ok(Some(meta))
    }

    fn read_subset(
        &self,
        path: &Path,
        request: &SubsetRequest,
    ) -> Result<(VisMeta, VisBuffer), KvisError> {
        trace!("start read_subset of {:?}", path);
        let (mut reader, meta, layout) = Self::open_header(path)?;

        // each block is read on its own, so only the accepted keys are read
        let keys = meta
            .antpairpols()
            .into_iter()
            .filter(|key| request.bls.accepts(key))
            .collect_vec();
        let freq_idxs = match &request.freq_idxs {
            Some(idxs) => {
                check_idxs("channel", idxs, meta.num_freqs())?;
                idxs.clone()
            }
            None => (0..meta.num_freqs()).collect(),
        };
        let time_idxs = match &request.time_idxs {
            Some(idxs) => {
                check_idxs("time index", idxs, meta.num_ints())?;
                idxs.clone()
            }
            None => (0..meta.num_ints()).collect(),
        };
        debug!(
            "reading {} blocks, {} channels, {} integrations from {:?}",
            keys.len(),
            freq_idxs.len(),
            time_idxs.len(),
            path
        );

        let buffer = Self::read_blocks(&mut reader, &layout, &keys, &time_idxs, &freq_idxs)
            .map_err(|err| KvisError::backend_read(path, err))?;

        let antpairs = keys.iter().map(AntPairPol::antpair).unique().collect_vec();
        let pols = meta
            .polarizations()
            .iter()
            .filter(|pol| keys.iter().any(|key| key.pol == **pol))
            .copied()
            .collect_vec();
        let sub_meta = if request.is_everything() {
            meta
        } else {
            meta.restrict(&antpairs, &pols, &freq_idxs, &time_idxs)
        };
        trace!("end read_subset of {:?}", path);
        Ok((sub_meta, buffer))
    }

    fn allocate_output(
        &self,
        path: &Path,
        template: &VisMeta,
        overwrite: bool,
    ) -> Result<(), KvisError> {
        trace!("allocating {:?}", path);
        check_clobber(path, overwrite)?;
        let mut writer = BufWriter::new(
            File::create(path).map_err(|err| KvisError::backend_write(path, err.into()))?,
        );
        write_header(&mut writer, template).map_err(|err| KvisError::backend_write(path, err))?;
        let file = writer
            .into_inner()
            .map_err(|err| KvisError::backend_write(path, err.into_error().into()))?;
        let payload_offset = header_len(template);
        let layout = Layout::new(template, payload_offset);
        // the payload is zero-filled by extending the file
        file.set_len(layout.file_len())
            .map_err(|err| KvisError::backend_write(path, err.into()))?;
        Ok(())
    }

    fn write_region(&self, path: &Path, region: &Region, buffer: &VisBuffer) -> Result<(), KvisError> {
        trace!("start write_region to {:?}", path);
        let (_, meta, layout) = Self::open_header(path)?;
        let out_of_bounds = |axis: &str, value: String| KvisError::RegionOutOfBounds {
            path: path.to_path_buf(),
            axis: axis.to_string(),
            value,
        };
        if let Some(&chan) = region.freq_idxs.iter().find(|&&c| c >= meta.num_freqs()) {
            return Err(out_of_bounds("channel", chan.to_string()));
        }
        if let Some(&row) = region.time_idxs.iter().find(|&&r| r >= meta.num_ints()) {
            return Err(out_of_bounds("time index", row.to_string()));
        }
        let mut starts = Vec::with_capacity(region.bls.len());
        for key in &region.bls {
            let start = layout
                .block_start(key)
                .ok_or_else(|| out_of_bounds("baseline", key.to_string()))?;
            starts.push(start);
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| KvisError::backend_write(path, err.into()))?;
        Self::write_region_payload(&mut file, &layout, region, &starts, buffer)
            .map_err(|err| KvisError::backend_write(path, err))?;
        trace!("end write_region to {:?}", path);
        Ok(())
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
        let mut writer = BufWriter::new(file);
        write_header(&mut writer, meta)
            .and_then(|_| Self::write_payload(&mut writer, meta, buffer))
            .and_then(|_| writer.flush().map_err(IOError::from))
            .map_err(|err| KvisError::backend_write(path, err))?;
        trace!("end write_full to {:?}", path);
        Ok(())
    }
}

/// The length of the header that [`write_header`] produces for `meta`.
fn header_len(meta: &VisMeta) -> u64 {
    let fixed = 16 + 4 * 6 + 8 * 2 + 1 + 8 * 3;
    let freqs = 8 * meta.num_freqs();
    let ants = (4 + 8 * 3) * meta.antenna_positions().len();
    let bls = (8 + 16 * meta.num_ints()) * meta.num_bls();
    let pols: usize = meta
        .polarizations()
        .iter()
        .map(|pol| 1 + pol.as_str().len())
        .sum();
    let history = 4 + meta.history().len();
    (fixed + freqs + ants + bls + pols + history) as u64
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::tempdir;

    use super::*;
    use crate::{
        selection::BaselineFilter,
        test_common::{synthetic_buffer, synthetic_meta},
    };

    #[test]
    fn test_header_len_matches_written_header() {
        let meta = synthetic_meta(&[(0, 1), (1, 2), (2, 2)], &[Pol::XX, Pol::PI], 5, 3)
            .with_history("made for a test");
        let mut bytes = vec![];
        write_header(&mut bytes, &meta).unwrap();
        assert_eq!(bytes.len() as u64, header_len(&meta));

        let (read_meta, layout) = read_header(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(layout.payload_offset, header_len(&meta));
        assert_eq!(read_meta.history(), "made for a test");
        assert_eq!(read_meta.baselines(), meta.baselines());
        assert_eq!(read_meta.polarizations(), meta.polarizations());
    }

    #[test]
    fn test_read_subset_selects_cells() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("subset.kvb");
        let meta = synthetic_meta(&[(0, 1), (1, 2)], &[Pol::XX, Pol::YY], 6, 4);
        let buffer = synthetic_buffer(&meta);
        BlockedBackend.write_full(&path, &meta, &buffer, false).unwrap();

        let request = SubsetRequest {
            bls: BaselineFilter::keys(vec![AntPairPol::new(2, 1, Pol::YY)]),
            freq_idxs: Some(vec![1, 4]),
            time_idxs: Some(vec![0, 3]),
        };
        let (sub_meta, sub) = BlockedBackend.read_subset(&path, &request).unwrap();
        let key = AntPairPol::new(1, 2, Pol::YY);
        assert_eq!(sub.keys().copied().collect_vec(), vec![key]);
        assert_eq!(sub.shape(), Some((2, 2)));
        assert_eq!(sub.data[&key][(1, 1)], buffer.data[&key][(3, 4)]);
        assert_eq!(sub.flags[&key][(0, 0)], buffer.flags[&key][(0, 1)]);
        assert_eq!(sub.nsamples[&key][(1, 0)], buffer.nsamples[&key][(3, 1)]);
        assert_eq!(sub_meta.freqs(), &[meta.freqs()[1], meta.freqs()[4]]);
        assert_eq!(sub_meta.num_ints(), 2);
    }

    #[test]
    fn test_read_subset_reads_only_selected_keys() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("keys.kvb");
        let meta = synthetic_meta(&[(0, 1), (0, 2), (1, 2)], &[Pol::XX, Pol::YY], 3, 2);
        let buffer = synthetic_buffer(&meta);
        BlockedBackend.write_full(&path, &meta, &buffer, false).unwrap();

        let selected = vec![AntPairPol::new(0, 1, Pol::XX), AntPairPol::new(0, 2, Pol::YY)];
        let request = SubsetRequest {
            bls: BaselineFilter::keys(selected.clone()),
            ..Default::default()
        };
        let (sub_meta, sub) = BlockedBackend.read_subset(&path, &request).unwrap();
        assert_eq!(sub.keys().copied().collect_vec(), selected);
        assert_eq!(sub.nsamples.len(), 2);
        for key in &selected {
            assert_eq!(sub.data[key], buffer.data[key]);
        }
        // the metadata spans the baselines and polarizations of the keys read
        assert_eq!(sub_meta.baselines(), vec![(0, 1), (0, 2)]);
        assert_eq!(sub_meta.polarizations(), &[Pol::XX, Pol::YY]);
    }

    #[test]
    fn test_write_full_fills_missing_keys() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("sparse.kvb");
        let meta = synthetic_meta(&[(0, 1), (0, 2)], &[Pol::XX, Pol::YY], 4, 2);
        let full = synthetic_buffer(&meta);
        let kept = [AntPairPol::new(0, 1, Pol::XX), AntPairPol::new(0, 2, Pol::YY)];
        let mut buffer = VisBuffer::default();
        for key in kept {
            buffer.insert(
                key,
                full.data[&key].clone(),
                full.flags[&key].clone(),
                full.nsamples[&key].clone(),
            );
        }
        BlockedBackend.write_full(&path, &meta, &buffer, false).unwrap();

        let (_, written) = BlockedBackend.read_full(&path).unwrap();
        assert_eq!(written.len(), 4);
        for key in kept {
            assert_eq!(written.data[&key], full.data[&key]);
            assert_eq!(written.flags[&key], full.flags[&key]);
        }
        let missing = AntPairPol::new(0, 1, Pol::YY);
        assert!(written.flags[&missing].iter().all(|&flag| flag));
        assert!(written.nsamples[&missing].iter().all(|&n| n == 0.0));
        assert!(written.data[&missing]
            .iter()
            .all(|&v| v == Complex::new(0.0, 0.0)));

        // a key with only some of its arrays is still an error
        buffer.nsamples.shift_remove(&kept[0]);
        assert!(matches!(
            BlockedBackend.write_full(&path, &meta, &buffer, true),
            Err(KvisError::BackendWrite { .. })
        ));
    }

    #[test]
    fn test_write_region_into_allocated_file() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("region.kvb");
        let meta = synthetic_meta(&[(0, 1)], &[Pol::XX], 8, 2);
        BlockedBackend.allocate_output(&path, &meta, false).unwrap();

        let key = AntPairPol::new(0, 1, Pol::XX);
        let region = Region {
            bls: vec![key],
            freq_idxs: vec![2, 3, 6],
            time_idxs: vec![1],
        };
        let mut buffer = VisBuffer::zeros(&[key], region.shape());
        buffer.data[&key].fill(Complex::new(1.5, -2.5));
        buffer.flags[&key].fill(true);
        buffer.nsamples[&key].fill(8.0);
        BlockedBackend.write_region(&path, &region, &buffer).unwrap();

        let (_, written) = BlockedBackend.read_full(&path).unwrap();
        for chan in 0..8 {
            let touched = [2, 3, 6].contains(&chan);
            assert_eq!(written.flags[&key][(1, chan)], touched);
            assert!(!written.flags[&key][(0, chan)]);
            let expected = if touched {
                Complex::new(1.5, -2.5)
            } else {
                Complex::new(0.0, 0.0)
            };
            assert_eq!(written.data[&key][(1, chan)], expected);
        }

        let region = Region {
            bls: vec![AntPairPol::new(0, 2, Pol::XX)],
            freq_idxs: vec![0],
            time_idxs: vec![0],
        };
        assert!(matches!(
            BlockedBackend.write_region(&path, &region, &buffer),
            Err(KvisError::RegionOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_write_full_refuses_to_clobber() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("exists.kvb");
        let meta = synthetic_meta(&[(0, 1)], &[Pol::XX], 2, 2);
        let buffer = synthetic_buffer(&meta);
        BlockedBackend.write_full(&path, &meta, &buffer, false).unwrap();
        assert!(matches!(
            BlockedBackend.write_full(&path, &meta, &buffer, false),
            Err(KvisError::FileExists { .. })
        ));
        assert!(BlockedBackend.write_full(&path, &meta, &buffer, true).is_ok());
    }
}
