//! IO for the `.kcal` calibration solutions format.
//!
//! The layout follows the AOCal binary format: a 7 character magic string, 9 zero bytes and a
//! header of little-endian u32 counts, followed by f64 arrays. After the header come, for each
//! antenna and each Jones polarization (antenna-major), a `[time][channel]` plane of complex
//! gains (interleaved f64 re/im), a plane of u8 flags and a plane of f64 quality. Each Jones
//! polarization then has a u8 marker saying whether a total quality plane follows.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;

use super::{
    check_clobber, error::IOError, read_bytes, read_code, read_f64s, read_magic, read_text, read_usize,
    read_version, write_code, write_f64s, write_magic, write_text, write_usize, CalBackend,
};
use crate::{
    cal::{CalMeta, CalSolutions},
    key::AntPol,
    marlu::{ndarray::Array2, Complex},
    pol::JonesPol,
    KvisError,
};

const MAGIC: &str = "KVISCAL";
const VERSION: u32 = 1;

/// Driver for `.kcal` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalsolBackend;

fn inconsistent(thing: &str, shape: (usize, usize), len: usize) -> IOError {
    IOError::Inconsistent {
        thing: thing.to_string(),
        expected: format!("{} values", shape.0 * shape.1),
        found: len.to_string(),
    }
}

fn read_solutions<R: Read>(reader: &mut R) -> Result<(CalMeta, CalSolutions), IOError> {
    read_magic(reader, MAGIC)?;
    read_version(reader, VERSION)?;
    let num_times = read_usize(reader)?;
    let num_freqs = read_usize(reader)?;
    let num_ants = read_usize(reader)?;
    let num_jpols = read_usize(reader)?;
    let times = read_f64s(reader, num_times)?;
    let freqs = read_f64s(reader, num_freqs)?;
    let mut ants = vec![];
    for _ in 0..num_ants {
        ants.push(read_usize(reader)?);
    }
    let mut jones_pols = vec![];
    for _ in 0..num_jpols {
        let code = read_code(reader)?;
        jones_pols.push(
            code.parse::<JonesPol>()
                .map_err(|_| IOError::BadHeaderValue {
                    field: "jones polarization",
                    expected: "a Jones polarization code".to_string(),
                    got: code,
                })?,
        );
    }
    let history = read_text(reader)?;

    let shape = (num_times, num_freqs);
    let cells = num_times
        .checked_mul(num_freqs)
        .ok_or_else(|| inconsistent("solution shape", shape, usize::MAX))?;
    let mut solutions = CalSolutions::default();
    for &ant in &ants {
        for &jpol in &jones_pols {
            let key = AntPol::new(ant, jpol);
            let raw = read_f64s(reader, cells * 2)?;
            let gains = Array2::from_shape_vec(
                shape,
                raw.chunks_exact(2)
                    .map(|pair| Complex::new(pair[0], pair[1]))
                    .collect(),
            )
            .map_err(|_| inconsistent("gains", shape, raw.len() / 2))?;

            let raw_flags = read_bytes(reader, cells, 1)?;
            let flags =
                Array2::from_shape_vec(shape, raw_flags.into_iter().map(|f| f != 0).collect())
                    .map_err(|_| inconsistent("flags", shape, cells))?;

            let quality = Array2::from_shape_vec(shape, read_f64s(reader, cells)?)
                .map_err(|_| inconsistent("quality", shape, cells))?;

            solutions.gains.insert(key, gains);
            solutions.flags.insert(key, flags);
            solutions.quality.insert(key, quality);
        }
    }
    for &jpol in &jones_pols {
        if reader.read_u8()? != 0 {
            let total = Array2::from_shape_vec(shape, read_f64s(reader, cells)?)
                .map_err(|_| inconsistent("total quality", shape, cells))?;
            solutions.total_quality.insert(jpol, total);
        }
    }

    let meta = CalMeta {
        freqs,
        times,
        ants,
        jones_pols,
        history,
    };
    Ok((meta, solutions))
}

fn write_solutions<W: Write>(
    writer: &mut W,
    meta: &CalMeta,
    solutions: &CalSolutions,
) -> Result<(), IOError> {
    write_magic(writer, MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    write_usize(writer, meta.times.len())?;
    write_usize(writer, meta.freqs.len())?;
    write_usize(writer, meta.ants.len())?;
    write_usize(writer, meta.jones_pols.len())?;
    write_f64s(writer, &meta.times)?;
    write_f64s(writer, &meta.freqs)?;
    for &ant in &meta.ants {
        write_usize(writer, ant)?;
    }
    for jpol in &meta.jones_pols {
        write_code(writer, jpol.as_str())?;
    }
    write_text(writer, &meta.history)?;

    let shape = (meta.times.len(), meta.freqs.len());
    let missing = |what: &str, key: &AntPol| IOError::Inconsistent {
        thing: format!("{what} of {key}"),
        expected: format!("a {shape:?} array"),
        found: "missing or misshapen".to_string(),
    };
    for &ant in &meta.ants {
        for &jpol in &meta.jones_pols {
            let key = AntPol::new(ant, jpol);
            let gains = solutions
                .gains
                .get(&key)
                .filter(|a| a.dim() == shape)
                .ok_or_else(|| missing("gains", &key))?;
            let flags = solutions
                .flags
                .get(&key)
                .filter(|a| a.dim() == shape)
                .ok_or_else(|| missing("flags", &key))?;
            let quality = solutions
                .quality
                .get(&key)
                .filter(|a| a.dim() == shape)
                .ok_or_else(|| missing("quality", &key))?;
            for gain in gains.iter() {
                writer.write_f64::<LittleEndian>(gain.re)?;
                writer.write_f64::<LittleEndian>(gain.im)?;
            }
            for &flag in flags.iter() {
                writer.write_u8(u8::from(flag))?;
            }
            for &value in quality.iter() {
                writer.write_f64::<LittleEndian>(value)?;
            }
        }
    }
    for jpol in &meta.jones_pols {
        match solutions.total_quality.get(jpol) {
            Some(total) if total.dim() == shape => {
                writer.write_u8(1)?;
                for &value in total.iter() {
                    writer.write_f64::<LittleEndian>(value)?;
                }
            }
            Some(total) => {
                return Err(IOError::Inconsistent {
                    thing: format!("total quality of {jpol}"),
                    expected: format!("{shape:?}"),
                    found: format!("{:?}", total.dim()),
                })
            }
            None => writer.write_u8(0)?,
        }
    }
    writer.flush()?;
    Ok(())
}

impl CalBackend for CalsolBackend {
    fn read_full(&self, path: &Path) -> Result<(CalMeta, CalSolutions), KvisError> {
        trace!("start read_full of {:?}", path);
        let mut reader = BufReader::new(
            File::open(path).map_err(|err| KvisError::backend_read(path, err.into()))?,
        );
        let result =
            read_solutions(&mut reader).map_err(|err| KvisError::backend_read(path, err))?;
        trace!("end read_full of {:?}", path);
        Ok(result)
    }

    fn write_full(
        &self,
        path: &Path,
        meta: &CalMeta,
        solutions: &CalSolutions,
        overwrite: bool,
    ) -> Result<(), KvisError> {
        trace!("start write_full to {:?}", path);
        check_clobber(path, overwrite)?;
        let file =
            File::create(path).map_err(|err| KvisError::backend_write(path, err.into()))?;
        write_solutions(&mut BufWriter::new(file), meta, solutions)
            .map_err(|err| KvisError::backend_write(path, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_common::synthetic_calsols;

    #[test]
    fn test_total_quality_presence() {
        let (meta, mut solutions) =
            synthetic_calsols(&[0, 1, 5], &[JonesPol::Jee, JonesPol::Jnn], 2, 4);
        solutions.total_quality.shift_remove(&JonesPol::Jnn);
        let mut bytes = vec![];
        write_solutions(&mut bytes, &meta, &solutions).unwrap();
        let (read_meta, read) = read_solutions(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(read_meta, meta);
        assert!(read.total_quality.contains_key(&JonesPol::Jee));
        assert!(!read.total_quality.contains_key(&JonesPol::Jnn));
        let key = AntPol::new(5, JonesPol::Jnn);
        assert_eq!(read.gains[&key], solutions.gains[&key]);
    }

    #[test]
    fn test_write_requires_every_key() {
        let (meta, mut solutions) = synthetic_calsols(&[0, 1], &[JonesPol::Jxx], 1, 2);
        solutions.quality.shift_remove(&AntPol::new(1, JonesPol::Jxx));
        let mut bytes = vec![];
        assert!(matches!(
            write_solutions(&mut bytes, &meta, &solutions),
            Err(IOError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_truncated_file_with_huge_counts() {
        let (meta, solutions) = synthetic_calsols(&[0, 1], &[JonesPol::Jxx], 2, 3);
        let mut bytes = vec![];
        write_solutions(&mut bytes, &meta, &solutions).unwrap();
        // num_times follows the magic and the version
        bytes[20..24].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[24..28].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes.truncate(64);
        assert!(matches!(
            read_solutions(&mut Cursor::new(&bytes)),
            Err(IOError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_reject_visibility_file() {
        let mut bytes = vec![];
        write_magic(&mut bytes, "KVISBLK").unwrap();
        bytes.extend_from_slice(&[0; 64]);
        assert!(matches!(
            read_solutions(&mut Cursor::new(&bytes)),
            Err(IOError::BadMagic { .. })
        ));
    }
}
