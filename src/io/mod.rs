//! Input and output of visibility and calibration files.
//!
//! Each visibility format has one [`FormatBackend`], and [`VisFormat::backend`] is the only
//! place that decides which one to use. The backends own their byte layouts; the rest of the
//! crate only deals in [`VisMeta`], [`VisBuffer`] and the subset types from
//! [`crate::selection`].

pub mod blocked;
pub mod calsol;
pub mod error;
pub mod sequential;

use std::{
    fmt::Display,
    io::{Read, Write},
    path::Path,
    str::FromStr,
};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;

use crate::{
    cal::{CalMeta, CalSolutions},
    key::AntPairPol,
    marlu::{
        ndarray::{concatenate, Array2, ArrayView2, Axis},
        Complex,
    },
    meta::VisMeta,
    pol::Pol,
    selection::{Region, SubsetRequest},
    KvisError,
};

use self::error::IOError;

/// The visibility file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisFormat {
    /// Self-describing, random-access `.kvb` files
    Blocked,
    /// Legacy sequential-record `.kvs` files
    Sequential,
}

impl VisFormat {
    /// Every visibility format.
    pub const ALL: [VisFormat; 2] = [VisFormat::Blocked, VisFormat::Sequential];

    /// The file extension of this format, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            VisFormat::Blocked => "kvb",
            VisFormat::Sequential => "kvs",
        }
    }

    /// Determine the format of a file from its extension.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::UnknownFormat`] if the extension is missing or unrecognised.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, KvisError> {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        ext.parse().map_err(|_| KvisError::UnknownFormat {
            input: path.as_ref().display().to_string(),
            expected: Self::expected(),
        })
    }

    /// The driver for this format.
    pub fn backend(self) -> Box<dyn FormatBackend> {
        match self {
            VisFormat::Blocked => Box::new(blocked::BlockedBackend),
            VisFormat::Sequential => Box::new(sequential::SequentialBackend),
        }
    }

    pub(crate) fn expected() -> String {
        Self::ALL
            .iter()
            .map(|format| format!("{format} (.{})", format.extension()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Display for VisFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                VisFormat::Blocked => "blocked",
                VisFormat::Sequential => "sequential",
            }
        )
    }
}

impl FromStr for VisFormat {
    type Err = KvisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "blocked" | "kvb" => Ok(VisFormat::Blocked),
            "sequential" | "kvs" => Ok(VisFormat::Sequential),
            _ => Err(KvisError::UnknownFormat {
                input: s.to_string(),
                expected: Self::expected(),
            }),
        }
    }
}

/// What a backend is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whole-file metadata can be read without reading the payload
    pub metadata_probe: bool,
    /// Reads can be restricted to some frequency channels
    pub freq_select: bool,
    /// Reads can be restricted to some integrations
    pub time_select: bool,
    /// Regions of a preallocated file can be written in place
    pub region_write: bool,
}

/// The visibilities, flags and sample counts of some baseline-polarizations, all with the same
/// (integrations, channels) shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisBuffer {
    /// Complex visibilities
    pub data: IndexMap<AntPairPol, Array2<Complex<f32>>>,
    /// Flags, true where flagged
    pub flags: IndexMap<AntPairPol, Array2<bool>>,
    /// Number of samples that went into each visibility
    pub nsamples: IndexMap<AntPairPol, Array2<f32>>,
}

impl VisBuffer {
    /// Add one baseline-polarization.
    pub fn insert(
        &mut self,
        key: AntPairPol,
        data: Array2<Complex<f32>>,
        flags: Array2<bool>,
        nsamples: Array2<f32>,
    ) {
        self.data.insert(key, data);
        self.flags.insert(key, flags);
        self.nsamples.insert(key, nsamples);
    }

    /// A buffer with zeroed visibilities, no flags and zero samples for each key.
    pub fn zeros(keys: &[AntPairPol], shape: (usize, usize)) -> Self {
        let mut result = Self::default();
        for &key in keys {
            result.insert(
                key,
                Array2::zeros(shape),
                Array2::from_elem(shape, false),
                Array2::zeros(shape),
            );
        }
        result
    }

    /// The keys in this buffer, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &AntPairPol> + Clone {
        self.data.keys()
    }

    /// The number of baseline-polarizations.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there are no baseline-polarizations.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The (integrations, channels) shape of the arrays, if there are any.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.data.values().next().map(Array2::dim)
    }

    /// Join buffers of consecutive pieces of a dataset along the time axis.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::ShapeMismatch`] if the parts don't hold the same keys and
    /// channels.
    pub fn concat_time(parts: &[Self]) -> Result<Self, KvisError> {
        let first = match parts.first() {
            Some(first) => first,
            None => return Ok(Self::default()),
        };
        let mut result = Self::default();
        for key in first.keys() {
            result.insert(
                *key,
                concat_key(parts, key, |part| part.data.get(key))?,
                concat_key(parts, key, |part| part.flags.get(key))?,
                concat_key(parts, key, |part| part.nsamples.get(key))?,
            );
        }
        Ok(result)
    }
}

fn concat_key<'a, T: Clone + 'a>(
    parts: &'a [VisBuffer],
    key: &AntPairPol,
    get: impl Fn(&'a VisBuffer) -> Option<&'a Array2<T>>,
) -> Result<Array2<T>, KvisError> {
    let views = parts
        .iter()
        .map(|part| get(part).map(Array2::view))
        .collect::<Option<Vec<ArrayView2<T>>>>()
        .ok_or_else(|| KvisError::KeyNotFound {
            key: key.to_string(),
        })?;
    concatenate(Axis(0), &views).map_err(|err| KvisError::ShapeMismatch {
        argument: format!("parts[..][{key}]"),
        function: "VisBuffer::concat_time".to_string(),
        expected: "the same number of channels in every part".to_string(),
        received: err.to_string(),
    })
}

/// A driver for one visibility file format.
///
/// Backends are stateless; every call opens the file it is given.
pub trait FormatBackend: Send + Sync {
    /// The format this backend reads and writes.
    fn format(&self) -> VisFormat;

    /// What this backend can do.
    fn capabilities(&self) -> Capabilities;

    /// Read the whole-file metadata without the payload, or `None` if that needs a full scan.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::BackendRead`] if the file can't be parsed.
    fn probe_metadata(&self, path: &Path) -> Result<Option<VisMeta>, KvisError>;

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::BackendRead`] if the file can't be parsed.
    fn read_full(&self, path: &Path) -> Result<(VisMeta, VisBuffer), KvisError> {
        self.read_subset(path, &SubsetRequest::default())
    }

    /// Read part of a file. Keys are returned in file order and orientation.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::UnsupportedSelector`] if the request selects on an axis this
    /// format can't subset, or [`KvisError::BackendRead`] if the file can't be parsed.
    fn read_subset(
        &self,
        path: &Path,
        request: &SubsetRequest,
    ) -> Result<(VisMeta, VisBuffer), KvisError>;

    /// Create a file described by `template`, with zeroed payload, ready for
    /// [`FormatBackend::write_region`].
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::FileExists`] if `path` exists and `overwrite` is false, or
    /// [`KvisError::NotSupported`] if this format can't be written in regions.
    fn allocate_output(
        &self,
        path: &Path,
        template: &VisMeta,
        overwrite: bool,
    ) -> Result<(), KvisError> {
        let _ = (path, template, overwrite);
        Err(KvisError::NotSupported {
            operation: "allocating an output for partial writes".to_string(),
            target: format!("the {} format", self.format()),
        })
    }

    /// Write `buffer` into a region of a file created by [`FormatBackend::allocate_output`].
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::RegionOutOfBounds`] if the region doesn't exist in the file,
    /// or [`KvisError::NotSupported`] if this format can't be written in regions.
    fn write_region(&self, path: &Path, region: &Region, buffer: &VisBuffer) -> Result<(), KvisError> {
        let _ = (path, region, buffer);
        Err(KvisError::NotSupported {
            operation: "partial_write".to_string(),
            target: format!("the {} format", self.format()),
        })
    }

    /// Write a whole file.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::FileExists`] if `path` exists and `overwrite` is false, or
    /// [`KvisError::BackendWrite`] if writing fails.
    fn write_full(
        &self,
        path: &Path,
        meta: &VisMeta,
        buffer: &VisBuffer,
        overwrite: bool,
    ) -> Result<(), KvisError>;
}

/// A driver for a calibration solution format. Calibration files are only ever read and
/// written whole.
pub trait CalBackend: Send + Sync {
    /// Read a whole calibration file.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::BackendRead`] if the file can't be parsed.
    fn read_full(&self, path: &Path) -> Result<(CalMeta, CalSolutions), KvisError>;

    /// Write a whole calibration file.
    ///
    /// # Errors
    ///
    /// Will return [`KvisError::FileExists`] if `path` exists and `overwrite` is false, or
    /// [`KvisError::BackendWrite`] if writing fails.
    fn write_full(
        &self,
        path: &Path,
        meta: &CalMeta,
        solutions: &CalSolutions,
        overwrite: bool,
    ) -> Result<(), KvisError>;
}

/// Refuse to replace `path` unless asked to.
pub(crate) fn check_clobber(path: &Path, overwrite: bool) -> Result<(), KvisError> {
    if path.exists() && !overwrite {
        return Err(KvisError::FileExists {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Read a 7 character magic string followed by 9 zero bytes.
pub(crate) fn read_magic<R: Read>(reader: &mut R, expected: &'static str) -> Result<(), IOError> {
    let mut magic = [0_u8; 7];
    reader.read_exact(&mut magic)?;
    let got = String::from_utf8_lossy(&magic).to_string();
    if got != expected {
        return Err(IOError::BadMagic { expected, got });
    }
    for _ in 0..9 {
        match reader.read_u8()? {
            0 => (),
            v => {
                return Err(IOError::BadHeaderValue {
                    field: "padding",
                    expected: "0".to_string(),
                    got: v.to_string(),
                })
            }
        }
    }
    Ok(())
}

pub(crate) fn write_magic<W: Write>(writer: &mut W, magic: &'static str) -> Result<(), IOError> {
    writer.write_all(magic.as_bytes())?;
    writer.write_all(&[0_u8; 9])?;
    Ok(())
}

/// Read a u32 format version and check that it is one we understand.
pub(crate) fn read_version<R: Read>(reader: &mut R, supported: u32) -> Result<(), IOError> {
    match reader.read_u32::<LittleEndian>()? {
        v if v == supported => Ok(()),
        v => Err(IOError::BadHeaderValue {
            field: "version",
            expected: supported.to_string(),
            got: v.to_string(),
        }),
    }
}

pub(crate) fn read_usize<R: Read>(reader: &mut R) -> Result<usize, IOError> {
    Ok(reader.read_u32::<LittleEndian>()? as usize)
}

pub(crate) fn write_usize<W: Write>(writer: &mut W, value: usize) -> Result<(), IOError> {
    let value = u32::try_from(value).map_err(|_| IOError::BadHeaderValue {
        field: "count",
        expected: format!("at most {}", u32::MAX),
        got: value.to_string(),
    })?;
    writer.write_u32::<LittleEndian>(value)?;
    Ok(())
}

/// Read the bytes of `count` values of `size` bytes each.
///
/// Counts come from file headers, so the buffer only grows as bytes actually arrive. A corrupt
/// count fails at the end of the file instead of allocating what it claims.
pub(crate) fn read_bytes<R: Read>(
    reader: &mut R,
    count: usize,
    size: usize,
) -> Result<Vec<u8>, IOError> {
    let len = count
        .checked_mul(size)
        .ok_or_else(|| IOError::BadHeaderValue {
            field: "count",
            expected: format!("at most {} values of {} bytes", usize::MAX / size.max(1), size),
            got: count.to_string(),
        })?;
    let mut bytes = vec![];
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(IOError::Inconsistent {
            thing: "file length".to_string(),
            expected: format!("{len} more bytes"),
            found: bytes.len().to_string(),
        });
    }
    Ok(bytes)
}

/// The number of cells in a plane of `shape`.
fn plane_cells(shape: (usize, usize)) -> Result<usize, IOError> {
    shape
        .0
        .checked_mul(shape.1)
        .ok_or_else(|| IOError::BadHeaderValue {
            field: "plane shape",
            expected: "a plane that fits in memory".to_string(),
            got: format!("{shape:?}"),
        })
}

pub(crate) fn read_f64s<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f64>, IOError> {
    let bytes = read_bytes(reader, count, 8)?;
    let mut values = vec![0.0; count];
    LittleEndian::read_f64_into(&bytes, &mut values);
    Ok(values)
}

pub(crate) fn write_f64s<W: Write>(writer: &mut W, values: &[f64]) -> Result<(), IOError> {
    for &value in values {
        writer.write_f64::<LittleEndian>(value)?;
    }
    Ok(())
}

/// Read a u32 length-prefixed utf-8 string.
pub(crate) fn read_text<R: Read>(reader: &mut R) -> Result<String, IOError> {
    let len = read_usize(reader)?;
    Ok(String::from_utf8(read_bytes(reader, len, 1)?)?)
}

pub(crate) fn write_text<W: Write>(writer: &mut W, text: &str) -> Result<(), IOError> {
    write_usize(writer, text.len())?;
    writer.write_all(text.as_bytes())?;
    Ok(())
}

/// Read a u8 length-prefixed polarization string.
pub(crate) fn read_code<R: Read>(reader: &mut R) -> Result<String, IOError> {
    let len = reader.read_u8()? as usize;
    Ok(String::from_utf8(read_bytes(reader, len, 1)?)?)
}

pub(crate) fn write_code<W: Write>(writer: &mut W, code: &str) -> Result<(), IOError> {
    writer.write_u8(code.len() as u8)?;
    writer.write_all(code.as_bytes())?;
    Ok(())
}

pub(crate) fn read_pol<R: Read>(reader: &mut R) -> Result<Pol, IOError> {
    let code = read_code(reader)?;
    code.parse().map_err(|_| IOError::BadHeaderValue {
        field: "polarization",
        expected: "a polarization code".to_string(),
        got: code,
    })
}

/// Read a (rows, cols) plane of interleaved re/im f32 pairs.
pub(crate) fn read_complex_plane<R: Read>(
    reader: &mut R,
    shape: (usize, usize),
) -> Result<Array2<Complex<f32>>, IOError> {
    let cells = plane_cells(shape)?;
    let bytes = read_bytes(reader, cells, 8)?;
    let mut raw = vec![0.0_f32; cells * 2];
    LittleEndian::read_f32_into(&bytes, &mut raw);
    let values = raw
        .chunks_exact(2)
        .map(|pair| Complex::new(pair[0], pair[1]))
        .collect();
    plane_from_vec(shape, values)
}

pub(crate) fn read_f32_plane<R: Read>(
    reader: &mut R,
    shape: (usize, usize),
) -> Result<Array2<f32>, IOError> {
    let cells = plane_cells(shape)?;
    let bytes = read_bytes(reader, cells, 4)?;
    let mut values = vec![0.0_f32; cells];
    LittleEndian::read_f32_into(&bytes, &mut values);
    plane_from_vec(shape, values)
}

pub(crate) fn read_flag_plane<R: Read>(
    reader: &mut R,
    shape: (usize, usize),
) -> Result<Array2<bool>, IOError> {
    let raw = read_bytes(reader, plane_cells(shape)?, 1)?;
    plane_from_vec(shape, raw.into_iter().map(|flag| flag != 0).collect())
}

fn plane_from_vec<T>(shape: (usize, usize), values: Vec<T>) -> Result<Array2<T>, IOError> {
    let len = values.len();
    Array2::from_shape_vec(shape, values).map_err(|_| IOError::Inconsistent {
        thing: "payload plane".to_string(),
        expected: format!("{} values", shape.0 * shape.1),
        found: len.to_string(),
    })
}

pub(crate) fn write_complex_values<'a, W: Write>(
    writer: &mut W,
    values: impl IntoIterator<Item = &'a Complex<f32>>,
) -> Result<(), IOError> {
    for value in values {
        writer.write_f32::<LittleEndian>(value.re)?;
        writer.write_f32::<LittleEndian>(value.im)?;
    }
    Ok(())
}

pub(crate) fn write_f32_values<'a, W: Write>(
    writer: &mut W,
    values: impl IntoIterator<Item = &'a f32>,
) -> Result<(), IOError> {
    for &value in values {
        writer.write_f32::<LittleEndian>(value)?;
    }
    Ok(())
}

pub(crate) fn write_flag_values<'a, W: Write>(
    writer: &mut W,
    values: impl IntoIterator<Item = &'a bool>,
) -> Result<(), IOError> {
    for &flag in values {
        writer.write_u8(u8::from(flag))?;
    }
    Ok(())
}

/// Look up one key of a buffer that is about to be written.
pub(crate) fn buffer_arrays<'a>(
    buffer: &'a VisBuffer,
    key: &AntPairPol,
) -> Result<(&'a Array2<Complex<f32>>, &'a Array2<bool>, &'a Array2<f32>), IOError> {
    match (
        buffer.data.get(key),
        buffer.flags.get(key),
        buffer.nsamples.get(key),
    ) {
        (Some(data), Some(flags), Some(nsamples)) => Ok((data, flags, nsamples)),
        _ => Err(IOError::Inconsistent {
            thing: format!("buffer contents for {key}"),
            expected: "data, flags and nsamples".to_string(),
            found: "some missing".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::marlu::ndarray::array;

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            VisFormat::from_path("/tmp/obs.kvb").unwrap(),
            VisFormat::Blocked
        );
        assert_eq!(
            VisFormat::from_path("obs.KVS").unwrap(),
            VisFormat::Sequential
        );
        assert!(matches!(
            VisFormat::from_path("obs.uvh5"),
            Err(KvisError::UnknownFormat { .. })
        ));
        assert_eq!("Blocked".parse::<VisFormat>().unwrap(), VisFormat::Blocked);
        assert_eq!(VisFormat::Sequential.backend().format(), VisFormat::Sequential);
    }

    #[test]
    fn test_magic_rejects_other_formats() {
        let mut bytes = vec![];
        write_magic(&mut bytes, "KVISBLK").unwrap();
        assert!(read_magic(&mut Cursor::new(&bytes), "KVISBLK").is_ok());
        assert!(matches!(
            read_magic(&mut Cursor::new(&bytes), "KVISSEQ"),
            Err(IOError::BadMagic { .. })
        ));
        bytes[10] = 1;
        assert!(matches!(
            read_magic(&mut Cursor::new(&bytes), "KVISBLK"),
            Err(IOError::BadHeaderValue { .. })
        ));
    }

    #[test]
    fn test_counts_beyond_the_end_of_file() {
        let mut reader = Cursor::new(vec![0_u8; 20]);
        assert!(matches!(
            read_f64s(&mut reader, u32::MAX as usize),
            Err(IOError::Inconsistent { .. })
        ));
        assert!(matches!(
            read_flag_plane(&mut Cursor::new(vec![1_u8; 5]), (2, 3)),
            Err(IOError::Inconsistent { .. })
        ));
        assert!(matches!(
            read_bytes(&mut Cursor::new(vec![]), usize::MAX, 8),
            Err(IOError::BadHeaderValue { .. })
        ));

        let mut bytes = vec![];
        write_text(&mut bytes, "history").unwrap();
        bytes[0] = 0xff;
        assert!(read_text(&mut Cursor::new(&bytes)).is_err());
        bytes[0] = 7;
        assert_eq!(read_text(&mut Cursor::new(&bytes)).unwrap(), "history");
    }

    #[test]
    fn test_concat_time() {
        let key = AntPairPol::new(0, 1, Pol::XX);
        let mut first = VisBuffer::default();
        first.insert(
            key,
            array![[Complex::new(1.0, 1.0), Complex::new(2.0, 0.0)]],
            array![[false, true]],
            array![[1.0, 1.0]],
        );
        let mut second = VisBuffer::default();
        second.insert(
            key,
            array![[Complex::new(3.0, -1.0), Complex::new(4.0, 0.0)]],
            array![[true, false]],
            array![[0.5, 1.0]],
        );
        let joined = VisBuffer::concat_time(&[first, second]).unwrap();
        assert_eq!(joined.shape(), Some((2, 2)));
        assert_eq!(joined.flags[&key], array![[false, true], [true, false]]);
        assert_eq!(joined.data[&key][(1, 0)], Complex::new(3.0, -1.0));
    }
}
