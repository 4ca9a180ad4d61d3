//! TrackVis streamline files (.trk, format version 1).
//!
//! A file is a fixed 1000-byte header followed by length-prefixed records:
//! one little-endian i32 point count, then that many x,y,z f32 triplets.
//! Points are voxel coordinates, written as given.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::enums::SavePolicy;

/// Byte offsets of the header fields used by this toolkit.
mod offsets {
    pub const ID_STRING: usize = 0;
    pub const DIM: usize = 6;
    pub const VOXEL_SIZE: usize = 12;
    pub const ORIGIN: usize = 24;
    pub const N_SCALARS: usize = 36;
    pub const N_PROPERTIES: usize = 238;
    pub const VOXEL_ORDER: usize = 948;
    pub const PAD2: usize = 952;
    pub const IMAGE_ORIENTATION: usize = 956;
    pub const N_COUNT: usize = 988;
    pub const VERSION: usize = 992;
    pub const HDR_SIZE: usize = 996;
}

/// Per-record capacity bound, in points.
pub const MAX_TRACK_POINTS: usize = 2000;

/// Shift added to every coordinate on write.
pub const POINT_SHIFT: f32 = 0.0;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("not a streamline file: bad id string")]
    BadMagic,

    #[error("header size field is {0}, expected 1000")]
    BadHeaderSize(i32),

    #[error("unsupported record layout: {scalars} scalars, {properties} properties per point")]
    UnsupportedLayout { scalars: i16, properties: i16 },

    #[error("invalid grid: dimensions and voxel sizes must be positive")]
    InvalidGrid,

    #[error("streamline has {count} points, writer capacity is {max}")]
    TooManyPoints { count: usize, max: usize },

    #[error("negative point count {0} in record")]
    BadRecord(i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed fields of the 1000-byte header.
///
/// The voxel order is pinned to LPS and the per-point scalar and property
/// counts to zero; files carrying extra per-point data are rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackHeader {
    pub dim: [i16; 3],
    pub voxel_size: [f32; 3],
    pub origin: [f32; 3],
    pub n_count: i32,
    pub version: i32,
}

impl TrackHeader {
    /// On-disk header size in bytes.
    pub const SIZE: usize = 1000;
    /// Byte offset of the streamline count field.
    pub const COUNT_OFFSET: u64 = (Self::SIZE - 12) as u64;

    fn new(dim: [i16; 3], voxel_size: [f32; 3]) -> Result<Self, TrackError> {
        let grid_ok = dim.iter().all(|&d| d > 0)
            && voxel_size.iter().all(|&vs| vs > 0.0 && !vs.is_nan());
        if !grid_ok {
            return Err(TrackError::InvalidGrid);
        }
        Ok(Self {
            dim,
            voxel_size,
            origin: [0.0; 3],
            n_count: 0,
            version: 1,
        })
    }

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[offsets::ID_STRING..offsets::ID_STRING + 6].copy_from_slice(b"TRACK\0");
        for i in 0..3 {
            LittleEndian::write_i16(&mut b[offsets::DIM + 2 * i..], self.dim[i]);
            LittleEndian::write_f32(&mut b[offsets::VOXEL_SIZE + 4 * i..], self.voxel_size[i]);
            LittleEndian::write_f32(&mut b[offsets::ORIGIN + 4 * i..], self.origin[i]);
        }
        b[offsets::VOXEL_ORDER..offsets::VOXEL_ORDER + 4].copy_from_slice(b"LPS\0");
        b[offsets::PAD2..offsets::PAD2 + 4].copy_from_slice(b"LPS\0");
        for (i, v) in [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0].iter().enumerate() {
            LittleEndian::write_f32(&mut b[offsets::IMAGE_ORIENTATION + 4 * i..], *v);
        }
        LittleEndian::write_i32(&mut b[offsets::N_COUNT..], self.n_count);
        LittleEndian::write_i32(&mut b[offsets::VERSION..], self.version);
        LittleEndian::write_i32(&mut b[offsets::HDR_SIZE..], Self::SIZE as i32);
        b
    }

    fn from_bytes(b: &[u8; Self::SIZE]) -> Result<Self, TrackError> {
        if &b[..5] != b"TRACK" {
            return Err(TrackError::BadMagic);
        }
        let hdr_size = LittleEndian::read_i32(&b[offsets::HDR_SIZE..]);
        if hdr_size != Self::SIZE as i32 {
            return Err(TrackError::BadHeaderSize(hdr_size));
        }
        let scalars = LittleEndian::read_i16(&b[offsets::N_SCALARS..]);
        let properties = LittleEndian::read_i16(&b[offsets::N_PROPERTIES..]);
        if scalars != 0 || properties != 0 {
            return Err(TrackError::UnsupportedLayout { scalars, properties });
        }

        let mut dim = [0i16; 3];
        let mut voxel_size = [0f32; 3];
        let mut origin = [0f32; 3];
        for i in 0..3 {
            dim[i] = LittleEndian::read_i16(&b[offsets::DIM + 2 * i..]);
            voxel_size[i] = LittleEndian::read_f32(&b[offsets::VOXEL_SIZE + 4 * i..]);
            origin[i] = LittleEndian::read_f32(&b[offsets::ORIGIN + 4 * i..]);
        }
        Ok(Self {
            dim,
            voxel_size,
            origin,
            n_count: LittleEndian::read_i32(&b[offsets::N_COUNT..]),
            version: LittleEndian::read_i32(&b[offsets::VERSION..]),
        })
    }
}

/// A streamline file open for writing or reading.
///
/// The header's streamline count is not maintained automatically: callers
/// track how many records they appended and persist the total with
/// [`TrackFile::update_total`] before closing.
pub struct TrackFile {
    file: File,
    header: TrackHeader,
    point_buf: Vec<f32>,
}

impl TrackFile {
    /// Create `path` with a fresh header, ready for the first record.
    pub fn create(
        path: impl AsRef<Path>,
        dim: [i16; 3],
        voxel_size: [f32; 3],
    ) -> Result<Self, TrackError> {
        let header = TrackHeader::new(dim, voxel_size)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.write_all(&header.to_bytes())?;
        Ok(Self {
            file,
            header,
            point_buf: Vec::new(),
        })
    }

    /// Open an existing file, leaving the cursor at the first record.
    ///
    /// To append to the end of the existing data, call
    /// [`TrackFile::seek_to_end`] first; records are otherwise written at
    /// the current position.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut bytes = [0u8; TrackHeader::SIZE];
        file.read_exact(&mut bytes)?;
        let header = TrackHeader::from_bytes(&bytes)?;
        Ok(Self {
            file,
            header,
            point_buf: Vec::new(),
        })
    }

    pub fn header(&self) -> &TrackHeader {
        &self.header
    }

    /// Serialize one streamline at the current position, applying `policy`.
    ///
    /// Returns the number of points written. Streamlines over
    /// [`MAX_TRACK_POINTS`] are rejected before anything reaches the file,
    /// leaving it exactly as it was; the writer stays usable.
    pub fn append(
        &mut self,
        points: &[[f32; 3]],
        policy: SavePolicy,
    ) -> Result<usize, TrackError> {
        if points.len() > MAX_TRACK_POINTS {
            return Err(TrackError::TooManyPoints {
                count: points.len(),
                max: MAX_TRACK_POINTS,
            });
        }

        self.point_buf.clear();
        if !points.is_empty() {
            match policy {
                SavePolicy::All => {
                    for p in points {
                        self.push_point(p);
                    }
                }
                SavePolicy::Half => {
                    // back to front, so the record ends on the first point
                    for i in (1..points.len()).rev().step_by(2) {
                        self.push_point(&points[i]);
                    }
                    self.push_point(&points[0]);
                }
                SavePolicy::Unique => {
                    let mut last = [0i32; 3];
                    let mut kept_any = false;
                    for p in points {
                        let voxel = [
                            p[0].floor() as i32,
                            p[1].floor() as i32,
                            p[2].floor() as i32,
                        ];
                        if !kept_any || voxel != last {
                            self.push_point(p);
                            last = voxel;
                            kept_any = true;
                        }
                    }
                }
            }
        }

        let count = self.point_buf.len() / 3;
        let mut record = Vec::with_capacity(4 + 4 * self.point_buf.len());
        record.write_i32::<LittleEndian>(count as i32)?;
        for &v in &self.point_buf {
            record.write_f32::<LittleEndian>(v)?;
        }
        self.file.write_all(&record)?;
        Ok(count)
    }

    fn push_point(&mut self, p: &[f32; 3]) {
        self.point_buf.push(p[0] + POINT_SHIFT);
        self.point_buf.push(p[1] + POINT_SHIFT);
        self.point_buf.push(p[2] + POINT_SHIFT);
    }

    /// Read the record at the current position; `None` at end of data.
    pub fn next_streamline(&mut self) -> Result<Option<Vec<[f32; 3]>>, TrackError> {
        let count = match self.file.read_i32::<LittleEndian>() {
            Ok(count) => count,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if count < 0 {
            return Err(TrackError::BadRecord(count));
        }

        let mut coords = vec![0u8; count as usize * 12];
        self.file.read_exact(&mut coords)?;
        let points = coords
            .chunks_exact(12)
            .map(|c| {
                [
                    LittleEndian::read_f32(&c[0..4]),
                    LittleEndian::read_f32(&c[4..8]),
                    LittleEndian::read_f32(&c[8..12]),
                ]
            })
            .collect();
        Ok(Some(points))
    }

    /// Overwrite the streamline count field in place.
    ///
    /// Leaves the cursor inside the header; seek before appending more
    /// records.
    pub fn update_total(&mut self, total: i32) -> Result<(), TrackError> {
        self.file.seek(SeekFrom::Start(TrackHeader::COUNT_OFFSET))?;
        self.file.write_i32::<LittleEndian>(total)?;
        self.header.n_count = total;
        Ok(())
    }

    /// Rewrite the full header at the start of the file.
    pub fn write_header(&mut self) -> Result<(), TrackError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }

    /// Move the cursor past everything already in the file.
    pub fn seek_to_end(&mut self) -> Result<(), TrackError> {
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Flush and release the handle.
    pub fn close(mut self) -> Result<(), TrackError> {
        self.file.flush()?;
        Ok(())
    }
}
