//! In-memory volumes and their on-disk form.
//!
//! A [`Volume`] pairs a parsed [`VolumeHeader`] with a dense row-major
//! voxel buffer. Files are written little-endian; both byte orders are
//! accepted on read.

use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytemuck::Pod;
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use thiserror::Error;

use crate::header::{Datatype, VolumeHeader};

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("not a volume file: bad magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("not a volume file: header size field is {0}")]
    BadHeaderSize(i32),

    #[error("unsupported datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("volume holds {found:?} data, expected {expected:?}")]
    WrongDatatype { expected: Datatype, found: Datatype },

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("file truncated: {actual} bytes, need {required}")]
    Truncated { required: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scalar types a voxel buffer can hold.
pub trait Element: Pod + Default {
    const DATATYPE: Datatype;
}

impl Element for i16 {
    const DATATYPE: Datatype = Datatype::Int16;
}

impl Element for f32 {
    const DATATYPE: Datatype = Datatype::Float32;
}

#[derive(Debug)]
pub struct Volume<T: Element> {
    pub header: VolumeHeader,
    pub data: ArrayD<T>,
}

impl<T: Element> Volume<T> {
    /// Allocate a zero-filled volume with the given grid and voxel size.
    pub fn make(dims: &[usize], voxel_size: &[f32]) -> Result<Self, VolumeError> {
        let header = VolumeHeader::new(dims, voxel_size, T::DATATYPE)?;
        let data = ArrayD::from_elem(IxDyn(dims), T::default());
        Ok(Self { header, data })
    }

    /// Read a volume file, requiring its datatype to match `T`.
    ///
    /// A readable file of the wrong element type reports
    /// [`VolumeError::WrongDatatype`]; files that cannot be parsed at all
    /// report what broke instead.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
        let bytes = fs::read(path.as_ref())?;
        let (header, little_endian) = VolumeHeader::from_bytes(&bytes)?;
        if header.datatype != T::DATATYPE {
            return Err(VolumeError::WrongDatatype {
                expected: T::DATATYPE,
                found: header.datatype,
            });
        }

        let data_len = header.data_len().ok_or_else(|| {
            VolumeError::InvalidDimensions("element count overflows usize".into())
        })?;
        let required = VolumeHeader::VOX_OFFSET + data_len;
        if bytes.len() < required {
            return Err(VolumeError::Truncated {
                required,
                actual: bytes.len(),
            });
        }

        let mut raw = bytes[VolumeHeader::VOX_OFFSET..required].to_vec();
        if little_endian != cfg!(target_endian = "little") {
            swap_elements(&mut raw, T::DATATYPE.byte_size());
        }
        let elements = bytemuck::pod_collect_to_vec::<u8, T>(&raw);
        let data = ArrayD::from_shape_vec(IxDyn(&header.dim[..header.ndim]), elements)
            .map_err(|e| VolumeError::InvalidDimensions(e.to_string()))?;
        Ok(Self { header, data })
    }

    /// Write header and voxel buffer to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VolumeError> {
        if self.data.shape() != &self.header.dim[..self.header.ndim] {
            return Err(VolumeError::InvalidDimensions(format!(
                "header says {:?}, buffer is {:?}",
                &self.header.dim[..self.header.ndim],
                self.data.shape()
            )));
        }

        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&self.header.to_bytes())?;
        // pad up to the fixed voxel offset
        writer.write_all(&[0u8; VolumeHeader::VOX_OFFSET - VolumeHeader::SIZE])?;

        let contiguous = self.data.as_standard_layout();
        let slice = contiguous
            .as_slice()
            .ok_or_else(|| VolumeError::InvalidDimensions("non-contiguous voxel buffer".into()))?;
        if cfg!(target_endian = "little") {
            writer.write_all(bytemuck::cast_slice(slice))?;
        } else {
            let mut raw = bytemuck::cast_slice(slice).to_vec();
            swap_elements(&mut raw, T::DATATYPE.byte_size());
            writer.write_all(&raw)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Take over spatial metadata from another volume's header.
    ///
    /// Voxel sizes, the orientation quaternion, the calibration range and
    /// the units byte are copied; dimensions and datatype keep describing
    /// this volume's own buffer.
    pub fn copy_header(&mut self, src: &VolumeHeader) {
        self.header.pixdim = src.pixdim;
        self.header.quatern = src.quatern;
        self.header.cal_min = src.cal_min;
        self.header.cal_max = src.cal_max;
        self.header.xyz_units = src.xyz_units;
    }

    /// Shape of the voxel buffer, slowest axis first.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

// Byte-swap every element in place; `width` is the element size in bytes.
fn swap_elements(bytes: &mut [u8], width: usize) {
    bytes
        .par_chunks_exact_mut(width)
        .for_each(|chunk| chunk.reverse());
}
