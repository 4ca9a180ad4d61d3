//! Fixed 348-byte volume header (NIfTI-1 single-file layout).
//!
//! Only the fields this toolkit uses are parsed; everything else is written
//! as zero. Voxel data starts at byte 352. Files are written little-endian;
//! reads accept either byte order.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::volume::VolumeError;

/// Byte offsets of the header fields used by this toolkit.
mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const XYZT_UNITS: usize = 123;
    pub const CAL_MAX: usize = 124;
    pub const CAL_MIN: usize = 128;
    pub const QFORM_CODE: usize = 252;
    pub const QUATERN_B: usize = 256;
    pub const QUATERN_C: usize = 260;
    pub const QUATERN_D: usize = 264;
    pub const MAGIC: usize = 344;
}

/// Default spatial/temporal units code written on creation (mm + s).
pub const UNITS_MM_SEC: u8 = 10;

/// Element type of the voxel buffer, by on-disk code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Datatype {
    Int16 = 4,
    Float32 = 16,
}

impl Datatype {
    pub fn from_code(code: i16) -> Result<Self, VolumeError> {
        match code {
            4 => Ok(Datatype::Int16),
            16 => Ok(Datatype::Float32),
            other => Err(VolumeError::UnsupportedDatatype(other)),
        }
    }

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn byte_size(self) -> usize {
        match self {
            Datatype::Int16 => 2,
            Datatype::Float32 => 4,
        }
    }
}

/// Parsed header of a volume file.
///
/// `dim` and `pixdim` always hold 4 entries; axes past `ndim` are pinned to
/// 1 / 1.0 so shape math can ignore the rank.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeHeader {
    pub ndim: usize,
    pub dim: [usize; 4],
    pub pixdim: [f32; 4],
    pub datatype: Datatype,
    pub cal_min: f32,
    pub cal_max: f32,
    pub xyz_units: u8,
    pub quatern: [f32; 3],
}

impl VolumeHeader {
    /// On-disk header size in bytes.
    pub const SIZE: usize = 348;
    /// Byte offset of the first voxel.
    pub const VOX_OFFSET: usize = 352;

    const MAGIC: &'static [u8; 4] = b"n+1\0";

    /// Build a header for a freshly allocated volume.
    ///
    /// `dims` and `voxel_size` must have the same length (1 to 4 entries),
    /// all strictly positive. Dimensions are bounded by the signed 16-bit
    /// on-disk field.
    pub fn new(
        dims: &[usize],
        voxel_size: &[f32],
        datatype: Datatype,
    ) -> Result<Self, VolumeError> {
        if dims.is_empty() || dims.len() > 4 {
            return Err(VolumeError::InvalidDimensions(format!(
                "rank {} outside 1..=4",
                dims.len()
            )));
        }
        if voxel_size.len() != dims.len() {
            return Err(VolumeError::InvalidDimensions(format!(
                "{} voxel sizes for {} dimensions",
                voxel_size.len(),
                dims.len()
            )));
        }
        let mut dim = [1usize; 4];
        let mut pixdim = [1f32; 4];
        for (i, (&d, &vs)) in dims.iter().zip(voxel_size).enumerate() {
            if d == 0 || d > i16::MAX as usize {
                return Err(VolumeError::InvalidDimensions(format!(
                    "dimension {i} is {d}, outside 1..={}",
                    i16::MAX
                )));
            }
            if vs <= 0.0 || vs.is_nan() {
                return Err(VolumeError::InvalidDimensions(format!(
                    "voxel size {i} is {vs}, must be positive"
                )));
            }
            dim[i] = d;
            pixdim[i] = vs;
        }
        Ok(Self {
            ndim: dims.len(),
            dim,
            pixdim,
            datatype,
            cal_min: 0.0,
            cal_max: 0.0,
            xyz_units: UNITS_MM_SEC,
            quatern: [0.0; 3],
        })
    }

    /// Parse a header from raw bytes.
    ///
    /// Returns the header and whether the file is little-endian, detected
    /// from the `sizeof_hdr` field.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, bool), VolumeError> {
        if bytes.len() < Self::SIZE {
            return Err(VolumeError::Truncated {
                required: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let size_le = LittleEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]);
        if size_le == Self::SIZE as i32 {
            return Ok((Self::parse::<LittleEndian>(bytes)?, true));
        }
        let size_be = BigEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]);
        if size_be == Self::SIZE as i32 {
            return Ok((Self::parse::<BigEndian>(bytes)?, false));
        }
        Err(VolumeError::BadHeaderSize(size_le))
    }

    /// Read just the header of a volume file, leaving the buffer untouched.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
        let mut file = File::open(path.as_ref())?;
        let mut bytes = [0u8; Self::SIZE];
        file.read_exact(&mut bytes)?;
        let (header, _) = Self::from_bytes(&bytes)?;
        Ok(header)
    }

    fn parse<E: ByteOrder>(bytes: &[u8]) -> Result<Self, VolumeError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[offsets::MAGIC..offsets::MAGIC + 4]);
        if &magic != Self::MAGIC {
            return Err(VolumeError::BadMagic(magic));
        }

        let ndim = E::read_i16(&bytes[offsets::DIM..]);
        if !(1..=4).contains(&ndim) {
            return Err(VolumeError::InvalidDimensions(format!(
                "rank {ndim} outside 1..=4"
            )));
        }
        let ndim = ndim as usize;

        let mut dim = [1usize; 4];
        let mut pixdim = [1f32; 4];
        for i in 0..ndim {
            let d = E::read_i16(&bytes[offsets::DIM + 2 * (i + 1)..]);
            if d <= 0 {
                return Err(VolumeError::InvalidDimensions(format!(
                    "dimension {i} is {d}"
                )));
            }
            dim[i] = d as usize;
            pixdim[i] = E::read_f32(&bytes[offsets::PIXDIM + 4 * (i + 1)..]);
        }

        let datatype = Datatype::from_code(E::read_i16(&bytes[offsets::DATATYPE..]))?;

        Ok(Self {
            ndim,
            dim,
            pixdim,
            datatype,
            cal_min: E::read_f32(&bytes[offsets::CAL_MIN..]),
            cal_max: E::read_f32(&bytes[offsets::CAL_MAX..]),
            xyz_units: bytes[offsets::XYZT_UNITS],
            quatern: [
                E::read_f32(&bytes[offsets::QUATERN_B..]),
                E::read_f32(&bytes[offsets::QUATERN_C..]),
                E::read_f32(&bytes[offsets::QUATERN_D..]),
            ],
        })
    }

    /// Encode the header, always little-endian.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        LittleEndian::write_i32(&mut b[offsets::SIZEOF_HDR..], Self::SIZE as i32);
        LittleEndian::write_i16(&mut b[offsets::DIM..], self.ndim as i16);
        for i in 0..4 {
            LittleEndian::write_i16(&mut b[offsets::DIM + 2 * (i + 1)..], self.dim[i] as i16);
            LittleEndian::write_f32(&mut b[offsets::PIXDIM + 4 * (i + 1)..], self.pixdim[i]);
        }
        for i in 5..8 {
            LittleEndian::write_i16(&mut b[offsets::DIM + 2 * i..], 1);
        }
        // pixdim[0] is the qform handedness factor
        LittleEndian::write_f32(&mut b[offsets::PIXDIM..], 1.0);
        LittleEndian::write_i16(&mut b[offsets::DATATYPE..], self.datatype.code());
        LittleEndian::write_i16(
            &mut b[offsets::BITPIX..],
            (self.datatype.byte_size() * 8) as i16,
        );
        LittleEndian::write_f32(&mut b[offsets::VOX_OFFSET..], Self::VOX_OFFSET as f32);
        LittleEndian::write_f32(&mut b[offsets::SCL_SLOPE..], 1.0);
        b[offsets::XYZT_UNITS] = self.xyz_units;
        LittleEndian::write_f32(&mut b[offsets::CAL_MAX..], self.cal_max);
        LittleEndian::write_f32(&mut b[offsets::CAL_MIN..], self.cal_min);
        LittleEndian::write_i16(&mut b[offsets::QFORM_CODE..], 1);
        LittleEndian::write_f32(&mut b[offsets::QUATERN_B..], self.quatern[0]);
        LittleEndian::write_f32(&mut b[offsets::QUATERN_C..], self.quatern[1]);
        LittleEndian::write_f32(&mut b[offsets::QUATERN_D..], self.quatern[2]);
        b[offsets::MAGIC..offsets::MAGIC + 4].copy_from_slice(Self::MAGIC);
        b
    }

    /// Number of voxels, or None if the product overflows.
    pub fn element_count(&self) -> Option<usize> {
        self.dim
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Size of the voxel buffer in bytes.
    pub fn data_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.datatype.byte_size())
    }

    /// Rotation matrix mapping voxel-index axes to scanner axes, derived
    /// from the orientation quaternion with `a = sqrt(1 - b² - c² - d²)`.
    pub fn rotation_matrix(&self) -> [[f32; 3]; 3] {
        let [b, c, d] = self.quatern;
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        [
            [
                a * a + b * b - c * c - d * d,
                2.0 * b * c - 2.0 * a * d,
                2.0 * b * d + 2.0 * a * c,
            ],
            [
                2.0 * b * c + 2.0 * a * d,
                a * a + c * c - b * b - d * d,
                2.0 * c * d - 2.0 * a * b,
            ],
            [
                2.0 * b * d - 2.0 * a * c,
                2.0 * c * d + 2.0 * a * b,
                a * a + d * d - c * c - b * b,
            ],
        ]
    }
}
