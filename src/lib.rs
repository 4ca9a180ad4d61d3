//! # DWI-volume library
//!
//! Post-processing for diffusion-weighted MRI datasets stored as
//! single-file volumes.
//!
//! Three reductions are provided on top of a small typed volume container:
//!  - per-voxel fiber direction fields from DTI principal eigenvectors or
//!    DSI orientation distribution functions ([`reconstruct`])
//!  - normalized signal-decay maps from raw diffusion acquisitions
//!    ([`scalar_maps::signal_decay_map`])
//!  - standardized ODF moment maps, generalized fractional anisotropy,
//!    skewness and kurtosis ([`scalar_maps::odf_moment_map`])
//!
//! Streamline sets produced by tractography over the direction fields are
//! written as TrackVis files ([`trackvis::TrackFile`]).
//!
//! Voxel buffers are `ndarray` arrays in row-major order; the per-voxel
//! reductions run in parallel through rayon. Volume files are written
//! little-endian and read in either byte order.
//!
//! # Examples
//!
//! Turn a principal-eigenvector volume into a direction field:
//!
//! ```no_run
//! use dwi_volume::{AxisFlips, Volume, dti_direction_field};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let v1 = Volume::<f32>::open("subject_v1.nii")?;
//! let field = dti_direction_field(&v1, AxisFlips::default())?;
//! field.save("subject_dir.nii")?;
//! # Ok(())
//! # }
//! ```

pub mod enums;
pub mod header;
pub mod reconstruct;
pub mod scalar_maps;
pub mod trackvis;
pub mod volume;

pub use enums::{Modality, SavePolicy};
pub use header::{Datatype, VolumeHeader};
pub use reconstruct::{
    AxisFlips, DirectionTable, MAX_PEAKS, PEAK_CHANNELS, ReconstructError, dsi_direction_field,
    dti_direction_field,
};
pub use scalar_maps::{ScalarMapError, odf_moment_map, signal_decay_map};
pub use trackvis::{MAX_TRACK_POINTS, TrackError, TrackFile, TrackHeader};
pub use volume::{Element, Volume, VolumeError};
