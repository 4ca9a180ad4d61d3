//! Per-voxel fiber direction fields from DTI eigenvectors or DSI
//! orientation distribution functions.
//!
//! Both reconstructions emit the same record layout: [`MAX_PEAKS`] slots of
//! (volume fraction, x, y, z) per voxel, unused slots zero.

use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use ndarray::{ArrayView1, ArrayViewMut1, Axis, Zip};
use thiserror::Error;

use crate::header::{UNITS_MM_SEC, VolumeHeader};
use crate::volume::{Volume, VolumeError};

/// Peak slots retained per voxel.
pub const MAX_PEAKS: usize = 3;

/// Channels per output voxel: one (fraction, x, y, z) group per peak slot.
pub const PEAK_CHANNELS: usize = 4 * MAX_PEAKS;

/// Rotation the acquisition protocol normally produces; anything else is
/// reported but still processed.
const EXPECTED_ROTATION: [[f32; 3]; 3] =
    [[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]];

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("volume fraction threshold {0} outside [0, 1]")]
    ThresholdOutOfRange(f32),

    #[error("unexpected volume shape: {0}")]
    BadShape(String),

    #[error("ODF and maxima volumes have different geometry: {0}")]
    GeometryMismatch(String),

    #[error("invalid direction table: {0}")]
    BadTable(String),

    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Axis-inversion switches; an enabled flag negates that output component.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct AxisFlips {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl AxisFlips {
    fn signs(self) -> [f32; 3] {
        [
            if self.x { -1.0 } else { 1.0 },
            if self.y { -1.0 } else { 1.0 },
            if self.z { -1.0 } else { 1.0 },
        ]
    }
}

/// ODF sampling directions, loaded once per run.
pub struct DirectionTable {
    directions: Vec<[f32; 3]>,
}

impl DirectionTable {
    /// Load a flat little-endian f32 file of x,y,z triplets.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReconstructError> {
        let bytes = fs::read(path.as_ref())?;
        if bytes.is_empty() || bytes.len() % 12 != 0 {
            return Err(ReconstructError::BadTable(format!(
                "{} bytes is not a whole number of direction triplets",
                bytes.len()
            )));
        }
        let directions = bytes
            .chunks_exact(12)
            .map(|t| {
                [
                    LittleEndian::read_f32(&t[0..4]),
                    LittleEndian::read_f32(&t[4..8]),
                    LittleEndian::read_f32(&t[8..12]),
                ]
            })
            .collect();
        Ok(Self { directions })
    }

    pub fn from_directions(directions: Vec<[f32; 3]>) -> Self {
        Self { directions }
    }

    pub fn len(&self) -> usize {
        self.directions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directions.is_empty()
    }

    /// Map every direction through the transpose of `rotation`, apply the
    /// axis-inversion signs, then negate the y component (the convention
    /// downstream tractography expects).
    fn reoriented(&self, rotation: &[[f32; 3]; 3], flips: AxisFlips) -> Vec<[f32; 3]> {
        let [sx, sy, sz] = flips.signs();
        self.directions
            .iter()
            .map(|v| {
                let mut w = [
                    sx * (v[0] * rotation[0][0] + v[1] * rotation[1][0] + v[2] * rotation[2][0]),
                    sy * (v[0] * rotation[0][1] + v[1] * rotation[1][1] + v[2] * rotation[2][1]),
                    sz * (v[0] * rotation[0][2] + v[1] * rotation[1][2] + v[2] * rotation[2][2]),
                ];
                w[1] = -w[1];
                w
            })
            .collect()
    }
}

/// Build a direction field from a principal-eigenvector volume (X,Y,Z,3).
///
/// Every voxel gets exactly one peak of weight 1.0 holding its normalized
/// eigenvector; a zero-norm vector keeps direction (0,0,0).
pub fn dti_direction_field(
    v1: &Volume<f32>,
    flips: AxisFlips,
) -> Result<Volume<f32>, ReconstructError> {
    let h = &v1.header;
    if h.ndim != 4 || h.dim[3] != 3 {
        return Err(ReconstructError::BadShape(format!(
            "eigenvector volume must be (X,Y,Z,3), got {:?}",
            &h.dim[..h.ndim]
        )));
    }

    let [sx, sy, sz] = flips.signs();
    let pixdim = [h.pixdim[0], h.pixdim[1], h.pixdim[2], 1.0];
    let mut out = direction_volume([h.dim[0], h.dim[1], h.dim[2]], pixdim, h)?;

    Zip::from(out.data.lanes_mut(Axis(3)))
        .and(v1.data.lanes(Axis(3)))
        .par_for_each(|mut rec, vec| {
            let (vx, vy, vz) = (vec[0], vec[1], vec[2]);
            let mut norm = (vx * vx + vy * vy + vz * vz).sqrt();
            if norm <= 0.0 {
                norm = 1.0;
            }
            rec[0] = 1.0;
            rec[1] = sx * vx / norm;
            rec[2] = sy * vy / norm;
            rec[3] = sz * vz / norm;
        });
    Ok(out)
}

/// Build a direction field from a sampled ODF volume (N,X,Y,Z) and its
/// marked local maxima.
///
/// Per voxel the ODF is normalized by its own range, marked maxima below
/// `vf_threshold` are dropped, the three largest survivors are kept and
/// their fractions normalized to sum to one.
pub fn dsi_direction_field(
    odf: &Volume<f32>,
    maxima: &Volume<i16>,
    table: &DirectionTable,
    flips: AxisFlips,
    vf_threshold: f32,
) -> Result<Volume<f32>, ReconstructError> {
    if !(0.0..=1.0).contains(&vf_threshold) {
        return Err(ReconstructError::ThresholdOutOfRange(vf_threshold));
    }
    let h = &odf.header;
    if h.ndim != 4 {
        return Err(ReconstructError::BadShape(format!(
            "ODF volume must be (N,X,Y,Z), got {:?}",
            &h.dim[..h.ndim]
        )));
    }
    if h.dim[0] != table.len() {
        return Err(ReconstructError::BadShape(format!(
            "ODF holds {} samples per voxel, direction table holds {}",
            h.dim[0],
            table.len()
        )));
    }
    check_geometry(h, &maxima.header)?;

    let rotation = h.rotation_matrix();
    if rotation != EXPECTED_ROTATION {
        log::warn!(
            "header rotation {rotation:?} differs from the usual {EXPECTED_ROTATION:?}; \
             reoriented directions may need review"
        );
    }
    let directions = table.reoriented(&rotation, flips);

    let pixdim = [h.pixdim[1], h.pixdim[2], h.pixdim[3], 1.0];
    let mut out = direction_volume([h.dim[1], h.dim[2], h.dim[3]], pixdim, h)?;

    Zip::from(out.data.lanes_mut(Axis(3)))
        .and(odf.data.lanes(Axis(0)))
        .and(maxima.data.lanes(Axis(0)))
        .par_for_each(|mut rec, amplitudes, markers| {
            dsi_voxel(&mut rec, &amplitudes, &markers, &directions, vf_threshold)
        });
    Ok(out)
}

/// Zeroed (X,Y,Z,12) field carrying the source volume's spatial metadata.
fn direction_volume(
    spatial: [usize; 3],
    pixdim: [f32; 4],
    src: &VolumeHeader,
) -> Result<Volume<f32>, ReconstructError> {
    let dims = [spatial[0], spatial[1], spatial[2], PEAK_CHANNELS];
    let mut out = Volume::<f32>::make(&dims, &pixdim)?;
    out.copy_header(src);
    out.header.pixdim = pixdim;
    out.header.cal_min = 0.0;
    out.header.cal_max = 1.0;
    out.header.xyz_units = UNITS_MM_SEC;
    Ok(out)
}

fn check_geometry(odf: &VolumeHeader, maxima: &VolumeHeader) -> Result<(), ReconstructError> {
    if maxima.ndim != odf.ndim
        || maxima.dim != odf.dim
        || maxima.pixdim[1..4] != odf.pixdim[1..4]
    {
        return Err(ReconstructError::GeometryMismatch(format!(
            "ODF is {:?} at {:?}, maxima is {:?} at {:?}",
            &odf.dim[..odf.ndim],
            &odf.pixdim[1..4],
            &maxima.dim[..maxima.ndim],
            &maxima.pixdim[1..4]
        )));
    }
    Ok(())
}

fn dsi_voxel(
    record: &mut ArrayViewMut1<f32>,
    amplitudes: &ArrayView1<f32>,
    markers: &ArrayView1<i16>,
    directions: &[[f32; 3]],
    vf_threshold: f32,
) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &a in amplitudes.iter() {
        min = min.min(a);
        max = max.max(a);
    }
    // a flat profile carries no maxima
    if min >= max {
        return;
    }
    let span = max - min;

    let mut fractions = [0f32; MAX_PEAKS];
    let mut picked = [0usize; MAX_PEAKS];
    for (i, (&a, &m)) in amplitudes.iter().zip(markers.iter()).enumerate() {
        if m != 1 {
            continue;
        }
        let value = (a - min) / span;
        if value < vf_threshold {
            continue;
        }
        // ranked insertion; an equal value never displaces an earlier peak
        for slot in 0..MAX_PEAKS {
            if value > fractions[slot] {
                for k in (slot + 1..MAX_PEAKS).rev() {
                    fractions[k] = fractions[k - 1];
                    picked[k] = picked[k - 1];
                }
                fractions[slot] = value;
                picked[slot] = i;
                break;
            }
        }
    }

    let sum: f32 = fractions.iter().sum();
    if sum > 0.0 {
        for f in &mut fractions {
            *f /= sum;
        }
    }

    for slot in 0..MAX_PEAKS {
        if fractions[slot] <= 0.0 {
            continue;
        }
        let d = directions[picked[slot]];
        record[4 * slot] = fractions[slot];
        record[4 * slot + 1] = d[0];
        record[4 * slot + 2] = d[1];
        record[4 * slot + 3] = d[2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    fn record(field: &Volume<f32>, x: usize, y: usize, z: usize) -> Vec<f32> {
        (0..PEAK_CHANNELS).map(|c| field.data[[x, y, z, c]]).collect()
    }

    #[test]
    fn dti_normalizes_each_eigenvector() {
        let mut v1 = Volume::<f32>::make(&[1, 1, 2, 3], &[2.0, 2.0, 2.0, 1.0]).unwrap();
        v1.data[[0, 0, 0, 0]] = 1.0;
        v1.data[[0, 0, 1, 0]] = 3.0;
        v1.data[[0, 0, 1, 1]] = 4.0;

        let field = dti_direction_field(&v1, AxisFlips::default()).unwrap();

        assert_eq!(field.shape(), &[1, 1, 2, PEAK_CHANNELS]);
        let first = record(&field, 0, 0, 0);
        assert_eq!(&first[..4], &[1.0, 1.0, 0.0, 0.0]);
        assert!(first[4..].iter().all(|&v| v == 0.0));
        let second = record(&field, 0, 0, 1);
        assert_eq!(&second[..4], &[1.0, 0.6, 0.8, 0.0]);
    }

    #[test]
    fn dti_zero_vector_keeps_zero_direction() {
        let v1 = Volume::<f32>::make(&[1, 1, 1, 3], &[1.0; 4]).unwrap();
        let field = dti_direction_field(&v1, AxisFlips::default()).unwrap();
        assert_eq!(&record(&field, 0, 0, 0)[..4], &[1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn dti_flips_negate_components() {
        let mut v1 = Volume::<f32>::make(&[1, 1, 1, 3], &[1.0; 4]).unwrap();
        v1.data[[0, 0, 0, 0]] = 3.0;
        v1.data[[0, 0, 0, 1]] = 4.0;

        let flips = AxisFlips { x: true, y: true, z: false };
        let field = dti_direction_field(&v1, flips).unwrap();
        assert_eq!(&record(&field, 0, 0, 0)[..4], &[1.0, -0.6, -0.8, 0.0]);
    }

    #[test]
    fn dti_carries_spatial_metadata() {
        let mut v1 = Volume::<f32>::make(&[2, 2, 2, 3], &[0.5, 1.5, 2.5, 1.0]).unwrap();
        v1.header.quatern = [0.0, 0.0, 1.0];

        let field = dti_direction_field(&v1, AxisFlips::default()).unwrap();

        assert_eq!(field.header.pixdim, [0.5, 1.5, 2.5, 1.0]);
        assert_eq!(field.header.quatern, [0.0, 0.0, 1.0]);
        assert_eq!(field.header.cal_min, 0.0);
        assert_eq!(field.header.cal_max, 1.0);
        assert_eq!(field.header.xyz_units, UNITS_MM_SEC);
    }

    #[test]
    fn dti_rejects_non_eigenvector_shape() {
        let flat = Volume::<f32>::make(&[2, 2, 2], &[1.0; 3]).unwrap();
        assert!(matches!(
            dti_direction_field(&flat, AxisFlips::default()),
            Err(ReconstructError::BadShape(_))
        ));

        let wide = Volume::<f32>::make(&[2, 2, 2, 4], &[1.0; 4]).unwrap();
        assert!(matches!(
            dti_direction_field(&wide, AxisFlips::default()),
            Err(ReconstructError::BadShape(_))
        ));
    }

    /// One voxel, `amplitudes.len()` ODF samples, markers aligned.
    fn dsi_fixture(amplitudes: &[f32], markers: &[i16]) -> (Volume<f32>, Volume<i16>) {
        let n = amplitudes.len();
        let mut odf = Volume::<f32>::make(&[n, 1, 1, 1], &[1.0; 4]).unwrap();
        let mut max = Volume::<i16>::make(&[n, 1, 1, 1], &[1.0; 4]).unwrap();
        for i in 0..n {
            odf.data[[i, 0, 0, 0]] = amplitudes[i];
            max.data[[i, 0, 0, 0]] = markers[i];
        }
        (odf, max)
    }

    /// Directions [i, 0, 0] so the x channel identifies which index won.
    fn index_table(n: usize) -> DirectionTable {
        DirectionTable::from_directions((0..n).map(|i| [i as f32, 0.0, 0.0]).collect())
    }

    #[test]
    fn dsi_picks_three_largest_maxima() {
        let (odf, max) = dsi_fixture(&[0.0, 10.0, 2.0, 8.0, 5.0, 1.0], &[0, 1, 1, 1, 1, 0]);
        let field =
            dsi_direction_field(&odf, &max, &index_table(6), AxisFlips::default(), 0.0).unwrap();

        let rec = record(&field, 0, 0, 0);
        // winners by index, largest first
        assert_eq!(rec[1], 1.0);
        assert_eq!(rec[5], 3.0);
        assert_eq!(rec[9], 4.0);
        // normalized range values 1.0, 0.8, 0.5 scaled to sum to one
        assert!((rec[0] - 1.0 / 2.3).abs() < 1e-6);
        assert!((rec[4] - 0.8 / 2.3).abs() < 1e-6);
        assert!((rec[8] - 0.5 / 2.3).abs() < 1e-6);
        assert!((rec[0] + rec[4] + rec[8] - 1.0).abs() < 1e-6);
        assert!(rec[0] > rec[4] && rec[4] > rec[8]);
    }

    #[test]
    fn dsi_unmarked_samples_never_win() {
        // the global maximum is unmarked, so the runner-up takes slot 0
        let (odf, max) = dsi_fixture(&[0.0, 10.0, 8.0], &[0, 0, 1]);
        let field =
            dsi_direction_field(&odf, &max, &index_table(3), AxisFlips::default(), 0.0).unwrap();

        let rec = record(&field, 0, 0, 0);
        assert_eq!(rec[0], 1.0);
        assert_eq!(rec[1], 2.0);
        assert!(rec[4..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dsi_threshold_drops_weak_maxima() {
        let (odf, max) = dsi_fixture(&[0.0, 10.0, 2.0, 8.0, 5.0, 1.0], &[0, 1, 1, 1, 1, 0]);
        let field =
            dsi_direction_field(&odf, &max, &index_table(6), AxisFlips::default(), 1.0).unwrap();

        // only the full-range maximum survives a threshold of 1.0
        let rec = record(&field, 0, 0, 0);
        assert_eq!(rec[0], 1.0);
        assert_eq!(rec[1], 1.0);
        assert!(rec[4..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dsi_equal_values_keep_first_seen_order() {
        let (odf, max) = dsi_fixture(&[0.0, 10.0, 10.0, 4.0], &[0, 1, 1, 1]);
        let field =
            dsi_direction_field(&odf, &max, &index_table(4), AxisFlips::default(), 0.0).unwrap();

        let rec = record(&field, 0, 0, 0);
        assert_eq!(rec[1], 1.0);
        assert_eq!(rec[5], 2.0);
        assert_eq!(rec[9], 3.0);
        assert!((rec[0] - rec[4]).abs() < 1e-6);
    }

    #[test]
    fn dsi_flat_profile_leaves_voxel_empty() {
        let (odf, max) = dsi_fixture(&[5.0, 5.0, 5.0], &[1, 1, 1]);
        let field =
            dsi_direction_field(&odf, &max, &index_table(3), AxisFlips::default(), 0.0).unwrap();
        assert!(record(&field, 0, 0, 0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dsi_rejects_out_of_range_threshold() {
        let (odf, max) = dsi_fixture(&[0.0, 1.0], &[1, 1]);
        for vf in [-0.1, 1.5] {
            assert!(matches!(
                dsi_direction_field(&odf, &max, &index_table(2), AxisFlips::default(), vf),
                Err(ReconstructError::ThresholdOutOfRange(_))
            ));
        }
    }

    #[test]
    fn dsi_rejects_geometry_mismatch() {
        let (odf, _) = dsi_fixture(&[0.0, 1.0], &[1, 1]);
        let max = Volume::<i16>::make(&[2, 2, 1, 1], &[1.0; 4]).unwrap();
        assert!(matches!(
            dsi_direction_field(&odf, &max, &index_table(2), AxisFlips::default(), 0.0),
            Err(ReconstructError::GeometryMismatch(_))
        ));

        let spaced = Volume::<i16>::make(&[2, 1, 1, 1], &[1.0, 2.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            dsi_direction_field(&odf, &spaced, &index_table(2), AxisFlips::default(), 0.0),
            Err(ReconstructError::GeometryMismatch(_))
        ));
    }

    #[test]
    fn dsi_rejects_table_length_mismatch() {
        let (odf, max) = dsi_fixture(&[0.0, 1.0, 2.0], &[1, 1, 1]);
        assert!(matches!(
            dsi_direction_field(&odf, &max, &index_table(2), AxisFlips::default(), 0.0),
            Err(ReconstructError::BadShape(_))
        ));
    }

    #[test]
    fn reorientation_negates_y() {
        let table = DirectionTable::from_directions(vec![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
        let out = table.reoriented(&IDENTITY, AxisFlips::default());
        assert_eq!(out[0], [0.0, -1.0, 0.0]);
        assert_eq!(out[1], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn reorientation_applies_transposed_rotation_and_flips() {
        let table = DirectionTable::from_directions(vec![[1.0, 0.0, 0.0]]);

        let out = table.reoriented(&EXPECTED_ROTATION, AxisFlips::default());
        assert_eq!(out[0], [-1.0, 0.0, 0.0]);

        let flipped = table.reoriented(&EXPECTED_ROTATION, AxisFlips { x: true, y: false, z: false });
        assert_eq!(flipped[0], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn table_load_reads_triplets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vecs.dat");
        let mut bytes = Vec::new();
        for v in [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(&path, &bytes).unwrap();

        let table = DirectionTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.directions, vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
    }

    #[test]
    fn table_load_rejects_ragged_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vecs.dat");

        fs::write(&path, [0u8; 13]).unwrap();
        assert!(matches!(
            DirectionTable::load(&path),
            Err(ReconstructError::BadTable(_))
        ));

        fs::write(&path, []).unwrap();
        assert!(matches!(
            DirectionTable::load(&path),
            Err(ReconstructError::BadTable(_))
        ));
    }
}
