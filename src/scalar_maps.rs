//! Scalar summary maps reduced from 4-D acquisitions.

use ndarray::{Axis, Zip};
use thiserror::Error;

use crate::header::UNITS_MM_SEC;
use crate::volume::{Volume, VolumeError};

#[derive(Debug, Error)]
pub enum ScalarMapError {
    #[error("channel axis holds {found} volumes, expected {expected}")]
    ChannelCountMismatch { expected: usize, found: usize },

    #[error("unexpected volume shape: {0}")]
    BadShape(String),

    #[error("moment {0} outside 2..=4")]
    InvalidMoment(u32),

    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),
}

/// Reduce a diffusion-weighted volume (X,Y,Z,C) to a per-voxel signal
/// decay map: the channel sum divided by the b0 reference in channel 0.
///
/// Voxels with a non-positive reference map to 0. The calibration range of
/// the output spans [0, C], the value a decay-free voxel would reach.
pub fn signal_decay_map(
    dwi: &Volume<i16>,
    expected_channels: usize,
) -> Result<Volume<f32>, ScalarMapError> {
    let h = &dwi.header;
    if h.ndim != 4 {
        return Err(ScalarMapError::BadShape(format!(
            "diffusion volume must be (X,Y,Z,C), got {:?}",
            &h.dim[..h.ndim]
        )));
    }
    if h.dim[3] != expected_channels {
        return Err(ScalarMapError::ChannelCountMismatch {
            expected: expected_channels,
            found: h.dim[3],
        });
    }

    let mut out = Volume::<f32>::make(
        &[h.dim[0], h.dim[1], h.dim[2]],
        &[h.pixdim[0], h.pixdim[1], h.pixdim[2]],
    )?;
    out.copy_header(h);
    out.header.pixdim = [h.pixdim[0], h.pixdim[1], h.pixdim[2], 1.0];
    out.header.cal_min = 0.0;
    out.header.cal_max = expected_channels as f32;
    out.header.xyz_units = UNITS_MM_SEC;

    Zip::from(&mut out.data)
        .and(dwi.data.lanes(Axis(3)))
        .par_for_each(|p, channels| {
            let reference = channels[0] as f32;
            *p = if reference > 0.0 {
                let total: f32 = channels.iter().map(|&v| v as f32).sum();
                total / reference
            } else {
                0.0
            };
        });
    Ok(out)
}

/// Reduce a sampled ODF volume (N,X,Y,Z) to its per-voxel standardized
/// moment: 2 is the generalized fractional anisotropy, 3 skewness, 4
/// kurtosis.
///
/// Per voxel the samples are normalized to fractions of their sum; voxels
/// whose sum is not positive map to 0, voxels whose m-th power mean
/// vanishes map to -1.
pub fn odf_moment_map(odf: &Volume<f32>, moment: u32) -> Result<Volume<f32>, ScalarMapError> {
    if !(2..=4).contains(&moment) {
        return Err(ScalarMapError::InvalidMoment(moment));
    }
    let h = &odf.header;
    if h.ndim != 4 {
        return Err(ScalarMapError::BadShape(format!(
            "ODF volume must be (N,X,Y,Z), got {:?}",
            &h.dim[..h.ndim]
        )));
    }
    let n = h.dim[0];
    if n < 2 {
        return Err(ScalarMapError::BadShape(format!(
            "moment needs at least 2 ODF samples, got {n}"
        )));
    }

    let mut out = Volume::<f32>::make(
        &[h.dim[1], h.dim[2], h.dim[3]],
        &[h.pixdim[1], h.pixdim[2], h.pixdim[3]],
    )?;
    out.copy_header(h);
    out.header.pixdim = [h.pixdim[1], h.pixdim[2], h.pixdim[3], 1.0];
    out.header.cal_min = 0.0;
    out.header.cal_max = 1.0;
    out.header.xyz_units = UNITS_MM_SEC;

    let mean = 1.0 / n as f32;
    let exponent = 1.0 / moment as f32;
    let power = moment as i32;

    Zip::from(&mut out.data)
        .and(odf.data.lanes(Axis(0)))
        .par_for_each(|g, amplitudes| {
            let total: f32 = amplitudes.sum();
            if total <= 0.0 {
                return;
            }
            let mut centered = 0.0f32;
            let mut raw = 0.0f32;
            for &a in amplitudes.iter() {
                let p = a / total;
                centered += (p - mean).powi(power);
                raw += p.powi(power);
            }
            centered /= (n - 1) as f32;
            raw /= n as f32;

            // odd moments keep their sign through the root
            let sign = if moment == 3 && centered < 0.0 { -1.0 } else { 1.0 };
            *g = if raw > 0.0 {
                sign * (centered / raw).abs().powf(exponent)
            } else {
                -1.0
            };
        });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dwi_fixture(lanes: &[[i16; 4]]) -> Volume<i16> {
        let mut dwi = Volume::<i16>::make(&[lanes.len(), 1, 1, 4], &[2.0, 2.0, 2.0, 1.0]).unwrap();
        for (x, lane) in lanes.iter().enumerate() {
            for (c, &v) in lane.iter().enumerate() {
                dwi.data[[x, 0, 0, c]] = v;
            }
        }
        dwi
    }

    #[test]
    fn decay_divides_channel_sum_by_reference() {
        let dwi = dwi_fixture(&[[2, 4, 6, 8], [0, 5, 5, 5], [-3, 5, 5, 5]]);
        let map = signal_decay_map(&dwi, 4).unwrap();

        assert_eq!(map.shape(), &[3, 1, 1]);
        assert_eq!(map.data[[0, 0, 0]], 10.0);
        // non-positive reference zeroes the voxel
        assert_eq!(map.data[[1, 0, 0]], 0.0);
        assert_eq!(map.data[[2, 0, 0]], 0.0);
    }

    #[test]
    fn decay_header_spans_channel_count() {
        let dwi = dwi_fixture(&[[1, 1, 1, 1]]);
        let map = signal_decay_map(&dwi, 4).unwrap();

        assert_eq!(map.header.ndim, 3);
        assert_eq!(map.header.pixdim, [2.0, 2.0, 2.0, 1.0]);
        assert_eq!(map.header.cal_min, 0.0);
        assert_eq!(map.header.cal_max, 4.0);
        assert_eq!(map.header.xyz_units, UNITS_MM_SEC);
    }

    #[test]
    fn decay_rejects_channel_mismatch() {
        let dwi = dwi_fixture(&[[1, 1, 1, 1]]);
        assert!(matches!(
            signal_decay_map(&dwi, 515),
            Err(ScalarMapError::ChannelCountMismatch { expected: 515, found: 4 })
        ));
    }

    #[test]
    fn decay_rejects_flat_volumes() {
        let flat = Volume::<i16>::make(&[2, 2, 2], &[1.0; 3]).unwrap();
        assert!(matches!(
            signal_decay_map(&flat, 4),
            Err(ScalarMapError::BadShape(_))
        ));
    }

    fn odf_fixture(lanes: &[Vec<f32>]) -> Volume<f32> {
        let n = lanes[0].len();
        let mut odf = Volume::<f32>::make(&[n, lanes.len(), 1, 1], &[1.0; 4]).unwrap();
        for (x, lane) in lanes.iter().enumerate() {
            for (i, &v) in lane.iter().enumerate() {
                odf.data[[i, x, 0, 0]] = v;
            }
        }
        odf
    }

    #[test]
    fn gfa_is_zero_for_uniform_profiles() {
        let odf = odf_fixture(&[vec![3.0, 3.0, 3.0, 3.0]]);
        let map = odf_moment_map(&odf, 2).unwrap();
        assert_eq!(map.data[[0, 0, 0]], 0.0);
    }

    #[test]
    fn gfa_is_one_for_a_single_spike() {
        // p = (1, 0): centered and raw power means are both 0.5
        let odf = odf_fixture(&[vec![1.0, 0.0]]);
        let map = odf_moment_map(&odf, 2).unwrap();
        assert!((map.data[[0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_profile_maps_to_zero() {
        let odf = odf_fixture(&[vec![0.0, 0.0, 0.0]]);
        let map = odf_moment_map(&odf, 2).unwrap();
        assert_eq!(map.data[[0, 0, 0]], 0.0);
    }

    #[test]
    fn skewness_keeps_its_sign() {
        let spiked = odf_fixture(&[vec![1.0, 0.0, 0.0]]);
        let high = odf_moment_map(&spiked, 3).unwrap();
        assert!(high.data[[0, 0, 0]] > 0.0);

        let dented = odf_fixture(&[vec![0.0, 1.0, 1.0]]);
        let low = odf_moment_map(&dented, 3).unwrap();
        assert!(low.data[[0, 0, 0]] < 0.0);
    }

    #[test]
    fn kurtosis_of_known_profile() {
        // p = (1, 0): centered mean (2 * 0.5^4) / 1, raw mean 1 / 2
        let odf = odf_fixture(&[vec![1.0, 0.0]]);
        let map = odf_moment_map(&odf, 4).unwrap();
        let expected = (0.125f32 / 0.5).powf(0.25);
        assert!((map.data[[0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn moment_outside_range_is_rejected() {
        let odf = odf_fixture(&[vec![1.0, 2.0]]);
        for m in [0, 1, 5] {
            assert!(matches!(
                odf_moment_map(&odf, m),
                Err(ScalarMapError::InvalidMoment(_))
            ));
        }
    }

    #[test]
    fn moment_needs_two_samples() {
        let odf = Volume::<f32>::make(&[1, 2, 2, 2], &[1.0; 4]).unwrap();
        assert!(matches!(
            odf_moment_map(&odf, 2),
            Err(ScalarMapError::BadShape(_))
        ));
    }

    #[test]
    fn moment_carries_spatial_metadata() {
        let mut odf = Volume::<f32>::make(&[4, 2, 2, 2], &[1.0, 0.5, 1.5, 2.5]).unwrap();
        odf.header.quatern = [0.0, 0.0, 1.0];
        let map = odf_moment_map(&odf, 2).unwrap();

        assert_eq!(map.header.ndim, 3);
        assert_eq!(map.header.dim, [2, 2, 2, 1]);
        assert_eq!(map.header.pixdim, [0.5, 1.5, 2.5, 1.0]);
        assert_eq!(map.header.quatern, [0.0, 0.0, 1.0]);
        assert_eq!(map.header.cal_max, 1.0);
    }
}
