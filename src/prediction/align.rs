//! Alignment of a camera-rate behaviour stream to neural timestamps.

use crate::core::{MapError, MapResult};
use ndarray::{s, Array2, ArrayView1, ArrayView2};

fn check_increasing(name: &str, times: ArrayView1<f64>) -> MapResult<()> {
    if times.is_empty() {
        return Err(MapError::InvalidInput(format!("{name} is empty")));
    }
    if times.iter().any(|t| !t.is_finite()) {
        return Err(MapError::InvalidInput(format!("{name} contains non-finite values")));
    }
    if times.iter().zip(times.iter().skip(1)).any(|(a, b)| b <= a) {
        return Err(MapError::InvalidInput(format!(
            "{name} must be strictly increasing"
        )));
    }
    Ok(())
}

/// Gaussian smoothing along time (rows), weights renormalised at the edges.
pub fn gaussian_smooth(x: ArrayView2<f32>, sigma: f32) -> Array2<f32> {
    if sigma <= 0.0 {
        return x.to_owned();
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let radius = (4.0 * sigma).ceil() as usize;
    let weights: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let d = i as f32 - radius as f32;
            (-0.5 * (d / sigma).powi(2)).exp()
        })
        .collect();

    let t_len = x.nrows();
    let mut out = Array2::<f32>::zeros(x.dim());
    for t in 0..t_len {
        let lo = t.saturating_sub(radius);
        let hi = (t + radius).min(t_len - 1);
        let mut norm = 0.0f32;
        let mut row = out.row_mut(t);
        for s in lo..=hi {
            let w = weights[s + radius - t];
            row.scaled_add(w, &x.row(s));
            norm += w;
        }
        row /= norm;
    }
    out
}

/// Resample behaviour (T_cam × p) at the neural timestamps.
///
/// Optional Gaussian smoothing (in camera samples) is applied first; values are then
/// linearly interpolated, and timestamps outside the camera range take the nearest
/// end sample.
///
/// # Errors
/// - `ShapeMismatch` if `behavior` and `time_cam` disagree in length
/// - `InvalidInput` if either timestamp vector is empty, non-finite, or not strictly increasing
pub fn resample(
    behavior: ArrayView2<f32>,
    time_cam: ArrayView1<f64>,
    time_neural: ArrayView1<f64>,
    smoothing_sigma: f32,
) -> MapResult<Array2<f32>> {
    if behavior.nrows() != time_cam.len() {
        return Err(MapError::ShapeMismatch(format!(
            "behaviour has {} samples, time_cam has {}",
            behavior.nrows(),
            time_cam.len()
        )));
    }
    check_increasing("time_cam", time_cam)?;
    check_increasing("time_neural", time_neural)?;

    let smoothed = gaussian_smooth(behavior, smoothing_sigma);
    let last = time_cam.len() - 1;
    let cam = time_cam.to_vec();

    let mut out = Array2::<f32>::zeros((time_neural.len(), behavior.ncols()));
    for (i, &t) in time_neural.iter().enumerate() {
        let upper = cam.partition_point(|&c| c <= t);
        let mut row = out.row_mut(i);
        if upper == 0 {
            row.assign(&smoothed.row(0));
        } else if upper > last {
            row.assign(&smoothed.row(last));
        } else {
            let (t0, t1) = (cam[upper - 1], cam[upper]);
            #[allow(clippy::cast_possible_truncation)]
            let frac = ((t - t0) / (t1 - t0)) as f32;
            row.assign(&smoothed.row(upper - 1));
            row *= 1.0 - frac;
            row.scaled_add(frac, &smoothed.row(upper));
        }
    }
    Ok(out)
}

/// Shift behaviour relative to neural activity by `delay` samples and trim both.
///
/// With a negative delay behaviour leads: behaviour at `t` is paired with neural
/// activity at `t - delay`. Both outputs have `T - |delay|` rows.
///
/// # Errors
/// - `ShapeMismatch` if the two streams have different lengths
/// - `InvalidInput` if `|delay|` leaves no samples
pub fn apply_delay(
    behavior: ArrayView2<f32>,
    neural: ArrayView2<f32>,
    delay: i64,
) -> MapResult<(Array2<f32>, Array2<f32>)> {
    let t_len = behavior.nrows();
    if neural.nrows() != t_len {
        return Err(MapError::ShapeMismatch(format!(
            "behaviour has {} timepoints after alignment, neural targets have {}",
            t_len,
            neural.nrows()
        )));
    }
    let shift = usize::try_from(delay.unsigned_abs()).unwrap_or(usize::MAX);
    if shift >= t_len {
        return Err(MapError::InvalidInput(format!(
            "delay {delay} leaves no samples out of {t_len}"
        )));
    }
    let keep = t_len - shift;
    if delay < 0 {
        Ok((
            behavior.slice(s![..keep, ..]).to_owned(),
            neural.slice(s![shift.., ..]).to_owned(),
        ))
    } else {
        Ok((
            behavior.slice(s![shift.., ..]).to_owned(),
            neural.slice(s![..keep, ..]).to_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_resample_interpolates_and_clamps() {
        let beh = array![[0.0], [10.0], [20.0]];
        let cam = array![0.0, 1.0, 2.0];
        let neural = array![-1.0, 0.5, 1.25, 3.0];
        let out = resample(beh.view(), cam.view(), neural.view(), 0.0).expect("resample");
        assert_eq!(out.column(0).to_vec(), vec![0.0, 5.0, 12.5, 20.0]);
    }

    #[test]
    fn test_resample_rejects_unsorted() {
        let beh = Array2::<f32>::zeros((3, 1));
        let cam = array![0.0, 2.0, 1.0];
        let neural = array![0.5];
        assert!(matches!(
            resample(beh.view(), cam.view(), neural.view(), 0.0),
            Err(MapError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_smoothing_preserves_constant() {
        let x = Array2::from_elem((20, 2), 3.0f32);
        let y = gaussian_smooth(x.view(), 2.0);
        assert!(y.iter().all(|v| (v - 3.0).abs() < 1e-5));
    }

    #[test]
    fn test_negative_delay_behaviour_leads() {
        let beh = Array1::from_iter((0..6).map(|v| v as f32)).insert_axis(ndarray::Axis(1));
        let neu = &beh * 10.0;
        let (b, n) = apply_delay(beh.view(), neu.view(), -2).expect("delay");
        assert_eq!(b.column(0).to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(n.column(0).to_vec(), vec![20.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_delay_shape_mismatch() {
        let beh = Array2::<f32>::zeros((5, 1));
        let neu = Array2::<f32>::zeros((4, 1));
        assert!(matches!(
            apply_delay(beh.view(), neu.view(), 0),
            Err(MapError::ShapeMismatch(_))
        ));
    }
}
