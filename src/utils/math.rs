//! Math utility functions

/// Softmax function
pub fn softmax(x: &[f64]) -> Vec<f64> {
    let max_val = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp_vals: Vec<f64> = x.iter().map(|v| (v - max_val).exp()).collect();
    let sum: f64 = exp_vals.iter().sum();
    exp_vals.iter().map(|v| v / sum).collect()
}

/// Clamp a latitude into [-90, 90]
pub fn clamp_latitude(lat: f64) -> f64 {
    lat.clamp(-90.0, 90.0)
}

/// Wrap a longitude into [-180, 180]
pub fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    // rem_euclid can land exactly on -180 for inputs like 540
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Clamp a probability into [0, 1]
pub fn clamp_probability(p: f64) -> f64 {
    p.clamp(0.0, 1.0)
}

/// True when every value is neither NaN nor infinite
pub fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}
