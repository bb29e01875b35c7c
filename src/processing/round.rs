use crate::types::{Sample, Value};

use super::SampleStream;

/// Round `v` to `places` decimal places (negative `places` rounds to tens, hundreds, ...).
pub fn round_to_places(v: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    let rounded = (v * factor).round() / factor;
    if rounded.is_finite() { rounded } else { v }
}

/// Rounds float values; every other value passes through unchanged.
pub struct RoundOff {
    parent: SampleStream,
    places: i32,
}

impl RoundOff {
    pub fn new(parent: SampleStream, places: i32) -> Self {
        Self { parent, places }
    }
}

impl Iterator for RoundOff {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        let mut sample = self.parent.next()?;
        if let Value::Float(v) = sample.value {
            sample.value = Value::Float(round_to_places(v, self.places));
        }
        Some(sample)
    }
}
