use chrono::{DateTime, TimeDelta, Utc};

use crate::types::{Sample, Value};

use super::SampleStream;

/// How a grid point between two real samples gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMode {
    /// Linear interpolation between the neighbors; non-numeric neighbors carry the left value.
    Linear,
    /// The left neighbor's value.
    Fill,
}

/// Resamples a stream onto an epoch-aligned grid of `period`.
///
/// The grid starts at the first grid point at or after the first sample and ends at the last
/// sample. Real samples that fall exactly on the grid are emitted unchanged. Real samples between
/// grid points are passed through when `drop_extra` is false and discarded otherwise.
pub struct Resampler {
    parent: SampleStream,
    mode: ResampleMode,
    period: TimeDelta,
    drop_extra: bool,
    left: Option<Sample>,
    right: Option<Sample>,
    next_grid: Option<DateTime<Utc>>,
    exhausted: bool,
}

impl Resampler {
    pub fn new(parent: SampleStream, mode: ResampleMode, period: TimeDelta, drop_extra: bool) -> Self {
        Self {
            parent,
            mode,
            period,
            drop_extra,
            left: None,
            right: None,
            next_grid: None,
            exhausted: false,
        }
    }

    fn grid_value(&self, left: &Sample, right: &Sample, at: DateTime<Utc>) -> Value {
        match self.mode {
            ResampleMode::Fill => left.value.clone(),
            ResampleMode::Linear => match (left.value.as_f64(), right.value.as_f64()) {
                (Some(l), Some(r)) => {
                    let span = (right.time - left.time).num_milliseconds() as f64;
                    let offset = (at - left.time).num_milliseconds() as f64;
                    Value::Float(l + (r - l) * offset / span)
                }
                _ => left.value.clone(),
            },
        }
    }
}

/// First multiple of `period` (counted from the Unix epoch) at or after `t`.
fn grid_ceil(t: DateTime<Utc>, period: TimeDelta) -> Option<DateTime<Utc>> {
    let p = period.num_seconds().max(1);
    let secs = t.timestamp();
    let floor = secs.div_euclid(p) * p;
    if floor == secs && t.timestamp_subsec_nanos() == 0 {
        Some(t)
    } else {
        DateTime::<Utc>::from_timestamp(floor.checked_add(p)?, 0)
    }
}

impl Iterator for Resampler {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        loop {
            if self.right.is_none() && !self.exhausted {
                self.right = self.parent.next();
                self.exhausted = self.right.is_none();
            }

            let right_time = self.right.as_ref().map(|s| s.time);
            match (self.next_grid, right_time) {
                (_, None) => return None,
                (None, Some(t)) => {
                    self.next_grid = Some(grid_ceil(t, self.period)?);
                }
                (Some(grid), Some(t)) if t <= grid => {
                    let sample = self.right.take()?;
                    self.left = Some(sample.clone());
                    if t == grid {
                        self.next_grid = grid.checked_add_signed(self.period);
                        return Some(sample);
                    }
                    if !self.drop_extra {
                        return Some(sample);
                    }
                }
                (Some(grid), Some(_)) => {
                    let (Some(left), Some(right)) = (self.left.as_ref(), self.right.as_ref()) else {
                        return None;
                    };
                    let value = self.grid_value(left, right, grid);
                    self.next_grid = grid.checked_add_signed(self.period);
                    return Some(Sample::new(grid, value));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 2, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(min)
    }

    fn run(samples: Vec<(i64, Value)>, mode: ResampleMode, period_min: i64, drop_extra: bool) -> Vec<(i64, Value)> {
        let parent: SampleStream = Box::new(
            samples
                .into_iter()
                .map(|(m, v)| Sample::new(at(m), v))
                .collect::<Vec<_>>()
                .into_iter(),
        );
        Resampler::new(parent, mode, TimeDelta::minutes(period_min), drop_extra)
            .map(|s| ((s.time - at(0)).num_minutes(), s.value))
            .collect()
    }

    #[test]
    fn interpolates_the_exact_midpoint() {
        let out = run(
            vec![(0, Value::Integer(10)), (10, Value::Integer(20))],
            ResampleMode::Linear,
            5,
            false,
        );
        assert_eq!(
            out,
            vec![(0, Value::Integer(10)), (5, Value::Float(15.0)), (10, Value::Integer(20))]
        );
    }

    #[test]
    fn off_grid_samples_pass_through_unless_dropped() {
        let samples = vec![
            (2, Value::Float(2.0)),
            (7, Value::Float(7.0)),
            (13, Value::Float(13.0)),
        ];
        let kept = run(samples.clone(), ResampleMode::Linear, 5, false);
        assert_eq!(
            kept,
            vec![
                (2, Value::Float(2.0)),
                (5, Value::Float(5.0)),
                (7, Value::Float(7.0)),
                (10, Value::Float(10.0)),
                (13, Value::Float(13.0)),
            ]
        );

        let dropped = run(samples, ResampleMode::Linear, 5, true);
        assert_eq!(dropped, vec![(5, Value::Float(5.0)), (10, Value::Float(10.0))]);
    }

    #[test]
    fn fill_carries_the_left_value_across_gaps() {
        let out = run(
            vec![(0, Value::Float(1.0)), (20, Value::Float(2.0))],
            ResampleMode::Fill,
            5,
            true,
        );
        assert_eq!(
            out,
            vec![
                (0, Value::Float(1.0)),
                (5, Value::Float(1.0)),
                (10, Value::Float(1.0)),
                (15, Value::Float(1.0)),
                (20, Value::Float(2.0)),
            ]
        );
    }

    #[test]
    fn non_numeric_neighbors_carry_the_left_value() {
        let out = run(
            vec![(0, Value::Null), (10, Value::Float(2.0))],
            ResampleMode::Linear,
            5,
            false,
        );
        assert_eq!(out[1], (5, Value::Null));
    }

    #[test]
    fn empty_streams_stay_empty() {
        assert!(run(Vec::new(), ResampleMode::Fill, 5, false).is_empty());
    }
}
