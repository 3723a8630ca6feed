//! Retransmission interval strategies
//!
//! - Static: walk a fixed list of delays, then repeat the last one
//! - Exponential: start at `initial`, double on every call, cap at `max`
//!
//! Each outstanding retransmission range owns its own copy (`fresh()`), so
//! backoff progresses per range, not globally.

use std::time::Duration;

use super::errors::{WindowError, WindowResult};

/// Produces successive retransmission delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interval {
    Static {
        values: Vec<Duration>,
        index: usize,
    },
    Exponential {
        initial: Duration,
        max: Duration,
        current: Duration,
    },
}

impl Interval {
    /// Static list of delays. The list must not be empty.
    pub fn static_list(values: Vec<Duration>) -> WindowResult<Self> {
        if values.is_empty() {
            return Err(WindowError::InvalidInterval(
                "static interval needs at least one value".into(),
            ));
        }
        Ok(Interval::Static { values, index: 0 })
    }

    /// Exponential backoff from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> WindowResult<Self> {
        if initial.is_zero() || initial > max {
            return Err(WindowError::InvalidInterval(format!(
                "exponential interval needs 0 < initial <= max (initial={:?}, max={:?})",
                initial, max
            )));
        }
        Ok(Interval::Exponential {
            initial,
            max,
            current: initial,
        })
    }

    /// Next delay.
    pub fn next(&mut self) -> Duration {
        match self {
            Interval::Static { values, index } => {
                let last = values.len() - 1;
                let value = values[(*index).min(last)];
                if *index < last {
                    *index += 1;
                }
                value
            }
            Interval::Exponential { max, current, .. } => {
                let value = *current;
                *current = current.saturating_mul(2).min(*max);
                value
            }
        }
    }

    /// A copy starting from the beginning.
    pub fn fresh(&self) -> Interval {
        match self {
            Interval::Static { values, .. } => Interval::Static {
                values: values.clone(),
                index: 0,
            },
            Interval::Exponential { initial, max, .. } => Interval::Exponential {
                initial: *initial,
                max: *max,
                current: *initial,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_exponential_doubles_to_ceiling() {
        let mut i = Interval::exponential(ms(1000), ms(15000)).unwrap();
        let seen: Vec<u64> = (0..6).map(|_| i.next().as_millis() as u64).collect();
        assert_eq!(seen, vec![1000, 2000, 4000, 8000, 15000, 15000]);
    }

    #[test]
    fn test_static_repeats_last() {
        let mut i = Interval::static_list(vec![ms(100), ms(200), ms(400)]).unwrap();
        let seen: Vec<u64> = (0..5).map(|_| i.next().as_millis() as u64).collect();
        assert_eq!(seen, vec![100, 200, 400, 400, 400]);
    }

    #[test]
    fn test_fresh_restarts() {
        let mut i = Interval::exponential(ms(10), ms(100)).unwrap();
        i.next();
        i.next();
        let mut f = i.fresh();
        assert_eq!(f.next(), ms(10));
        assert_eq!(i.next(), ms(40));
    }

    #[test]
    fn test_invalid_intervals_rejected() {
        assert!(Interval::static_list(vec![]).is_err());
        assert!(Interval::exponential(ms(200), ms(100)).is_err());
        assert!(Interval::exponential(Duration::ZERO, ms(100)).is_err());
    }
}
