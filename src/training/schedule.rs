//! Annealed hyperparameter schedules.

use serde::{Deserialize, Serialize};

/// A scalar hyperparameter as a function of the global step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    Constant(f64),
    /// Geometric ramp from `start` to `end` over `steps` optimizer steps,
    /// clamped at `end` afterwards. Falls back to a linear ramp when the
    /// endpoints straddle zero (a geometric path is undefined there).
    Geometric { start: f64, end: f64, steps: usize },
}

impl Schedule {
    pub fn value_at(&self, step: usize) -> f64 {
        match *self {
            Schedule::Constant(value) => value,
            Schedule::Geometric { start, end, steps } => {
                if steps <= 1 || step + 1 >= steps {
                    return end;
                }
                let t = step as f64 / (steps as f64 - 1.0);
                if start > 0.0 && end > 0.0 {
                    start * (end / start).powf(t)
                } else {
                    start + (end - start) * t
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_never_moves() {
        let s = Schedule::Constant(0.7);
        assert_eq!(s.value_at(0), 0.7);
        assert_eq!(s.value_at(1_000_000), 0.7);
    }

    #[test]
    fn ramp_hits_both_endpoints_and_clamps() {
        let s = Schedule::Geometric {
            start: 1.0,
            end: 0.01,
            steps: 100,
        };
        assert!((s.value_at(0) - 1.0).abs() < 1e-9);
        assert!((s.value_at(99) - 0.01).abs() < 1e-9);
        assert!((s.value_at(5000) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn ramp_is_monotonic() {
        let s = Schedule::Geometric {
            start: 0.05,
            end: 1.0,
            steps: 50,
        };
        let mut prev = s.value_at(0);
        for step in 1..60 {
            let v = s.value_at(step);
            assert!(v >= prev - 1e-12, "step {step}: {v} < {prev}");
            prev = v;
        }
    }

    #[test]
    fn zero_start_falls_back_to_linear() {
        let s = Schedule::Geometric {
            start: 0.0,
            end: 1.0,
            steps: 11,
        };
        assert!((s.value_at(5) - 0.5).abs() < 1e-9);
    }
}
