//! Learning-rate policies.
//!
//! The rate for an epoch is a pure function of the base rate, the epoch and
//! the configured policy. Applying it to an optimizer is the only side effect.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Optimizer;
use crate::error::ConfigError;

/// Decay shape for the per-epoch learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrPolicy {
    /// Keep the base rate for every epoch.
    Constant,
    /// Multiply by `decay_rate` once for every milestone the epoch has reached.
    Step { steps: Vec<u32>, decay_rate: f64 },
    /// `base * gamma^epoch`.
    Exponential { gamma: f64 },
}

impl Default for LrPolicy {
    fn default() -> Self {
        LrPolicy::Step {
            steps: vec![3, 4, 5, 6],
            decay_rate: 0.5,
        }
    }
}

impl LrPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            LrPolicy::Constant => Ok(()),
            LrPolicy::Step { decay_rate, .. } => {
                if !decay_rate.is_finite() || *decay_rate <= 0.0 {
                    return Err(ConfigError::invalid(
                        "solver.lr_policy.decay_rate",
                        "must be a finite value > 0",
                    ));
                }
                Ok(())
            }
            LrPolicy::Exponential { gamma } => {
                if !gamma.is_finite() || *gamma <= 0.0 {
                    return Err(ConfigError::invalid(
                        "solver.lr_policy.gamma",
                        "must be a finite value > 0",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Learning rate for `epoch` given the configured base rate.
    pub fn learning_rate(&self, base_lr: f64, epoch: u32) -> f64 {
        match self {
            LrPolicy::Constant => base_lr,
            LrPolicy::Step { steps, decay_rate } => {
                let reached = steps.iter().filter(|&&step| epoch >= step).count();
                base_lr * decay_rate.powi(i32::try_from(reached).unwrap_or(i32::MAX))
            }
            LrPolicy::Exponential { gamma } => {
                base_lr * gamma.powi(i32::try_from(epoch).unwrap_or(i32::MAX))
            }
        }
    }
}

/// Recompute the rate for `epoch` and push it into every parameter group,
/// scaled by that group's multiplier. Returns the unscaled rate.
pub fn adjust_learning_rate(
    optimizer: &mut dyn Optimizer,
    policy: &LrPolicy,
    base_lr: f64,
    epoch: u32,
) -> f64 {
    let lr = policy.learning_rate(base_lr, epoch);
    let groups: Vec<(String, f64)> = optimizer
        .param_groups()
        .iter()
        .map(|g| (g.name.clone(), g.lr_mult))
        .collect();
    for (index, (name, mult)) in groups.into_iter().enumerate() {
        optimizer.set_group_lr(index, lr * mult);
        debug!(
            epoch,
            group = %name,
            lr = ?optimizer.group_lr(index),
            "learning rate applied"
        );
    }
    lr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DetectionModel, ParameterGroup, StateBlob};

    #[test]
    fn test_constant_ignores_epoch() {
        let policy = LrPolicy::Constant;
        assert_eq!(policy.learning_rate(1e-3, 0), 1e-3);
        assert_eq!(policy.learning_rate(1e-3, 50), 1e-3);
    }

    #[test]
    fn test_step_counts_reached_milestones() {
        let policy = LrPolicy::default();
        assert_eq!(policy.learning_rate(1e-4, 1), 1e-4);
        assert_eq!(policy.learning_rate(1e-4, 2), 1e-4);
        assert_eq!(policy.learning_rate(1e-4, 3), 5e-5);
        assert_eq!(policy.learning_rate(1e-4, 4), 2.5e-5);
        assert_eq!(policy.learning_rate(1e-4, 10), 6.25e-6);
    }

    #[test]
    fn test_step_milestones_need_not_be_sorted() {
        let policy = LrPolicy::Step {
            steps: vec![5, 2],
            decay_rate: 0.1,
        };
        let lr = policy.learning_rate(1.0, 3);
        assert!((lr - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_exponential() {
        let policy = LrPolicy::Exponential { gamma: 0.5 };
        assert_eq!(policy.learning_rate(8.0, 3), 1.0);
    }

    #[test]
    fn test_exponential_stays_decayed_at_huge_epochs() {
        let policy = LrPolicy::Exponential { gamma: 0.5 };
        assert_eq!(policy.learning_rate(1.0, u32::MAX), 0.0);
        assert_eq!(policy.learning_rate(1.0, i32::MAX as u32 + 1), 0.0);
    }

    #[test]
    fn test_step_never_exceeds_base_at_huge_epochs() {
        let policy = LrPolicy::Step {
            steps: vec![1, 2],
            decay_rate: 0.5,
        };
        assert_eq!(policy.learning_rate(1.0, u32::MAX), 0.25);
    }

    struct Groups {
        groups: Vec<ParameterGroup>,
        lrs: Vec<f64>,
    }

    impl Optimizer for Groups {
        fn param_groups(&self) -> &[ParameterGroup] {
            &self.groups
        }

        fn set_group_lr(&mut self, index: usize, lr: f64) {
            self.lrs[index] = lr;
        }

        fn group_lr(&self, index: usize) -> Option<f64> {
            self.lrs.get(index).copied()
        }

        fn zero_grad(&mut self, _: &mut dyn DetectionModel) {}

        fn step(&mut self, _: &mut dyn DetectionModel) -> anyhow::Result<()> {
            Ok(())
        }

        fn state(&self) -> anyhow::Result<StateBlob> {
            Ok(StateBlob::default())
        }

        fn load_state(&mut self, _: &StateBlob) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_adjust_scales_each_group() {
        let mut optimizer = Groups {
            groups: vec![
                ParameterGroup::new("backbone", 0.1, 4),
                ParameterGroup::new("head", 1.0, 2),
            ],
            lrs: vec![0.0; 2],
        };
        let lr = adjust_learning_rate(&mut optimizer, &LrPolicy::default(), 1e-3, 3);

        assert_eq!(lr, 5e-4);
        assert_eq!(optimizer.group_lr(0), Some(5e-4 * 0.1));
        assert_eq!(optimizer.group_lr(1), Some(5e-4));
        assert_eq!(optimizer.group_lr(2), None);
    }

    #[test]
    fn test_validate_rejects_non_positive_decay() {
        let policy = LrPolicy::Step {
            steps: vec![1],
            decay_rate: 0.0,
        };
        assert!(policy.validate().is_err());
        assert!(LrPolicy::Exponential { gamma: f64::INFINITY }.validate().is_err());
    }
}
