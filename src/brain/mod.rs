//! Value-function approximators
//!
//! [`Brain`] is the contract the policy agents consume; [`DeepQBrain`] is
//! the deep Q-learner served by default.

pub mod dqn;
pub mod network;
pub mod replay;

pub use dqn::{DeepQBrain, DqnSettings};
pub use network::{Activation, DenseLayer, DenseNetwork};
pub use replay::{AverageWindow, Experience, ExperienceReplay};

use crate::error::{Result, ValidationError};

/// Action chosen by a brain, with its value estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub action: usize,
    pub value: f64,
}

/// Decide/update/query/serialize contract of a value-function approximator
#[cfg_attr(test, mockall::automock)]
pub trait Brain: Send {
    /// Length of the feature vector accepted by `decide`/`query`
    fn num_inputs(&self) -> usize;

    /// Size of the full action space
    fn num_actions(&self) -> usize;

    fn is_learning(&self) -> bool;

    fn set_learning(&mut self, learning: bool);

    /// Probability of a non-greedy choice on the next decision
    fn exploration_rate(&self) -> f64;

    /// Pick an action from `mask`: epsilon-greedy while learning,
    /// greedy otherwise
    fn decide(&mut self, features: &[f64], mask: &[usize]) -> Result<Decision>;

    /// One temporal-difference step for the most recent decision
    fn update(&mut self, reward: f64) -> Result<()>;

    /// Value estimates over the full action space, without side effects
    fn query(&self, features: &[f64]) -> Result<Vec<f64>>;

    /// Snapshot of every learnable parameter
    fn serialize(&self) -> Result<serde_json::Value>;

    /// Replace the learnable parameters with a snapshot
    fn deserialize(&mut self, snapshot: &serde_json::Value) -> Result<()>;
}

/// Reject empty masks and actions outside `[0, num_actions)`
pub fn check_mask(mask: &[usize], num_actions: usize) -> Result<()> {
    if mask.is_empty() {
        return Err(ValidationError::EmptyActionMask.into());
    }
    if let Some(bad) = mask.iter().find(|a| **a >= num_actions) {
        return Err(ValidationError::ActionOutOfRange {
            action: *bad as i64,
            num_actions,
        }
        .into());
    }
    Ok(())
}

/// Highest-valued action in `mask`; ties go to the earliest entry
pub fn greedy(qvalues: &[f64], mask: &[usize]) -> Option<Decision> {
    let mut best: Option<Decision> = None;
    for &action in mask {
        let value = qvalues.get(action).copied()?;
        match best {
            Some(b) if b.value >= value => {}
            _ => best = Some(Decision { action, value }),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParleyError;

    #[test]
    fn greedy_respects_mask() {
        let q = [5.0, 1.0, 3.0, 4.0];
        let d = greedy(&q, &[1, 2, 3]).unwrap();
        assert_eq!(d.action, 3);
        assert_eq!(d.value, 4.0);
    }

    #[test]
    fn greedy_ties_go_to_first() {
        let q = [0.0; 4];
        assert_eq!(greedy(&q, &[2, 0, 3]).unwrap().action, 2);
    }

    #[test]
    fn check_mask_rejects_bad_masks() {
        assert!(matches!(
            check_mask(&[], 4),
            Err(ParleyError::Validation(ValidationError::EmptyActionMask))
        ));
        assert!(matches!(
            check_mask(&[1, 4], 4),
            Err(ParleyError::Validation(ValidationError::ActionOutOfRange { action: 4, .. }))
        ));
        assert!(check_mask(&[0, 3], 4).is_ok());
    }
}
