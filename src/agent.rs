//! Policy agent
//!
//! Mediates between raw feature vectors and a [`Brain`]: installs the
//! allowed-action mask, remembers the pending decision, and routes each
//! reward batch to the action that was actually taken.

use tracing::{debug, trace};

use crate::brain::{check_mask, AverageWindow, Brain, Decision};
use crate::error::{Result, ValidationError};

/// Rewards kept for the diagnostic average
const REWARD_WINDOW: usize = 1000;
/// Rewards required before an average is reported
const REWARD_WINDOW_MIN: usize = 10;

pub struct PolicyAgent {
    brain: Box<dyn Brain>,
    allowed_actions: Vec<usize>,
    pending: Option<Decision>,
    rewards: AverageWindow,
}

impl PolicyAgent {
    pub fn new(brain: Box<dyn Brain>) -> Self {
        // Until the simulator sends a mask, every raw action is allowed
        let allowed_actions = (0..brain.num_actions().saturating_sub(1)).collect();
        Self {
            brain,
            allowed_actions,
            pending: None,
            rewards: AverageWindow::new(REWARD_WINDOW, REWARD_WINDOW_MIN),
        }
    }

    pub fn brain(&self) -> &dyn Brain {
        self.brain.as_ref()
    }

    pub fn brain_mut(&mut self) -> &mut dyn Brain {
        self.brain.as_mut()
    }

    pub fn allowed_actions(&self) -> &[usize] {
        &self.allowed_actions
    }

    /// Most recent decision, awaiting its reward
    pub fn pending(&self) -> Option<Decision> {
        self.pending
    }

    /// Average of the rewards attributed so far
    pub fn average_reward(&self) -> Option<f64> {
        self.rewards.average()
    }

    /// Replace the allowed-action mask used by the next decision
    pub fn set_actions(&mut self, mask: Vec<usize>) {
        self.allowed_actions = mask;
    }

    /// Ask the brain for a decision under the current mask.
    ///
    /// Feature length and mask must already be validated by the session.
    pub fn forward(&mut self, features: &[f64]) -> Result<usize> {
        debug_assert_eq!(features.len(), self.brain.num_inputs());
        debug_assert!(check_mask(&self.allowed_actions, self.brain.num_actions()).is_ok());

        let decision = self.brain.decide(features, &self.allowed_actions)?;
        trace!(action = decision.action, value = decision.value, "agent decision");
        self.pending = Some(decision);
        Ok(decision.action)
    }

    /// Apply the reward that belongs to the pending action.
    ///
    /// A single reward is always applied. Otherwise `rewards[i]` is applied
    /// for the first `i` with `actions[i] == pending`; without a match
    /// nothing is learned. Returns the applied reward.
    pub fn backward(&mut self, rewards: &[f64], actions: &[i64]) -> Result<Option<f64>> {
        let reward = match rewards {
            [] => None,
            [single] => Some(*single),
            _ => self.attributed_reward(rewards, actions),
        };

        let Some(reward) = reward else {
            debug!(
                pending = ?self.pending.map(|d| d.action),
                rewards = rewards.len(),
                "no reward matches the pending action"
            );
            return Ok(None);
        };

        self.rewards.add(reward);
        if self.brain.is_learning() {
            self.brain.update(reward)?;
        }
        Ok(Some(reward))
    }

    /// Value estimates for every action; leaves mask and pending decision alone
    pub fn qvalues(&self, features: &[f64]) -> Result<Vec<f64>> {
        if features.len() != self.brain.num_inputs() {
            return Err(ValidationError::FeatureCount {
                got: features.len(),
                expected: self.brain.num_inputs(),
            }
            .into());
        }
        self.brain.query(features)
    }

    fn attributed_reward(&self, rewards: &[f64], actions: &[i64]) -> Option<f64> {
        let pending = self.pending?.action as i64;
        let index = actions.iter().position(|a| *a == pending)?;
        rewards.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockBrain;
    use mockall::predicate::eq;

    fn mock_brain(inputs: usize, actions: usize) -> MockBrain {
        let mut brain = MockBrain::new();
        brain.expect_num_inputs().return_const(inputs);
        brain.expect_num_actions().return_const(actions);
        brain.expect_is_learning().return_const(true);
        brain
    }

    fn agent_with_pending(mut brain: MockBrain, action: usize) -> PolicyAgent {
        brain.expect_decide().times(1).returning(move |_, _| {
            Ok(Decision {
                action,
                value: 0.5,
            })
        });
        let mut agent = PolicyAgent::new(Box::new(brain));
        agent.set_actions(vec![3, 5, 7]);
        agent.forward(&[0.0, 0.0]).unwrap();
        agent
    }

    #[test]
    fn test_forward_records_pending_and_passes_mask() {
        let mut brain = mock_brain(2, 10);
        brain
            .expect_decide()
            .withf(|features, mask| features.to_vec() == vec![1.0, 2.0] && mask.to_vec() == vec![4, 6])
            .times(1)
            .returning(|_, _| Ok(Decision { action: 6, value: 1.5 }));

        let mut agent = PolicyAgent::new(Box::new(brain));
        agent.set_actions(vec![4, 6]);
        assert_eq!(agent.forward(&[1.0, 2.0]).unwrap(), 6);
        assert_eq!(agent.pending(), Some(Decision { action: 6, value: 1.5 }));
    }

    #[test]
    fn test_reward_attributed_to_pending_action() {
        let mut brain = mock_brain(2, 10);
        brain.expect_update().with(eq(20.0)).times(1).returning(|_| Ok(()));
        let mut agent = agent_with_pending(brain, 5);

        let applied = agent.backward(&[10.0, 20.0, 30.0], &[3, 5, 7]).unwrap();
        assert_eq!(applied, Some(20.0));
    }

    #[test]
    fn test_single_reward_always_applied() {
        let mut brain = mock_brain(2, 10);
        brain.expect_update().with(eq(-4.0)).times(1).returning(|_| Ok(()));
        let mut agent = agent_with_pending(brain, 5);

        // The mask content is irrelevant for a single reward
        let applied = agent.backward(&[-4.0], &[9]).unwrap();
        assert_eq!(applied, Some(-4.0));
    }

    #[test]
    fn test_unmatched_rewards_are_ignored() {
        let mut brain = mock_brain(2, 10);
        brain.expect_update().times(0);
        let mut agent = agent_with_pending(brain, 5);

        assert_eq!(agent.backward(&[1.0, 2.0], &[3, 7]).unwrap(), None);
        assert_eq!(agent.backward(&[], &[3, 5]).unwrap(), None);
    }

    #[test]
    fn test_no_update_outside_training() {
        let mut brain = MockBrain::new();
        brain.expect_num_inputs().return_const(2usize);
        brain.expect_num_actions().return_const(10usize);
        brain.expect_is_learning().return_const(false);
        brain.expect_update().times(0);
        let mut agent = agent_with_pending(brain, 3);

        assert_eq!(agent.backward(&[1.0], &[3]).unwrap(), Some(1.0));
    }

    #[test]
    fn test_qvalues_leaves_state_alone() {
        let mut brain = mock_brain(2, 3);
        brain
            .expect_query()
            .times(1)
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        let mut agent = PolicyAgent::new(Box::new(brain));
        agent.set_actions(vec![2]);

        assert_eq!(agent.qvalues(&[0.0, 1.0]).unwrap(), vec![0.1, 0.2, 0.3]);
        assert_eq!(agent.allowed_actions(), &[2]);
        assert_eq!(agent.pending(), None);
    }

    #[test]
    fn test_default_mask_covers_raw_actions() {
        let agent = PolicyAgent::new(Box::new(mock_brain(2, 4)));
        assert_eq!(agent.allowed_actions(), &[0, 1, 2]);
    }
}
