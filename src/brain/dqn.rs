//! Deep Q-Learning Brain
//!
//! Epsilon-greedy DQN over an MLP value network with experience replay.
//!
//! The network input folds in a temporal window of past states and
//! actions: `[x_t, x_{t-1}, onehot(a_{t-1}) * num_inputs, ...]`, so its
//! width is `num_inputs + window * (num_inputs + num_actions)`.
//!
//! Each `update(r_t)` records the reward of the decision just made and
//! stores the previous transition `(s_{t-1}, a_{t-1}, r_{t-1}, s_t)`.
//! Learning starts once the replay memory holds more than the burn-in
//! count of experiences.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{debug, trace};

use super::network::DenseNetwork;
use super::replay::{AverageWindow, Experience, ExperienceReplay};
use super::{check_mask, greedy, Brain, Decision};
use crate::config::BrainConfig;
use crate::error::{ParleyError, Result, ValidationError};

/// Learner hyperparameters
#[derive(Debug, Clone)]
pub struct DqnSettings {
    pub temporal_window: usize,
    pub hidden_units: usize,
    pub experience_size: usize,
    /// Experiences required before the first TD update
    pub start_learn_threshold: usize,
    pub gamma: f64,
    pub learning_steps_total: u64,
    pub learning_steps_burnin: u64,
    pub epsilon_min: f64,
    /// Exploration used when not learning
    pub epsilon_test_time: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub l2_decay: f64,
}

impl Default for DqnSettings {
    fn default() -> Self {
        Self {
            temporal_window: 1,
            hidden_units: 50,
            experience_size: 30_000,
            start_learn_threshold: 1_000,
            gamma: 0.7,
            learning_steps_total: 100_000,
            learning_steps_burnin: 3_000,
            epsilon_min: 0.05,
            epsilon_test_time: 0.0,
            batch_size: 64,
            learning_rate: 0.001,
            l2_decay: 0.01,
        }
    }
}

impl From<&BrainConfig> for DqnSettings {
    fn from(config: &BrainConfig) -> Self {
        Self {
            temporal_window: config.temporal_window,
            hidden_units: config.hidden_units,
            experience_size: config.experience_size,
            start_learn_threshold: config.burning_steps as usize,
            gamma: config.discount_factor,
            learning_steps_total: config.learning_steps,
            learning_steps_burnin: config.burning_steps,
            epsilon_min: config.minimum_epsilon,
            epsilon_test_time: 0.0,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            l2_decay: config.l2_decay,
        }
    }
}

/// Epsilon-greedy deep Q-learner
pub struct DeepQBrain {
    num_inputs: usize,
    num_actions: usize,
    settings: DqnSettings,
    value_net: DenseNetwork,
    learning: bool,
    epsilon: f64,
    /// TD updates requested while learning
    age: u64,
    forward_passes: u64,
    window_size: usize,
    state_window: VecDeque<Vec<f64>>,
    action_window: VecDeque<usize>,
    reward_window: VecDeque<f64>,
    net_window: VecDeque<Vec<f64>>,
    experience: ExperienceReplay,
    average_loss: AverageWindow,
    last_decision: Option<Decision>,
    rng: StdRng,
}

impl DeepQBrain {
    /// Randomly initialized brain
    pub fn new(num_inputs: usize, num_actions: usize, settings: DqnSettings, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let input_dim = Self::net_input_dim(num_inputs, num_actions, settings.temporal_window);
        let hidden = [settings.hidden_units, settings.hidden_units];
        let value_net = DenseNetwork::mlp(input_dim, &hidden, num_actions, &mut rng);
        Self::with_network(num_inputs, num_actions, settings, value_net, rng)
    }

    /// Brain whose network parameters are all zero
    pub fn zeroed(num_inputs: usize, num_actions: usize, settings: DqnSettings, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let input_dim = Self::net_input_dim(num_inputs, num_actions, settings.temporal_window);
        let hidden = [settings.hidden_units, settings.hidden_units];
        let value_net = DenseNetwork::zeroed(input_dim, &hidden, num_actions);
        Self::with_network(num_inputs, num_actions, settings, value_net, rng)
    }

    /// Build from configuration; the network reserves one action beyond
    /// the raw dimension
    pub fn from_config(config: &BrainConfig) -> Self {
        Self::new(
            config.num_inputs,
            config.network_actions(),
            DqnSettings::from(config),
            config.seed,
        )
    }

    fn with_network(
        num_inputs: usize,
        num_actions: usize,
        settings: DqnSettings,
        value_net: DenseNetwork,
        rng: StdRng,
    ) -> Self {
        let window_size = settings.temporal_window.max(2);
        let experience = ExperienceReplay::new(settings.experience_size);

        // Zero-padded history keeps the network input defined from the
        // first decision on
        Self {
            num_inputs,
            num_actions,
            value_net,
            learning: true,
            epsilon: 1.0,
            age: 0,
            forward_passes: 0,
            window_size,
            state_window: VecDeque::from(vec![vec![0.0; num_inputs]; window_size]),
            action_window: VecDeque::from(vec![0; window_size]),
            reward_window: VecDeque::from(vec![0.0; window_size]),
            net_window: VecDeque::from(vec![Vec::new(); window_size]),
            experience,
            average_loss: AverageWindow::new(1000, 10),
            last_decision: None,
            settings,
            rng,
        }
    }

    pub fn net_input_dim(num_inputs: usize, num_actions: usize, temporal_window: usize) -> usize {
        num_inputs + temporal_window * (num_inputs + num_actions)
    }

    pub fn settings(&self) -> &DqnSettings {
        &self.settings
    }

    pub fn value_net(&self) -> &DenseNetwork {
        &self.value_net
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn experience_len(&self) -> usize {
        self.experience.len()
    }

    pub fn average_loss(&self) -> Option<f64> {
        self.average_loss.average()
    }

    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision
    }

    fn check_features(&self, features: &[f64]) -> Result<()> {
        if features.len() != self.num_inputs {
            return Err(ValidationError::FeatureCount {
                got: features.len(),
                expected: self.num_inputs,
            }
            .into());
        }
        Ok(())
    }

    /// Current features followed by the windowed history
    fn net_input(&self, features: &[f64]) -> Vec<f64> {
        let n = self.window_size;
        let mut input = Vec::with_capacity(self.value_net.input_dim);
        input.extend_from_slice(features);
        for k in 0..self.settings.temporal_window {
            input.extend_from_slice(&self.state_window[n - 1 - k]);
            let mut onehot = vec![0.0; self.num_actions];
            onehot[self.action_window[n - 1 - k]] = self.num_inputs as f64;
            input.extend(onehot);
        }
        input
    }

    fn current_epsilon(&self) -> f64 {
        if !self.learning {
            return self.settings.epsilon_test_time;
        }
        let s = &self.settings;
        let progress = (self.age as f64 - s.learning_steps_burnin as f64)
            / (s.learning_steps_total as f64 - s.learning_steps_burnin as f64);
        (1.0 - progress).max(s.epsilon_min).min(1.0)
    }

    fn shift<T>(window: &mut VecDeque<T>, size: usize, value: T) {
        window.push_back(value);
        while window.len() > size {
            window.pop_front();
        }
    }

    fn learn_from_replay(&mut self) -> Result<()> {
        let mut grads = self.value_net.zero_gradients();
        let mut total_loss = 0.0;

        for _ in 0..self.settings.batch_size {
            let Some(e) = self.experience.sample(&mut self.rng) else {
                break;
            };
            let next_q = self.value_net.forward(&e.state1)?;
            let max_next = next_q.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let target = e.reward0 + self.settings.gamma * max_next;
            total_loss += self
                .value_net
                .accumulate_gradient(&e.state0, e.action0, target, &mut grads)?;
        }

        let samples = grads.samples();
        if samples > 0 {
            self.value_net
                .apply_gradients(&grads, self.settings.learning_rate, self.settings.l2_decay);
            self.average_loss.add(total_loss / samples as f64);
        }
        Ok(())
    }
}

impl Brain for DeepQBrain {
    fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    fn num_actions(&self) -> usize {
        self.num_actions
    }

    fn is_learning(&self) -> bool {
        self.learning
    }

    fn set_learning(&mut self, learning: bool) {
        self.learning = learning;
        self.epsilon = self.current_epsilon();
    }

    fn exploration_rate(&self) -> f64 {
        self.epsilon
    }

    /// Callers validate features and mask before deciding
    fn decide(&mut self, features: &[f64], mask: &[usize]) -> Result<Decision> {
        debug_assert_eq!(features.len(), self.num_inputs);
        debug_assert!(check_mask(mask, self.num_actions).is_ok());

        self.forward_passes += 1;
        let net_input = self.net_input(features);
        let qvalues = self.value_net.forward(&net_input)?;

        self.epsilon = self.current_epsilon();
        let decision = if self.rng.gen::<f64>() < self.epsilon {
            let action = *mask
                .choose(&mut self.rng)
                .ok_or(ValidationError::EmptyActionMask)?;
            Decision {
                action,
                value: qvalues[action],
            }
        } else {
            greedy(&qvalues, mask).ok_or_else(|| {
                ParleyError::Brain("greedy choice over a validated mask failed".to_string())
            })?
        };

        let size = self.window_size;
        Self::shift(&mut self.state_window, size, features.to_vec());
        Self::shift(&mut self.action_window, size, decision.action);
        Self::shift(&mut self.net_window, size, net_input);
        self.last_decision = Some(decision);

        trace!(
            action = decision.action,
            value = decision.value,
            epsilon = self.epsilon,
            "dqn decision"
        );
        Ok(decision)
    }

    fn update(&mut self, reward: f64) -> Result<()> {
        if !self.learning {
            trace!("update ignored outside training");
            return Ok(());
        }
        if self.last_decision.is_none() {
            return Err(ParleyError::Brain("update before any decision".to_string()));
        }

        let size = self.window_size;
        Self::shift(&mut self.reward_window, size, reward);
        self.age += 1;

        let n = self.window_size;
        if self.forward_passes > self.settings.temporal_window as u64 + 1 {
            let experience = Experience {
                state0: self.net_window[n - 2].clone(),
                action0: self.action_window[n - 2],
                reward0: self.reward_window[n - 2],
                state1: self.net_window[n - 1].clone(),
            };
            self.experience.push(experience, &mut self.rng);

            if self.experience.len() > self.settings.start_learn_threshold {
                self.learn_from_replay()?;
                if self.age % 1000 == 0 {
                    debug!(
                        age = self.age,
                        replay = self.experience.len(),
                        replay_fill = self.experience.fill_ratio(),
                        loss = ?self.average_loss.average(),
                        "dqn training progress"
                    );
                }
            }
        }
        Ok(())
    }

    fn query(&self, features: &[f64]) -> Result<Vec<f64>> {
        self.check_features(features)?;
        self.value_net.forward(&self.net_input(features))
    }

    fn serialize(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.value_net)?)
    }

    fn deserialize(&mut self, snapshot: &serde_json::Value) -> Result<()> {
        let net: DenseNetwork = serde_json::from_value(snapshot.clone())?;
        net.validate().map_err(ParleyError::Brain)?;

        if net.input_dim != self.value_net.input_dim || net.output_dim() != self.num_actions {
            return Err(ParleyError::Brain(format!(
                "snapshot shape {}x{} does not fit brain {}x{}",
                net.input_dim,
                net.output_dim(),
                self.value_net.input_dim,
                self.num_actions
            )));
        }

        self.value_net = net;
        Ok(())
    }
}
