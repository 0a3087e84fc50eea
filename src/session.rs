//! Decision session
//!
//! Per-process state machine driven by the server. Each `tick` runs one
//! Idle → Decision → (Learning) → Idle cycle for the addressed agent;
//! `save` emits periodic summaries and checkpoints.

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::agent::PolicyAgent;
use crate::brain::Brain;
use crate::config::{BrainConfig, RunMode};
use crate::error::{Result, ValidationError};
use crate::protocol::{self, Request};
use crate::store::PolicyStore;

/// Ticks between diagnostic summaries
pub const SUMMARY_INTERVAL: u64 = 100;

/// One diagnostic summary row
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub clock: u64,
    pub average_reward: f64,
    pub exploration_rate: f64,
    pub average_actions: f64,
    pub dialogues: f64,
    pub elapsed_hours: f64,
}

impl std::fmt::Display for SummaryRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:.4} {:.4} {:.2} {} {:.4}",
            self.clock,
            self.average_reward,
            self.exploration_rate,
            self.average_actions,
            self.dialogues,
            self.elapsed_hours
        )
    }
}

/// What `save` did on this tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    pub summary: Option<SummaryRow>,
    pub checkpointed: bool,
}

pub struct Session {
    clock: u64,
    /// Last addressed agent
    agent_id: Option<usize>,
    total_actions: u64,
    total_dialogues: f64,
    started_at: DateTime<Utc>,
    agents: Vec<PolicyAgent>,
    /// Summary rows per agent, flushed at each checkpoint
    summaries: Vec<String>,
    mode: RunMode,
    saving_frequency: u64,
}

impl Session {
    pub fn new(agents: Vec<PolicyAgent>, mode: RunMode, saving_frequency: u64) -> Self {
        let summaries = vec![String::new(); agents.len()];
        Self {
            clock: 0,
            agent_id: None,
            total_actions: 0,
            total_dialogues: 0.0,
            started_at: Utc::now(),
            agents,
            summaries,
            mode,
            saving_frequency: saving_frequency.max(1),
        }
    }

    /// Build `num_agents` agents from a brain factory and set their mode
    pub fn from_factory<F>(config: &BrainConfig, mode: RunMode, saving_frequency: u64, factory: F) -> Self
    where
        F: Fn(&BrainConfig) -> Box<dyn Brain>,
    {
        let agents = (0..config.num_agents)
            .map(|_| {
                let mut brain = factory(config);
                brain.set_learning(mode.is_training());
                PolicyAgent::new(brain)
            })
            .collect();
        Self::new(agents, mode, saving_frequency)
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn agent_id(&self) -> Option<usize> {
        self.agent_id
    }

    pub fn total_actions(&self) -> u64 {
        self.total_actions
    }

    pub fn total_dialogues(&self) -> f64 {
        self.total_dialogues
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn agents(&self) -> &[PolicyAgent] {
        &self.agents
    }

    pub fn agent(&self, agent_id: usize) -> Option<&PolicyAgent> {
        self.agents.get(agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: usize) -> Option<&mut PolicyAgent> {
        self.agents.get_mut(agent_id)
    }

    /// Decode one raw message and run a full decision cycle
    pub fn tick(&mut self, raw: &str) -> Result<usize> {
        let request = protocol::decode(raw)?;
        self.handle(&request)
    }

    /// Run a decision cycle for an already decoded request.
    ///
    /// All validation happens before the brain is consulted or any
    /// session counter moves.
    pub fn handle(&mut self, request: &Request) -> Result<usize> {
        let agent_id = self.resolve_agent(request.agent)?;
        let agent = &mut self.agents[agent_id];

        let expected = agent.brain().num_inputs();
        if request.features.len() != expected {
            return Err(ValidationError::FeatureCount {
                got: request.features.len(),
                expected,
            }
            .into());
        }
        let mask = to_mask(&request.actions, agent.brain().num_actions())?;

        agent.set_actions(mask);
        let action = agent.forward(&request.features)?;
        if !request.rewards.is_empty() {
            agent.backward(&request.rewards, &request.actions)?;
        }

        self.clock += 1;
        self.total_actions += request.actions.len() as u64;
        if let Some(dialogues) = request.dialogues {
            self.total_dialogues = dialogues;
        }
        self.agent_id = Some(agent_id);

        Ok(action)
    }

    /// Periodic bookkeeping, called once per tick
    pub fn save(&mut self, store: &PolicyStore) -> SaveReport {
        let mut report = SaveReport::default();
        let Some(agent_id) = self.agent_id else {
            return report;
        };
        if self.clock == 0 {
            return report;
        }

        if self.clock % SUMMARY_INTERVAL == 0 {
            let row = self.summary(agent_id);
            info!(
                clock = row.clock,
                avg_reward = row.average_reward,
                epsilon = row.exploration_rate,
                avg_actions = row.average_actions,
                dialogues = row.dialogues,
                hours = row.elapsed_hours,
                "session summary"
            );
            self.summaries[agent_id].push_str(&format!("{row}\n"));
            report.summary = Some(row);
        }

        let agent = &self.agents[agent_id];
        if self.clock % self.saving_frequency == 0 && agent.brain().is_learning() {
            store.save_summary(agent_id, self.summaries[agent_id].clone());
            match store.save(agent.brain(), agent_id) {
                Ok(()) => report.checkpointed = true,
                Err(e) => error!(agent = agent_id, "Checkpoint failed: {}", e),
            }
        }

        report
    }

    /// Diagnostic row for one agent; never fails
    pub fn summary(&self, agent_id: usize) -> SummaryRow {
        let (average_reward, exploration_rate) = self
            .agents
            .get(agent_id)
            .map(|a| (a.average_reward().unwrap_or(0.0), a.brain().exploration_rate()))
            .unwrap_or((0.0, 0.0));
        let average_actions = if self.clock == 0 {
            0.0
        } else {
            self.total_actions as f64 / self.clock as f64
        };
        let elapsed = Utc::now() - self.started_at;

        SummaryRow {
            clock: self.clock,
            average_reward,
            exploration_rate,
            average_actions,
            dialogues: self.total_dialogues,
            elapsed_hours: elapsed.num_milliseconds() as f64 / 3_600_000.0,
        }
    }

    /// One synthetic all-zero request for agent 0, proving the loaded
    /// policy answers before traffic is accepted
    pub fn warmup(&mut self) -> Result<usize> {
        let num_inputs = self
            .agents
            .first()
            .map(|a| a.brain().num_inputs())
            .unwrap_or(0);
        let request = Request {
            features: vec![0.0; num_inputs],
            actions: vec![0],
            agent: 0,
            ..Request::default()
        };
        let action = self.handle(&request)?;
        info!(action, "Warm-up decision");
        Ok(action)
    }

    fn resolve_agent(&self, agent: i64) -> Result<usize> {
        match usize::try_from(agent) {
            Ok(id) if id < self.agents.len() => Ok(id),
            _ => Err(ValidationError::UnknownAgent {
                agent,
                agents: self.agents.len(),
            }
            .into()),
        }
    }
}

/// Convert the wire mask to action indices, rejecting empty or out-of-range masks
fn to_mask(actions: &[i64], num_actions: usize) -> Result<Vec<usize>> {
    if actions.is_empty() {
        return Err(ValidationError::EmptyActionMask.into());
    }
    let mut mask = Vec::with_capacity(actions.len());
    for &action in actions {
        match usize::try_from(action) {
            Ok(idx) if idx < num_actions => mask.push(idx),
            _ => return Err(ValidationError::ActionOutOfRange { action, num_actions }.into()),
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{Decision, DeepQBrain, DqnSettings, MockBrain};
    use crate::error::{ParleyError, ProtocolError};
    use std::env::temp_dir;

    fn dqn_session(mode: RunMode, saving_frequency: u64) -> Session {
        let settings = DqnSettings {
            hidden_units: 8,
            experience_size: 100,
            start_learn_threshold: 10,
            learning_steps_total: 500,
            learning_steps_burnin: 10,
            batch_size: 4,
            ..DqnSettings::default()
        };
        let mut brain = DeepQBrain::new(3, 6, settings, Some(42));
        brain.set_learning(mode.is_training());
        Session::new(vec![PolicyAgent::new(Box::new(brain))], mode, saving_frequency)
    }

    fn untouchable_brain() -> MockBrain {
        let mut brain = MockBrain::new();
        brain.expect_num_inputs().return_const(3usize);
        brain.expect_num_actions().return_const(6usize);
        brain.expect_decide().times(0);
        brain.expect_update().times(0);
        brain
    }

    fn scratch_store() -> PolicyStore {
        let dir = temp_dir().join(format!("parley_session_{}", uuid::Uuid::new_v4()));
        PolicyStore::new(dir, "policy", "output")
    }

    #[test]
    fn test_tick_returns_action_from_mask() {
        let mut session = dqn_session(RunMode::Train, 1000);
        for i in 0..50 {
            let raw = format!("agent=0|state={i},0,1|actions=1,3,5|rewards=1,2,3|dialogues={i}");
            let action = session.tick(&raw).unwrap();
            assert!([1, 3, 5].contains(&action));
        }
        assert_eq!(session.clock(), 50);
        assert_eq!(session.total_actions(), 150);
        assert_eq!(session.total_dialogues(), 49.0);
        assert_eq!(session.agent_id(), Some(0));
    }

    #[test]
    fn test_feature_mismatch_never_reaches_brain() {
        let mut session = Session::new(
            vec![PolicyAgent::new(Box::new(untouchable_brain()))],
            RunMode::Train,
            10,
        );

        let err = session.tick("agent=0|state=1,2|actions=0").unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Validation(ValidationError::FeatureCount { got: 2, expected: 3 })
        ));
        assert_eq!(session.clock(), 0);
        assert_eq!(session.total_actions(), 0);
    }

    #[test]
    fn test_bad_mask_never_reaches_brain() {
        let mut session = Session::new(
            vec![PolicyAgent::new(Box::new(untouchable_brain()))],
            RunMode::Train,
            10,
        );

        assert!(matches!(
            session.tick("agent=0|state=1,2,3"),
            Err(ParleyError::Validation(ValidationError::EmptyActionMask))
        ));
        assert!(matches!(
            session.tick("agent=0|state=1,2,3|actions=2,6"),
            Err(ParleyError::Validation(ValidationError::ActionOutOfRange { action: 6, .. }))
        ));
        assert!(matches!(
            session.tick("agent=0|state=1,2,3|actions=-1"),
            Err(ParleyError::Validation(ValidationError::ActionOutOfRange { action: -1, .. }))
        ));
    }

    #[test]
    fn test_unknown_agent() {
        let mut session = dqn_session(RunMode::Train, 10);
        for agent in ["1", "-1"] {
            let raw = format!("agent={agent}|state=0,0,0|actions=0");
            assert!(matches!(
                session.tick(&raw),
                Err(ParleyError::Validation(ValidationError::UnknownAgent { .. }))
            ));
        }
    }

    #[test]
    fn test_protocol_errors_surface() {
        let mut session = dqn_session(RunMode::Train, 10);
        assert!(matches!(
            session.tick("agent=0|speed=3"),
            Err(ParleyError::Protocol(ProtocolError::UnknownField { .. }))
        ));
    }

    #[test]
    fn test_rewards_routed_through_agent() {
        let mut brain = MockBrain::new();
        brain.expect_num_inputs().return_const(3usize);
        brain.expect_num_actions().return_const(6usize);
        brain.expect_is_learning().return_const(true);
        brain
            .expect_decide()
            .returning(|_, _| Ok(Decision { action: 4, value: 0.0 }));
        brain
            .expect_update()
            .with(mockall::predicate::eq(7.0))
            .times(1)
            .returning(|_| Ok(()));

        let mut session = Session::new(vec![PolicyAgent::new(Box::new(brain))], RunMode::Train, 10);
        let action = session
            .tick("agent=0|state=0,0,0|actions=2,4,5|rewards=1,7,9")
            .unwrap();
        assert_eq!(action, 4);
    }

    #[test]
    fn test_summary_every_hundred_ticks() {
        let mut session = dqn_session(RunMode::Test, 1000);
        let store = scratch_store();

        let mut summaries = 0;
        for _ in 0..250 {
            session.tick("agent=0|state=0,0,0|actions=0,1|rewards=1").unwrap();
            let report = session.save(&store);
            assert!(!report.checkpointed);
            if let Some(row) = report.summary {
                summaries += 1;
                assert_eq!(row.clock % SUMMARY_INTERVAL, 0);
                assert!((row.average_actions - 2.0).abs() < 1e-12);
                assert!((row.average_reward - 1.0).abs() < 1e-12);
                assert_eq!(row.exploration_rate, 0.0);
            }
        }
        assert_eq!(summaries, 2);
    }

    #[test]
    fn test_checkpoint_only_in_training() {
        let store = scratch_store();

        let mut training = dqn_session(RunMode::Train, 5);
        for i in 1..=10 {
            training.tick("agent=0|state=0,1,0|actions=0,2|rewards=0.5").unwrap();
            let report = training.save(&store);
            assert_eq!(report.checkpointed, i % 5 == 0);
        }
        assert!(store.exists(0));
        assert!(store.summary_path(0).exists());

        let other = scratch_store();
        let mut testing = dqn_session(RunMode::Test, 5);
        for _ in 0..10 {
            testing.tick("agent=0|state=0,1,0|actions=0").unwrap();
            assert!(!testing.save(&other).checkpointed);
        }
        assert!(!other.exists(0));
    }

    #[test]
    fn test_save_before_any_tick_is_quiet() {
        let mut session = dqn_session(RunMode::Train, 1);
        assert_eq!(session.save(&scratch_store()), SaveReport::default());
    }

    #[test]
    fn test_summary_row_format() {
        let row = SummaryRow {
            clock: 200,
            average_reward: 0.5,
            exploration_rate: 0.25,
            average_actions: 3.0,
            dialogues: 12.0,
            elapsed_hours: 0.01,
        };
        assert_eq!(row.to_string(), "200 0.5000 0.2500 3.00 12 0.0100");
    }

    #[test]
    fn test_warmup() {
        let mut session = dqn_session(RunMode::Test, 10);
        assert_eq!(session.warmup().unwrap(), 0);
        assert_eq!(session.clock(), 1);
    }
}
