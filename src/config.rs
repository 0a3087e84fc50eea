use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ParleyError, Result};
use crate::protocol::Framing;

/// Default config file, as written by the simulator launcher
pub const DEFAULT_CONFIG_FILE: &str = "nodeConfig.txt";

/// Execution mode selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RunMode {
    /// Learn online and checkpoint periodically
    Train,
    /// Load a saved policy and act greedily
    #[default]
    Test,
}

impl RunMode {
    pub fn is_training(&self) -> bool {
        matches!(self, RunMode::Train)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Train => write!(f, "training"),
            RunMode::Test => write!(f, "test"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub brain: BrainConfig,
    pub server: ListenConfig,
    pub output: OutputConfig,
}

/// Deep-Q learner hyperparameters and network shape
#[derive(Debug, Clone)]
pub struct BrainConfig {
    /// Length of the state vector sent by the simulator
    pub num_inputs: usize,
    /// Raw action dimension; the network reserves one extra output
    pub num_actions: usize,
    /// Number of policy agents served by this process
    pub num_agents: usize,
    /// Minibatch size for replayed TD updates
    pub batch_size: usize,
    /// Replay memory capacity
    pub experience_size: usize,
    /// Experiences collected before learning starts
    pub burning_steps: u64,
    /// TD discount factor (gamma)
    pub discount_factor: f64,
    /// Steps over which epsilon decays to its minimum
    pub learning_steps: u64,
    /// Floor of the exploration schedule
    pub minimum_epsilon: f64,
    pub learning_rate: f64,
    pub l2_decay: f64,
    /// Width of each of the two hidden layers
    pub hidden_units: usize,
    /// Number of past (state, action) pairs folded into the network input
    pub temporal_window: usize,
    /// Fixed RNG seed (random when absent)
    pub seed: Option<u64>,
}

impl BrainConfig {
    /// Action count used by the network (raw dimension plus one reserved slot)
    pub fn network_actions(&self) -> usize {
        self.num_actions + 1
    }
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Exit the process on the first malformed request
    pub strict_mode: bool,
    pub framing: Framing,
}

impl ListenConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Directory holding policies and summary logs
    pub path: PathBuf,
    pub policy_name: String,
    pub output_name: String,
    /// Ticks between checkpoints in training mode
    pub saving_frequency: u64,
}

/// Flat key=value view with case-insensitive lookup
struct RawConfig {
    values: HashMap<String, String>,
}

impl RawConfig {
    fn get(&self, key: &str) -> Option<&str> {
        // Environment overrides arrive lowercased, so they win over file keys
        let lowered = key.to_ascii_lowercase();
        self.values
            .get(&lowered)
            .or_else(|| self.values.get(key))
            .or_else(|| {
                self.values
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(|v| v.trim())
    }

    fn required<T>(&self, key: &str, errors: &mut Vec<String>) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => self.parse(key, raw, errors),
            None => {
                errors.push(format!("missing required key {key}"));
                None
            }
        }
    }

    fn optional<T>(&self, key: &str, default: T, errors: &mut Vec<String>) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => self.parse(key, raw, errors).unwrap_or(default),
            None => default,
        }
    }

    fn parse<T>(&self, key: &str, raw: &str, errors: &mut Vec<String>) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(e) => {
                errors.push(format!("{key}={raw}: {e}"));
                None
            }
        }
    }
}

impl ServerConfig {
    /// Load a key=value file, with PARLEY_<KEY> environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path.to_str().ok_or_else(|| {
            ParleyError::InvalidConfig(format!("config path is not UTF-8: {path:?}"))
        })?;

        let settings = Config::builder()
            .add_source(File::new(name, FileFormat::Ini).required(true))
            .add_source(Environment::with_prefix("PARLEY"))
            .build()?;

        let values: HashMap<String, String> = settings.try_deserialize()?;
        Self::from_map(values)
    }

    /// Parse key=value text directly (no environment overrides)
    pub fn parse_str(text: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()?;

        let values: HashMap<String, String> = settings.try_deserialize()?;
        Self::from_map(values)
    }

    /// Build the typed configuration from raw key/value pairs
    pub fn from_map(values: HashMap<String, String>) -> Result<Self> {
        let raw = RawConfig { values };
        let mut errors = Vec::new();

        let batch_size = raw.required("BatchSize", &mut errors);
        let experience_size = raw.required("ExperienceSize", &mut errors);
        let burning_steps = raw.required("BurningSteps", &mut errors);
        let discount_factor = raw.required("DiscountFactor", &mut errors);
        let learning_steps = raw.required("LearningSteps", &mut errors);
        let minimum_epsilon = raw.required("MinimumEpsilon", &mut errors);
        let saving_frequency = raw.required("SavingFrequency", &mut errors);
        let output_path: Option<String> = raw.required("OutputPath", &mut errors);
        let port = raw.required("TCPServer_Port", &mut errors);
        let host: Option<String> = raw.required("TCPServer_Server", &mut errors);

        let num_inputs = raw.optional("NumInputs", 160, &mut errors);
        let num_actions = raw.optional("NumActions", 120, &mut errors);
        let num_agents = raw.optional("NumAgents", 1, &mut errors);
        let learning_rate = raw.optional("LearningRate", 0.001, &mut errors);
        let l2_decay = raw.optional("L2Decay", 0.01, &mut errors);
        let hidden_units = raw.optional("HiddenUnits", 50, &mut errors);
        let temporal_window = raw.optional("TemporalWindow", 1, &mut errors);
        let seed = raw
            .get("Seed")
            .and_then(|s| raw.parse::<u64>("Seed", s, &mut errors));
        let policy_name = raw.optional("PolicyName", "simpleds-policy".to_string(), &mut errors);
        let output_name = raw.optional("OutputName", "simpleds-output".to_string(), &mut errors);
        let strict_mode = raw.optional("StrictMode", true, &mut errors);
        let framing = raw.optional("Framing", Framing::Chunk, &mut errors);

        match (
            batch_size,
            experience_size,
            burning_steps,
            discount_factor,
            learning_steps,
            minimum_epsilon,
            saving_frequency,
            output_path,
            port,
            host,
        ) {
            (
                Some(batch_size),
                Some(experience_size),
                Some(burning_steps),
                Some(discount_factor),
                Some(learning_steps),
                Some(minimum_epsilon),
                Some(saving_frequency),
                Some(output_path),
                Some(port),
                Some(host),
            ) if errors.is_empty() => {
                let config = Self {
                    brain: BrainConfig {
                        num_inputs,
                        num_actions,
                        num_agents,
                        batch_size,
                        experience_size,
                        burning_steps,
                        discount_factor,
                        learning_steps,
                        minimum_epsilon,
                        learning_rate,
                        l2_decay,
                        hidden_units,
                        temporal_window,
                        seed,
                    },
                    server: ListenConfig {
                        host,
                        port,
                        strict_mode,
                        framing,
                    },
                    output: OutputConfig {
                        path: PathBuf::from(output_path),
                        policy_name,
                        output_name,
                        saving_frequency,
                    },
                };
                config
                    .validate()
                    .map_err(|errs| ParleyError::InvalidConfig(errs.join("; ")))?;
                Ok(config)
            }
            _ => Err(ParleyError::InvalidConfig(errors.join("; "))),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let brain = &self.brain;

        if brain.num_inputs == 0 {
            errors.push("NumInputs must be positive".to_string());
        }
        if brain.num_agents == 0 {
            errors.push("NumAgents must be positive".to_string());
        }
        if brain.batch_size == 0 {
            errors.push("BatchSize must be positive".to_string());
        }
        if brain.experience_size == 0 {
            errors.push("ExperienceSize must be positive".to_string());
        }
        if brain.learning_steps <= brain.burning_steps {
            errors.push(format!(
                "LearningSteps ({}) must exceed BurningSteps ({})",
                brain.learning_steps, brain.burning_steps
            ));
        }
        if !(0.0..=1.0).contains(&brain.discount_factor) {
            errors.push("DiscountFactor must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&brain.minimum_epsilon) {
            errors.push("MinimumEpsilon must be between 0 and 1".to_string());
        }
        if brain.learning_rate <= 0.0 || !brain.learning_rate.is_finite() {
            errors.push("LearningRate must be positive".to_string());
        }
        if brain.hidden_units == 0 {
            errors.push("HiddenUnits must be positive".to_string());
        }
        if self.output.saving_frequency == 0 {
            errors.push("SavingFrequency must be positive".to_string());
        }
        if self.server.host.is_empty() {
            errors.push("TCPServer_Server must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
BatchSize=32
ExperienceSize=30000
BurningSteps=1000
DiscountFactor=0.7
LearningSteps=50000
MinimumEpsilon=0.05
SavingFrequency=1000
OutputPath=results
TCPServer_Port=8083
TCPServer_Server=localhost
";

    #[test]
    fn test_parse_sample_config() {
        let config = ServerConfig::parse_str(SAMPLE).unwrap();

        assert_eq!(config.brain.batch_size, 32);
        assert_eq!(config.brain.experience_size, 30000);
        assert_eq!(config.brain.burning_steps, 1000);
        assert!((config.brain.discount_factor - 0.7).abs() < 1e-12);
        assert_eq!(config.output.saving_frequency, 1000);
        assert_eq!(config.output.path, PathBuf::from("results"));
        assert_eq!(config.server.bind_addr(), "localhost:8083");

        // Defaults for the keys the launcher never writes
        assert_eq!(config.brain.num_inputs, 160);
        assert_eq!(config.brain.network_actions(), 121);
        assert_eq!(config.output.policy_name, "simpleds-policy");
        assert!(config.server.strict_mode);
        assert_eq!(config.server.framing, Framing::Chunk);
    }

    #[test]
    fn test_missing_keys_are_all_reported() {
        let err = ServerConfig::parse_str("BatchSize=32\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ExperienceSize"), "{msg}");
        assert!(msg.contains("TCPServer_Port"), "{msg}");
    }

    #[test]
    fn test_unparsable_value() {
        let text = SAMPLE.replace("BatchSize=32", "BatchSize=lots");
        let err = ServerConfig::parse_str(&text).unwrap_err();
        assert!(err.to_string().contains("BatchSize=lots"));
    }

    #[test]
    fn test_validate_rejects_inverted_schedule() {
        let text = SAMPLE.replace("LearningSteps=50000", "LearningSteps=10");
        let err = ServerConfig::parse_str(&text).unwrap_err();
        assert!(err.to_string().contains("LearningSteps"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut values = HashMap::new();
        for line in SAMPLE.lines() {
            let (k, v) = line.split_once('=').unwrap();
            values.insert(k.to_ascii_lowercase(), v.to_string());
        }
        values.insert("framing".to_string(), "line".to_string());

        let config = ServerConfig::from_map(values).unwrap();
        assert_eq!(config.server.port, 8083);
        assert_eq!(config.server.framing, Framing::Line);
    }
}
