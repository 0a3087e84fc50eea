//! Policy Store
//!
//! Save and load brain parameters as per-agent JSON files.
//!
//! Files keep the legacy layout: the network JSON is stringified and the
//! resulting string is written as pretty-printed JSON, i.e. the document
//! is a single JSON string.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::brain::Brain;
use crate::config::OutputConfig;
use crate::error::{ParleyError, Result};

/// Reads and writes policy snapshots and summary logs for every agent
#[derive(Debug, Clone)]
pub struct PolicyStore {
    /// Directory for policies and summary logs
    output_dir: PathBuf,
    policy_name: String,
    output_name: String,
    /// Distinguishes the temp files of overlapping writes
    write_seq: Arc<AtomicU64>,
}

impl PolicyStore {
    /// Create a new store
    pub fn new<P: AsRef<Path>>(output_dir: P, policy_name: &str, output_name: &str) -> Self {
        let output_dir = output_dir.as_ref().to_path_buf();

        // Create directory if it doesn't exist
        if !output_dir.exists() {
            if let Err(e) = fs::create_dir_all(&output_dir) {
                warn!("Failed to create output directory {:?}: {}", output_dir, e);
            }
        }

        Self {
            output_dir,
            policy_name: policy_name.to_string(),
            output_name: output_name.to_string(),
            write_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(&config.path, &config.policy_name, &config.output_name)
    }

    /// `<dir>/<policy_name>-<agent>.json`
    pub fn policy_path(&self, agent_id: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.json", self.policy_name, agent_id))
    }

    /// `<dir>/<output_name>-<agent>.txt`
    pub fn summary_path(&self, agent_id: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.txt", self.output_name, agent_id))
    }

    /// Check if a policy exists for the agent
    pub fn exists(&self, agent_id: usize) -> bool {
        self.policy_path(agent_id).exists()
    }

    /// Snapshot the brain and write it without blocking the caller.
    ///
    /// Serialization happens here; the write runs on a background task when
    /// a tokio runtime is available. Write failures are only logged.
    pub fn save(&self, brain: &dyn Brain, agent_id: usize) -> Result<()> {
        let contents = encode_policy(&brain.serialize()?)?;
        self.write_detached(self.policy_path(agent_id), contents, "policy");
        Ok(())
    }

    /// Write the policy and wait for the result
    pub fn save_blocking(&self, brain: &dyn Brain, agent_id: usize) -> Result<PathBuf> {
        let path = self.policy_path(agent_id);
        let contents = encode_policy(&brain.serialize()?)?;
        let tmp = self.temp_path(&path);
        fs::write(&tmp, contents)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| ParleyError::Checkpoint(format!("writing {:?}: {}", path, e)))?;
        info!("Saved policy {:?}", path);
        Ok(path)
    }

    /// Write the summary log without blocking the caller
    pub fn save_summary(&self, agent_id: usize, text: String) {
        self.write_detached(self.summary_path(agent_id), text, "output");
    }

    /// Restore brain parameters from the agent's policy file
    pub fn load(&self, brain: &mut dyn Brain, agent_id: usize) -> Result<PathBuf> {
        let path = self.policy_path(agent_id);

        if !path.exists() {
            return Err(ParleyError::Checkpoint(format!(
                "Policy not found: {:?}",
                path
            )));
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| ParleyError::Checkpoint(format!("reading {:?}: {}", path, e)))?;
        let snapshot = decode_policy(&contents)
            .map_err(|e| ParleyError::Checkpoint(format!("parsing {:?}: {}", path, e)))?;
        brain
            .deserialize(&snapshot)
            .map_err(|e| ParleyError::Checkpoint(format!("restoring {:?}: {}", path, e)))?;

        info!("Loaded policy {:?}", path);
        Ok(path)
    }

    /// Sibling temp file, renamed over the target once fully written
    fn temp_path(&self, path: &Path) -> PathBuf {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{seq}.tmp"));
        path.with_file_name(name)
    }

    fn write_detached(&self, path: PathBuf, contents: String, what: &'static str) {
        let tmp = self.temp_path(&path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let written = match tokio::fs::write(&tmp, contents).await {
                        Ok(()) => tokio::fs::rename(&tmp, &path).await,
                        Err(e) => Err(e),
                    };
                    match written {
                        Ok(()) => info!("Saved {} {:?}", what, path),
                        Err(e) => error!("Failed to save {} {:?}: {}", what, path, e),
                    }
                });
            }
            Err(_) => match fs::write(&tmp, contents).and_then(|()| fs::rename(&tmp, &path)) {
                Ok(()) => info!("Saved {} {:?}", what, path),
                Err(e) => error!("Failed to save {} {:?}: {}", what, path, e),
            },
        }
    }
}

/// Stringify the snapshot, then write that string as pretty JSON
pub fn encode_policy(snapshot: &serde_json::Value) -> Result<String> {
    let text = serde_json::to_string(snapshot)?;
    Ok(serde_json::to_string_pretty(&text)?)
}

/// Accepts the double-encoded layout and plain JSON objects
pub fn decode_policy(contents: &str) -> Result<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(contents)? {
        serde_json::Value::String(inner) => Ok(serde_json::from_str(&inner)?),
        object @ serde_json::Value::Object(_) => Ok(object),
        other => Err(ParleyError::Checkpoint(format!(
            "unexpected policy document type: {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{DeepQBrain, DqnSettings};
    use std::env::temp_dir;

    fn scratch_store() -> PolicyStore {
        let dir = temp_dir().join(format!("parley_store_{}", uuid::Uuid::new_v4()));
        PolicyStore::new(dir, "simpleds-policy", "simpleds-output")
    }

    fn small_brain(seed: u64) -> DeepQBrain {
        let settings = DqnSettings {
            hidden_units: 6,
            ..DqnSettings::default()
        };
        DeepQBrain::new(4, 3, settings, Some(seed))
    }

    #[test]
    fn test_paths() {
        let store = PolicyStore::new(temp_dir().join("parley_paths"), "policy", "output");
        assert!(store
            .policy_path(0)
            .to_string_lossy()
            .ends_with("policy-0.json"));
        assert!(store
            .summary_path(3)
            .to_string_lossy()
            .ends_with("output-3.txt"));
    }

    #[test]
    fn test_policy_file_is_double_encoded() {
        let snapshot = serde_json::json!({"input_dim": 2, "layers": []});
        let encoded = encode_policy(&snapshot).unwrap();

        let outer: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert!(outer.is_string());
        assert_eq!(decode_policy(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn test_decode_accepts_plain_object() {
        let plain = r#"{"input_dim": 2, "layers": []}"#;
        assert_eq!(decode_policy(plain).unwrap()["input_dim"], 2);
        assert!(decode_policy("[1, 2]").is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = scratch_store();
        let source = small_brain(1);
        let mut target = small_brain(2);
        let features = [0.1, 0.2, 0.3, 0.4];

        // No runtime here, so the write completes before save returns
        store.save(&source, 0).unwrap();
        assert!(store.exists(0));

        store.load(&mut target, 0).unwrap();
        let a = source.query(&features).unwrap();
        let b = target.query(&features).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_load_missing_policy_fails() {
        let store = scratch_store();
        let mut brain = small_brain(1);
        assert!(matches!(
            store.load(&mut brain, 7),
            Err(ParleyError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_load_corrupt_policy_fails() {
        let store = scratch_store();
        fs::write(store.policy_path(0), "not json").unwrap();
        let mut brain = small_brain(1);
        assert!(matches!(
            store.load(&mut brain, 0),
            Err(ParleyError::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_save_in_runtime_is_detached() {
        let store = scratch_store();
        let brain = small_brain(3);
        store.save(&brain, 1).unwrap();

        // Wait for the background write
        for _ in 0..100 {
            if store.exists(1) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(store.exists(1));
    }

    #[tokio::test]
    async fn test_overlapping_saves_leave_a_whole_file() {
        let store = scratch_store();
        let wide = DeepQBrain::new(
            4,
            3,
            DqnSettings {
                hidden_units: 64,
                ..DqnSettings::default()
            },
            Some(1),
        );
        let narrow = small_brain(2);

        for _ in 0..10 {
            store.save(&wide, 0).unwrap();
            store.save(&narrow, 0).unwrap();
        }

        // Wait for every background write to land
        let has_temp = |store: &PolicyStore| {
            fs::read_dir(&store.output_dir)
                .unwrap()
                .any(|e| e.unwrap().file_name().to_string_lossy().ends_with(".tmp"))
        };
        for _ in 0..200 {
            if store.exists(0) && !has_temp(&store) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let contents = fs::read_to_string(store.policy_path(0)).unwrap();
        let snapshot = decode_policy(&contents).unwrap();
        small_brain(3).deserialize(&snapshot).unwrap();
    }
}
