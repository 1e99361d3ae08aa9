//! Image configuration model.
//!
//! [`ImageConfigFile`] is the config blob referenced from a manifest. The
//! executor keeps one as its running accumulator; each commit freezes a copy
//! into the content store. Optional fields distinguish "absent" from an
//! explicit zero value (`None` vs `Some(vec![])`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Serialized as `{}`; used for the set-like maps (ports, volumes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Runtime defaults of a container started from the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, EmptyObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_build: Option<Vec<String>>,
}

/// HEALTHCHECK settings. Durations are nanoseconds, as in the Docker schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One commit in the image history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The image config blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl Default for ImageConfigFile {
    fn default() -> Self {
        Self::scratch()
    }
}

impl ImageConfigFile {
    /// The default empty config used for `FROM scratch`.
    pub fn scratch() -> Self {
        Self {
            created: None,
            author: None,
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            config: ContainerConfig::default(),
            rootfs: RootFs::default(),
            history: Vec::new(),
        }
    }

    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Compact, deterministic serialization (struct field order, sorted maps).
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Number of history entries that produced a layer.
    pub fn non_empty_history(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }
}

/// OCI architecture name of the host.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

impl ContainerConfig {
    /// Value of `key` in the env list.
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.as_ref()?.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            (k == key).then_some(v)
        })
    }

    /// Set `key=value`, replacing an existing entry in place so the order of
    /// first definition is kept.
    pub fn env_set(&mut self, key: &str, value: &str) {
        let env = self.env.get_or_insert_with(Vec::new);
        let entry = format!("{}={}", key, value);
        match env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) == key)
        {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
    }

    /// Env list as `(key, value)` pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .flatten()
            .map(|e| match e.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (e.clone(), String::new()),
            })
            .collect()
    }

    pub fn add_volume(&mut self, path: &str) {
        self.volumes
            .get_or_insert_with(BTreeMap::new)
            .insert(path.to_string(), EmptyObject {});
    }

    pub fn add_exposed_port(&mut self, port: &str) {
        self.exposed_ports
            .get_or_insert_with(BTreeMap::new)
            .insert(port.to_string(), EmptyObject {});
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_serialization() {
        let config = ImageConfigFile::scratch();
        let json: serde_json::Value = serde_json::from_slice(&config.to_vec().unwrap()).unwrap();
        assert_eq!(json["os"], "linux");
        assert_eq!(json["architecture"], host_architecture());
        assert_eq!(json["config"], serde_json::json!({}));
        assert_eq!(json["rootfs"]["type"], "layers");
        assert_eq!(json["rootfs"]["diff_ids"], serde_json::json!([]));
        assert!(json.get("history").is_none());
        assert!(json.get("created").is_none());
    }

    #[test]
    fn test_container_config_pascal_case() {
        let mut config = ContainerConfig::default();
        config.working_dir = Some("/app".to_string());
        config.stop_signal = Some("SIGTERM".to_string());
        config.on_build = Some(vec!["RUN make".to_string()]);
        config.add_exposed_port("80/tcp");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["WorkingDir"], "/app");
        assert_eq!(json["StopSignal"], "SIGTERM");
        assert_eq!(json["OnBuild"][0], "RUN make");
        assert_eq!(json["ExposedPorts"]["80/tcp"], serde_json::json!({}));
    }

    #[test]
    fn test_explicit_empty_distinct_from_absent() {
        let mut config = ContainerConfig::default();
        config.cmd = Some(Vec::new());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["Cmd"], serde_json::json!([]));
        assert!(json.get("Entrypoint").is_none());
    }

    #[test]
    fn test_env_set_replaces_in_place() {
        let mut config = ContainerConfig::default();
        config.env_set("A", "1");
        config.env_set("B", "2");
        config.env_set("A", "3");
        assert_eq!(
            config.env,
            Some(vec!["A=3".to_string(), "B=2".to_string()])
        );
        assert_eq!(config.env_get("A"), Some("3"));
        assert_eq!(config.env_get("C"), None);
    }

    #[test]
    fn test_env_value_with_equals() {
        let mut config = ContainerConfig::default();
        config.env_set("OPTS", "a=b");
        assert_eq!(config.env_get("OPTS"), Some("a=b"));
        assert_eq!(
            config.env_pairs(),
            vec![("OPTS".to_string(), "a=b".to_string())]
        );
    }

    #[test]
    fn test_history_empty_layer_omitted_when_false() {
        let entry = HistoryEntry {
            created_by: Some("COPY hello /".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("empty_layer").is_none());

        let empty = HistoryEntry {
            empty_layer: true,
            ..entry
        };
        assert_eq!(serde_json::to_value(&empty).unwrap()["empty_layer"], true);
    }

    #[test]
    fn test_parse_foreign_config() {
        let data = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/usr/bin"], "Cmd": ["sh"], "Hostname": "ignored"},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"]},
            "history": [{"created": "2024-01-01T00:00:00Z", "created_by": "ADD rootfs.tar /"}],
            "docker_version": "24.0"
        }"#;
        let config = ImageConfigFile::from_slice(data).unwrap();
        assert_eq!(config.config.env_get("PATH"), Some("/usr/bin"));
        assert_eq!(config.rootfs.diff_ids.len(), 1);
        assert_eq!(config.non_empty_history(), 1);
    }
}
