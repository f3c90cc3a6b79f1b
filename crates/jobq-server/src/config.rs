use jobq_engine::DispatcherConfig;
use jobq_store::JobStoreConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub dispatcher: DispatcherConfig,
    pub store: StoreConfig,
    pub workers: Vec<WorkerGroupConfig>,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// RocksDB directory; omit to keep jobs in memory only
    pub data_dir: Option<PathBuf>,
}

/// `count` slots for one role, all talking to the same backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerGroupConfig {
    pub role: String,
    #[serde(default = "default_slot_count")]
    pub count: usize,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Ollama {
        base_url: String,
        model: String,
        #[serde(default)]
        system: Option<String>,
        #[serde(default)]
        options: Option<serde_json::Value>,
    },
    /// Returns the payload unchanged, for smoke tests
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Longest `wait_secs` a result request may ask for
    pub max_wait_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
}

fn default_slot_count() -> usize {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ollama = BackendConfig::Ollama {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            system: None,
            options: None,
        };

        ServerConfig {
            dispatcher: DispatcherConfig::default(),
            store: StoreConfig::default(),
            workers: ["architect", "coder", "reviewer"]
                .iter()
                .map(|role| WorkerGroupConfig {
                    role: role.to_string(),
                    count: 1,
                    backend: ollama.clone(),
                })
                .collect(),
            api: ApiConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: Some(PathBuf::from("./data")),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_wait_secs: 300,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            data_dir: self.store.data_dir.clone(),
        }
    }
}
