pub mod api;
pub mod config;
pub mod ollama;

pub use config::ServerConfig;
pub use ollama::OllamaClient;

use config::{BackendConfig, WorkerGroupConfig};
use jobq_core::WorkerClient;
use jobq_engine::clients::EchoClient;
use jobq_engine::WorkerPool;
use std::sync::Arc;
use tracing::info;

/// Build the fixed slot table. Slots in one group share a single client.
pub fn build_pool(groups: &[WorkerGroupConfig]) -> anyhow::Result<WorkerPool> {
    let mut builder = WorkerPool::builder();

    for group in groups {
        let client: Arc<dyn WorkerClient> = match &group.backend {
            BackendConfig::Ollama {
                base_url,
                model,
                system,
                options,
            } => {
                let client = OllamaClient::new(base_url, model.clone())?
                    .with_system(system.clone())
                    .with_options(options.clone());
                info!(
                    "Role {}: {} slots on {} (model {})",
                    group.role,
                    group.count,
                    base_url,
                    client.model()
                );
                Arc::new(client)
            }
            BackendConfig::Echo => {
                info!("Role {}: {} echo slots", group.role, group.count);
                Arc::new(EchoClient)
            }
        };

        builder = builder.slots(group.role.clone(), group.count, client);
    }

    Ok(builder.build())
}
