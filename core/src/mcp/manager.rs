/// Provider manager
///
/// Owns every connected provider client, keyed by provider name. The map is
/// written during startup and shutdown only; dispatch takes read locks.
use super::client::McpClient;
use super::types::{McpError, ProviderConfig};
use crate::BridgeError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Default)]
pub struct ProviderManager {
    /// Active clients: provider_name -> client
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured provider in order.
    ///
    /// Stops at the first failure: providers started so far are shut down
    /// and the failing provider's error is returned.
    pub async fn connect_all(
        &self,
        configs: &[ProviderConfig],
    ) -> crate::Result<Vec<Arc<McpClient>>> {
        let mut connected = Vec::with_capacity(configs.len());

        for config in configs {
            match self.add_provider(config.clone()).await {
                Ok(client) => connected.push(client),
                Err(source) => {
                    error!(
                        target: "provider_manager",
                        provider = %config.name,
                        error = %source,
                        "Provider failed to start, aborting startup"
                    );
                    if let Err(e) = self.shutdown().await {
                        warn!(target: "provider_manager", error = %e, "Cleanup after failed startup reported errors");
                    }
                    return Err(BridgeError::Provider {
                        provider: config.name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(connected)
    }

    /// Spawn and connect one provider
    pub async fn add_provider(&self, config: ProviderConfig) -> Result<Arc<McpClient>, McpError> {
        if let Some(existing) = self.get(&config.name).await {
            warn!(target: "provider_manager", provider = %config.name, "Provider already connected");
            return Ok(existing);
        }

        info!(
            target: "provider_manager",
            provider = %config.name,
            protocol_version = %config.protocol_version(),
            "Adding provider"
        );

        let client = McpClient::connect(config).await?;
        Ok(self.insert(client).await)
    }

    /// Take ownership of an already connected client
    pub async fn insert(&self, client: McpClient) -> Arc<McpClient> {
        let client = Arc::new(client);
        let previous = self
            .clients
            .write()
            .await
            .insert(client.name().to_string(), Arc::clone(&client));

        if let Some(previous) = previous {
            warn!(target: "provider_manager", provider = %previous.name(), "Replacing connected provider");
            if let Err(e) = previous.disconnect().await {
                warn!(target: "provider_manager", provider = %previous.name(), error = %e, "Replaced provider teardown reported errors");
            }
        }

        client
    }

    pub async fn get(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(name).cloned()
    }

    /// Names of connected providers, sorted
    pub async fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disconnect and forget one provider
    pub async fn remove_provider(&self, name: &str) -> Result<(), McpError> {
        let client = self.clients.write().await.remove(name);

        match client {
            Some(client) => {
                client.disconnect().await?;
                info!(target: "provider_manager", provider = %name, "Provider removed");
            }
            None => warn!(target: "provider_manager", provider = %name, "Provider not found"),
        }

        Ok(())
    }

    /// Disconnect every provider, reporting all failures together
    pub async fn shutdown(&self) -> Result<(), McpError> {
        let clients: Vec<Arc<McpClient>> = {
            let mut map = self.clients.write().await;
            map.drain().map(|(_, client)| client).collect()
        };

        info!(target: "provider_manager", count = clients.len(), "Shutting down providers");

        let mut errors = Vec::new();
        for client in clients {
            if let Err(e) = client.disconnect().await {
                errors.push(format!("{}: {}", client.name(), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(McpError::Teardown(errors))
        }
    }
}
