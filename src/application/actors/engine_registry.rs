//! Account id -> running engine map, owned by `main` and shared with the
//! status surface.

use crate::application::actors::execution_engine::OrderExecutionEngine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long `shutdown_all` waits for each engine to wind down
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Engine already registered for account {0}")]
    AlreadyRegistered(String),

    #[error("No engine registered for account {0}")]
    UnknownAccount(String),
}

struct Entry {
    engine: Arc<OrderExecutionEngine>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Arc<RwLock<HashMap<String, Entry>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an engine and start its run loop
    pub async fn register(&self, engine: Arc<OrderExecutionEngine>) -> Result<(), RegistryError> {
        let account_id = engine.account_id().to_string();
        let mut engines = self.engines.write().await;
        if engines.contains_key(&account_id) {
            return Err(RegistryError::AlreadyRegistered(account_id));
        }

        let task = tokio::spawn(engine.clone().run());
        info!("Registered engine for account {}", account_id);
        engines.insert(
            account_id,
            Entry {
                engine,
                task: Some(task),
            },
        );
        Ok(())
    }

    pub async fn get(&self, account_id: &str) -> Option<Arc<OrderExecutionEngine>> {
        self.engines
            .read()
            .await
            .get(account_id)
            .map(|entry| entry.engine.clone())
    }

    /// Stop an engine and drop it from the registry
    pub async fn remove(&self, account_id: &str) -> Result<Arc<OrderExecutionEngine>, RegistryError> {
        let entry = self
            .engines
            .write()
            .await
            .remove(account_id)
            .ok_or_else(|| RegistryError::UnknownAccount(account_id.to_string()))?;
        stop(account_id, entry.engine.clone(), entry.task).await;
        Ok(entry.engine)
    }

    pub async fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.engines.read().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub async fn shutdown_all(&self) {
        let entries: Vec<(String, Entry)> = self.engines.write().await.drain().collect();
        info!("Shutting down {} engines...", entries.len());
        for (account_id, entry) in entries {
            stop(&account_id, entry.engine, entry.task).await;
        }
        info!("All engines stopped");
    }
}

async fn stop(account_id: &str, engine: Arc<OrderExecutionEngine>, task: Option<JoinHandle<()>>) {
    engine.shutdown();
    let Some(task) = task else {
        return;
    };
    match tokio::time::timeout(ENGINE_STOP_TIMEOUT, task).await {
        Ok(Ok(())) => info!("Engine for {} stopped", account_id),
        Ok(Err(e)) => error!("Engine task for {} failed: {}", account_id, e),
        Err(_) => warn!(
            "Engine for {} did not stop within {:?}",
            account_id, ENGINE_STOP_TIMEOUT
        ),
    }
}
