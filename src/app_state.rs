// =============================================================================
// Application State — instance registry and shared services
// =============================================================================
//
// The registry maps instance_id -> running TradingEngine plus its watchdog
// task handles. Writes (register / unregister) take the registry write lock;
// dispatch paths clone `Arc`s out of a read lock and never hold it across an
// await.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use crate::alert::AlertSink;
use crate::engine::TradingEngine;
use crate::store::SignalStore;
use crate::types::Exchange;

/// A registered instance: the engine plus its background watchdogs.
pub struct RegisteredInstance {
    pub engine: Arc<TradingEngine>,
    pub watchdogs: Vec<JoinHandle<()>>,
}

/// Summary row for the `/instances` listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub strategy: String,
}

pub struct AppState {
    pub store: SignalStore,
    pub alerts: Arc<dyn AlertSink>,
    /// Shared secret for `X-Signature` verification; `None` skips checks.
    pub webhook_secret: Option<String>,
    pub defaults: crate::config::AppConfig,
    registry: RwLock<HashMap<String, RegisteredInstance>>,
}

impl AppState {
    pub fn new(
        store: SignalStore,
        alerts: Arc<dyn AlertSink>,
        defaults: crate::config::AppConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            webhook_secret: defaults.webhook_secret.clone(),
            defaults,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace an instance. Replacement aborts the old watchdogs.
    pub fn insert_instance(&self, instance_id: &str, instance: RegisteredInstance) {
        let mut registry = self.registry.write();
        if let Some(previous) = registry.insert(instance_id.to_string(), instance) {
            for handle in previous.watchdogs {
                handle.abort();
            }
            info!(instance_id, "previous instance replaced");
        }
    }

    /// Remove an instance and abort its watchdogs. Returns whether it
    /// existed.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let removed = self.registry.write().remove(instance_id);
        match removed {
            Some(instance) => {
                for handle in instance.watchdogs {
                    handle.abort();
                }
                info!(instance_id, "instance unregistered");
                true
            }
            None => false,
        }
    }

    /// Engine lookup for single-instance routing.
    pub fn get_engine(&self, instance_id: &str) -> Option<Arc<TradingEngine>> {
        self.registry.read().get(instance_id).map(|i| i.engine.clone())
    }

    /// Snapshot of every registered engine (for broadcast dispatch).
    pub fn engines_snapshot(&self) -> Vec<(String, Arc<TradingEngine>)> {
        self.registry
            .read()
            .iter()
            .map(|(id, inst)| (id.clone(), inst.engine.clone()))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Summaries for the `/instances` listing.
    pub fn instance_summaries(&self) -> Vec<InstanceSummary> {
        self.registry
            .read()
            .iter()
            .map(|(id, inst)| {
                let cfg = inst.engine.config();
                InstanceSummary {
                    instance_id: id.clone(),
                    symbol: cfg.symbol,
                    exchange: cfg.exchange,
                    strategy: if cfg.strategy_name.is_empty() {
                        "TradingView Signal".to_string()
                    } else {
                        cfg.strategy_name
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InstanceConfig;
    use crate::mock::{MockBroker, RecordingAlerts};

    async fn state_with_engine(id: &str) -> Arc<AppState> {
        let store = SignalStore::connect("sqlite::memory:").await.unwrap();
        let alerts = Arc::new(RecordingAlerts::new());
        let state = Arc::new(AppState::new(
            store.clone(),
            alerts.clone(),
            crate::config::AppConfig {
                bind_addr: "127.0.0.1:0".into(),
                database_url: "sqlite::memory:".into(),
                dingtalk_token: None,
                dingtalk_secret: None,
                webhook_secret: None,
                default_forbidden_hours: Default::default(),
                default_margin: Default::default(),
                minute_alert_symbols: Vec::new(),
            },
        ));
        let engine = Arc::new(TradingEngine::new(
            id,
            InstanceConfig::default(),
            Arc::new(MockBroker::new(3000.0)),
            store,
            alerts,
        ));
        state.insert_instance(
            id,
            RegisteredInstance {
                engine,
                watchdogs: Vec::new(),
            },
        );
        state
    }

    #[tokio::test]
    async fn registry_insert_lookup_remove() {
        let state = state_with_engine("acct1").await;
        assert_eq!(state.instance_count(), 1);
        assert!(state.get_engine("acct1").is_some());
        assert!(state.get_engine("other").is_none());

        assert!(state.remove_instance("acct1"));
        assert!(!state.remove_instance("acct1"));
        assert_eq!(state.instance_count(), 0);
    }

    #[tokio::test]
    async fn summaries_default_strategy_label() {
        let state = state_with_engine("acct1").await;
        let summaries = state.instance_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].strategy, "TradingView Signal");
        assert_eq!(summaries[0].exchange, Exchange::Ostium);
    }
}
