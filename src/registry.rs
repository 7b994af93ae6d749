//! Node registry: authenticates claim requests and tracks which build nodes
//! exist. The registry is the sole writer of node records and their liveness
//! metadata.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use crate::broker::{NodeRecord, QueueStore, CHANNEL_NODE};
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::NodeChannelMessage;

pub struct NodeRegistry {
    broker: Arc<dyn QueueStore>,
}

impl NodeRegistry {
    pub fn new(broker: Arc<dyn QueueStore>) -> Self {
        Self { broker }
    }

    /// Idempotent upsert. Re-registering rotates the PSK.
    pub async fn register(&self, node_id: &str, psk: &str, arch: Vec<String>) -> Result<()> {
        self.broker
            .put_node(NodeRecord {
                node_id: node_id.to_string(),
                psk: psk.to_string(),
                arch,
                last_seen: Utc::now(),
            })
            .await?;
        tracing::info!(node_id, "Node registered");
        Ok(())
    }

    pub async fn lookup(&self, node_id: &str) -> Result<NodeRecord> {
        self.broker
            .get_node(node_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("Node {node_id} is not registered")))
    }

    pub async fn deregister(&self, node_id: &str) -> Result<()> {
        self.broker.remove_node(node_id).await?;
        tracing::info!(node_id, "Node deregistered");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<NodeRecord>> {
        self.broker.list_nodes().await
    }

    /// Refresh the node's liveness timestamp.
    pub async fn mark_seen(&self, node_id: &str) -> Result<()> {
        let mut record = self.lookup(node_id).await?;
        record.last_seen = Utc::now();
        self.broker.put_node(record).await
    }

    /// A request is authenticated iff it carries a non-empty node identity
    /// and an authorization value exactly equal to the registered PSK. The
    /// specific failure is logged; callers only see `Unauthorized`, with a
    /// `cause` for the unknown-node and bad-secret splits.
    pub async fn authenticate(
        &self,
        node_id: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<NodeRecord> {
        let Some(node_id) = node_id.filter(|id| !id.is_empty()) else {
            tracing::debug!("Claim request failed with missing node identity header");
            return Err(SchedulerError::Unauthorized { cause: None });
        };
        let record = match self.broker.get_node(node_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(node_id, "Claim request failed with unknown node ID");
                return Err(SchedulerError::Unauthorized {
                    cause: Some("Invalid node ID"),
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to get node info from queue store");
                return Err(SchedulerError::Unauthorized {
                    cause: Some("Invalid node ID"),
                });
            }
        };
        let matches = authorization
            .map(|auth| constant_time_eq(auth.as_bytes(), record.psk.as_bytes()))
            .unwrap_or(false);
        if !matches {
            tracing::debug!(node_id, "Claim request failed with invalid PSK");
            return Err(SchedulerError::Unauthorized {
                cause: Some("Invalid PSK"),
            });
        }
        Ok(record)
    }

    /// One liveness pass: ping every registered node on the node channel,
    /// wait a bounded window for responses, deregister the silent ones.
    /// Returns the ids of deregistered nodes.
    pub async fn health_sweep(&self, wait: Duration) -> Result<Vec<String>> {
        let nodes = self.list().await?;
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut responses = self.broker.subscribe(CHANNEL_NODE).await?;

        for node in &nodes {
            let ping = NodeChannelMessage::HealthCheck {
                sender: "controller".to_string(),
                target: node.node_id.clone(),
            };
            self.broker
                .publish(CHANNEL_NODE, &serde_json::to_string(&ping)?)
                .await?;
        }

        let mut responded: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::select! {
                msg = responses.next() => msg,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            let Some(msg) = msg else { break };
            let Ok(NodeChannelMessage::HealthCheck { sender, target }) =
                serde_json::from_str(&msg)
            else {
                continue;
            };
            if target == "controller" {
                responded.push(sender);
            }
        }

        let mut deregistered = Vec::new();
        for node in nodes {
            if responded.contains(&node.node_id) {
                continue;
            }
            tracing::warn!(
                node_id = %node.node_id,
                "Node did not respond to health check, deregistering"
            );
            let notice = NodeChannelMessage::Deregister {
                sender: "controller".to_string(),
                target: node.node_id.clone(),
            };
            self.broker
                .publish(CHANNEL_NODE, &serde_json::to_string(&notice)?)
                .await?;
            self.broker.remove_node(&node.node_id).await?;
            deregistered.push(node.node_id);
        }
        Ok(deregistered)
    }
}

/// Compares in time independent of where the first mismatch occurs.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(MemoryBroker::new()))
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = registry();
        registry
            .register("n1", "psk1", vec!["x86_64".to_string()])
            .await
            .unwrap();
        let record = registry.lookup("n1").await.unwrap();
        assert_eq!(record.psk, "psk1");
        assert_eq!(record.arch, vec!["x86_64".to_string()]);
    }

    #[tokio::test]
    async fn register_is_idempotent_upsert() {
        let registry = registry();
        registry.register("n1", "old", vec![]).await.unwrap();
        registry.register("n1", "rotated", vec![]).await.unwrap();
        let record = registry.lookup("n1").await.unwrap();
        assert_eq!(record.psk, "rotated");
    }

    #[tokio::test]
    async fn lookup_unknown_node_fails() {
        let registry = registry();
        assert!(matches!(
            registry.lookup("ghost").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn authenticate_happy_path() {
        let registry = registry();
        registry.register("n1", "psk1", vec![]).await.unwrap();
        let record = registry
            .authenticate(Some("n1"), Some("psk1"))
            .await
            .unwrap();
        assert_eq!(record.node_id, "n1");
    }

    #[tokio::test]
    async fn authenticate_missing_header() {
        let registry = registry();
        let err = registry.authenticate(None, Some("psk1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Unauthorized { cause: None }));
    }

    #[tokio::test]
    async fn authenticate_unknown_node() {
        let registry = registry();
        let err = registry
            .authenticate(Some("ghost"), Some("psk1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Unauthorized {
                cause: Some("Invalid node ID")
            }
        ));
    }

    #[tokio::test]
    async fn authenticate_wrong_psk() {
        let registry = registry();
        registry.register("n1", "psk1", vec![]).await.unwrap();
        let err = registry
            .authenticate(Some("n1"), Some("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Unauthorized {
                cause: Some("Invalid PSK")
            }
        ));
    }

    #[tokio::test]
    async fn authenticate_missing_authorization() {
        let registry = registry();
        registry.register("n1", "psk1", vec![]).await.unwrap();
        let err = registry.authenticate(Some("n1"), None).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Unauthorized {
                cause: Some("Invalid PSK")
            }
        ));
    }
}
