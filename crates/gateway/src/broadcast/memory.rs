use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use huntart_common::protocol::Frame;
use tokio::sync::{mpsc, RwLock};

use super::BroadcastLayer;

#[derive(Default)]
struct Inner {
    senders: HashMap<String, mpsc::UnboundedSender<Frame>>,
    /// group → member addresses.
    groups: HashMap<String, HashSet<String>>,
    /// address → groups it belongs to, for cleanup on unregister.
    memberships: HashMap<String, HashSet<String>>,
}

/// Process-local broadcast backend. Single-node deployments and tests.
#[derive(Clone, Default)]
pub struct MemoryBroadcast {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BroadcastLayer for MemoryBroadcast {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn register(
        &self,
        address: &str,
        sender: mpsc::UnboundedSender<Frame>,
    ) -> anyhow::Result<()> {
        self.inner.write().await.senders.insert(address.to_owned(), sender);
        Ok(())
    }

    async fn unregister(&self, address: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.senders.remove(address);
        drop_memberships(&mut inner, address);
        Ok(())
    }

    async fn join(&self, group: &str, address: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.groups.entry(group.to_owned()).or_default().insert(address.to_owned());
        inner.memberships.entry(address.to_owned()).or_default().insert(group.to_owned());
        Ok(())
    }

    async fn leave(&self, group: &str, address: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.groups.get_mut(group) {
            members.remove(address);
            if members.is_empty() {
                inner.groups.remove(group);
            }
        }
        if let Some(groups) = inner.memberships.get_mut(address) {
            groups.remove(group);
        }
        Ok(())
    }

    async fn leave_all(&self, address: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        drop_memberships(&mut inner, address);
        Ok(())
    }

    async fn publish(&self, group: &str, frame: &Frame) -> anyhow::Result<()> {
        let inner = self.inner.read().await;
        let Some(members) = inner.groups.get(group) else {
            return Ok(());
        };
        for address in members {
            if let Some(sender) = inner.senders.get(address) {
                // A closed receiver means the connection is tearing down;
                // its unregister will clean up.
                let _ = sender.send(frame.clone());
            }
        }
        Ok(())
    }
}

fn drop_memberships(inner: &mut Inner, address: &str) {
    if let Some(groups) = inner.memberships.remove(address) {
        for group in groups {
            if let Some(members) = inner.groups.get_mut(&group) {
                members.remove(address);
                if members.is_empty() {
                    inner.groups.remove(&group);
                }
            }
        }
    }
}
