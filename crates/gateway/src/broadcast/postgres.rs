use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use huntart_common::protocol::Frame;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::BroadcastLayer;

const NOTIFY_CHANNEL: &str = "huntart_broadcast";

/// What rides inside one NOTIFY payload. Postgres caps payloads near 8000
/// bytes; `MAX_MESSAGE_TEXT_BYTES` keeps fanout frames comfortably under it.
#[derive(Debug, Serialize, Deserialize)]
struct NotifyEnvelope {
    group: String,
    frame: Frame,
}

type LocalSenders = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Frame>>>>;

/// Distributed broadcast backend.
///
/// Group membership lives in the shared `broadcast_group_members` table;
/// publishes fan out through LISTEN/NOTIFY so every gateway process sees
/// them and forwards to whichever member connections it hosts locally.
pub struct PgBroadcast {
    pool: PgPool,
    senders: LocalSenders,
    listener_task: JoinHandle<()>,
}

impl PgBroadcast {
    pub async fn connect(pool: PgPool) -> anyhow::Result<Self> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .context("failed to open broadcast listener connection")?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .context("failed to subscribe to broadcast channel")?;

        let senders: LocalSenders = Arc::new(RwLock::new(HashMap::new()));
        let listener_task =
            tokio::spawn(run_listener(listener, pool.clone(), Arc::clone(&senders)));

        Ok(Self { pool, senders, listener_task })
    }
}

impl Drop for PgBroadcast {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

async fn run_listener(mut listener: PgListener, pool: PgPool, senders: LocalSenders) {
    loop {
        let notification = match listener.recv().await {
            Ok(notification) => notification,
            Err(error) => {
                // recv re-establishes the connection internally; a returned
                // error here means the retry also failed.
                tracing::warn!(error = %error, "broadcast listener error, retrying");
                continue;
            }
        };

        let envelope: NotifyEnvelope = match serde_json::from_str(notification.payload()) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(error = %error, "discarding malformed broadcast payload");
                continue;
            }
        };

        let members = match group_members(&pool, &envelope.group).await {
            Ok(members) => members,
            Err(error) => {
                tracing::error!(
                    error = ?error,
                    group = %envelope.group,
                    "failed to resolve broadcast group members"
                );
                continue;
            }
        };

        let guard = senders.read().await;
        for address in &members {
            if let Some(sender) = guard.get(address) {
                let _ = sender.send(envelope.frame.clone());
            }
        }
    }
}

async fn group_members(pool: &PgPool, group: &str) -> anyhow::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT address FROM broadcast_group_members WHERE group_name = $1",
    )
    .bind(group)
    .fetch_all(pool)
    .await
    .context("failed to list broadcast group members")
}

#[async_trait]
impl BroadcastLayer for PgBroadcast {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn register(
        &self,
        address: &str,
        sender: mpsc::UnboundedSender<Frame>,
    ) -> anyhow::Result<()> {
        self.senders.write().await.insert(address.to_owned(), sender);
        Ok(())
    }

    async fn unregister(&self, address: &str) -> anyhow::Result<()> {
        self.senders.write().await.remove(address);
        sqlx::query("DELETE FROM broadcast_group_members WHERE address = $1")
            .bind(address)
            .execute(&self.pool)
            .await
            .context("failed to drop broadcast memberships for connection")?;
        Ok(())
    }

    async fn join(&self, group: &str, address: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broadcast_group_members (group_name, address)
            VALUES ($1, $2)
            ON CONFLICT (group_name, address) DO NOTHING
            "#,
        )
        .bind(group)
        .bind(address)
        .execute(&self.pool)
        .await
        .context("failed to join broadcast group")?;
        Ok(())
    }

    async fn leave(&self, group: &str, address: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM broadcast_group_members WHERE group_name = $1 AND address = $2")
            .bind(group)
            .bind(address)
            .execute(&self.pool)
            .await
            .context("failed to leave broadcast group")?;
        Ok(())
    }

    async fn leave_all(&self, address: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM broadcast_group_members WHERE address = $1")
            .bind(address)
            .execute(&self.pool)
            .await
            .context("failed to drop broadcast memberships for address")?;
        Ok(())
    }

    async fn publish(&self, group: &str, frame: &Frame) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&NotifyEnvelope {
            group: group.to_owned(),
            frame: frame.clone(),
        })
        .context("failed to encode broadcast payload")?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("failed to publish broadcast notification")?;
        Ok(())
    }
}
