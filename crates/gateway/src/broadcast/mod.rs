// Group fanout.
//
// A connection registers its outbound sender under a process-unique address;
// chat subsystems join that address into per-chat groups, and publishing to a
// group delivers the frame to every member's socket. Two backends: in-process
// maps for a single node, and Postgres LISTEN/NOTIFY plus a shared membership
// table when several gateway processes serve connections.

pub mod memory;
pub mod postgres;

pub use memory::MemoryBroadcast;
pub use postgres::PgBroadcast;

use async_trait::async_trait;
use huntart_common::protocol::Frame;
use tokio::sync::mpsc;

/// Broadcast group for one chat.
pub fn chat_group(chat_id: i64) -> String {
    format!("chat:{chat_id}")
}

#[async_trait]
pub trait BroadcastLayer: Send + Sync {
    /// Short backend label for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Register a connection's outbound sender under its address.
    async fn register(
        &self,
        address: &str,
        sender: mpsc::UnboundedSender<Frame>,
    ) -> anyhow::Result<()>;

    /// Drop a connection and every group membership it holds.
    async fn unregister(&self, address: &str) -> anyhow::Result<()>;

    async fn join(&self, group: &str, address: &str) -> anyhow::Result<()>;

    async fn leave(&self, group: &str, address: &str) -> anyhow::Result<()>;

    /// Remove an address from every group it belongs to, keeping its sender
    /// registered. Covers memberships other sessions added for this address.
    async fn leave_all(&self, address: &str) -> anyhow::Result<()>;

    /// Deliver a frame to every current member of a group.
    async fn publish(&self, group: &str, frame: &Frame) -> anyhow::Result<()>;
}
