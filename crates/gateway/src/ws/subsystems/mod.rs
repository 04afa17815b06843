// Per-connection subsystems.
//
// A session multiplexes independent subsystems over one socket; each frame
// names the subsystem it targets. Subsystems hold per-connection state (group
// memberships, debouncers) and react to identity changes, since a connection
// can authenticate or lose its identity mid-stream.

pub mod auth;
pub mod chat;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use huntart_common::protocol::{Frame, Route};
use serde_json::Value;

use crate::broadcast::BroadcastLayer;
use crate::error::GatewayError;
use crate::store::{ChatStore, User, UserStore};

/// Shared handles a subsystem needs to do its work.
#[derive(Clone)]
pub struct SessionServices {
    pub users: UserStore,
    pub chats: ChatStore,
    pub broadcast: Arc<dyn BroadcastLayer>,
    pub read_flush_interval: Duration,
}

/// The session state a handler may observe for one frame.
pub struct SessionContext<'a> {
    /// Process-unique address of this connection in the broadcast layer.
    pub address: &'a str,
    /// Identity established by the most recent valid credential, if any.
    pub identity: Option<&'a User>,
}

#[async_trait]
pub trait Subsystem: Send {
    /// Wire-level subsystem name frames are matched against.
    fn name(&self) -> &'static str;

    /// Called when the session's identity is established, replaced, or
    /// cleared. `ctx.identity` is the new state.
    async fn on_identity_changed(
        &mut self,
        _ctx: &SessionContext<'_>,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Handle one routed frame. Returned frames are replies to this
    /// connection only; group fanout goes through the broadcast layer.
    async fn handle(
        &mut self,
        ctx: &SessionContext<'_>,
        route: Route,
        data: &Value,
    ) -> Result<Vec<Frame>, GatewayError>;
}
