use async_trait::async_trait;
use huntart_common::protocol::{AuthStateData, Frame, Route, SUBSYSTEM_AUTH};
use serde_json::Value;

use super::{SessionContext, Subsystem};
use crate::error::GatewayError;

/// Answers `auth/authenticate` probes with the session's current identity.
///
/// The actual credential check happens in the session's per-frame auth step
/// before any subsystem runs; by the time this handler sees the frame the
/// identity is already settled, so the probe is a pure state read.
#[derive(Default)]
pub struct AuthSubsystem;

impl AuthSubsystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subsystem for AuthSubsystem {
    fn name(&self) -> &'static str {
        SUBSYSTEM_AUTH
    }

    async fn handle(
        &mut self,
        ctx: &SessionContext<'_>,
        _route: Route,
        _data: &Value,
    ) -> Result<Vec<Frame>, GatewayError> {
        let state = match ctx.identity {
            Some(user) => AuthStateData {
                authenticated: true,
                user_id: Some(user.id),
                username: Some(user.username.clone()),
            },
            None => AuthStateData { authenticated: false, user_id: None, username: None },
        };
        Ok(vec![Frame::auth_state(state)])
    }
}
