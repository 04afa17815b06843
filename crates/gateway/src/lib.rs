// huntart-gateway: the real-time chat gateway.
//
// One WebSocket connection per client, authenticated lazily by a credential
// carried in each frame's headers. Inbound frames are routed to per-connection
// subsystem instances (chat, auth); outbound fanout flows through a broadcast
// layer keyed by chat group.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod metrics;
pub mod store;
pub mod ws;
