// Wire protocol for the chat gateway.
//
// Every frame on the socket — inbound and outbound — shares one JSON
// envelope: `{subsystem, action, headers, data}`. Credentials ride in
// `headers` so any message can (re)authenticate the connection.

mod frame;
mod routes;

pub use frame::{
    AuthStateData, AuthorSummary, ErrorData, Frame, Headers, MarkReadData, MessageSentData,
    NewMessageData, SendMessageData, MAX_MESSAGE_TEXT_BYTES,
};
pub use routes::{AuthAction, ChatAction, Route};

/// Subsystem name owning chat actions and fanout frames.
pub const SUBSYSTEM_CHAT: &str = "chat";
/// Subsystem name owning the authentication action.
pub const SUBSYSTEM_AUTH: &str = "auth";
/// Pseudo-subsystem for gateway-level acknowledgments (errors).
pub const SUBSYSTEM_GATEWAY: &str = "gateway";
