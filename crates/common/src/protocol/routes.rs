use super::{SUBSYSTEM_AUTH, SUBSYSTEM_CHAT};

/// Actions owned by the chat subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    SendMessage,
    MarkRead,
}

impl ChatAction {
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::SendMessage => "sendMessage",
            Self::MarkRead => "markRead",
        }
    }
}

/// Actions owned by the auth subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Authenticate,
}

impl AuthAction {
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
        }
    }
}

/// A fully resolved inbound route: a registered subsystem plus one of its
/// actions. Resolution is a static table; anything it does not name is an
/// unknown route and must be rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Chat(ChatAction),
    Auth(AuthAction),
}

impl Route {
    /// Resolve wire-level `subsystem`/`action` strings to a route.
    pub fn resolve(subsystem: &str, action: &str) -> Option<Self> {
        match (subsystem, action) {
            (SUBSYSTEM_CHAT, "sendMessage") => Some(Self::Chat(ChatAction::SendMessage)),
            (SUBSYSTEM_CHAT, "markRead") => Some(Self::Chat(ChatAction::MarkRead)),
            (SUBSYSTEM_AUTH, "authenticate") => Some(Self::Auth(AuthAction::Authenticate)),
            _ => None,
        }
    }

    /// Name of the subsystem this route targets.
    pub const fn subsystem(self) -> &'static str {
        match self {
            Self::Chat(_) => SUBSYSTEM_CHAT,
            Self::Auth(_) => SUBSYSTEM_AUTH,
        }
    }

    /// Wire name of the action this route targets.
    pub const fn action(self) -> &'static str {
        match self {
            Self::Chat(action) => action.wire_name(),
            Self::Auth(action) => action.wire_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_routes() {
        assert_eq!(
            Route::resolve("chat", "sendMessage"),
            Some(Route::Chat(ChatAction::SendMessage))
        );
        assert_eq!(Route::resolve("chat", "markRead"), Some(Route::Chat(ChatAction::MarkRead)));
        assert_eq!(
            Route::resolve("auth", "authenticate"),
            Some(Route::Auth(AuthAction::Authenticate))
        );
    }

    #[test]
    fn rejects_unknown_subsystem_or_action() {
        assert_eq!(Route::resolve("chat", "deleteMessage"), None);
        assert_eq!(Route::resolve("presence", "update"), None);
        assert_eq!(Route::resolve("auth", "sendMessage"), None);
        assert_eq!(Route::resolve("", ""), None);
    }

    #[test]
    fn resolution_is_case_sensitive() {
        assert_eq!(Route::resolve("Chat", "sendMessage"), None);
        assert_eq!(Route::resolve("chat", "sendmessage"), None);
    }

    #[test]
    fn route_round_trips_through_wire_names() {
        for route in [
            Route::Chat(ChatAction::SendMessage),
            Route::Chat(ChatAction::MarkRead),
            Route::Auth(AuthAction::Authenticate),
        ] {
            assert_eq!(Route::resolve(route.subsystem(), route.action()), Some(route));
        }
    }
}
