use huntart_common::protocol::{ErrorData, Frame};

/// Why a presented credential was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    #[error("credential is invalid or expired")]
    InvalidCredential,
    #[error("user {0} no longer exists")]
    UserNotFound(i64),
    #[error("user {0} is deactivated")]
    UserInactive(i64),
    #[error("credential was issued before the last password change")]
    CredentialStale,
}

/// Everything that can go wrong while handling one inbound frame.
///
/// Per-frame errors are converted into a `gateway/error` acknowledgment on
/// the same connection and never terminate it; only transport failures end a
/// session.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("unknown route {subsystem}/{action}")]
    UnknownRoute { subsystem: String, action: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] AuthFailure),
    #[error("this action requires an authenticated user")]
    IdentityRequired,
    #[error("exactly one of userId or chatId must be provided")]
    AmbiguousTarget,
    #[error("cannot send a message to yourself")]
    SelfMessageNotAllowed,
    #[error("recipient user {0} does not exist")]
    RecipientNotFound(i64),
    #[error("message {0} does not exist")]
    MessageNotFound(i64),
    #[error("group chat targets are not implemented")]
    NotImplemented,
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),
    #[error("storage operation failed")]
    Store(#[source] anyhow::Error),
}

impl GatewayError {
    /// Stable wire code, one per variant.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::UnknownRoute { .. } => "UNKNOWN_ROUTE",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::IdentityRequired => "IDENTITY_REQUIRED",
            Self::AmbiguousTarget => "AMBIGUOUS_TARGET",
            Self::SelfMessageNotAllowed => "SELF_MESSAGE_NOT_ALLOWED",
            Self::RecipientNotFound(_) => "RECIPIENT_NOT_FOUND",
            Self::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::DataIntegrity(_) => "DATA_INTEGRITY_ERROR",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may usefully retry the same frame.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Convert into the error acknowledgment sent back on the connection.
    ///
    /// Integrity and storage failures surface a generic message; the detail
    /// is for the server log, not the client.
    pub fn to_frame(&self) -> Frame {
        let message = match self {
            Self::DataIntegrity(_) => "internal data integrity violation".to_owned(),
            Self::Store(_) => "internal storage failure".to_owned(),
            other => other.to_string(),
        };
        Frame::error(ErrorData { code: self.code().to_owned(), message, retryable: self.retryable() })
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_distinct_code() {
        let errors = [
            GatewayError::MalformedMessage("x".into()),
            GatewayError::UnknownRoute { subsystem: "a".into(), action: "b".into() },
            GatewayError::AuthenticationFailed(AuthFailure::InvalidCredential),
            GatewayError::IdentityRequired,
            GatewayError::AmbiguousTarget,
            GatewayError::SelfMessageNotAllowed,
            GatewayError::RecipientNotFound(1),
            GatewayError::MessageNotFound(1),
            GatewayError::NotImplemented,
            GatewayError::DataIntegrity("x".into()),
            GatewayError::Store(anyhow::anyhow!("x")),
        ];
        let mut codes: Vec<_> = errors.iter().map(|error| error.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn only_storage_failures_are_retryable() {
        assert!(GatewayError::Store(anyhow::anyhow!("db down")).retryable());
        assert!(!GatewayError::IdentityRequired.retryable());
        assert!(!GatewayError::DataIntegrity("dup".into()).retryable());
    }

    #[test]
    fn integrity_errors_surface_generically() {
        let frame = GatewayError::DataIntegrity("pair (1,2) has 2 chats".into()).to_frame();
        let value = serde_json::to_value(&frame).expect("frame should serialize");
        assert_eq!(value["data"]["code"], "DATA_INTEGRITY_ERROR");
        let message = value["data"]["message"].as_str().unwrap();
        assert!(!message.contains("pair (1,2)"), "detail must not leak to the client");
    }

    #[test]
    fn validation_errors_surface_their_message() {
        let frame = GatewayError::RecipientNotFound(42).to_frame();
        let value = serde_json::to_value(&frame).expect("frame should serialize");
        assert_eq!(value["data"]["code"], "RECIPIENT_NOT_FOUND");
        assert!(value["data"]["message"].as_str().unwrap().contains("42"));
    }
}
