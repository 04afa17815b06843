// Per-frame authentication.
//
// Credentials ride in frame headers rather than the HTTP upgrade, so a
// connection can start anonymous and authenticate (or rotate identity)
// mid-stream. Verification is two-step: the token signature and expiry, then
// the account it names (must exist, be active, and the token must predate no
// password change).

pub mod token;

use huntart_common::protocol::Headers;

use crate::error::{AuthFailure, GatewayError};
use crate::store::{User, UserStore};
use token::AccessTokenVerifier;

/// Result of examining one frame's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No credential was presented; the frame is anonymous.
    Anonymous,
    /// The credential verified and resolved to an active account.
    Authenticated(User),
}

#[derive(Clone)]
pub struct Authenticator {
    verifier: AccessTokenVerifier,
}

impl Authenticator {
    pub fn new(verifier: AccessTokenVerifier) -> Self {
        Self { verifier }
    }

    pub async fn authenticate(
        &self,
        headers: &Headers,
        users: &UserStore,
    ) -> Result<AuthOutcome, GatewayError> {
        let Some(credential) = headers.credential.as_deref() else {
            return Ok(AuthOutcome::Anonymous);
        };

        let claims = self
            .verifier
            .verify(credential)
            .map_err(|_| GatewayError::AuthenticationFailed(AuthFailure::InvalidCredential))?;

        let user = users
            .get(claims.user_id)
            .await
            .map_err(GatewayError::Store)?
            .ok_or(GatewayError::AuthenticationFailed(AuthFailure::UserNotFound(
                claims.user_id,
            )))?;

        if !user.is_active {
            return Err(GatewayError::AuthenticationFailed(AuthFailure::UserInactive(user.id)));
        }

        // A password change rotates the stored fingerprint and revokes every
        // credential minted against the old one.
        if let Some(token_fingerprint) = &claims.password_fingerprint {
            if user.password_fingerprint.as_ref() != Some(token_fingerprint) {
                return Err(GatewayError::AuthenticationFailed(AuthFailure::CredentialStale));
            }
        }

        Ok(AuthOutcome::Authenticated(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "huntart_test_secret_that_is_definitely_long_enough";

    fn authenticator() -> Authenticator {
        Authenticator::new(AccessTokenVerifier::new(TEST_SECRET).expect("verifier"))
    }

    fn user(id: i64, is_active: bool, fingerprint: Option<&str>) -> User {
        User {
            id,
            username: format!("user{id}"),
            is_active,
            password_fingerprint: fingerprint.map(str::to_owned),
        }
    }

    fn headers_with(credential: &str) -> Headers {
        Headers { credential: Some(credential.to_owned()) }
    }

    #[tokio::test]
    async fn no_credential_is_anonymous() {
        let users = UserStore::memory();
        let outcome = authenticator().authenticate(&Headers::default(), &users).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Anonymous);
    }

    #[tokio::test]
    async fn valid_credential_resolves_the_account() {
        let auth = authenticator();
        let users = UserStore::memory_with([user(7, true, None)]);
        let token = AccessTokenVerifier::new(TEST_SECRET)
            .unwrap()
            .issue_token(7, None)
            .expect("token");

        let outcome = auth.authenticate(&headers_with(&token), &users).await.unwrap();
        match outcome {
            AuthOutcome::Authenticated(account) => assert_eq!(account.id, 7),
            other => panic!("expected authenticated outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_credential_fails() {
        let users = UserStore::memory_with([user(7, true, None)]);
        let error =
            authenticator().authenticate(&headers_with("not-a-jwt"), &users).await.unwrap_err();
        assert_eq!(error.code(), "AUTHENTICATION_FAILED");
    }

    #[tokio::test]
    async fn credential_for_missing_user_fails() {
        let users = UserStore::memory();
        let token =
            AccessTokenVerifier::new(TEST_SECRET).unwrap().issue_token(99, None).expect("token");
        let error =
            authenticator().authenticate(&headers_with(&token), &users).await.unwrap_err();
        assert!(matches!(
            error,
            GatewayError::AuthenticationFailed(AuthFailure::UserNotFound(99))
        ));
    }

    #[tokio::test]
    async fn credential_for_deactivated_user_fails() {
        let users = UserStore::memory_with([user(7, false, None)]);
        let token =
            AccessTokenVerifier::new(TEST_SECRET).unwrap().issue_token(7, None).expect("token");
        let error =
            authenticator().authenticate(&headers_with(&token), &users).await.unwrap_err();
        assert!(matches!(
            error,
            GatewayError::AuthenticationFailed(AuthFailure::UserInactive(7))
        ));
    }

    #[tokio::test]
    async fn password_change_revokes_old_credentials() {
        let users = UserStore::memory_with([user(7, true, Some("hash_v2"))]);
        let stale = AccessTokenVerifier::new(TEST_SECRET)
            .unwrap()
            .issue_token(7, Some("hash_v1"))
            .expect("token");
        let error =
            authenticator().authenticate(&headers_with(&stale), &users).await.unwrap_err();
        assert!(matches!(
            error,
            GatewayError::AuthenticationFailed(AuthFailure::CredentialStale)
        ));

        let fresh = AccessTokenVerifier::new(TEST_SECRET)
            .unwrap()
            .issue_token(7, Some("hash_v2"))
            .expect("token");
        let outcome =
            authenticator().authenticate(&headers_with(&fresh), &users).await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated(_)));
    }
}
