use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 30 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
    /// Fingerprint of the password hash at issue time. When present, a
    /// mismatch with the stored hash invalidates the token (password change
    /// revokes outstanding credentials).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pwd: Option<String>,
}

/// Identity extracted from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub user_id: i64,
    pub password_fingerprint: Option<String>,
}

/// Verifies (and, for tests and companion tooling, issues) HS256 access
/// tokens carrying the user id as the subject claim.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AccessTokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(
        &self,
        user_id: i64,
        password_fingerprint: Option<&str>,
    ) -> anyhow::Result<String> {
        self.issue_token_at(user_id, password_fingerprint, current_unix_timestamp()?)
    }

    fn issue_token_at(
        &self,
        user_id: i64,
        password_fingerprint: Option<&str>,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
            pwd: password_fingerprint.map(str::to_owned),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<AccessClaims> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id: i64 = claims
            .sub
            .parse()
            .map_err(|_| anyhow!("access token subject '{}' is not a user id", claims.sub))?;

        Ok(AccessClaims { user_id, password_fingerprint: claims.pwd })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
