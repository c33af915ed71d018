//! Identity validation for the connection handshake.
//!
//! The gateway does not issue credentials. It consumes an
//! [`IdentityValidator`] and ships a [`StaticTokenValidator`] configured from
//! `AUTH_TOKENS` for deployments that front a pre-shared token list.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::GatewayError;

/// Caller role, used for rate-limit quotas and ingestion access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full access.
    Admin,
    /// Operations staff; may publish events.
    Operator,
    /// Read-only dashboard user.
    Viewer,
}

impl Role {
    /// Returns the role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
        }
    }

    /// Returns `true` if the role may publish domain events.
    #[must_use]
    pub const fn can_publish(self) -> bool {
        matches!(self, Self::Admin | Self::Operator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "operator" => Ok(Self::Operator),
            "viewer" => Ok(Self::Viewer),
            other => Err(GatewayError::InvalidRequest(format!("unknown role: {other}"))),
        }
    }
}

/// Authenticated principal attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Subject (user or service) name.
    pub subject: String,
    /// Role of the subject.
    pub role: Role,
}

/// External collaborator that turns a bearer credential into an identity.
#[async_trait]
pub trait IdentityValidator: Send + Sync + fmt::Debug {
    /// Validates a bearer credential.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authentication`] when the credential is
    /// unknown, expired or malformed.
    async fn validate(&self, credential: &str) -> Result<Identity, GatewayError>;
}

/// Validator backed by a fixed token → identity table.
pub struct StaticTokenValidator {
    tokens: HashMap<String, Identity>,
}

impl fmt::Debug for StaticTokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenValidator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl StaticTokenValidator {
    /// Creates a validator from explicit entries.
    #[must_use]
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    /// Parses `token:subject:role` entries separated by commas.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for an entry that does not
    /// have three fields or names an unknown role.
    pub fn parse(entries: &str) -> Result<Self, GatewayError> {
        let mut tokens = HashMap::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut fields = entry.splitn(3, ':');
            let (Some(token), Some(subject), Some(role)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(GatewayError::InvalidRequest(format!(
                    "auth token entry must be token:subject:role, got {entry:?}"
                )));
            };
            tokens.insert(
                token.to_string(),
                Identity {
                    subject: subject.to_string(),
                    role: role.parse()?,
                },
            );
        }
        Ok(Self { tokens })
    }

    /// Returns the number of configured tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if no tokens are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityValidator for StaticTokenValidator {
    async fn validate(&self, credential: &str) -> Result<Identity, GatewayError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| GatewayError::Authentication("unknown credential".to_string()))
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
#[must_use]
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parsed_tokens_validate() {
        let Ok(validator) = StaticTokenValidator::parse("t1:alice:operator, t2:bob:viewer") else {
            panic!("valid token table rejected");
        };
        assert_eq!(validator.len(), 2);

        let Ok(identity) = validator.validate("t1").await else {
            panic!("known token rejected");
        };
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.role, Role::Operator);

        let unknown = validator.validate("nope").await;
        assert!(matches!(unknown, Err(GatewayError::Authentication(_))));
    }

    #[test]
    fn malformed_entry_is_rejected() {
        assert!(StaticTokenValidator::parse("t1:alice").is_err());
        assert!(StaticTokenValidator::parse("t1:alice:root").is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
