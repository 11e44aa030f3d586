//! Credential types for authentication.

use std::borrow::Cow;

/// Credentials for SQL Server authentication.
///
/// Credentials are designed to minimize copying of sensitive data.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// SQL Server authentication with username and password.
    SqlServer {
        /// Username.
        username: Cow<'static, str>,
        /// Password.
        password: Cow<'static, str>,
    },

    /// Pre-obtained access token.
    AccessToken {
        /// The access token string.
        token: Cow<'static, str>,
    },

    /// Federated authentication; the token is acquired per login for the
    /// given authority and resource, and shared through the pool's
    /// authentication-context cache.
    Federated {
        /// Token authority (STS URL).
        authority: Cow<'static, str>,
        /// Resource the token is issued for.
        resource: Cow<'static, str>,
    },
}

impl Credentials {
    /// Create SQL Server credentials.
    pub fn sql_server(
        username: impl Into<Cow<'static, str>>,
        password: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create access token credentials.
    pub fn access_token(token: impl Into<Cow<'static, str>>) -> Self {
        Self::AccessToken {
            token: token.into(),
        }
    }

    /// Create federated credentials.
    pub fn federated(
        authority: impl Into<Cow<'static, str>>,
        resource: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::Federated {
            authority: authority.into(),
            resource: resource.into(),
        }
    }

    /// Check if these credentials use SQL authentication.
    #[must_use]
    pub fn is_sql_auth(&self) -> bool {
        matches!(self, Self::SqlServer { .. })
    }

    /// Check if a token is acquired per login.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        matches!(self, Self::Federated { .. })
    }

    /// Get the authentication method name.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::SqlServer { .. } => "SQL Server Authentication",
            Self::AccessToken { .. } => "Access Token",
            Self::Federated { .. } => "Federated Authentication",
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::sql_server("", "")
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose sensitive data in debug output
        match self {
            Self::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("token", &"[REDACTED]")
                .finish(),
            Self::Federated {
                authority,
                resource,
            } => f
                .debug_struct("Federated")
                .field("authority", authority)
                .field("resource", resource)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::sql_server("sa", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("sa"));
        assert!(!debug.contains("hunter2"));

        let token = Credentials::access_token("secret-token");
        assert!(!format!("{token:?}").contains("secret-token"));
    }

    #[test]
    fn test_method_names() {
        assert!(Credentials::sql_server("a", "b").is_sql_auth());
        let fed = Credentials::federated("https://login.example", "https://db.example");
        assert!(fed.is_federated());
        assert_eq!(fed.method_name(), "Federated Authentication");
    }
}
