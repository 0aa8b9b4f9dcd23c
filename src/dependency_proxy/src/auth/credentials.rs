use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// Verifies username/password pairs presented to the authorize endpoint.
/// User management lives outside the proxy; this is the seam it plugs into.
pub trait CredentialVerifier: Send + Sync {
    /// Subject to embed in the issued token, or `None` if the credentials are wrong
    fn verify(&self, username: &str, password: &str) -> Option<String>;
}

/// Fixed user table from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> Option<String> {
        let expected = self.users.get(username)?;
        if bool::from(expected.as_bytes().ct_eq(password.as_bytes())) {
            Some(username.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_matching_password_verifies() {
        let creds = StaticCredentials::new(HashMap::from([(
            "ci".to_string(),
            "s3cret".to_string(),
        )]));
        assert_eq!(creds.verify("ci", "s3cret").as_deref(), Some("ci"));
        assert_eq!(creds.verify("ci", "s3cre"), None);
        assert_eq!(creds.verify("nobody", "s3cret"), None);
    }
}
