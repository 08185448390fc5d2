use std::fmt;

/// Login credentials. Held in memory only; never written to disk or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Base32 TOTP seed; enables fully unattended MFA.
    pub mfa_secret: Option<String>,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            mfa_secret: None,
        }
    }

    pub fn with_mfa_secret(mut self, secret: impl Into<String>) -> Self {
        self.mfa_secret = Some(secret.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field(
                "mfa_secret",
                &self.mfa_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("me@example.com", "hunter2").with_mfa_secret("JBSWY3DP");
        let out = format!("{:?}", creds);
        assert!(out.contains("me@example.com"));
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("JBSWY3DP"));
    }
}
