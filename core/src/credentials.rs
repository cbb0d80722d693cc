//! Credential retrieval for shell targets

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::{CredentialContext, Error, Result};

/// Source of shell passwords
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Secret for `user` on a device described by `context`
    async fn get_credential(&self, user: &str, context: &CredentialContext) -> Result<String>;
}

/// External helper that prints the password of release images
#[derive(Debug, Clone)]
pub struct ReleaseHelper {
    /// Path of the helper binary
    pub program: String,
    /// First argument passed to the helper
    pub request_type: String,
    pub timeout: Duration,
}

/// Password policy driven by configuration.
///
/// Development images share one configured password; release images get a
/// per-model password from the release helper. Anything else is an error.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredCredentials {
    users: Vec<String>,
    dev_password: Option<String>,
    release_helper: Option<ReleaseHelper>,
}

impl ConfiguredCredentials {
    pub fn new(
        users: Vec<String>,
        dev_password: Option<String>,
        release_helper: Option<ReleaseHelper>,
    ) -> Self {
        Self {
            users,
            dev_password,
            release_helper,
        }
    }

    async fn release_password(&self, unit_type: &str) -> Result<String> {
        let helper = self.release_helper.as_ref().ok_or_else(|| {
            Error::CredentialError("no release password helper configured".to_string())
        })?;

        debug!(program = %helper.program, unit_type, "Requesting release password");

        let output = tokio::time::timeout(
            helper.timeout,
            tokio::process::Command::new(&helper.program)
                .arg(&helper.request_type)
                .arg(unit_type)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Error::CredentialError(format!(
                "password helper ran longer than {}s and was stopped",
                helper.timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::CredentialError(format!("failed to run password helper: {}", e)))?;

        if !output.status.success() {
            warn!(status = ?output.status.code(), "Password helper failed");
            return Err(Error::CredentialError(format!(
                "password helper exited with code {:?}",
                output.status.code()
            )));
        }

        let password = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if password.is_empty() {
            return Err(Error::CredentialError(
                "password helper returned an empty password".to_string(),
            ));
        }

        Ok(password)
    }
}

#[async_trait]
impl CredentialProvider for ConfiguredCredentials {
    #[instrument(skip(self), fields(unit_type = %context.unit_type))]
    async fn get_credential(&self, user: &str, context: &CredentialContext) -> Result<String> {
        if !self.users.iter().any(|u| u == user) {
            return Err(Error::CredentialError(format!("unknown shell user '{}'", user)));
        }

        match context.image.as_deref() {
            Some("dev") => self.dev_password.clone().ok_or_else(|| {
                Error::CredentialError("no password configured for dev images".to_string())
            }),
            Some("release") => self.release_password(&context.unit_type).await,
            other => Err(Error::CredentialError(format!(
                "don't know password for image of type {:?}",
                other
            ))),
        }
    }
}
