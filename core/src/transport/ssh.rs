//! Network shell transport over SSH

use async_ssh2_tokio::client::Client;
use async_ssh2_tokio::{AuthMethod, ServerCheckMethod};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::{Session, Transport};
use crate::{Error, Operation, RawOutput, Result, Target, TransportKind};

/// Password-authenticated SSH transport
#[derive(Debug, Default, Clone)]
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Sort SSH client errors into the transport taxonomy
fn classify(err: async_ssh2_tokio::Error, endpoint: &str) -> Error {
    match err {
        async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
            Error::TransportAuth(format!("{}: {}", endpoint, err))
        }
        other => Error::TransportConnect(format!("{}: {}", endpoint, other)),
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Shell
    }

    async fn connect(&self, target: &Target, timeout: Duration) -> Result<Box<dyn Session>> {
        let Target::Shell(shell) = target else {
            return Err(Error::InvalidRequest(format!(
                "ssh transport cannot reach {}",
                target.display()
            )));
        };

        let password = shell.password.as_deref().ok_or_else(|| {
            Error::CredentialError(format!("no password resolved for {}", shell.username))
        })?;

        let endpoint = target.display();
        info!(endpoint = %endpoint, "Opening SSH session");

        let client = tokio::time::timeout(
            timeout,
            Client::connect(
                (shell.host.clone(), shell.port),
                &shell.username,
                AuthMethod::with_password(password),
                ServerCheckMethod::NoCheck,
            ),
        )
        .await
        .map_err(|_| {
            Error::TransportTimeout(format!(
                "{}: no SSH handshake within {}s",
                endpoint,
                timeout.as_secs()
            ))
        })?
        .map_err(|e| classify(e, &endpoint))?;

        Ok(Box::new(SshSession { client, endpoint }))
    }
}

struct SshSession {
    client: Client,
    endpoint: String,
}

#[async_trait]
impl Session for SshSession {
    async fn execute(&mut self, operation: &Operation, timeout: Duration) -> Result<RawOutput> {
        let Operation::Exec { command } = operation else {
            return Err(Error::InvalidRequest(format!(
                "{} is not a shell operation",
                operation.name()
            )));
        };

        debug!(endpoint = %self.endpoint, command = %command, "Executing command");

        let result = tokio::time::timeout(timeout, self.client.execute(command))
            .await
            .map_err(|_| {
                Error::TransportTimeout(format!(
                    "{}: command did not finish within {}s",
                    self.endpoint,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Other(format!("{}: exec failed: {}", self.endpoint, e)))?;

        debug!(
            endpoint = %self.endpoint,
            exit_code = result.exit_status,
            "Command finished"
        );

        Ok(RawOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: Some(result.exit_status as i32),
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::TransportConnect(format!("{}: disconnect: {}", self.endpoint, e)))
    }
}
