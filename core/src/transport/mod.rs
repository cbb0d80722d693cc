//! Remote command transports
//!
//! A transport opens a [`Session`] against a [`Target`]; the session performs
//! operations and must be closed afterwards. [`run_once`] wraps the whole
//! connect → execute → close sequence so the session is released on every
//! exit path, including timeouts.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::{Error, Operation, RawOutput, Result, Target, TransportKind};

#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "ssh")]
pub mod ssh;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
#[cfg(feature = "ssh")]
pub use ssh::SshTransport;

/// Extra time allowed on top of the command timeout for transport overhead
pub const EXECUTION_GRACE: Duration = Duration::from_secs(5);

/// An open connection to one target
#[async_trait]
pub trait Session: Send {
    /// Perform exactly one operation
    async fn execute(&mut self, operation: &Operation, timeout: Duration) -> Result<RawOutput>;

    /// Release the underlying connection or port
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for sessions of one transport kind
#[async_trait]
pub trait Transport: Send + Sync {
    /// Lane this transport serves
    fn kind(&self) -> TransportKind;

    /// Open a session to `target`
    async fn connect(&self, target: &Target, timeout: Duration) -> Result<Box<dyn Session>>;
}

/// Connect, run one operation and close, bounded by `timeout` plus [`EXECUTION_GRACE`].
#[instrument(skip(transport, operation), fields(target = %target.display(), op = operation.name()))]
pub async fn run_once(
    transport: &dyn Transport,
    target: &Target,
    operation: &Operation,
    timeout: Duration,
) -> Result<RawOutput> {
    let deadline = timeout.saturating_add(EXECUTION_GRACE);

    let mut session = tokio::time::timeout(deadline, transport.connect(target, timeout))
        .await
        .map_err(|_| {
            Error::TransportTimeout(format!(
                "connecting to {} took longer than {}s",
                target.display(),
                deadline.as_secs()
            ))
        })??;

    debug!("Session open");

    let outcome = match tokio::time::timeout(deadline, session.execute(operation, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(Error::TransportTimeout(format!(
            "{} on {} did not finish within {}s",
            operation.name(),
            target.display(),
            deadline.as_secs()
        ))),
    };

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close session cleanly");
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SerialLine, SerialTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSession {
        closed: Arc<AtomicUsize>,
        hang: bool,
    }

    #[async_trait]
    impl Session for CountingSession {
        async fn execute(&mut self, _op: &Operation, _timeout: Duration) -> Result<RawOutput> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(RawOutput {
                stdout: "ok".into(),
                ..Default::default()
            })
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingTransport {
        closed: Arc<AtomicUsize>,
        hang: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Serial
        }

        async fn connect(&self, _target: &Target, _timeout: Duration) -> Result<Box<dyn Session>> {
            Ok(Box::new(CountingSession {
                closed: self.closed.clone(),
                hang: self.hang,
            }))
        }
    }

    fn target() -> Target {
        Target::Serial(SerialTarget {
            port: "/dev/ttyUSB0".into(),
            line: SerialLine::default(),
        })
    }

    #[tokio::test]
    async fn test_session_closed_after_success() {
        let closed = Arc::new(AtomicUsize::new(0));
        let transport = CountingTransport {
            closed: closed.clone(),
            hang: false,
        };

        let out = run_once(&transport, &target(), &Operation::Read, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.stdout, "ok");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closed_after_timeout() {
        let closed = Arc::new(AtomicUsize::new(0));
        let transport = CountingTransport {
            closed: closed.clone(),
            hang: true,
        };

        let err = run_once(&transport, &target(), &Operation::Read, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportTimeout(_)));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let closed = Arc::new(AtomicUsize::new(0));
        let transport = CountingTransport {
            closed: closed.clone(),
            hang: false,
        };

        let out = run_once(&transport, &target(), &Operation::Read, Duration::MAX)
            .await
            .unwrap();
        assert_eq!(out.stdout, "ok");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
