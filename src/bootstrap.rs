//! Messaging-network session bootstrap.
//!
//! Establishing a session can hang, fail transiently, or fail because the
//! identity has hit the network's installation cap. Each attempt races the
//! connect call against a timeout (long on the first attempt to cover cold
//! start, short afterwards); the connect future runs in its own task, so a
//! losing attempt is abandoned and its eventual result discarded rather than
//! cancelled. Installation-cap failures are classified from the error text
//! and handed to a caller-supplied decision callback instead of being
//! retried blindly.

use std::sync::Arc;
use std::time::Duration;

use crate::network::{MessagingConnector, MessagingSession};

/// Decision callback for installation-cap failures: `true` retries, `false`
/// aborts with the remediation message.
pub type InstallationLimitDecision = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub max_attempts: u32,
    /// First attempt gets the long timeout; cold starts are slow.
    pub first_attempt_timeout: Duration,
    /// Later attempts fail fast once everything is warm.
    pub retry_timeout: Duration,
    /// Delay before attempt n is `n * base_retry_delay`.
    pub base_retry_delay: Duration,
    /// Documented network cap, surfaced in the remediation message. Metadata
    /// only; nothing in the core branches on the number.
    pub installation_cap: u32,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            first_attempt_timeout: Duration::from_secs(30),
            retry_timeout: Duration::from_secs(10),
            base_retry_delay: Duration::from_secs(2),
            installation_cap: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{remediation}")]
    InstallationLimit { remediation: String },
    #[error("all {attempts} connection attempt(s) failed: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Phrases the messaging network uses when an identity has registered too
/// many live installations. Matched case-insensitively against failure text.
const INSTALLATION_LIMIT_PHRASES: &[&str] = &[
    "installation limit",
    "too many installations",
    "maximum number of installations",
    "installation cap",
    "device limit",
    "max installations",
];

pub fn is_installation_limit_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    INSTALLATION_LIMIT_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

fn installation_limit_remediation(cap: u32, underlying: &str) -> String {
    format!(
        "The agent's identity has hit the messaging network's installation limit \
         (up to {cap} live installations per identity).\n\n\
         Each deployment that connects with this key registers a new installation, \
         and old ones are not reclaimed automatically. Revoke stale installations \
         from a wallet session, or rotate to a fresh key for this deployment, then \
         restart the agent.\n\n\
         Underlying error: {underlying}"
    )
}

pub struct ConnectionBootstrapper {
    connector: Arc<dyn MessagingConnector>,
    options: BootstrapOptions,
    on_installation_limit: Option<InstallationLimitDecision>,
}

impl ConnectionBootstrapper {
    pub fn new(connector: Arc<dyn MessagingConnector>, options: BootstrapOptions) -> Self {
        Self {
            connector,
            options,
            on_installation_limit: None,
        }
    }

    /// Supply the recovery decision for installation-cap failures. Without
    /// one, a classified cap failure aborts immediately.
    pub fn with_installation_limit_decision(mut self, decision: InstallationLimitDecision) -> Self {
        self.on_installation_limit = Some(decision);
        self
    }

    /// Run the bootstrap to completion: a live session or a terminal error.
    pub async fn connect(&self) -> Result<Box<dyn MessagingSession>, BootstrapError> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.options.max_attempts {
            let timeout = if attempt == 1 {
                self.options.first_attempt_timeout
            } else {
                self.options.retry_timeout
            };
            tracing::info!(
                "connecting to messaging network (attempt {}/{}, timeout {:?})",
                attempt,
                self.options.max_attempts,
                timeout
            );

            match self.attempt_once(timeout).await {
                Ok(session) => {
                    tracing::info!("messaging session established on attempt {}", attempt);
                    self.post_connect_probe(session.as_ref()).await;
                    return Ok(session);
                }
                Err(message) => {
                    tracing::warn!("connection attempt {} failed: {}", attempt, message);

                    if is_installation_limit_error(&message) {
                        let retry = match &self.on_installation_limit {
                            Some(decision) => decision(&message),
                            None => false,
                        };
                        if !retry {
                            return Err(BootstrapError::InstallationLimit {
                                remediation: installation_limit_remediation(
                                    self.options.installation_cap,
                                    &message,
                                ),
                            });
                        }
                        tracing::info!("installation limit acknowledged, retrying");
                    }

                    last_error = message;
                }
            }

            if attempt < self.options.max_attempts {
                let delay = self.options.base_retry_delay * attempt;
                tracing::debug!("waiting {:?} before next attempt", delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(BootstrapError::Exhausted {
            attempts: self.options.max_attempts,
            last_error,
        })
    }

    /// One timed attempt. The connect call runs in a spawned task; on
    /// timeout the task is left to finish on its own and whatever it returns
    /// is discarded.
    async fn attempt_once(&self, timeout: Duration) -> Result<Box<dyn MessagingSession>, String> {
        let connector = self.connector.clone();
        let handle = tokio::spawn(async move { connector.connect().await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(session))) => Ok(session),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(join_error)) => Err(format!("connect task panicked: {join_error}")),
            Err(_) => Err(format!("connection timed out after {timeout:?}")),
        }
    }

    /// Best-effort diagnostics after a successful connect; never fatal.
    async fn post_connect_probe(&self, session: &dyn MessagingSession) {
        match session.list_conversations(Some(1)).await {
            Ok(conversations) => {
                tracing::debug!(
                    "post-connect probe ok ({} conversation(s) visible)",
                    conversations.len()
                );
            }
            Err(e) => {
                tracing::warn!("post-connect probe failed (ignored): {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{GroupConversation, MessagingConnector, MessagingSession};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct StubSession;

    #[async_trait]
    impl MessagingSession for StubSession {
        fn agent_address(&self) -> &str {
            "0xagent"
        }

        async fn list_conversations(&self, _limit: Option<usize>) -> Result<Vec<String>> {
            Ok(vec!["conv-1".to_string()])
        }

        async fn conversation(&self, _id: &str) -> Result<Box<dyn GroupConversation>> {
            anyhow::bail!("not used in tests")
        }
    }

    enum Outcome {
        Succeed,
        Fail(&'static str),
        Hang,
    }

    struct ScriptedConnector {
        script: Mutex<Vec<Outcome>>,
        attempts: AtomicU32,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessagingConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn MessagingSession>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut script = self.script.lock().expect("script lock");
                if script.is_empty() {
                    Outcome::Succeed
                } else {
                    script.remove(0)
                }
            };
            match outcome {
                Outcome::Succeed => Ok(Box::new(StubSession) as Box<dyn MessagingSession>),
                Outcome::Fail(message) => anyhow::bail!("{}", message),
                Outcome::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn options() -> BootstrapOptions {
        BootstrapOptions {
            max_attempts: 3,
            first_attempt_timeout: Duration::from_secs(30),
            retry_timeout: Duration::from_secs(10),
            base_retry_delay: Duration::from_secs(2),
            installation_cap: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_on_first_attempt() {
        let connector = ScriptedConnector::new(vec![Outcome::Succeed]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options());
        let session = bootstrapper.connect().await.expect("session");
        assert_eq!(session.agent_address(), "0xagent");
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_growing_delay() {
        let connector = ScriptedConnector::new(vec![
            Outcome::Fail("network unreachable"),
            Outcome::Fail("network unreachable"),
            Outcome::Succeed,
        ]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options());
        let started = tokio::time::Instant::now();
        bootstrapper.connect().await.expect("session");
        assert_eq!(connector.attempts(), 3);
        // Delays: 1*2s after attempt 1, 2*2s after attempt 2.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_fails_at_the_attempt_timeout() {
        let connector = ScriptedConnector::new(vec![Outcome::Hang, Outcome::Succeed]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options());
        let started = tokio::time::Instant::now();
        bootstrapper.connect().await.expect("session");
        assert_eq!(connector.attempts(), 2);
        // First attempt hangs until its 30s timeout, then the 2s delay.
        assert!(started.elapsed() >= Duration::from_secs(32));
        assert!(started.elapsed() < Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_carries_the_last_error() {
        let connector = ScriptedConnector::new(vec![
            Outcome::Fail("boom one"),
            Outcome::Fail("boom two"),
            Outcome::Fail("boom three"),
        ]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options());
        let Err(err) = bootstrapper.connect().await else {
            panic!("should exhaust");
        };
        match err {
            BootstrapError::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("boom three"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn installation_limit_without_callback_aborts_immediately() {
        let connector = ScriptedConnector::new(vec![
            Outcome::Fail("client already registered 5/5: installation limit reached"),
            Outcome::Succeed,
        ]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options());
        let Err(err) = bootstrapper.connect().await else {
            panic!("should abort");
        };
        assert!(matches!(err, BootstrapError::InstallationLimit { .. }));
        assert!(err.to_string().contains("up to 5 live installations"));
        // No further attempts after the abort.
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn installation_limit_decision_false_aborts() {
        let connector =
            ScriptedConnector::new(vec![Outcome::Fail("too many installations"), Outcome::Succeed]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options())
            .with_installation_limit_decision(Box::new(|_| false));
        let Err(err) = bootstrapper.connect().await else {
            panic!("should abort");
        };
        assert!(matches!(err, BootstrapError::InstallationLimit { .. }));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn installation_limit_decision_true_retries() {
        let connector =
            ScriptedConnector::new(vec![Outcome::Fail("too many installations"), Outcome::Succeed]);
        let bootstrapper = ConnectionBootstrapper::new(connector.clone(), options())
            .with_installation_limit_decision(Box::new(|_| true));
        let session = bootstrapper.connect().await.expect("session");
        assert_eq!(session.agent_address(), "0xagent");
        assert_eq!(connector.attempts(), 2);
    }

    #[test]
    fn limit_classification_is_phrase_based() {
        assert!(is_installation_limit_error("Installation LIMIT reached"));
        assert!(is_installation_limit_error(
            "identity has too many installations registered"
        ));
        assert!(!is_installation_limit_error("connection refused"));
        assert!(!is_installation_limit_error("timed out"));
    }
}
