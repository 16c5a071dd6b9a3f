use crate::auth::validate_token_format;
use crate::reconnect::{BackoffConfig, ReconnectManager};
use crate::session::{self, ClientHello, CloseReason, ControlSession, Established, IncomingStream};
use crate::transport::ws;
use poglets_common::{Result, SessionConfig, TunnelError};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dials the control endpoint and keeps a session up until shut down.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    url: String,
    hello: ClientHello,
    session_config: SessionConfig,
    backoff: BackoffConfig,
    max_attempts: Option<u32>,
}

impl TunnelClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hello: ClientHello {
                token: token.into(),
                routes: Vec::new(),
                strict_forwarding: true,
            },
            session_config: SessionConfig::default(),
            backoff: BackoffConfig::default(),
            max_attempts: None,
        }
    }

    /// Route keys advertised to the server, and whether only they are served.
    #[must_use]
    pub fn with_routes(mut self, routes: Vec<String>, strict_forwarding: bool) -> Self {
        self.hello.routes = routes;
        self.hello.strict_forwarding = strict_forwarding;
        self
    }

    #[must_use]
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up after this many consecutive failures. Unlimited by default.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Single connect attempt: dial, authenticate, start the session.
    pub async fn connect(&self) -> Result<Established> {
        validate_token_format(&self.hello.token, 256)?;
        debug!("Dialing {}", self.url);
        session::connect(
            ws::dial(&self.url),
            &self.hello,
            self.session_config.clone(),
        )
        .await
    }

    /// Connect, serve incoming streams with `handler`, and reconnect with
    /// backoff whenever the session is lost.
    ///
    /// Returns `Ok` once `shutdown` is cancelled, or the first error that
    /// retrying cannot fix.
    pub async fn run<F, Fut, C>(
        &self,
        handler: F,
        mut on_connected: C,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        F: Fn(ControlSession, IncomingStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        C: FnMut(&ControlSession),
    {
        let mut manager = ReconnectManager::new(self.backoff.clone(), self.max_attempts);

        loop {
            manager.start_attempt();
            info!("Connecting to {}", self.url);

            let attempt = tokio::select! {
                attempt = self.connect() => attempt,
                () = shutdown.cancelled() => return Ok(()),
            };
            match attempt {
                Ok(established) => {
                    manager.on_connected();
                    info!("Tunnel established, session {}", established.session.id());
                    on_connected(&established.session);

                    let reason = serve(established, &handler, &shutdown).await;
                    if shutdown.is_cancelled() {
                        info!("Session closed for shutdown ({reason})");
                        return Ok(());
                    }
                    warn!("Session lost: {reason}");
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!("Connection attempt failed: {e}"),
            }

            let Some(delay) = manager.on_disconnected() else {
                return Err(TunnelError::Connection(format!(
                    "giving up after {} attempts",
                    manager.attempts()
                )));
            };
            info!("Reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => return Ok(()),
            }
        }
    }
}

/// Hand every incoming stream to `handler` until the session ends.
async fn serve<F, Fut>(
    established: Established,
    handler: &F,
    shutdown: &CancellationToken,
) -> CloseReason
where
    F: Fn(ControlSession, IncomingStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Established {
        session,
        mut incoming,
        driver,
    } = established;

    loop {
        tokio::select! {
            stream = incoming.accept() => match stream {
                Some(stream) => {
                    tokio::spawn(handler(session.clone(), stream));
                }
                None => break,
            },
            () = shutdown.cancelled() => {
                session.drain();
                break;
            }
        }
    }
    drop(incoming);

    driver
        .await
        .unwrap_or_else(|e| CloseReason::Transport(format!("session task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::BackoffConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_invalid_token_is_fatal() {
        let client = TunnelClient::new("ws://127.0.0.1:1", "bad\ntoken");
        let result = client
            .run(|_, _| async {}, |_| {}, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[tokio::test]
    async fn test_non_ws_url_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TunnelClient::new(format!("http://{addr}"), "");
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.run(|_, _| async {}, |_| {}, CancellationToken::new()),
        )
        .await
        .expect("retry loop should stop on a bad scheme");
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[tokio::test]
    async fn test_bounded_retries_give_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TunnelClient::new(format!("ws://{addr}"), "")
            .with_backoff(BackoffConfig {
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
                factor: 2.0,
                jitter: 0.0,
            })
            .with_max_attempts(Some(3));
        let result = client
            .run(|_, _| async {}, |_| {}, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_retry_loop() {
        let client = TunnelClient::new("ws://127.0.0.1:1", "").with_backoff(BackoffConfig {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.0,
        });
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.run(|_, _| async {}, |_| {}, shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
