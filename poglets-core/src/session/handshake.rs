//! Authentication exchange that precedes every session

use super::Capabilities;
use crate::auth::TokenAuthenticator;
use crate::transport::Transport;
use poglets_common::{Result, SessionConfig, TunnelError};
use poglets_protocol::constants::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SESSION_STREAM_ID};
use poglets_protocol::validation::{validate_frame, ValidationLimits};
use poglets_protocol::{ErrorCode, Frame, HandshakeAckFrame, HandshakeFrame};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the client presents when it dials.
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    pub token: String,
    /// Route keys this client serves
    pub routes: Vec<String>,
    pub strict_forwarding: bool,
}

/// How the server vets a dialing client.
#[derive(Debug, Clone)]
pub struct AcceptPolicy {
    pub authenticator: TokenAuthenticator,
    pub transport_wrapping: bool,
    pub limits: ValidationLimits,
}

impl AcceptPolicy {
    pub fn new(token: &str) -> Self {
        Self {
            authenticator: TokenAuthenticator::new(token),
            transport_wrapping: true,
            limits: ValidationLimits::default(),
        }
    }
}

/// Parameters both sides agreed on.
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    pub(crate) session_id: Uuid,
    pub(crate) token: String,
    pub(crate) capabilities: Capabilities,
    pub(crate) routes: Vec<String>,
    pub(crate) peer_window: u32,
}

pub(crate) async fn client_handshake(
    transport: &mut Transport,
    hello: &ClientHello,
    config: &SessionConfig,
) -> Result<Negotiated> {
    let own = Capabilities {
        strict_forwarding: hello.strict_forwarding,
        transport_wrapping: false,
    };
    transport
        .write_frame(&Frame::Handshake(Box::new(HandshakeFrame {
            token: hello.token.clone(),
            version: PROTOCOL_VERSION,
            capabilities: own.to_names(),
            routes: hello.routes.clone(),
            window: config.stream_window,
        })))
        .await?;

    let ack = match recv_first(transport, config.handshake_timeout).await? {
        Frame::HandshakeAck(ack) => ack,
        Frame::Error { code, message, .. } => {
            return Err(TunnelError::from_code(code, message));
        }
        other => {
            return Err(TunnelError::Protocol(format!(
                "expected handshake ack, got {:?}",
                other.kind()
            )));
        }
    };
    let HandshakeAckFrame {
        session_id,
        version,
        capabilities,
        window,
    } = *ack;

    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(TunnelError::Protocol(format!(
            "server speaks unsupported protocol version {version}"
        )));
    }
    if window == 0 {
        return Err(TunnelError::Protocol(
            "server advertised an empty stream window".to_string(),
        ));
    }

    debug!("Handshake accepted, session {session_id}");
    Ok(Negotiated {
        session_id,
        token: hello.token.clone(),
        capabilities: own.union(Capabilities::from_names(&capabilities)),
        routes: hello.routes.clone(),
        peer_window: window,
    })
}

pub(crate) async fn server_handshake(
    transport: &mut Transport,
    policy: &AcceptPolicy,
    config: &SessionConfig,
) -> Result<Negotiated> {
    let frame = recv_first(transport, config.handshake_timeout).await?;
    if let Err(e) = validate_frame(&frame, &policy.limits) {
        return Err(refuse(transport, ErrorCode::MalformedFrame, e.to_string()).await);
    }
    let hello = match frame {
        Frame::Handshake(hello) => *hello,
        other => {
            let msg = format!("expected handshake, got {:?}", other.kind());
            return Err(refuse(transport, ErrorCode::MalformedFrame, msg).await);
        }
    };

    if hello.version < MIN_PROTOCOL_VERSION {
        let msg = format!("unsupported protocol version {}", hello.version);
        return Err(refuse(transport, ErrorCode::MalformedFrame, msg).await);
    }
    if hello.window == 0 {
        let msg = "empty stream window".to_string();
        return Err(refuse(transport, ErrorCode::MalformedFrame, msg).await);
    }
    if !policy.authenticator.verify(&hello.token) {
        warn!("Rejected client with an invalid token");
        refuse(transport, ErrorCode::AuthenticationFailed, "invalid token".to_string()).await;
        return Err(TunnelError::Authentication(
            "client presented an invalid token".to_string(),
        ));
    }

    let own = Capabilities {
        strict_forwarding: false,
        transport_wrapping: policy.transport_wrapping,
    };
    let session_id = Uuid::new_v4();
    transport
        .write_frame(&Frame::HandshakeAck(Box::new(HandshakeAckFrame {
            session_id,
            version: hello.version.min(PROTOCOL_VERSION),
            capabilities: own.to_names(),
            window: config.stream_window,
        })))
        .await?;

    Ok(Negotiated {
        session_id,
        token: hello.token,
        capabilities: own.union(Capabilities::from_names(&hello.capabilities)),
        routes: hello.routes,
        peer_window: hello.window,
    })
}

async fn recv_first(transport: &mut Transport, limit: Duration) -> Result<Frame> {
    match tokio::time::timeout(limit, transport.receiver.recv()).await {
        Ok(Ok(Some(frame))) => Ok(frame),
        Ok(Ok(None)) => Err(TunnelError::Connection(
            "connection closed during handshake".to_string(),
        )),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TunnelError::Connection(format!(
            "handshake not completed within {limit:?}"
        ))),
    }
}

/// Report a session-level error to the client and close the connection.
async fn refuse(transport: &mut Transport, code: ErrorCode, message: String) -> TunnelError {
    let frame = Frame::error(SESSION_STREAM_ID, code, message.clone());
    if let Err(e) = transport.write_frame(&frame).await {
        debug!("Could not deliver handshake refusal: {e}");
    }
    let _ = transport.sink.close().await;
    TunnelError::from_code(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::io_transport;

    fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (io_transport(a), io_transport(b))
    }

    fn hello(token: &str) -> ClientHello {
        ClientHello {
            token: token.to_string(),
            routes: vec![String::new()],
            strict_forwarding: true,
        }
    }

    #[tokio::test]
    async fn test_matching_tokens_negotiate() {
        let (mut client, mut server) = pair();
        let config = SessionConfig::default();
        let policy = AcceptPolicy::new("secret");

        let hello = hello("secret");
        let (c, s) = tokio::join!(
            client_handshake(&mut client, &hello, &config),
            server_handshake(&mut server, &policy, &config),
        );
        let (c, s) = (c.unwrap(), s.unwrap());
        assert_eq!(c.session_id, s.session_id);
        assert!(c.capabilities.strict_forwarding && c.capabilities.transport_wrapping);
        assert_eq!(s.capabilities, c.capabilities);
        assert_eq!(s.routes, vec![String::new()]);
        assert_eq!(c.peer_window, config.stream_window);
    }

    #[tokio::test]
    async fn test_token_mismatch_fails_both_sides() {
        let (mut client, mut server) = pair();
        let config = SessionConfig::default();
        let policy = AcceptPolicy::new("secret");

        let hello = hello("wrong");
        let (c, s) = tokio::join!(
            client_handshake(&mut client, &hello, &config),
            server_handshake(&mut server, &policy, &config),
        );
        assert!(matches!(c, Err(TunnelError::Authentication(_))));
        assert!(matches!(s, Err(TunnelError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_empty_server_token_accepts_anything() {
        let (mut client, mut server) = pair();
        let config = SessionConfig::default();
        let mut policy = AcceptPolicy::new("");
        policy.transport_wrapping = false;

        let hello = hello("");
        let (c, s) = tokio::join!(
            client_handshake(&mut client, &hello, &config),
            server_handshake(&mut server, &policy, &config),
        );
        assert!(!c.unwrap().capabilities.transport_wrapping);
        assert!(s.is_ok());
    }

    #[tokio::test]
    async fn test_first_frame_must_be_handshake() {
        let (mut client, mut server) = pair();
        let config = SessionConfig::default();

        client.write_frame(&Frame::Keepalive { timestamp: 0 }).await.unwrap();
        let result = server_handshake(&mut server, &AcceptPolicy::new(""), &config).await;
        assert!(matches!(result, Err(TunnelError::Protocol(_))));

        assert!(matches!(
            client.receiver.recv().await.unwrap(),
            Some(Frame::Error {
                code: ErrorCode::MalformedFrame,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (_client, mut server) = pair();
        let config = SessionConfig::default();
        let result = server_handshake(&mut server, &AcceptPolicy::new(""), &config).await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }
}
