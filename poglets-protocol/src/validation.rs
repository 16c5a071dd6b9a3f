//! Frame validation for security hardening

use crate::frame::Frame;

/// Validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Token too long: {len} bytes exceeds limit of {limit} bytes")]
    TokenTooLong { len: usize, limit: usize },

    #[error("Too many capabilities: {count} exceeds limit of {limit}")]
    TooManyCapabilities { count: usize, limit: usize },

    #[error("Capability too long: {len} bytes exceeds limit of {limit} bytes")]
    CapabilityTooLong { len: usize, limit: usize },

    #[error("Too many routes: {count} exceeds limit of {limit}")]
    TooManyRoutes { count: usize, limit: usize },

    #[error("Route key too long: {len} bytes exceeds limit of {limit} bytes")]
    RouteTooLong { len: usize, limit: usize },

    #[error("Too many headers: {count} exceeds limit of {limit}")]
    TooManyHeaders { count: usize, limit: usize },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Validation limits
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_token_len: usize,
    pub max_capabilities: usize,
    pub max_capability_len: usize,
    pub max_routes: usize,
    pub max_route_len: usize,
    pub max_headers: usize,
    pub max_payload_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_token_len: 256,
            max_capabilities: 32,
            max_capability_len: 64,
            max_routes: 32,
            max_route_len: 255,
            max_headers: 256,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

fn check_capabilities(caps: &[String], limits: &ValidationLimits) -> Result<(), ValidationError> {
    if caps.len() > limits.max_capabilities {
        return Err(ValidationError::TooManyCapabilities {
            count: caps.len(),
            limit: limits.max_capabilities,
        });
    }
    for cap in caps {
        if cap.len() > limits.max_capability_len {
            return Err(ValidationError::CapabilityTooLong {
                len: cap.len(),
                limit: limits.max_capability_len,
            });
        }
    }
    Ok(())
}

/// Validate a decoded frame against limits
pub fn validate_frame(frame: &Frame, limits: &ValidationLimits) -> Result<(), ValidationError> {
    match frame {
        Frame::Handshake(handshake) => {
            if handshake.token.len() > limits.max_token_len {
                return Err(ValidationError::TokenTooLong {
                    len: handshake.token.len(),
                    limit: limits.max_token_len,
                });
            }
            check_capabilities(&handshake.capabilities, limits)?;
            if handshake.routes.len() > limits.max_routes {
                return Err(ValidationError::TooManyRoutes {
                    count: handshake.routes.len(),
                    limit: limits.max_routes,
                });
            }
            if let Some(route) = handshake
                .routes
                .iter()
                .find(|r| r.len() > limits.max_route_len)
            {
                return Err(ValidationError::RouteTooLong {
                    len: route.len(),
                    limit: limits.max_route_len,
                });
            }
        }
        Frame::HandshakeAck(ack) => check_capabilities(&ack.capabilities, limits)?,
        Frame::Open { head, .. } => {
            if head.route_key.len() > limits.max_route_len {
                return Err(ValidationError::RouteTooLong {
                    len: head.route_key.len(),
                    limit: limits.max_route_len,
                });
            }
            if head.headers.len() > limits.max_headers {
                return Err(ValidationError::TooManyHeaders {
                    count: head.headers.len(),
                    limit: limits.max_headers,
                });
            }
        }
        Frame::Reply { head, .. } => {
            if head.headers.len() > limits.max_headers {
                return Err(ValidationError::TooManyHeaders {
                    count: head.headers.len(),
                    limit: limits.max_headers,
                });
            }
        }
        Frame::Data { data, .. } => {
            if data.len() > limits.max_payload_bytes {
                return Err(ValidationError::PayloadTooLarge {
                    size: data.len(),
                    limit: limits.max_payload_bytes,
                });
            }
        }
        _ => {}
    }
    Ok(())
}
