//! SETUP configuration and the server-side acceptance gate.
//!
//! A client builds a [`SetupConfig`] with the fluent setters and hands it
//! to [`connect`](crate::connection::connect); the server observes the
//! same parameters as a [`SetupInfo`] through its [`ClientAcceptor`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ErrorCode, RSocketError, Result};
use crate::frame::{Frame, FrameBody, Payload, Version};
use crate::requester::Requester;
use crate::responder::Responder;

/// Boxed future returned by acceptor callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default interval between KEEPALIVE frames.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default max tolerated peer silence.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// Default MIME type for metadata and data.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Client-side SETUP parameters.
#[derive(Debug, Clone)]
pub struct SetupConfig {
    /// Time between locally-emitted KEEPALIVE frames, > 0.
    pub keepalive_interval: Duration,
    /// Max tolerated peer silence, >= `keepalive_interval`.
    pub max_lifetime: Duration,
    /// Metadata encoding MIME type (US-ASCII, at most 255 octets).
    pub metadata_mime_type: String,
    /// Data encoding MIME type (US-ASCII, at most 255 octets).
    pub data_mime_type: String,
    /// Resume identification token, carried verbatim.
    pub resume_token: Option<Bytes>,
    /// Whether this client honors LEASE frames.
    pub honors_lease: bool,
    /// Setup payload delivered to the server with the handshake.
    pub payload: Payload,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            resume_token: None,
            honors_lease: false,
            payload: Payload::empty(),
        }
    }
}

impl SetupConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keepalive interval.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the max lifetime.
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Set metadata and data MIME types.
    pub fn mime_types(mut self, metadata: &str, data: &str) -> Self {
        self.metadata_mime_type = metadata.to_string();
        self.data_mime_type = data.to_string();
        self
    }

    /// Set the resume identification token.
    pub fn resume_token(mut self, token: Bytes) -> Self {
        self.resume_token = Some(token);
        self
    }

    /// Declare that this client honors LEASE frames.
    pub fn honors_lease(mut self) -> Self {
        self.honors_lease = true;
        self
    }

    /// Set the setup payload.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Validate the configuration for protocol compliance.
    pub fn validate(&self) -> Result<()> {
        let keepalive_ms = self.keepalive_interval.as_millis();
        let lifetime_ms = self.max_lifetime.as_millis();
        if keepalive_ms == 0 {
            return Err(RSocketError::Protocol(
                "keepalive interval must be positive".to_string(),
            ));
        }
        if keepalive_ms > u32::MAX as u128 || lifetime_ms > u32::MAX as u128 {
            return Err(RSocketError::Protocol(
                "keepalive timing exceeds u32 milliseconds".to_string(),
            ));
        }
        if lifetime_ms < keepalive_ms {
            return Err(RSocketError::Protocol(
                "max lifetime below keepalive interval".to_string(),
            ));
        }
        for mime in [&self.metadata_mime_type, &self.data_mime_type] {
            if mime.len() > 255 || !mime.is_ascii() {
                return Err(RSocketError::Protocol(format!(
                    "mime type must be US-ASCII and at most 255 octets: {:?}",
                    mime
                )));
            }
        }
        Ok(())
    }

    /// Build the SETUP frame for this configuration.
    pub(crate) fn to_frame(&self) -> Frame {
        Frame::new(
            0,
            FrameBody::Setup {
                version: Version::CURRENT,
                keepalive_ms: self.keepalive_interval.as_millis() as u32,
                max_lifetime_ms: self.max_lifetime.as_millis() as u32,
                resume_token: self.resume_token.clone(),
                metadata_mime: self.metadata_mime_type.clone(),
                data_mime: self.data_mime_type.clone(),
                honors_lease: self.honors_lease,
                payload: self.payload.clone(),
            },
        )
    }
}

/// Server-side view of a received SETUP.
#[derive(Debug, Clone)]
pub struct SetupInfo {
    /// Protocol version announced by the client.
    pub version: Version,
    /// Client keepalive interval.
    pub keepalive_interval: Duration,
    /// Client max lifetime.
    pub max_lifetime: Duration,
    /// Resume identification token, if present.
    pub resume_token: Option<Bytes>,
    /// Metadata encoding MIME type.
    pub metadata_mime_type: String,
    /// Data encoding MIME type.
    pub data_mime_type: String,
    /// Whether the client honors LEASE frames.
    pub honors_lease: bool,
    /// Setup payload.
    pub payload: Payload,
}

/// A server's reason for refusing a client.
#[derive(Debug, Clone)]
pub struct SetupRejection {
    /// Setup error code sent on stream 0.
    pub code: ErrorCode,
    /// Error data sent on stream 0.
    pub message: String,
}

impl SetupRejection {
    /// Reject with INVALID_SETUP.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::INVALID_SETUP,
            message: message.into(),
        }
    }

    /// Reject with UNSUPPORTED_SETUP.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::UNSUPPORTED_SETUP,
            message: message.into(),
        }
    }

    /// Reject with REJECTED_SETUP.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::REJECTED_SETUP,
            message: message.into(),
        }
    }
}

/// Server-side gate and initializer for inbound connections.
pub trait ClientAcceptor: Send + Sync + 'static {
    /// Decide whether to accept the client. Runs synchronously on the
    /// connection loop before any other frame is processed.
    fn should_accept(&self, info: &SetupInfo) -> std::result::Result<(), SetupRejection>;

    /// Build the responder for an accepted client. While the returned
    /// future is pending, inbound frames are buffered in arrival order
    /// and replayed once it resolves. The `requester` may be kept for
    /// server-initiated interactions.
    fn initialize(
        &self,
        info: SetupInfo,
        requester: Requester,
    ) -> BoxFuture<'static, Result<Arc<dyn Responder>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SetupConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let config = SetupConfig::new().keepalive(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifetime_below_keepalive_rejected() {
        let config = SetupConfig::new()
            .keepalive(Duration::from_secs(10))
            .max_lifetime(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_ascii_mime_rejected() {
        let config = SetupConfig::new().mime_types("utf8", "übertype");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlong_mime_rejected() {
        let long = "x".repeat(256);
        let config = SetupConfig::new().mime_types(&long, "utf8");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_frame_carries_all_fields() {
        let config = SetupConfig::new()
            .keepalive(Duration::from_millis(500))
            .max_lifetime(Duration::from_millis(5000))
            .mime_types("utf8", "utf8")
            .resume_token(Bytes::from_static(b"tok"))
            .honors_lease()
            .payload(Payload::from_data(Bytes::from_static(b"hi")));

        let frame = config.to_frame();
        assert_eq!(frame.stream_id, 0);
        match frame.body {
            FrameBody::Setup {
                keepalive_ms,
                max_lifetime_ms,
                resume_token,
                metadata_mime,
                data_mime,
                honors_lease,
                payload,
                ..
            } => {
                assert_eq!(keepalive_ms, 500);
                assert_eq!(max_lifetime_ms, 5000);
                assert_eq!(resume_token, Some(Bytes::from_static(b"tok")));
                assert_eq!(metadata_mime, "utf8");
                assert_eq!(data_mime, "utf8");
                assert!(honors_lease);
                assert_eq!(&payload.data[..], b"hi");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
