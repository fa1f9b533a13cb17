/// Server configuration loading.
pub mod config;
/// Common error types: frame encoding, HTTP handshake.
pub mod error;
/// Logging (tracing subscriber initialization).
pub mod logging;
/// Network stack: HTTP handshake and Tokio-based server.
pub mod network;
/// Real-time event push core: frames, registry, publisher, connections.
pub mod sse;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Settings loaded from defaults and PUSHKA_-prefixed environment variables.
pub use config::Settings;
/// Operation errors.
pub use error::{EncodeError, HandshakeError};
/// Logging configuration and init.
pub use logging::{init_logging, LoggingConfig};
/// Server state and accept loop.
pub use network::{run_server, ServerState, SUBSCRIBER_HEADER};
/// Event push API.
pub use sse::{
    comment_frame, event_frame, ConnectionConfig, ConnectionHandle, ConnectionId, ConnectionState,
    EventPublisher, SseConnection, SseRegistry, SubscriberId,
};
