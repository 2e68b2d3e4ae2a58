/**
 * ============================================================================
 * CONNECTION MODULE
 * ============================================================================
 *
 * PURPOSE: Authenticated, focus-aware socket to the tracking server
 *
 * ARCHITECTURE:
 * - auth: Token issue/refresh with single-flight renewal
 * - registry: One token lifecycle per endpoint, owned by the host
 * - client: WebSocket transport (auth frame, events, acknowledged requests)
 * - manager: Connection state machine, presence and activity
 *
 * ============================================================================
 */

pub mod auth;
pub mod client;
pub mod manager;
pub mod registry;

pub use auth::{HttpTokenApi, TokenApi, TokenLifecycle, TokenPair};
pub use client::{Handshake, SocketEvent, SocketTransport, WsTransport};
pub use manager::{ActivityKind, ConnectionManager, ConnectionPhase};
pub use registry::TokenRegistry;
