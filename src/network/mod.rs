//! Network Layer
//!
//! WebSocket server, per-connection sessions, the HTTP validation surface
//! and the wire protocol they speak.

pub mod auth;
pub mod http;
pub mod protocol;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, AuthError, IdentityVerifier, JwtVerifier, TokenClaims, validate_token};
pub use http::{create_router, serve_http, HttpState, ValidateRoomRequest, ValidateRoomResponse};
pub use protocol::{ChatLine, ClientMessage, ServerMessage};
pub use session::{Flow, Session, SessionConfig, SessionState};
pub use server::{PresenceServer, ServerError};
