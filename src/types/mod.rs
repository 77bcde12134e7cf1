mod auth;
mod primitives;
mod websocket;

// Re-export all types
pub use auth::*;
pub use primitives::*;
pub use websocket::*;
