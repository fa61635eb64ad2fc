pub mod api;
pub mod auth;
pub mod frames;
pub mod gateway;

pub use api::{pick_default_channel, ApiResponse, QqApi};
pub use auth::AccessTokenCache;
pub use gateway::{AlwaysOnline, GatewayKeepAlive, SessionGate};
