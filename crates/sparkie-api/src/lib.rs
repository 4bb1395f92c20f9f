pub mod auth;
pub mod chat;
pub mod error;
pub mod health;
pub mod images;
pub mod middleware;
pub mod persona;
pub mod rate_limit;
pub mod relay;
pub mod router;
pub mod state;
pub mod store;

pub use error::ApiError;
pub use router::build_router;
pub use state::{AppState, AppStateInner, AuthSettings};
