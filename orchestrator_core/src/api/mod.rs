//! HTTP/JSON API surface: routes, handlers, the response envelope, and
//! error mapping.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::ApiState;
