mod handlers;
mod routes;

pub use handlers::{SDP_CONTENT_TYPE, SESSION_ID_HEADER};
pub use routes::create_router;
