pub mod handlers;
pub mod request_context;
pub mod routes;

pub use routes::create_router;
