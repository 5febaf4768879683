pub mod connections;
pub mod health;
pub mod link;

pub use connections::{list_connections, trigger_sync};
pub use health::{health_check, metrics_handler, readiness_check};
pub use link::{create_link_token, exchange_public_token};
