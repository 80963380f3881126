//! HTTP and WebSocket handlers for lbo-server
//!
//! REST endpoints create batches, accept items and answer status queries;
//! `/ws/{client_id}` carries progress pushes.

pub mod batches;
pub mod health;
pub mod ws;

pub use batches::batch_routes;
pub use health::health_routes;
pub use ws::ws_routes;
