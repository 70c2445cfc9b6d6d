pub mod monitor;
pub mod notifications;
pub mod server;
pub mod store;
pub mod version;
pub mod web;
