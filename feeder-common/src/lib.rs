pub mod config;
pub mod fetch;
pub mod health;
pub mod metrics;
pub mod notification;
pub mod queue;
pub mod retry;
pub mod xml;
