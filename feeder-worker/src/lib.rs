pub mod config;
pub mod dispatch;
pub mod error;
pub mod mapper;
pub mod pipeline;
pub mod processors;
pub mod registry;
pub mod worker;
