pub mod builder;
pub mod config;
pub mod frame;
pub mod reader;
pub mod snapshot;
