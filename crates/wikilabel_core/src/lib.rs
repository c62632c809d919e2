pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod migrate;
pub mod model;
pub mod runtime;
pub mod source;
pub mod store;
pub mod suggest;
