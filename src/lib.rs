pub mod analysis;
pub mod blob;
pub mod capture;
pub mod command;
pub mod config;
pub mod executor;
pub mod har;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod rank;
pub mod resolve;
pub mod service;
pub mod storage;
