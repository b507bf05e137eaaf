pub mod catalog;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod executor;
pub mod exit;
pub mod logs;
pub mod plan;
pub mod platform;
pub mod probes;
pub mod safety;
pub mod scan;
pub mod session;
pub mod ui;
pub mod verify;
