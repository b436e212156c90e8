pub mod analysis;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod custody;
pub mod evidence;
pub mod executor;
pub mod logging;
pub mod probe;
pub mod processor;
pub mod report;
pub mod validate;
