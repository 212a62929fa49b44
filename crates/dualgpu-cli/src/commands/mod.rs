//! Command implementations

pub mod bench;
pub mod config;
pub mod gpus;
pub mod run;
pub mod serve;
