pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod git;
pub mod hook;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod model;
pub mod output;
pub mod paths;
pub mod store;
