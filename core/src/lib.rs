pub mod config;
pub mod engine;

pub use config::{AppConfig, CliArgs};
pub use engine::run;
