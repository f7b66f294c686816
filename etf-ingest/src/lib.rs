pub mod cli;
pub mod gcloud;
pub mod load_config;
pub mod server;

pub use cli::{run, Cli, Commands};
