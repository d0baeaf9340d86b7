pub mod cli;
pub mod credentials;
pub mod drive;
pub mod dynamo;
pub mod health;
pub mod load_config;
pub mod schema;

pub use cli::{run, Cli, Commands};
