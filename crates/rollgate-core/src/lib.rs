pub mod alias;
pub mod config;
pub mod interval;
pub mod types;

pub use alias::{ChannelAliases, normalize_app_id};
pub use config::{ChannelAlias, ConfigError, RollgateConfig};
pub use interval::parse_interval;
pub use types::*;
