pub mod loader;
pub mod schema;

pub use loader::{config_path, load_config};
pub use schema::{
    ChannelsConfig, CliConfig, Config, DiscordConfig, LlmConfig, SlackConfig, TelegramConfig,
    WhatsAppConfig,
};
