pub mod base;
pub mod cli;
pub mod discord;
pub mod manager;
pub mod slack;
pub mod telegram;
pub mod whatsapp;

pub use base::Channel;
pub use manager::{ChannelStatus, Manager};
