// Discord layer - commands and event handlers.

#[path = "commands/command_catalog.rs"]
pub mod commands;

#[path = "leveling/chat_rewards.rs"]
pub mod chat_rewards;

#[path = "leveling/voice_rewards.rs"]
pub mod voice_rewards;

#[path = "moderation/mod.rs"]
pub mod moderation;

// Re-export command types for convenience
pub use commands::leveling::{Data, Error};
