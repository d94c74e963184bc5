// Discord side of moderation: slash commands and the serenity-backed
// implementation of `ModerationPlatform`.

pub mod commands;
pub mod serenity_platform;
