// Core moderation module - strikes, mutes and their lifecycle.
// Following the same layout as the leveling module: models plus a service
// that talks to storage and Discord only through traits.

pub mod moderation_models;
pub mod moderation_service;

pub use moderation_models::*;
pub use moderation_service::*;
