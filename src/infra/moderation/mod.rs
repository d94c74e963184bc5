// SQLite persistence for strikes, mutes and moderation settings.

pub mod sqlite_moderation_store;

pub use sqlite_moderation_store::SqliteModerationStore;
