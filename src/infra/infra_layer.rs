// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

#[path = "leveling/leveling_store.rs"]
pub mod leveling;

#[path = "moderation/mod.rs"]
pub mod moderation;
