// Discord commands module.
// Each feature gets its own command file; moderation commands live next to
// their platform adapter in `discord/moderation`.

pub mod arguments;

pub mod leveling;
