// Voice channel XP: every tick, members talking together in a voice channel
// get an award that ignores the chat cooldown.

use crate::core::leveling::{voice_multiplier, AwardOutcome, VoiceActivity};
use crate::discord::commands::leveling::AppLeveling;
use poise::serenity_prelude as serenity;
use std::collections::HashMap;

/// One occupied voice seat, copied out of the cache so no cache lock is held
/// across an await.
#[derive(Debug, Clone)]
pub struct VoiceSeat {
    pub channel_id: u64,
    pub user_id: u64,
    pub bot: bool,
    pub activity: VoiceActivity,
}

/// Pay out one voice tick in every guild the bot can see.
pub async fn award_voice_activity(cache: &serenity::Cache, leveling: &AppLeveling) {
    let mut awarded = 0usize;

    for guild_id in cache.guilds() {
        let Some((seats, afk_channel)) = snapshot_guild(cache, guild_id) else {
            continue;
        };

        for (user_id, multiplier) in eligible_members(&seats, afk_channel) {
            match leveling
                .award(user_id, guild_id.get(), multiplier, true)
                .await
            {
                Ok(AwardOutcome::Awarded { .. }) => awarded += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user_id, guild_id = %guild_id, error = %e, "Voice award failed");
                }
            }
        }
    }

    tracing::debug!(awarded, "Voice XP tick finished");
}

fn snapshot_guild(
    cache: &serenity::Cache,
    guild_id: serenity::GuildId,
) -> Option<(Vec<VoiceSeat>, Option<u64>)> {
    let guild = cache.guild(guild_id)?;
    let afk_channel = guild
        .afk_metadata
        .as_ref()
        .map(|afk| afk.afk_channel_id.get());
    Some((collect_seats(&guild), afk_channel))
}

fn collect_seats(guild: &serenity::Guild) -> Vec<VoiceSeat> {
    guild
        .voice_states
        .values()
        .filter_map(|state| {
            let channel_id = state.channel_id?;
            let bot = guild
                .members
                .get(&state.user_id)
                .or(state.member.as_ref())
                .map_or(false, |member| member.user.bot);

            Some(VoiceSeat {
                channel_id: channel_id.get(),
                user_id: state.user_id.get(),
                bot,
                activity: VoiceActivity {
                    deafened: state.self_deaf,
                    muted: state.self_mute,
                    video: state.self_video,
                    streaming: state.self_stream.unwrap_or(false),
                },
            })
        })
        .collect()
}

/// Who earns voice XP this tick, and at what multiplier.
///
/// Channels need at least two occupants and the AFK channel never pays.
/// Bots and deafened members are skipped.
pub fn eligible_members(seats: &[VoiceSeat], afk_channel: Option<u64>) -> Vec<(u64, f64)> {
    let mut occupancy: HashMap<u64, usize> = HashMap::new();
    for seat in seats {
        *occupancy.entry(seat.channel_id).or_default() += 1;
    }

    seats
        .iter()
        .filter(|seat| Some(seat.channel_id) != afk_channel)
        .filter(|seat| occupancy.get(&seat.channel_id).copied().unwrap_or(0) >= 2)
        .filter(|seat| !seat.bot)
        .filter_map(|seat| voice_multiplier(seat.activity).map(|m| (seat.user_id, m)))
        .collect()
}
