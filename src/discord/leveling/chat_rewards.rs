// Chat XP: messages and edits pay out through the same path, and a
// level-up gets a card in the channel it was earned in.

use crate::core::leveling::{LevelUpEvent, LevelingService, RewardStore};
use crate::discord::commands::leveling::build_progress_bar;
use crate::discord::Data;
use poise::serenity_prelude::{self as serenity, builder::CreateMessage};

/// What kind of chat activity earned the award.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatActivity {
    Message,
    Edit,
}

/// Pay a member for chat activity and announce any level-up it causes.
///
/// Failures are logged; a chat event never fails because of XP.
pub async fn reward_chat_activity(
    ctx: &serenity::Context,
    data: &Data,
    user_id: serenity::UserId,
    guild_id: serenity::GuildId,
    channel_id: serenity::ChannelId,
    activity: ChatActivity,
) {
    let outcome = match data
        .leveling
        .award(user_id.get(), guild_id.get(), 1.0, false)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(?activity, user_id = %user_id, guild_id = %guild_id, error = %e, "Error awarding chat XP");
            return;
        }
    };

    let Some(level_up) = outcome.into_level_up() else {
        return;
    };
    tracing::info!(
        user_id = level_up.user_id,
        guild_id = level_up.guild_id,
        old_level = level_up.old_level,
        new_level = level_up.new_level,
        total_points = level_up.total_points,
        ?activity,
        "User leveled up"
    );

    let card = LevelUpCard::new(&data.leveling, &level_up);
    if let Err(e) = channel_id
        .send_message(ctx, CreateMessage::new().embed(card.embed()))
        .await
    {
        tracing::warn!(channel_id = %channel_id, "Failed to send level-up card: {e}");
    }
}

/// Everything shown when a member reaches a new level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelUpCard {
    pub user_id: u64,
    pub level: u32,
    pub total_points: u64,
    /// Points needed for the level after this one.
    pub next_level_at: u64,
    /// Progress from zero toward `next_level_at`, as `/levelreq` shows it.
    pub percent: f64,
}

impl LevelUpCard {
    pub fn new<S: RewardStore>(leveling: &LevelingService<S>, level_up: &LevelUpEvent) -> Self {
        let next_level = f64::from(level_up.new_level) + 1.0;
        Self {
            user_id: level_up.user_id,
            level: level_up.new_level,
            total_points: level_up.total_points,
            next_level_at: leveling.points_required_for_level(next_level),
            percent: leveling.progress_percent(level_up.total_points, next_level),
        }
    }

    pub fn embed(&self) -> serenity::CreateEmbed {
        serenity::CreateEmbed::new()
            .title(format!("Level {}!", self.level))
            .description(format!("<@{}> just levelled up.", self.user_id))
            .color(tier_colour(self.level))
            .field(
                format!("Road to level {}", self.level + 1),
                format!(
                    "`{}/{}xp`\n{}",
                    self.total_points,
                    self.next_level_at,
                    build_progress_bar(self.percent / 100.0, 18)
                ),
                false,
            )
            .footer(serenity::CreateEmbedFooter::new(cheer(self.level)))
    }
}

/// Card colours, highest tier first.
const TIERS: [(u32, serenity::Colour); 4] = [
    (50, serenity::Colour::DARK_PURPLE),
    (25, serenity::Colour::ORANGE),
    (10, serenity::Colour::GOLD),
    (5, serenity::Colour::BLURPLE),
];

fn tier_colour(level: u32) -> serenity::Colour {
    TIERS
        .iter()
        .find(|(floor, _)| level >= *floor)
        .map_or(serenity::Colour::LIGHT_GREY, |(_, colour)| *colour)
}

fn cheer(level: u32) -> &'static str {
    const CHEERS: [&str; 4] = [
        "Keep chatting!",
        "Your activity is paying off.",
        "Another level down.",
        "That XP bar never stood a chance.",
    ];
    CHEERS[level as usize % CHEERS.len()]
}
