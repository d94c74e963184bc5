// Discord commands for the reward system.
//
// **Notice the pattern:**
// 1. Extract primitive data from Discord types
// 2. Call core service
// 3. Format the response based on the result
//
// This layer is THIN - no business logic, just translation.

use crate::core::leveling::{DeletionTally, LevelingError, LevelingService, RewardAccount};
use crate::core::moderation::ModerationService;
use crate::core::scheduling::PeriodicTask;
use crate::discord::moderation::serenity_platform::SerenityPlatform;
use crate::infra::leveling::SqliteRewardStore;
use crate::infra::moderation::SqliteModerationStore;
use poise::serenity_prelude as serenity;
use std::sync::Arc;

const LEADERBOARD_SIZE: usize = 100;
const PER_PAGE: usize = 10;
const DELETION_BOARD_SIZE: usize = 10;

/// Show your (or someone else's) XP, level and rank.
#[poise::command(slash_command, guild_only)]
pub async fn xp(
    ctx: Context<'_>,
    #[description = "User to check (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let target_user = user.as_ref().unwrap_or_else(|| ctx.author());
    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();

    if target_user.bot {
        ctx.say("Bots don't earn XP! 🤖").await?;
        return Ok(());
    }

    let standing = ctx
        .data()
        .leveling
        .get_standing(target_user.id.get(), guild_id)
        .await?;

    let embed = serenity::CreateEmbed::new()
        .title(format!("Activity stats for {}", target_user.name))
        .color(0x00ff00)
        .thumbnail(target_user.face())
        .field(
            "Standing",
            format!(
                "**[#{}]** Lv. {:.2} ({}xp)",
                standing.rank, standing.level, standing.points
            ),
            false,
        );

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Show how far you are from a level.
#[poise::command(slash_command, guild_only)]
pub async fn levelreq(
    ctx: Context<'_>,
    #[description = "Target level"]
    #[min = 0]
    level: f64,
) -> Result<(), Error> {
    if !level.is_finite() || level <= 0.0 {
        ctx.say("Please pick a level above 0.").await?;
        return Ok(());
    }

    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();

    let leveling = &ctx.data().leveling;
    let current = leveling.get_points(ctx.author().id.get(), guild_id).await?;
    let required = leveling.points_required_for_level(level);
    let percent = leveling.progress_percent(current, level);

    ctx.say(format!(
        "**Level progression to {:.2}.**\n> `{}/{}xp ({:.2}%)`\n{}",
        level,
        current,
        required,
        percent,
        build_progress_bar(percent / 100.0, 15)
    ))
    .await?;
    Ok(())
}

/// Show the XP leaderboard for this server.
#[poise::command(slash_command, guild_only)]
pub async fn leaderboard(
    ctx: Context<'_>,
    #[description = "Page number (default: 1)"]
    #[min = 1]
    page: Option<usize>,
) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();

    let accounts = ctx
        .data()
        .leveling
        .get_leaderboard(guild_id, LEADERBOARD_SIZE)
        .await?;

    if accounts.is_empty() {
        ctx.say("No one has earned XP yet! Start chatting to get on the leaderboard! 💬")
            .await?;
        return Ok(());
    }

    let total_pages = (accounts.len() + PER_PAGE - 1) / PER_PAGE;
    let mut current_page = page.unwrap_or(1).clamp(1, total_pages);

    let reply = ctx
        .send(
            poise::CreateReply::default()
                .embed(leaderboard_embed(&ctx, guild_id, &accounts, current_page, total_pages).await?)
                .components(page_buttons(current_page, total_pages)),
        )
        .await?;
    let msg_id = reply.message().await?.id;

    while let Some(mci) = serenity::ComponentInteractionCollector::new(ctx)
        .author_id(ctx.author().id)
        .channel_id(ctx.channel_id())
        .timeout(std::time::Duration::from_secs(60 * 2))
        .filter(move |mci| mci.message.id == msg_id)
        .await
    {
        match mci.data.custom_id.as_str() {
            "prev" if current_page > 1 => current_page -= 1,
            "next" if current_page < total_pages => current_page += 1,
            _ => {}
        }

        if let Err(e) = mci.defer(ctx.http()).await {
            tracing::warn!("Error deferring interaction: {:?}", e);
            continue;
        }

        let embed = leaderboard_embed(&ctx, guild_id, &accounts, current_page, total_pages).await?;
        reply
            .edit(
                ctx,
                poise::CreateReply::default()
                    .embed(embed)
                    .components(page_buttons(current_page, total_pages)),
            )
            .await?;
    }

    Ok(())
}

async fn leaderboard_embed(
    ctx: &Context<'_>,
    guild_id: u64,
    accounts: &[RewardAccount],
    page: usize,
    total_pages: usize,
) -> Result<serenity::CreateEmbed, LevelingError> {
    let leveling = &ctx.data().leveling;
    let offset = (page - 1) * PER_PAGE;
    let mut description = String::new();

    for account in accounts.iter().skip(offset).take(PER_PAGE) {
        // Ties share a rank, so ask the service rather than counting rows.
        let rank = leveling.get_rank(guild_id, account.points).await?;
        let medal = match rank {
            1 => "🥇",
            2 => "🥈",
            3 => "🥉",
            _ => "  ",
        };
        let name = resolve_display_name_cached(ctx, guild_id, account.user_id);

        description.push_str(&format!(
            "{} **#{}** {}\nLv. {:.2} ({}xp)\n\n",
            medal,
            rank,
            name,
            leveling.level(account.points),
            account.points
        ));
    }

    Ok(serenity::CreateEmbed::new()
        .title("XP/Level Leaderboard")
        .description(description)
        .color(0xffd700)
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Page {}/{}",
            page, total_pages
        ))))
}

fn page_buttons(page: usize, total_pages: usize) -> Vec<serenity::CreateActionRow> {
    vec![serenity::CreateActionRow::Buttons(vec![
        serenity::CreateButton::new("prev")
            .label("◀ Previous")
            .style(serenity::ButtonStyle::Primary)
            .disabled(page == 1),
        serenity::CreateButton::new("next")
            .label("Next ▶")
            .style(serenity::ButtonStyle::Primary)
            .disabled(page == total_pages),
    ])]
}

/// Show who has had the most messages deleted in this server.
#[poise::command(slash_command, guild_only)]
pub async fn deleterboard(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();

    let board = ctx
        .data()
        .leveling
        .get_deletion_board(guild_id, DELETION_BOARD_SIZE)
        .await?;

    if board.is_empty() {
        ctx.say("Not a single soul has ever told a lie..").await?;
        return Ok(());
    }

    let named: Vec<(String, &DeletionTally)> = board
        .iter()
        .map(|tally| (resolve_display_name_cached(&ctx, guild_id, tally.user_id), tally))
        .collect();

    ctx.send(
        poise::CreateReply::default().embed(
            serenity::CreateEmbed::new()
                .title("Deleted message leaderboards.")
                .description(deletion_board_text(&named))
                .color(0x992d22),
        ),
    )
    .await?;
    Ok(())
}

fn deletion_board_text(named: &[(String, &DeletionTally)]) -> String {
    named
        .iter()
        .enumerate()
        .map(|(i, (name, tally))| {
            let noun = if tally.deleted == 1 { "message" } else { "messages" };
            format!("**#{}** {} · {} {}", i + 1, name, tally.deleted, noun)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Set a member's XP to an exact value.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn setxp(
    ctx: Context<'_>,
    #[description = "Member to update"] user: serenity::User,
    #[description = "New XP total"] amount: u64,
) -> Result<(), Error> {
    if user.bot {
        ctx.say("Bots don't earn XP! 🤖").await?;
        return Ok(());
    }

    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();

    ctx.data()
        .leveling
        .set_points(user.id.get(), guild_id, amount)
        .await?;

    ctx.say(format!("✅ {} now has {} XP.", user.name, amount))
        .await?;
    Ok(())
}

/// Take XP away from a member.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn takexp(
    ctx: Context<'_>,
    #[description = "Member to update"] user: serenity::User,
    #[description = "XP to remove"] amount: u64,
) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();

    match ctx
        .data()
        .leveling
        .deduct_points(user.id.get(), guild_id, amount)
        .await
    {
        Ok(total) => {
            ctx.say(format!(
                "✅ Took {} XP from {}. They now have {} XP.",
                amount, user.name, total
            ))
            .await?;
        }
        Err(LevelingError::InsufficientPoints { available, .. }) => {
            ctx.say(format!(
                "❌ {} only has {} XP, nothing was taken.",
                user.name, available
            ))
            .await?;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

// ============================================================================
// SHARED DATA
// ============================================================================

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

pub type AppLeveling = LevelingService<SqliteRewardStore>;
pub type AppModeration = ModerationService<SqliteModerationStore, SerenityPlatform>;

/// Data that's shared across all commands.
/// This is where we store our services and configuration.
pub struct Data {
    pub leveling: Arc<AppLeveling>,
    pub moderation: Arc<AppModeration>,
    /// Same platform the moderation service uses, for role provisioning
    pub platform: Arc<SerenityPlatform>,
    /// Recurring sweep that lifts mutes whose timer was lost
    pub mute_sweep: Arc<PeriodicTask>,
    /// Recurring voice-channel XP payout
    pub voice_xp: Arc<PeriodicTask>,
    /// Name given to the role created by `/moderation on`
    pub restriction_role_name: String,
}

/// Resolve a display name from the cache only. Leaderboards must not make
/// an HTTP call per row.
fn resolve_display_name_cached(ctx: &Context<'_>, guild_id: u64, user_id: u64) -> String {
    let guild_id_s = serenity::GuildId::from(guild_id);
    let user_id_s = serenity::UserId::from(user_id);

    if let Some(guild) = ctx.serenity_context().cache.guild(guild_id_s) {
        if let Some(member) = guild.members.get(&user_id_s) {
            return member.display_name().to_string();
        }
    }

    if let Some(user) = ctx.serenity_context().cache.user(user_id_s) {
        return user.name.clone();
    }

    format!("<@{}>", user_id)
}

pub(crate) fn build_progress_bar(progress: f64, length: usize) -> String {
    let clamped = progress.clamp(0.0, 1.0);
    let mut filled = (clamped * length as f64).round() as usize;
    if clamped > 0.0 && filled == 0 {
        filled = 1;
    }
    filled = filled.min(length);
    let bar = "▰".repeat(filled) + &"▱".repeat(length - filled);
    format!("{} ({}%)", bar, (clamped * 100.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::{build_progress_bar, deletion_board_text};
    use crate::core::leveling::DeletionTally;

    #[test]
    fn deletion_board_lists_in_order() {
        let first = DeletionTally {
            user_id: 1,
            deleted: 4,
        };
        let second = DeletionTally {
            user_id: 2,
            deleted: 1,
        };
        let named = vec![("alice".to_string(), &first), ("<@2>".to_string(), &second)];

        assert_eq!(
            deletion_board_text(&named),
            "**#1** alice · 4 messages\n**#2** <@2> · 1 message"
        );
    }

    #[test]
    fn progress_bar_fills_proportionally() {
        assert_eq!(build_progress_bar(0.0, 4), "▱▱▱▱ (0%)");
        assert_eq!(build_progress_bar(0.5, 4), "▰▰▱▱ (50%)");
        assert_eq!(build_progress_bar(2.0, 4), "▰▰▰▰ (100%)");
        // Any progress at all shows at least one block.
        assert_eq!(build_progress_bar(0.01, 4), "▰▱▱▱ (1%)");
    }
}
