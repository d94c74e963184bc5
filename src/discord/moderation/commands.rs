// Moderation slash commands: settings, strikes and mutes.

use crate::core::moderation::{
    BanStatus, BatchReport, MemberSnapshot, ModerationError, MuteOutcome, StrikeOutcome,
};
use crate::core::scheduling::format_countdown;
use crate::discord::commands::arguments::{format_duration, parse_duration, parse_mentions};
use crate::discord::{Data, Error};
use poise::serenity_prelude as serenity;

type Context<'a> = poise::Context<'a, Data, Error>;

#[derive(Debug, Clone, Copy, PartialEq, poise::ChoiceParameter)]
pub enum Toggle {
    #[name = "on"]
    On,
    #[name = "off"]
    Off,
}

/// Turn moderation on or off for this server.
///
/// Turning it on creates the muted role, turning it off deletes it.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn moderation(
    ctx: Context<'_>,
    #[description = "on or off"] state: Toggle,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let data = ctx.data();
    let enable = state == Toggle::On;

    let config = data.moderation.get_config(guild_id.get()).await?;
    if config.enabled == enable {
        ctx.say("No changes were made.").await?;
        return Ok(());
    }

    if enable {
        ctx.defer().await?;
        let role_id = data
            .platform
            .provision_restriction_role(guild_id, &data.restriction_role_name)
            .await?;
        data.moderation
            .set_moderation(guild_id.get(), true, Some(role_id.get()))
            .await?;
        ctx.say("✅ Moderation enabled.").await?;
    } else {
        data.moderation
            .set_moderation(guild_id.get(), false, None)
            .await?;
        if let Some(role_id) = config.restriction_role_id {
            if let Err(e) = data
                .platform
                .delete_restriction_role(guild_id, role_id.into())
                .await
            {
                tracing::warn!(guild_id = %guild_id, error = %e, "Could not delete muted role");
            }
        }
        ctx.say("❌ Moderation disabled.").await?;
    }

    Ok(())
}

/// Set how many strikes get a member banned.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn maxstrikes(
    ctx: Context<'_>,
    #[description = "Strike limit"]
    #[min = 1]
    limit: u32,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    match ctx
        .data()
        .moderation
        .set_max_strikes(guild_id.get(), limit)
        .await
    {
        Ok(()) => {
            ctx.say(format!("✅ Members are now banned at {} strikes.", limit))
                .await?;
            Ok(())
        }
        Err(e) => explain(ctx, e).await,
    }
}

/// Strike one or more members. Reaching the strike limit bans them.
#[poise::command(slash_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn strike(
    ctx: Context<'_>,
    #[description = "Members to strike (mentions)"] members: String,
    #[description = "Why they are being striked"] reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let Some((actor, subjects, missing)) = resolve_batch(ctx, &members).await? else {
        return Ok(());
    };

    let report = match ctx
        .data()
        .moderation
        .strike(
            guild_id.get(),
            &actor,
            &subjects,
            reason.as_deref().unwrap_or_default(),
        )
        .await
    {
        Ok(report) => report,
        Err(e) => return explain(ctx, e).await,
    };

    let banned = report.succeeded().filter(|(_, o)| o.banned()).count();
    let mut reply = render_report(&report, &missing, describe_strike);
    if banned > 0 {
        reply.push_str(&format!("\n🔨 {} member(s) banned.", banned));
    }

    ctx.say(reply).await?;
    Ok(())
}

/// List a member's strikes.
#[poise::command(slash_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn strikes(
    ctx: Context<'_>,
    #[description = "Member to look up"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let records = ctx
        .data()
        .moderation
        .list_strikes(guild_id.get(), user.id.get())
        .await?;

    if records.is_empty() {
        ctx.say("U are doing well young paddawan..").await?;
        return Ok(());
    }

    let description = records
        .iter()
        .map(|s| {
            format!(
                "[{}] {}. {}",
                s.issued_at.format("%Y-%m-%d %H:%M"),
                s.id,
                if s.reason.is_empty() { "(no reason)" } else { s.reason.as_str() }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let embed = serenity::CreateEmbed::new()
        .title(format!("{}'s strikes", user.name))
        .description(description)
        .color(0xE73C82);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Delete a strike by its id. Does not undo bans.
#[poise::command(slash_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn removestrike(
    ctx: Context<'_>,
    #[description = "Strike id (see /strikes)"] strike_id: i64,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let removed = ctx
        .data()
        .moderation
        .remove_strike(guild_id.get(), strike_id)
        .await?;

    if removed {
        ctx.say("✅ Strike removed.").await?;
    } else {
        ctx.say("No strike found!").await?;
    }
    Ok(())
}

/// Mute one or more members for a while.
#[poise::command(slash_command, guild_only, required_permissions = "MUTE_MEMBERS")]
pub async fn mute(
    ctx: Context<'_>,
    #[description = "How long, e.g. 30s, 10m, 2h, 1d, 1w"] duration: String,
    #[description = "Members to mute (mentions)"] members: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let Some(duration) = parse_duration(&duration) else {
        ctx.say("Invalid duration. Try something like `30s`, `10m`, `2h` or `1d`, up to a year.")
            .await?;
        return Ok(());
    };

    let Some((actor, subjects, missing)) = resolve_batch(ctx, &members).await? else {
        return Ok(());
    };

    let report = match ctx
        .data()
        .moderation
        .mute(guild_id.get(), &actor, &subjects, duration)
        .await
    {
        Ok(report) => report,
        Err(e) => return explain(ctx, e).await,
    };

    ctx.say(render_report(&report, &missing, |outcome: &MuteOutcome| {
        format!("muted until <t:{}:f>", outcome.muted_until.timestamp())
    }))
    .await?;
    Ok(())
}

/// Lift a member's mute early.
#[poise::command(slash_command, guild_only, required_permissions = "MUTE_MEMBERS")]
pub async fn unmute(
    ctx: Context<'_>,
    #[description = "Member to unmute"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    match ctx
        .data()
        .moderation
        .unmute(guild_id.get(), user.id.get())
        .await
    {
        Ok(true) => {
            ctx.say(format!("✅ {} has been unmuted.", user.name)).await?;
            Ok(())
        }
        Ok(false) => {
            ctx.say(format!("{} was not muted.", user.name)).await?;
            Ok(())
        }
        Err(e) => explain(ctx, e).await,
    }
}

/// Show how long a member stays muted.
#[poise::command(slash_command, guild_only)]
pub async fn mutestatus(
    ctx: Context<'_>,
    #[description = "Member to check"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let remaining = ctx
        .data()
        .moderation
        .mute_remaining(guild_id.get(), user.id.get())
        .await?;

    match remaining {
        Some(left) => {
            ctx.say(format!(
                "{} is muted for another {}.",
                user.name,
                format_duration(left)
            ))
            .await?
        }
        None => ctx.say(format!("{} is not muted.", user.name)).await?,
    };
    Ok(())
}

/// Show when expired mutes are next swept up (and when voice XP is next paid).
#[poise::command(slash_command)]
pub async fn next_sweep(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let mut reply = match data.mute_sweep.time_until_next_cycle() {
        Some(left) => format!("Next iteration in {}.", format_countdown(left)),
        None => "The mute sweep is not running.".to_string(),
    };
    if let Some(left) = data.voice_xp.time_until_next_cycle() {
        reply.push_str(&format!("\nVoice XP is paid out in {}.", format_countdown(left)));
    }

    ctx.say(reply).await?;
    Ok(())
}

// ============================================================================
// HELPERS
// ============================================================================

/// Turn a command's member list into snapshots. Replies and returns `None`
/// when there is nobody to act on.
async fn resolve_batch(
    ctx: Context<'_>,
    members: &str,
) -> Result<Option<(MemberSnapshot, Vec<MemberSnapshot>, Vec<u64>)>, Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let ids = parse_mentions(members);
    if ids.is_empty() {
        ctx.say("Please mention at least one member.").await?;
        return Ok(None);
    }

    let actor_member = ctx
        .author_member()
        .await
        .ok_or("Could not look up your membership")?;
    let actor = member_snapshot(ctx, &actor_member);

    let mut subjects = Vec::with_capacity(ids.len());
    let mut missing = Vec::new();
    for id in ids {
        match guild_id.member(ctx, serenity::UserId::new(id)).await {
            Ok(member) => subjects.push(member_snapshot(ctx, &member)),
            Err(e) => {
                tracing::debug!(user_id = id, error = %e, "Mentioned user is not a member");
                missing.push(id);
            }
        }
    }

    Ok(Some((actor, subjects, missing)))
}

/// What moderation needs to know about a member. The server owner outranks
/// everyone.
fn member_snapshot(ctx: Context<'_>, member: &serenity::Member) -> MemberSnapshot {
    let is_owner = ctx
        .guild()
        .map(|guild| guild.owner_id == member.user.id)
        .unwrap_or(false);

    let authority = if is_owner {
        u16::MAX
    } else {
        member
            .highest_role_info(ctx.cache())
            .map(|(_, position)| position)
            .unwrap_or(0)
    };

    MemberSnapshot {
        user_id: member.user.id.get(),
        authority,
        role_ids: member.roles.iter().map(|r| r.get()).collect(),
    }
}

fn describe_strike(outcome: &StrikeOutcome) -> String {
    let count = format!(
        "{}/{} strikes (#{})",
        outcome.active_strikes, outcome.max_strikes, outcome.strike_id
    );
    match &outcome.ban {
        BanStatus::NotBanned => count,
        BanStatus::Banned => format!("{} (banned)", count),
        BanStatus::Failed(e) => format!("{} (ban failed: {})", count, e),
    }
}

fn render_report<T>(
    report: &BatchReport<T>,
    missing: &[u64],
    describe: impl Fn(&T) -> String,
) -> String {
    let mut lines: Vec<String> = report
        .succeeded()
        .map(|(user_id, outcome)| format!("✅ <@{}>: {}", user_id, describe(outcome)))
        .collect();
    lines.extend(
        report
            .failed()
            .map(|(user_id, e)| format!("⏭️ <@{}>: {}", user_id, e)),
    );
    lines.extend(missing.iter().map(|id| format!("⏭️ <@{}>: not in this server", id)));
    lines.push(report.summary());
    lines.join("\n")
}

/// Reply with a readable message for errors the user can fix; pass the
/// rest up to the framework.
async fn explain(ctx: Context<'_>, error: ModerationError) -> Result<(), Error> {
    let message = match error {
        ModerationError::StorageError(_) => return Err(error.into()),
        ModerationError::FeatureDisabled => {
            "To use moderation, please first run `/moderation on`.".to_string()
        }
        ModerationError::ConfigMissing => {
            "Could not find the muted role! Try `/moderation off` and `/moderation on` again."
                .to_string()
        }
        ModerationError::Platform(e) => format!("Discord refused the change: {}", e),
        other => other.to_string(),
    };
    ctx.say(message).await?;
    Ok(())
}
