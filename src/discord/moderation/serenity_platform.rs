// Discord implementation of the moderation platform port.

use crate::core::moderation::{ModerationPlatform, PlatformError, PlatformErrorKind};
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use std::sync::Arc;

/// Colour of the muted role (pinkish).
const RESTRICTION_ROLE_COLOUR: u32 = 0xE73C82;

pub struct SerenityPlatform {
    http: Arc<serenity::Http>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }

    /// Find or create the muted role and stop it from talking in every text
    /// channel. Returns the role id.
    pub async fn provision_restriction_role(
        &self,
        guild_id: serenity::GuildId,
        name: &str,
    ) -> Result<serenity::RoleId, serenity::Error> {
        let roles = guild_id.roles(&*self.http).await?;
        if let Some(role) = roles.values().find(|r| r.name == name) {
            return Ok(role.id);
        }

        let role = guild_id
            .create_role(
                &*self.http,
                serenity::EditRole::new()
                    .name(name)
                    .colour(RESTRICTION_ROLE_COLOUR)
                    .audit_log_reason("Aika moderation enabled."),
            )
            .await?;

        let overwrite = serenity::PermissionOverwrite {
            allow: serenity::Permissions::empty(),
            deny: serenity::Permissions::SEND_MESSAGES
                | serenity::Permissions::SEND_MESSAGES_IN_THREADS,
            kind: serenity::PermissionOverwriteType::Role(role.id),
        };

        for channel in guild_id.channels(&*self.http).await?.values() {
            if channel.kind != serenity::ChannelType::Text {
                continue;
            }
            if let Err(e) = channel.create_permission(&*self.http, overwrite.clone()).await {
                tracing::warn!(channel_id = %channel.id, error = %e, "Could not restrict muted role in channel");
            }
        }

        tracing::info!(guild_id = %guild_id, role_id = %role.id, "Created muted role");
        Ok(role.id)
    }

    /// Remove the muted role when moderation is switched off.
    pub async fn delete_restriction_role(
        &self,
        guild_id: serenity::GuildId,
        role_id: serenity::RoleId,
    ) -> Result<(), PlatformError> {
        match guild_id.delete_role(&*self.http, role_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = classify(&e);
                if error.is_not_found() {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }
}

#[async_trait]
impl ModerationPlatform for SerenityPlatform {
    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), PlatformError> {
        self.http
            .add_member_role(
                guild_id.into(),
                user_id.into(),
                role_id.into(),
                Some("Muted by Aika."),
            )
            .await
            .map_err(|e| classify(&e))
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .remove_member_role(
                guild_id.into(),
                user_id.into(),
                role_id.into(),
                Some(reason),
            )
            .await
            .map_err(|e| classify(&e))
    }

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), PlatformError> {
        self.http
            .ban_user(guild_id.into(), user_id.into(), 0, Some(reason))
            .await
            .map_err(|e| classify(&e))
    }
}

/// Sort a serenity error into the kinds the core cares about.
fn classify(error: &serenity::Error) -> PlatformError {
    let kind = match error {
        serenity::Error::Http(http_error) => classify_http(http_error),
        _ => PlatformErrorKind::Other,
    };
    PlatformError::new(kind, error.to_string())
}

fn classify_http(error: &serenity::HttpError) -> PlatformErrorKind {
    match error {
        serenity::HttpError::UnsuccessfulRequest(response) => {
            kind_for_status(response.status_code.as_u16())
        }
        _ => PlatformErrorKind::Other,
    }
}

fn kind_for_status(status: u16) -> PlatformErrorKind {
    match status {
        403 => PlatformErrorKind::PermissionDenied,
        404 => PlatformErrorKind::NotFound,
        _ => PlatformErrorKind::Other,
    }
}
