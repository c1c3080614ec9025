//! Offense accounting and automatic bans.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mc_domain::config::OffenseConfig;
use mc_domain::error::{Error, Result};
use mc_domain::model::{OffenseType, UserOffense};
use mc_domain::trace::TraceEvent;

use crate::store::ChatStore;

pub struct OffenseAccounting {
    store: Arc<ChatStore>,
    cfg: OffenseConfig,
}

impl OffenseAccounting {
    pub fn new(store: Arc<ChatStore>, cfg: OffenseConfig) -> Self {
        Self { store, cfg }
    }

    /// Append an offense and evaluate the ban rule. Returns whether the
    /// user is banned afterwards.
    pub fn add_offense(&self, user_id: i64, kind: OffenseType) -> Result<bool> {
        self.add_offense_at(user_id, kind, Utc::now())
    }

    pub fn add_offense_at(&self, user_id: i64, kind: OffenseType, at: DateTime<Utc>) -> Result<bool> {
        let window_start = at - Duration::seconds(self.cfg.window_secs as i64);
        let threshold = match kind {
            OffenseType::PromptOffense => self.cfg.prompt_threshold,
            OffenseType::ResponseOffense => self.cfg.response_threshold,
        };

        let (banned, newly_banned, count) = {
            let mut guard = self.store.data.write();
            let data = &mut *guard;
            let user = data
                .users
                .get_mut(&user_id)
                .ok_or_else(|| Error::BadRequest(format!("unknown user {user_id}")))?;

            data.offenses.push(UserOffense { user_id, kind, at });
            let count = data
                .offenses
                .iter()
                .filter(|o| o.user_id == user_id && o.kind == kind && o.at > window_start && o.at <= at)
                .count();

            let newly_banned = !user.banned && count >= threshold;
            if newly_banned {
                user.banned = true;
            }
            (user.banned, newly_banned, count)
        };
        self.store.flush()?;

        tracing::info!(user_id, kind = kind.as_str(), count, banned, "offense recorded");
        if newly_banned {
            TraceEvent::UserBanned {
                user_id,
                offense: kind.as_str().to_string(),
                count,
            }
            .emit();
            tracing::warn!(user_id, kind = kind.as_str(), count, "user banned");
        }
        Ok(banned)
    }
}
