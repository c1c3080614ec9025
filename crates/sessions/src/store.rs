//! Chat store.
//!
//! Persists users, chats, records, the offense log and the site config in
//! `mosschat.json` under the configured state path. Reads are served from
//! memory; every mutation is flushed before it returns.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use mc_domain::error::{Error, Result};
use mc_domain::model::{Chat, Record, SiteConfig, User, UserOffense};

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    next_chat_id: i64,
    #[serde(default)]
    next_record_id: i64,
    #[serde(default)]
    pub(crate) users: HashMap<i64, User>,
    #[serde(default)]
    chats: HashMap<i64, Chat>,
    /// Ordered by id, which is also creation order.
    #[serde(default)]
    records: BTreeMap<i64, Record>,
    #[serde(default)]
    pub(crate) offenses: Vec<UserOffense>,
    #[serde(default)]
    site: Option<SiteConfig>,
}

type ChatLock = Arc<tokio::sync::Mutex<()>>;

/// Gateway-owned chat store backed by a JSON file.
pub struct ChatStore {
    path: PathBuf,
    pub(crate) data: RwLock<StoreData>,
    /// Per-chat transaction locks, standing in for a row lock on the chat.
    chat_locks: Mutex<HashMap<i64, ChatLock>>,
}

/// Held chat transaction lock. The lock entry is dropped from the map
/// once no other task holds or waits on it.
pub struct ChatTx<'a> {
    store: &'a ChatStore,
    chat_id: i64,
    lock: ChatLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChatTx<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.store.chat_locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.chat_id);
        }
    }
}

impl ChatStore {
    /// Load or create the store at `state_path/mosschat.json`.
    pub fn open(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path)?;
        let path = state_path.join("mosschat.json");
        let data: StoreData = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            StoreData::default()
        };

        tracing::info!(
            users = data.users.len(),
            chats = data.chats.len(),
            records = data.records.len(),
            path = %path.display(),
            "chat store loaded"
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
            chat_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Persist the current state to disk (write to a temp file, then rename).
    pub fn flush(&self) -> Result<()> {
        let json = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Exclusive transaction lock for one chat. Held across the final
    /// record insert and the chat counter update.
    pub async fn lock_chat(&self, chat_id: i64) -> ChatTx<'_> {
        let lock = {
            let mut locks = self.chat_locks.lock();
            locks
                .entry(chat_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        ChatTx {
            store: self,
            chat_id,
            lock,
            guard: Some(guard),
        }
    }

    // ── Users ───────────────────────────────────────────────────────

    pub fn get_user(&self, user_id: i64) -> Option<User> {
        self.data.read().users.get(&user_id).cloned()
    }

    /// Users are provisioned by the API gateway; the first request seen
    /// for an id creates the local row.
    pub fn get_or_create_user(&self, user_id: i64) -> Result<User> {
        if let Some(user) = self.get_user(user_id) {
            return Ok(user);
        }
        let user = {
            let mut data = self.data.write();
            data.users
                .entry(user_id)
                .or_insert_with(|| User::new(user_id))
                .clone()
        };
        self.flush()?;
        Ok(user)
    }

    /// Apply `f` to a user and persist. Returns the updated user.
    pub fn update_user<F>(&self, user_id: i64, f: F) -> Result<User>
    where
        F: FnOnce(&mut User),
    {
        let user = {
            let mut data = self.data.write();
            let user = data
                .users
                .get_mut(&user_id)
                .ok_or_else(|| Error::BadRequest(format!("unknown user {user_id}")))?;
            f(user);
            user.clone()
        };
        self.flush()?;
        Ok(user)
    }

    /// Reconcile the user's plugin map with the model defaults.
    pub fn sync_plugin_config(&self, user_id: i64, defaults: &BTreeMap<String, bool>) -> Result<User> {
        let changed = {
            let mut data = self.data.write();
            let user = data
                .users
                .entry(user_id)
                .or_insert_with(|| User::new(user_id));
            user.sync_plugin_config(defaults)
        };
        if changed {
            tracing::debug!(user_id, "plugin config synced with model defaults");
            self.flush()?;
        }
        self.get_user(user_id)
            .ok_or_else(|| Error::Internal(format!("user {user_id} vanished")))
    }

    // ── Chats ───────────────────────────────────────────────────────

    pub fn create_chat(&self, user_id: i64) -> Result<Chat> {
        let chat = {
            let mut data = self.data.write();
            data.next_chat_id += 1;
            let now = Utc::now();
            let chat = Chat {
                id: data.next_chat_id,
                user_id,
                name: String::new(),
                count: 0,
                created_at: now,
                updated_at: now,
            };
            data.chats.insert(chat.id, chat.clone());
            chat
        };
        self.flush()?;
        Ok(chat)
    }

    pub fn get_chat(&self, chat_id: i64) -> Option<Chat> {
        self.data.read().chats.get(&chat_id).cloned()
    }

    /// Records of a chat, oldest first.
    pub fn records(&self, chat_id: i64) -> Vec<Record> {
        self.data
            .read()
            .records
            .values()
            .filter(|r| r.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn last_record(&self, chat_id: i64) -> Option<Record> {
        self.data
            .read()
            .records
            .values()
            .rev()
            .find(|r| r.chat_id == chat_id)
            .cloned()
    }

    // ── Turn persistence ────────────────────────────────────────────

    /// Insert the finished record and update the owning chat in one
    /// transaction: `count` is incremented, and `name` is set to the first
    /// `name_chars` characters of the request when the chat was empty.
    pub async fn persist_turn(&self, mut record: Record, name_chars: usize) -> Result<Record> {
        let _tx = self.lock_chat(record.chat_id).await;
        {
            let mut data = self.data.write();
            if !data.chats.contains_key(&record.chat_id) {
                return Err(Error::BadRequest(format!("unknown chat {}", record.chat_id)));
            }
            data.next_record_id += 1;
            record.id = data.next_record_id;
            data.records.insert(record.id, record.clone());

            if let Some(chat) = data.chats.get_mut(&record.chat_id) {
                if chat.count == 0 {
                    chat.name = record.request.chars().take(name_chars).collect();
                }
                chat.count += 1;
                chat.updated_at = Utc::now();
            }
        }
        self.flush()?;
        tracing::debug!(chat_id = record.chat_id, record_id = record.id, "record persisted");
        Ok(record)
    }

    /// Remove the newest record of a chat, keeping `count` in step.
    pub async fn delete_last_record(&self, chat_id: i64) -> Result<Option<Record>> {
        let _tx = self.lock_chat(chat_id).await;
        let removed = {
            let mut data = self.data.write();
            let last_id = data
                .records
                .values()
                .rev()
                .find(|r| r.chat_id == chat_id)
                .map(|r| r.id);
            let removed = last_id.and_then(|id| data.records.remove(&id));
            if removed.is_some() {
                if let Some(chat) = data.chats.get_mut(&chat_id) {
                    chat.count = chat.count.saturating_sub(1);
                    chat.updated_at = Utc::now();
                }
            }
            removed
        };
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    // ── Site config ─────────────────────────────────────────────────

    pub fn site_config(&self) -> Option<SiteConfig> {
        self.data.read().site.clone()
    }

    pub fn put_site_config(&self, site: SiteConfig) -> Result<()> {
        self.data.write().site = Some(site);
        self.flush()
    }

    /// Store `site` unless a site config is already persisted.
    pub fn seed_site_config(&self, site: SiteConfig) -> Result<()> {
        let seeded = {
            let mut data = self.data.write();
            if data.site.is_none() {
                data.site = Some(site);
                true
            } else {
                false
            }
        };
        if seeded {
            tracing::info!("site config seeded from configuration file");
            self.flush()?;
        }
        Ok(())
    }
}
