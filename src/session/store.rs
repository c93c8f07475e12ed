//! Durable session persistence.
//!
//! Each agent owns one SQLite database (WAL journaling) holding its
//! sessions. Image contents are externalized to content-addressed files
//! under `{agent_root}/images/` keyed by the BLAKE3 hash of the bytes; an
//! `images` table tracks (id, session_id) references so deletion can
//! garbage-collect files whose reference count drops to zero.
//!
//! Writes are debounced: repeated saves of the same session within the
//! debounce window collapse into one write. `flush_all` runs every
//! pending write synchronously and is called on shutdown.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{AssistantContent, Channel, Message, Session, UserContent};

/// Debounce window for `save_session`.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(2);

struct PendingSave {
    handle: JoinHandle<()>,
    session: Arc<Mutex<Session>>,
}

/// Per-agent session store backed by `{agent_root}/sessions.db`.
#[derive(Clone)]
pub struct SessionStore {
    pool: Pool<SqliteConnectionManager>,
    agent_root: PathBuf,
    slug: String,
    pending: Arc<StdMutex<HashMap<String, PendingSave>>>,
}

impl SessionStore {
    /// Open (creating if needed) an agent's session database.
    pub fn open(slug: &str, agent_root: &Path) -> Result<Self, String> {
        let db_path = agent_root.join("sessions.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA busy_timeout=5000;
                 PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;",
            )
        });

        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| format!("failed to open session db for '{}': {}", slug, e))?;

        let store = SessionStore {
            pool,
            agent_root: agent_root.to_path_buf(),
            slug: slug.to_string(),
            pending: Arc::new(StdMutex::new(HashMap::new())),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                meta TEXT NOT NULL,
                history TEXT NOT NULL,
                opened_files TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS images (
                id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                media_type TEXT NOT NULL,
                PRIMARY KEY (id, session_id)
            );",
        )
        .map_err(|e| format!("failed to init session schema: {}", e))?;
        Ok(())
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, String> {
        self.pool
            .get_timeout(Duration::from_secs(5))
            .map_err(|e| format!("session db connection timeout: {}", e))
    }

    fn images_dir(&self) -> PathBuf {
        self.agent_root.join("images")
    }

    /// Arm (or re-arm) the debounced write for a session. Any previously
    /// armed timer for the same session is cancelled.
    pub fn save_session(&self, session_id: &str, session: &Arc<Mutex<Session>>) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(prev) = pending.remove(session_id) {
            prev.handle.abort();
        }

        let store = self.clone();
        let sess = Arc::clone(session);
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            {
                let guard = sess.lock().await;
                if let Err(e) = store.persist_now(&guard) {
                    log::error!("[STORE:{}] debounced save failed: {}", store.slug, e);
                }
            }
            store.pending.lock().unwrap().remove(&id);
        });

        pending.insert(
            session_id.to_string(),
            PendingSave {
                handle,
                session: Arc::clone(session),
            },
        );
    }

    /// Cancel all pending timers and execute their flushes synchronously.
    pub async fn flush_all(&self) {
        let drained: Vec<(String, PendingSave)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (id, entry) in drained {
            entry.handle.abort();
            let guard = entry.session.lock().await;
            if let Err(e) = self.persist_now(&guard) {
                log::error!("[STORE:{}] flush of {} failed: {}", self.slug, id, e);
            }
        }
    }

    /// Number of armed save timers (zero after `flush_all`).
    pub fn pending_saves(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Write a session to storage immediately. Internal sessions are
    /// never persisted.
    pub fn persist_now(&self, session: &Session) -> Result<(), String> {
        if matches!(session.channel, Channel::Internal { .. }) {
            return Ok(());
        }

        let id = session.id();
        let (history, refs) = self.externalize_history(&session.history, &id)?;

        let history_json = serde_json::to_string(&history)
            .map_err(|e| format!("failed to serialize history: {}", e))?;
        let opened_json = serde_json::to_string(&session.opened_files)
            .map_err(|e| format!("failed to serialize opened files: {}", e))?;
        let meta_json = channel_meta_json(&session.channel).to_string();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (id, channel, meta, history, opened_files)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               channel = excluded.channel,
               meta = excluded.meta,
               history = excluded.history,
               opened_files = excluded.opened_files",
            params![
                &id,
                session.channel.kind(),
                &meta_json,
                &history_json,
                &opened_json
            ],
        )
        .map_err(|e| format!("failed to write session {}: {}", id, e))?;

        for (image_id, media_type) in refs {
            conn.execute(
                "INSERT OR IGNORE INTO images (id, session_id, media_type) VALUES (?1, ?2, ?3)",
                params![&image_id, &id, &media_type],
            )
            .map_err(|e| format!("failed to index image {}: {}", image_id, e))?;
        }

        Ok(())
    }

    /// Replace inline image bytes with content-addressed references,
    /// flushing bytes to disk only when the file is absent.
    fn externalize_history(
        &self,
        history: &[Message],
        session_id: &str,
    ) -> Result<(Vec<Message>, Vec<(String, String)>), String> {
        let mut refs: Vec<(String, String)> = Vec::new();
        let mut out = Vec::with_capacity(history.len());

        for msg in history {
            // Messages explicitly marked persist = false stay in memory
            // only.
            if let Message::User {
                persist: Some(false),
                ..
            } = msg
            {
                continue;
            }
            let msg = match msg {
                Message::User { content, id, persist } => Message::User {
                    content: content
                        .iter()
                        .map(|c| match c {
                            UserContent::Image { media_type, data } => {
                                let image_id = self.store_image(data, media_type)?;
                                refs.push((image_id.clone(), media_type.clone()));
                                Ok(UserContent::ImageRef {
                                    id: image_id,
                                    media_type: media_type.clone(),
                                })
                            }
                            other => Ok(other.clone()),
                        })
                        .collect::<Result<Vec<_>, String>>()?,
                    id: id.clone(),
                    persist: *persist,
                },
                Message::Assistant { content } => Message::Assistant {
                    content: content
                        .iter()
                        .map(|c| match c {
                            AssistantContent::Image { media_type, data } => {
                                let image_id = self.store_image(data, media_type)?;
                                refs.push((image_id.clone(), media_type.clone()));
                                Ok(AssistantContent::ImageRef {
                                    id: image_id,
                                    media_type: media_type.clone(),
                                })
                            }
                            other => Ok(other.clone()),
                        })
                        .collect::<Result<Vec<_>, String>>()?,
                },
                other => other.clone(),
            };
            out.push(msg);
        }

        log::debug!(
            "[STORE:{}] externalized {} image(s) for {}",
            self.slug,
            refs.len(),
            session_id
        );
        Ok((out, refs))
    }

    /// Content-address image bytes; write the file only if absent.
    fn store_image(&self, data: &[u8], media_type: &str) -> Result<String, String> {
        let id = blake3::hash(data).to_hex().to_string();
        let dir = self.images_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("failed to create images dir: {}", e))?;
        let file = dir.join(format!("{}.{}", id, extension_for(media_type)));
        if !file.exists() {
            std::fs::write(&file, data)
                .map_err(|e| format!("failed to write image {}: {}", id, e))?;
        }
        Ok(id)
    }

    fn image_path(&self, id: &str, media_type: &str) -> PathBuf {
        self.images_dir()
            .join(format!("{}.{}", id, extension_for(media_type)))
    }

    /// Load every persisted session, rehydrating image references.
    pub fn load_sessions(&self) -> Result<Vec<Session>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, channel, meta, history, opened_files FROM sessions")
            .map_err(|e| format!("failed to query sessions: {}", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| format!("failed to read sessions: {}", e))?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, kind, meta, history, opened) = match row {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("[STORE:{}] skipping unreadable session row: {}", self.slug, e);
                    continue;
                }
            };

            let channel = match channel_from_meta(&kind, &meta) {
                Some(c) => c,
                None => {
                    log::warn!("[STORE:{}] skipping session {} with bad meta", self.slug, id);
                    continue;
                }
            };

            let history: Vec<Message> = match serde_json::from_str(&history) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!(
                        "[STORE:{}] skipping session {} with bad history: {}",
                        self.slug,
                        id,
                        e
                    );
                    continue;
                }
            };

            let opened_files: Vec<String> = serde_json::from_str(&opened).unwrap_or_default();

            let mut session = Session::new(channel);
            session.history = self.rehydrate_history(history);
            session.opened_files = opened_files;
            sessions.push(session);
        }
        Ok(sessions)
    }

    fn rehydrate_history(&self, history: Vec<Message>) -> Vec<Message> {
        history
            .into_iter()
            .map(|msg| match msg {
                Message::User { content, id, persist } => Message::User {
                    content: content
                        .into_iter()
                        .map(|c| match c {
                            UserContent::ImageRef { id, media_type } => {
                                match std::fs::read(self.image_path(&id, &media_type)) {
                                    Ok(data) => UserContent::Image { media_type, data },
                                    Err(e) => {
                                        log::warn!(
                                            "[STORE:{}] missing image {}: {}",
                                            self.slug,
                                            id,
                                            e
                                        );
                                        UserContent::ImageRef { id, media_type }
                                    }
                                }
                            }
                            other => other,
                        })
                        .collect(),
                    id,
                    persist,
                },
                Message::Assistant { content } => Message::Assistant {
                    content: content
                        .into_iter()
                        .map(|c| match c {
                            AssistantContent::ImageRef { id, media_type } => {
                                match std::fs::read(self.image_path(&id, &media_type)) {
                                    Ok(data) => AssistantContent::Image { media_type, data },
                                    Err(_) => AssistantContent::ImageRef { id, media_type },
                                }
                            }
                            other => other,
                        })
                        .collect(),
                },
                other => other,
            })
            .collect()
    }

    /// Delete a session row and garbage-collect image files whose
    /// reference count drops to zero. File removal is best-effort.
    pub fn delete_session(&self, session_id: &str) -> Result<(), String> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT id, media_type FROM images WHERE session_id = ?1")
            .map_err(|e| format!("failed to query images: {}", e))?;
        let referenced: Vec<(String, String)> = stmt
            .query_map([session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| format!("failed to read image refs: {}", e))?
            .filter_map(|r| r.ok())
            .collect();

        for (image_id, media_type) in &referenced {
            let others: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM images WHERE id = ?1 AND session_id != ?2",
                    params![image_id, session_id],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            if others == 0 {
                let file = self.image_path(image_id, media_type);
                if let Err(e) = std::fs::remove_file(&file) {
                    log::debug!(
                        "[STORE:{}] could not remove image {}: {}",
                        self.slug,
                        file.display(),
                        e
                    );
                }
            }
        }

        conn.execute("DELETE FROM images WHERE session_id = ?1", [session_id])
            .map_err(|e| format!("failed to delete image refs: {}", e))?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])
            .map_err(|e| format!("failed to delete session: {}", e))?;

        log::info!("[STORE:{}] deleted session {}", self.slug, session_id);
        Ok(())
    }

    /// Ids of every persisted session (used by `clear`).
    pub fn session_ids(&self) -> Result<Vec<String>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM sessions")
            .map_err(|e| format!("failed to query session ids: {}", e))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| format!("failed to read session ids: {}", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/webp" => "webp",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Channel-specific metadata stored in the `meta` column.
fn channel_meta_json(channel: &Channel) -> serde_json::Value {
    match channel {
        Channel::Discord {
            channel_id,
            guild_id,
            is_nsfw,
        } => json!({
            "channelId": channel_id,
            "guildId": guild_id,
            "isNsfw": is_nsfw,
        }),
        Channel::Matrix { room_id } => json!({ "roomId": room_id }),
        Channel::Internal { job_id } => json!({ "jobId": job_id }),
    }
}

fn channel_from_meta(kind: &str, meta: &str) -> Option<Channel> {
    let value: serde_json::Value = serde_json::from_str(meta).ok()?;
    match kind {
        "discord" => Some(Channel::Discord {
            channel_id: value.get("channelId")?.as_str()?.to_string(),
            guild_id: value
                .get("guildId")
                .and_then(|v| v.as_str())
                .map(String::from),
            is_nsfw: value
                .get("isNsfw")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }),
        "matrix" => Some(Channel::Matrix {
            room_id: value.get("roomId")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}
