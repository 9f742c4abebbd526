use std::fmt::Display;

use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("storage error: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

fn internal(e: impl Display) -> RepoError {
    RepoError::Internal(e.to_string())
}

/// Index of comments stored on remote data servers.
#[async_trait]
pub trait PointerRepo: Send + Sync {
    /// Pointers without `created_at` first (insertion order), then ascending by `created_at`.
    async fn list_pointers(&self, page: &str) -> RepoResult<Vec<ProtocolPointer>>;
    /// Insert, or replace whatever pointer holds the same `(author_id, record_key)`,
    /// regardless of the page it was filed under.
    async fn upsert_pointer(&self, pointer: ProtocolPointer) -> RepoResult<()>;
    /// Number of records removed; 0 is not an error.
    async fn delete_pointer(&self, page: &str, author_id: &str, record_key: &str) -> RepoResult<u64>;
}

/// Locally stored anonymous comments.
#[async_trait]
pub trait AnonymousRepo: Send + Sync {
    /// Ascending by `created_at`, ties broken by id.
    async fn list_anonymous(&self, page: &str) -> RepoResult<Vec<AnonymousComment>>;
    async fn get_anonymous(&self, id: Id) -> RepoResult<AnonymousComment>;
    /// Assigns id, timestamp and a fresh delete token.
    async fn insert_anonymous(&self, new: NewAnonymousComment) -> RepoResult<AnonymousComment>;
    /// True only when `id` exists and `token` matches; a miss and a wrong token look the same.
    async fn delete_anonymous(&self, id: Id, token: &str) -> RepoResult<bool>;
}

pub trait Repo: PointerRepo + AnonymousRepo {}

impl<T> Repo for T where T: PointerRepo + AnonymousRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use tracing::{info, warn};

    use crate::authz;

    const SNAPSHOT_FILE: &str = "smudge.json";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct StoredPointer {
        seq: u64,
        #[serde(flatten)]
        pointer: ProtocolPointer,
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct State {
        pointers: Vec<StoredPointer>,
        anonymous: BTreeMap<Id, AnonymousComment>,
        next_id: Id,
        next_seq: u64,
    }

    /// Whole store held in memory and mirrored to a single JSON snapshot.
    ///
    /// Mutations are serialized by `writer` and run on a copy of the state.
    /// The copy is written to a temp file, fsynced and renamed over the
    /// snapshot on the blocking pool, and only then swapped in, so readers see
    /// either the old or the new state, on disk and in memory. Readers only
    /// wait for the swap itself, never for the disk.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        writer: Arc<tokio::sync::Mutex<()>>,
        snapshot_path: Option<Arc<PathBuf>>,
    }

    fn write_snapshot(path: &Path, state: &State) -> RepoResult<()> {
        let bytes = serde_json::to_vec_pretty(state).map_err(internal)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(internal)?;
        }
        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, path)
        };
        write().map_err(|e| {
            warn!(path = %path.display(), "snapshot write failed: {e}");
            internal(e)
        })
    }

    fn swap(state: &RwLock<State>, next: State) -> RepoResult<()> {
        *state.write().map_err(|_| internal("state lock poisoned"))? = next;
        Ok(())
    }

    impl InMemRepo {
        fn with_state(state: State, snapshot_path: Option<PathBuf>) -> Self {
            Self {
                state: Arc::new(RwLock::new(state)),
                writer: Arc::new(tokio::sync::Mutex::new(())),
                snapshot_path: snapshot_path.map(Arc::new),
            }
        }

        /// Memory only, nothing written to disk.
        pub fn ephemeral() -> Self {
            Self::with_state(State::default(), None)
        }

        /// Load `<dir>/smudge.json` if present. A snapshot that exists but does
        /// not parse is an error rather than an empty start, so it never gets
        /// overwritten by accident.
        pub fn open(dir: impl AsRef<Path>) -> RepoResult<Self> {
            let path = dir.as_ref().join(SNAPSHOT_FILE);
            let state = match fs::read(&path) {
                Ok(bytes) => {
                    let s: State = serde_json::from_slice(&bytes)
                        .map_err(|e| internal(format!("corrupt snapshot '{}': {e}", path.display())))?;
                    info!(path = %path.display(), pointers = s.pointers.len(), anonymous = s.anonymous.len(), "loaded snapshot");
                    s
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "no snapshot yet, starting empty");
                    State::default()
                }
                Err(e) => return Err(internal(format!("read '{}': {e}", path.display()))),
            };
            Ok(Self::with_state(state, Some(path)))
        }

        /// `f` returns its result and whether it changed anything.
        ///
        /// The commit owns the writer guard, so a dropped request still
        /// finishes its write and the next mutation starts from it.
        async fn mutate<T, F>(&self, f: F) -> RepoResult<T>
        where
            F: FnOnce(&mut State) -> (T, bool) + Send,
            T: Send,
        {
            let writer = self.writer.clone().lock_owned().await;
            let mut next = self.read(State::clone)?;
            let (out, dirty) = f(&mut next);
            if !dirty {
                return Ok(out);
            }
            let Some(path) = self.snapshot_path.clone() else {
                swap(&self.state, next)?;
                return Ok(out);
            };
            let state = self.state.clone();
            tokio::task::spawn_blocking(move || {
                let _writer = writer;
                write_snapshot(&path, &next)?;
                swap(&state, next)
            })
            .await
            .map_err(internal)??;
            Ok(out)
        }

        fn read<T>(&self, f: impl FnOnce(&State) -> T) -> RepoResult<T> {
            let guard = self.state.read().map_err(|_| internal("state lock poisoned"))?;
            Ok(f(&guard))
        }
    }

    #[async_trait]
    impl PointerRepo for InMemRepo {
        async fn list_pointers(&self, page: &str) -> RepoResult<Vec<ProtocolPointer>> {
            self.read(|s| {
                let mut v: Vec<&StoredPointer> = s.pointers.iter().filter(|p| p.pointer.page == page).collect();
                v.sort_by(|a, b| (a.pointer.created_at, a.seq).cmp(&(b.pointer.created_at, b.seq)));
                v.into_iter().map(|p| p.pointer.clone()).collect()
            })
        }

        async fn upsert_pointer(&self, pointer: ProtocolPointer) -> RepoResult<()> {
            self.mutate(|s| {
                s.pointers.retain(|p| !(p.pointer.author_id == pointer.author_id && p.pointer.record_key == pointer.record_key));
                s.next_seq += 1;
                let seq = s.next_seq;
                s.pointers.push(StoredPointer { seq, pointer });
                ((), true)
            })
            .await
        }

        async fn delete_pointer(&self, page: &str, author_id: &str, record_key: &str) -> RepoResult<u64> {
            self.mutate(|s| {
                let before = s.pointers.len();
                s.pointers.retain(|p| {
                    !(p.pointer.page == page && p.pointer.author_id == author_id && p.pointer.record_key == record_key)
                });
                let removed = (before - s.pointers.len()) as u64;
                (removed, removed > 0)
            })
            .await
        }
    }

    #[async_trait]
    impl AnonymousRepo for InMemRepo {
        async fn list_anonymous(&self, page: &str) -> RepoResult<Vec<AnonymousComment>> {
            self.read(|s| {
                let mut v: Vec<_> = s.anonymous.values().filter(|c| c.page == page).cloned().collect();
                v.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
                v
            })
        }

        async fn get_anonymous(&self, id: Id) -> RepoResult<AnonymousComment> {
            self.read(|s| s.anonymous.get(&id).cloned())?.ok_or(RepoError::NotFound)
        }

        async fn insert_anonymous(&self, new: NewAnonymousComment) -> RepoResult<AnonymousComment> {
            self.mutate(|s| {
                s.next_id += 1;
                let comment = AnonymousComment {
                    id: s.next_id,
                    page: new.page,
                    text: new.text,
                    position_x: new.position_x,
                    position_y: new.position_y,
                    created_at: new.created_at.unwrap_or_else(Utc::now),
                    author: new.author,
                    email_hash: new.email_hash,
                    reply_to: new.reply_to,
                    delete_token: authz::new_delete_token(),
                    client_ip: new.client_ip,
                };
                s.anonymous.insert(comment.id, comment.clone());
                (comment, true)
            })
            .await
        }

        async fn delete_anonymous(&self, id: Id, token: &str) -> RepoResult<bool> {
            self.mutate(|s| {
                let authorized = s.anonymous.get(&id).map_or(false, |c| authz::tokens_match(&c.delete_token, token));
                if authorized {
                    s.anonymous.remove(&id);
                }
                (authorized, authorized)
            })
            .await
        }
    }
}

#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    use crate::authz;

    const POINTER_COLUMNS: &str = "page, author_id, record_key, position_x, position_y, text, created_at, handle, reply_to";
    const ANON_COLUMNS: &str = "id, page, text, position_x, position_y, created_at, author, email_hash, reply_to, delete_token, client_ip";

    /// Split pointer / anonymous tables; uniqueness of `(author_id, record_key)`
    /// is a database constraint, so racing upserts cannot both insert.
    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

        pub async fn migrate(&self) -> RepoResult<()> {
            sqlx::migrate!("./migrations").run(&self.pool).await.map_err(internal)
        }
    }

    #[async_trait]
    impl PointerRepo for PgRepo {
        async fn list_pointers(&self, page: &str) -> RepoResult<Vec<ProtocolPointer>> {
            sqlx::query_as::<_, ProtocolPointer>(&format!(
                "SELECT {POINTER_COLUMNS} FROM pointers WHERE page = $1 ORDER BY created_at ASC NULLS FIRST, seq ASC"
            ))
            .bind(page)
            .fetch_all(&self.pool).await.map_err(internal)
        }

        async fn upsert_pointer(&self, p: ProtocolPointer) -> RepoResult<()> {
            // seq takes a fresh value on replace so the pointer moves to the end like a new insert
            sqlx::query(r#"
                INSERT INTO pointers (page, author_id, record_key, position_x, position_y, text, created_at, handle, reply_to)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                ON CONFLICT (author_id, record_key) DO UPDATE SET
                    page = EXCLUDED.page,
                    position_x = EXCLUDED.position_x,
                    position_y = EXCLUDED.position_y,
                    text = EXCLUDED.text,
                    created_at = EXCLUDED.created_at,
                    handle = EXCLUDED.handle,
                    reply_to = EXCLUDED.reply_to,
                    seq = EXCLUDED.seq
            "#)
            .bind(&p.page).bind(&p.author_id).bind(&p.record_key)
            .bind(p.position_x).bind(p.position_y).bind(&p.text)
            .bind(p.created_at).bind(&p.handle).bind(&p.reply_to)
            .execute(&self.pool).await.map_err(internal)?;
            Ok(())
        }

        async fn delete_pointer(&self, page: &str, author_id: &str, record_key: &str) -> RepoResult<u64> {
            let res = sqlx::query("DELETE FROM pointers WHERE page = $1 AND author_id = $2 AND record_key = $3")
                .bind(page).bind(author_id).bind(record_key)
                .execute(&self.pool).await.map_err(internal)?;
            Ok(res.rows_affected())
        }
    }

    #[async_trait]
    impl AnonymousRepo for PgRepo {
        async fn list_anonymous(&self, page: &str) -> RepoResult<Vec<AnonymousComment>> {
            sqlx::query_as::<_, AnonymousComment>(&format!(
                "SELECT {ANON_COLUMNS} FROM anonymous_comments WHERE page = $1 ORDER BY created_at ASC, id ASC"
            ))
            .bind(page)
            .fetch_all(&self.pool).await.map_err(internal)
        }

        async fn get_anonymous(&self, id: Id) -> RepoResult<AnonymousComment> {
            sqlx::query_as::<_, AnonymousComment>(&format!("SELECT {ANON_COLUMNS} FROM anonymous_comments WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool).await.map_err(internal)?
                .ok_or(RepoError::NotFound)
        }

        async fn insert_anonymous(&self, new: NewAnonymousComment) -> RepoResult<AnonymousComment> {
            sqlx::query_as::<_, AnonymousComment>(&format!(r#"
                INSERT INTO anonymous_comments (page, text, position_x, position_y, created_at, author, email_hash, reply_to, delete_token, client_ip)
                VALUES ($1,$2,$3,$4,COALESCE($5, now()),$6,$7,$8,$9,$10)
                RETURNING {ANON_COLUMNS}
            "#))
            .bind(&new.page).bind(&new.text).bind(new.position_x).bind(new.position_y)
            .bind(new.created_at).bind(&new.author).bind(&new.email_hash).bind(new.reply_to)
            .bind(authz::new_delete_token()).bind(&new.client_ip)
            .fetch_one(&self.pool).await.map_err(internal)
        }

        async fn delete_anonymous(&self, id: Id, token: &str) -> RepoResult<bool> {
            let res = sqlx::query("DELETE FROM anonymous_comments WHERE id = $1 AND delete_token = $2")
                .bind(id).bind(token)
                .execute(&self.pool).await.map_err(internal)?;
            Ok(res.rows_affected() == 1)
        }
    }
}
