//! Store gateway for the sente Go server.
//!
//! The PostgreSQL database is both the authoritative game state and the
//! pub/sub transport between server processes. Every mutation goes through a
//! stored procedure (see `migrations/`), so NOTIFY emission and row changes
//! commit atomically; the session layer never issues ad hoc SQL.
//!
//! Writes to a game are guarded by its `version` counter: `write_game`
//! succeeds only when the stored version is exactly one behind the version
//! being written, which linearizes concurrent writers without locks held
//! across the network.
//!
//! Transient errors are retried here with bounded exponential backoff,
//! but what counts as transient depends on the call: an I/O error can
//! strike after the server already committed the statement, so only
//! idempotent reads retry on it. Mutating procedures retry solely on
//! failures that provably happen before the statement is sent (pool
//! acquisition), because a re-sent `write_game` whose first attempt
//! committed would read back as a spurious version conflict, and a
//! re-sent `new_game` would mint a second game. Anything that survives
//! the retry budget propagates as [`StoreError::Database`].

use crate::keys;
use crate::types::{ChatEntry, Color};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attempts per store call before a transient error is surfaced.
const RETRY_ATTEMPTS: u32 = 3;

/// Initial backoff delay; quadruples per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Seconds since the Unix epoch, as the fractional form stored in chat rows.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by the store gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A freshly minted player key collided with an existing one.
    #[error("player key collision")]
    KeyCollision,

    /// `new_game` could not release the caller's previous key.
    #[error("failed to release previous key")]
    UnsubscribeFailed,

    /// A stored row disagrees with what the schema promises.
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Errors that can only arise before the statement reached the server.
/// Safe to retry for any call, mutating or not.
fn transient_before_send(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::PoolTimedOut)
}

/// Errors worth retrying for an idempotent read. An I/O failure is
/// ambiguous: the server may have executed the statement and only the
/// response was lost, so mutating procedures must not use this set.
fn transient_for_read(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// Runs `op` until it succeeds, a non-retryable error occurs, or the
/// retry budget is exhausted. `may_retry` decides which errors qualify.
async fn with_retry<T, Fut, F>(
    may_retry: fn(&sqlx::Error) -> bool,
    mut op: F,
) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if attempt < RETRY_ATTEMPTS && may_retry(&err) => {
                log::warn!(
                    "transient store error (attempt {}/{}): {}",
                    attempt,
                    RETRY_ATTEMPTS,
                    err
                );
                tokio::time::sleep(delay).await;
                delay *= 4;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Result rows
// ---------------------------------------------------------------------------

/// The persisted state of one game, as read through a player key.
#[derive(Debug, Clone)]
pub struct GameRecord {
    /// Opaque serialized [`crate::game::Game`].
    pub data: Vec<u8>,
    /// Accumulated seconds with at least one player connected.
    pub time_played: f64,
    /// Monotonic write counter.
    pub version: i64,
}

/// Outcome of a `join_game` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The key does not exist.
    Dne,
    /// Another process currently manages the key.
    InUse,
    /// The key is now managed by this process.
    Joined { white_key: String, black_key: String },
}

impl JoinOutcome {
    fn from_row(status: &str, white: Option<String>, black: Option<String>) -> Result<Self, StoreError> {
        match (status, white, black) {
            ("dne", _, _) => Ok(JoinOutcome::Dne),
            ("in_use", _, _) => Ok(JoinOutcome::InUse),
            ("success", Some(white_key), Some(black_key)) => {
                Ok(JoinOutcome::Joined { white_key, black_key })
            }
            (other, _, _) => Err(StoreError::CorruptRow(format!(
                "unexpected join_game status '{}'",
                other
            ))),
        }
    }
}

/// Parameters for game creation. The two keys are minted by the caller; the
/// stored procedure inserts the game row and both key rows in one
/// transaction with the mutual foreign key deferred to commit.
#[derive(Debug, Clone)]
pub struct CreateGame {
    pub data: Vec<u8>,
    pub white_key: String,
    pub black_key: String,
    /// Side the creating session binds to immediately, if any.
    pub joining_color: Option<Color>,
    pub manager_id: Option<String>,
    /// Key to release first; creation aborts if the release fails.
    pub unsubscribe_key: Option<String>,
    pub white_ai_secret: Option<String>,
    pub black_ai_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the shared PostgreSQL store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Store, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        Ok(Store { pool })
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))
    }

    /// Opens a dedicated LISTEN connection for the notification pump.
    pub async fn listener(&self) -> Result<PgListener, StoreError> {
        Ok(PgListener::connect_with(&self.pool).await?)
    }

    /// Creates a game plus its two mutually referencing player keys.
    pub async fn create_game(&self, params: &CreateGame) -> Result<i64, StoreError> {
        let result = with_retry(transient_before_send, || {
            let pool = self.pool.clone();
            let p = params.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    "SELECT new_game($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(&p.data)
                .bind(&p.white_key)
                .bind(&p.black_key)
                .bind(p.joining_color.map(Color::as_db))
                .bind(&p.manager_id)
                .bind(&p.unsubscribe_key)
                .bind(&p.white_ai_secret)
                .bind(&p.black_ai_secret)
                .fetch_one(&pool)
                .await
            }
        })
        .await;

        match result {
            Ok(game_id) => Ok(game_id),
            Err(err) => {
                if let Some(db) = err.as_database_error() {
                    if db.is_unique_violation() {
                        return Err(StoreError::KeyCollision);
                    }
                    if db.message().contains("unsubscribe failed") {
                        return Err(StoreError::UnsubscribeFailed);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Claims `key` for `manager_id`, announcing the connection to the
    /// opponent's channel.
    pub async fn join_game(&self, key: &str, manager_id: &str) -> Result<JoinOutcome, StoreError> {
        let (status, white, black) = with_retry(transient_before_send, || {
            let pool = self.pool.clone();
            let key = key.to_owned();
            let manager_id = manager_id.to_owned();
            async move {
                sqlx::query_as::<_, (String, Option<String>, Option<String>)>(
                    "SELECT * FROM join_game($1, $2)",
                )
                .bind(&key)
                .bind(&manager_id)
                .fetch_one(&pool)
                .await
            }
        })
        .await?;
        JoinOutcome::from_row(&status, white, black)
    }

    /// Writes a game blob at `version`, which must be exactly one past the
    /// stored version. Returns the updated `time_played`, or `None` on a
    /// version conflict (the caller resyncs; nothing was written).
    pub async fn write_game(
        &self,
        key: &str,
        data: &[u8],
        version: i64,
    ) -> Result<Option<f64>, StoreError> {
        let new_time = with_retry(transient_before_send, || {
            let pool = self.pool.clone();
            let key = key.to_owned();
            let data = data.to_vec();
            async move {
                sqlx::query_scalar::<_, Option<f64>>("SELECT write_game($1, $2, $3)")
                    .bind(&key)
                    .bind(&data)
                    .bind(version)
                    .fetch_one(&pool)
                    .await
            }
        })
        .await?;
        Ok(new_time)
    }

    /// Inserts a chat line and notifies both players' chat channels.
    /// Returns the assigned message id, or `None` if the key vanished.
    pub async fn write_chat(
        &self,
        timestamp: f64,
        message: &str,
        key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let id = with_retry(transient_before_send, || {
            let pool = self.pool.clone();
            let message = message.to_owned();
            let key = key.to_owned();
            async move {
                sqlx::query_scalar::<_, Option<i64>>("SELECT write_chat($1, $2, $3)")
                    .bind(timestamp)
                    .bind(&message)
                    .bind(&key)
                    .fetch_one(&pool)
                    .await
            }
        })
        .await?;
        Ok(id)
    }

    /// Releases `key` if this process holds it. Returns whether a release
    /// happened.
    pub async fn unsubscribe(&self, key: &str, manager_id: &str) -> Result<bool, StoreError> {
        let released = with_retry(transient_before_send, || {
            let pool = self.pool.clone();
            let key = key.to_owned();
            let manager_id = manager_id.to_owned();
            async move {
                sqlx::query_scalar::<_, bool>("SELECT unsubscribe($1, $2)")
                    .bind(&key)
                    .bind(&manager_id)
                    .fetch_one(&pool)
                    .await
            }
        })
        .await?;
        Ok(released)
    }

    /// Reads the game visible through `key`, or `None` for a dead key.
    pub async fn get_game_status(&self, key: &str) -> Result<Option<GameRecord>, StoreError> {
        let row = with_retry(transient_for_read, || {
            let pool = self.pool.clone();
            let key = key.to_owned();
            async move {
                sqlx::query_as::<_, (Vec<u8>, f64, i64)>("SELECT * FROM get_game_status($1)")
                    .bind(&key)
                    .fetch_optional(&pool)
                    .await
            }
        })
        .await?;
        Ok(row.map(|(data, time_played, version)| GameRecord { data, time_played, version }))
    }

    /// Chat rows for the game behind `key` with id greater than `since_id`
    /// (all rows when `None`), in id order.
    pub async fn get_chat_updates(
        &self,
        key: &str,
        since_id: Option<i64>,
    ) -> Result<Vec<ChatEntry>, StoreError> {
        let rows = with_retry(transient_for_read, || {
            let pool = self.pool.clone();
            let key = key.to_owned();
            async move {
                sqlx::query_as::<_, (i64, f64, String, String)>(
                    "SELECT * FROM get_chat_updates($1, $2)",
                )
                .bind(&key)
                .bind(since_id)
                .fetch_all(&pool)
                .await
            }
        })
        .await?;

        rows.into_iter()
            .map(|(id, timestamp, color, message)| {
                let color = Color::from_db(&color).ok_or_else(|| {
                    StoreError::CorruptRow(format!("chat row {} has color '{}'", id, color))
                })?;
                Ok(ChatEntry { id, timestamp, color, message })
            })
            .collect()
    }

    /// Whether the opponent of `key` currently has a live connection.
    pub async fn get_opponent_connected(&self, key: &str) -> Result<bool, StoreError> {
        let connected = with_retry(transient_for_read, || {
            let pool = self.pool.clone();
            let key = key.to_owned();
            async move {
                sqlx::query_scalar::<_, bool>("SELECT get_opponent_connected($1)")
                    .bind(&key)
                    .fetch_one(&pool)
                    .await
            }
        })
        .await?;
        Ok(connected)
    }

    /// Releases every key managed by `manager_id`. Returns how many were
    /// released. Run at shutdown, and by operators against the id of a
    /// process that died without cleaning up.
    pub async fn cleanup(&self, manager_id: &str) -> Result<i64, StoreError> {
        let released = with_retry(transient_before_send, || {
            let pool = self.pool.clone();
            let manager_id = manager_id.to_owned();
            async move {
                sqlx::query_scalar::<_, i64>("SELECT do_cleanup($1)")
                    .bind(&manager_id)
                    .fetch_one(&pool)
                    .await
            }
        })
        .await?;
        Ok(released)
    }

    /// Re-emits a `game_status` notification for every key, prompting all
    /// connected clients to refresh. Re-notifying is idempotent, so this
    /// may retry on ambiguous I/O failures like a read.
    pub async fn trigger_update_all(&self) -> Result<(), StoreError> {
        with_retry(transient_for_read, || {
            let pool = self.pool.clone();
            async move {
                sqlx::query("SELECT trigger_update_all()")
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }
}

/// Mints a key pair for a new game: `(white_key, black_key)`.
pub fn mint_key_pair() -> (String, String) {
    (keys::generate_key(), keys::generate_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_outcome_parsing() {
        assert_eq!(JoinOutcome::from_row("dne", None, None).unwrap(), JoinOutcome::Dne);
        assert_eq!(JoinOutcome::from_row("in_use", None, None).unwrap(), JoinOutcome::InUse);
        assert_eq!(
            JoinOutcome::from_row("success", Some("a".into()), Some("b".into())).unwrap(),
            JoinOutcome::Joined { white_key: "a".into(), black_key: "b".into() }
        );
        assert!(JoinOutcome::from_row("weird", None, None).is_err());
        // A success row missing a key column is corrupt, not a join.
        assert!(JoinOutcome::from_row("success", Some("a".into()), None).is_err());
    }

    #[test]
    fn test_mutations_never_retry_ambiguous_io_failures() {
        // An I/O error may arrive after the server committed the statement;
        // only idempotent reads may treat it as retryable.
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(transient_for_read(&io));
        assert!(!transient_before_send(&io));

        // Pool acquisition fails before anything is sent; both may retry.
        assert!(transient_before_send(&sqlx::Error::PoolTimedOut));
        assert!(transient_for_read(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_unix_timestamp_is_fractional_seconds() {
        let ts = unix_timestamp();
        // Past 2020, before 2100.
        assert!(ts > 1_577_836_800.0);
        assert!(ts < 4_102_444_800.0);
    }

    #[test]
    fn test_minted_pair_is_distinct() {
        let (white, black) = mint_key_pair();
        assert_ne!(white, black);
        assert!(keys::is_valid_key(&white));
        assert!(keys::is_valid_key(&black));
    }
}
