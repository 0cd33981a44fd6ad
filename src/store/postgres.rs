//! Postgres binding for the voice store, over a blocking r2d2 pool.
//!
//! Every operation is dispatched to the blocking worker pool so request
//! tasks never stall the scheduler on a database round trip.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::upsert::excluded;
use uuid::Uuid;

use super::{AuthAttempt, NewAuthAttempt, StoreError, VoiceStore, Voiceprint};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Build a connection pool without eagerly connecting; a database that is
/// down at startup surfaces through `health_check` instead.
pub fn establish_connection_pool(database_url: &str) -> DbPool {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build_unchecked(manager)
}

#[derive(Queryable, Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::users)]
struct UserRow {
    phone: String,
    id: Uuid,
    embedding: Vec<f64>,
    enrolled_at: DateTime<Utc>,
}

impl From<UserRow> for Voiceprint {
    fn from(row: UserRow) -> Self {
        Voiceprint {
            phone: row.phone,
            id: row.id,
            embedding: row.embedding,
            enrolled_at: row.enrolled_at,
        }
    }
}

impl From<Voiceprint> for UserRow {
    fn from(user: Voiceprint) -> Self {
        UserRow {
            phone: user.phone,
            id: user.id,
            embedding: user.embedding,
            enrolled_at: user.enrolled_at,
        }
    }
}

#[derive(Queryable, Clone, Debug)]
struct AttemptRow {
    id: i64,
    phone: String,
    success: bool,
    score: f64,
    created_at: DateTime<Utc>,
}

impl From<AttemptRow> for AuthAttempt {
    fn from(row: AttemptRow) -> Self {
        AuthAttempt {
            id: row.id,
            phone: row.phone,
            success: row.success,
            score: row.score,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::auth_attempts)]
struct NewAttemptRow {
    phone: String,
    success: bool,
    score: f64,
    created_at: DateTime<Utc>,
}

fn classify(err: diesel::result::Error) -> StoreError {
    use diesel::result::{DatabaseErrorKind, Error};
    match err {
        Error::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
            StoreError::Unavailable(info.message().to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}

pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?
    }
}

#[async_trait]
impl VoiceStore for PgStore {
    async fn upsert_user(&self, user: Voiceprint) -> Result<Voiceprint, StoreError> {
        use crate::schema::users;
        let row = UserRow::from(user);
        self.run(move |conn| {
            // Re-enrollment replaces the vector and timestamp; the record id
            // assigned at first enrollment stays stable.
            diesel::insert_into(users::table)
                .values(&row)
                .on_conflict(users::phone)
                .do_update()
                .set((
                    users::embedding.eq(excluded(users::embedding)),
                    users::enrolled_at.eq(excluded(users::enrolled_at)),
                ))
                .get_result::<UserRow>(conn)
                .map(Voiceprint::from)
                .map_err(classify)
        })
        .await
    }

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<Voiceprint>, StoreError> {
        use crate::schema::users::dsl;
        let phone = phone.to_string();
        self.run(move |conn| {
            dsl::users
                .find(phone)
                .get_result::<UserRow>(conn)
                .optional()
                .map(|row| row.map(Voiceprint::from))
                .map_err(classify)
        })
        .await
    }

    async fn delete_user(&self, phone: &str) -> Result<bool, StoreError> {
        use crate::schema::users::dsl;
        let phone = phone.to_string();
        self.run(move |conn| {
            diesel::delete(dsl::users.find(phone))
                .execute(conn)
                .map(|deleted| deleted > 0)
                .map_err(classify)
        })
        .await
    }

    async fn log_attempt(&self, attempt: NewAuthAttempt) -> Result<AuthAttempt, StoreError> {
        use crate::schema::auth_attempts;
        let row = NewAttemptRow {
            phone: attempt.phone,
            success: attempt.success,
            score: attempt.score,
            created_at: Utc::now(),
        };
        self.run(move |conn| {
            diesel::insert_into(auth_attempts::table)
                .values(&row)
                .get_result::<AttemptRow>(conn)
                .map(AuthAttempt::from)
                .map_err(classify)
        })
        .await
    }

    async fn attempts_by_phone(&self, phone: &str, limit: i64) -> Result<Vec<AuthAttempt>, StoreError> {
        use crate::schema::auth_attempts::dsl;
        let phone = phone.to_string();
        self.run(move |conn| {
            dsl::auth_attempts
                .filter(dsl::phone.eq(phone))
                .order((dsl::created_at.desc(), dsl::id.desc()))
                .limit(limit)
                .load::<AttemptRow>(conn)
                .map(|rows| rows.into_iter().map(AuthAttempt::from).collect())
                .map_err(classify)
        })
        .await
    }

    async fn recent_failure_count(&self, phone: &str, window_minutes: i64) -> Result<i64, StoreError> {
        use crate::schema::auth_attempts::dsl;
        let phone = phone.to_string();
        let cutoff = Utc::now() - ChronoDuration::minutes(window_minutes);
        self.run(move |conn| {
            dsl::auth_attempts
                .filter(dsl::phone.eq(phone))
                .filter(dsl::success.eq(false))
                .filter(dsl::created_at.ge(cutoff))
                .count()
                .get_result::<i64>(conn)
                .map_err(classify)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.run(|conn| {
            diesel::sql_query("SELECT 1")
                .execute(conn)
                .map(|_| ())
                .map_err(classify)
        })
        .await
        .is_ok()
    }
}
