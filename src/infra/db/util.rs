use time::OffsetDateTime;

use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
            RepoError::Duplicate {
                constraint: db
                    .message()
                    .trim_start_matches("UNIQUE constraint failed:")
                    .trim()
                    .to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("FOREIGN KEY constraint failed")
                || db.message().contains("NOT NULL constraint failed") =>
        {
            RepoError::Integrity {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("database is locked")
                || db.message().contains("database is busy") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

/// Milliseconds since the Unix epoch, the unit `created_at_ms` columns are stored in.
pub fn to_unix_millis(at: OffsetDateTime) -> i64 {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    millis.clamp(i64::MIN.into(), i64::MAX.into()) as i64
}

pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, RepoError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).map_err(|err| {
        RepoError::Integrity {
            message: format!("timestamp {millis} out of range: {err}"),
        }
    })
}

pub fn status_from_db(status: i64) -> Result<u16, RepoError> {
    u16::try_from(status).map_err(|_| RepoError::Integrity {
        message: format!("stored status {status} out of range"),
    })
}
