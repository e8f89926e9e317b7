use std::path::Path;

use async_trait::async_trait;
use avc_core::{
    AvcErrorCode, AvcStatus, DownloadResumeInfo, NotificationPending, UpdateRecord, UpdateResult,
    UpdateState, UpdateType,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};

use crate::storage::Storage;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("timestamp {0} cannot be stored")]
    TimestampRange(jiff::Timestamp),
    #[error("invalid {column} value: {value}")]
    InvalidEnum { column: &'static str, value: i32 },
}

/// SQLite-backed storage implementation.
///
/// Each record lives in its own single-row (or per-type) table and every
/// write is a single statement, so SQLite's journal provides crash atomicity.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, SqliteStorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStorageError> {
        // Every connection to `sqlite::memory:` is a distinct database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

// Timestamps are kept as nanoseconds since the epoch; records written within
// the same millisecond must still compare as different.
fn timestamp(nanos: i64) -> Result<jiff::Timestamp, SqliteStorageError> {
    jiff::Timestamp::from_nanosecond(i128::from(nanos))
        .map_err(|_| SqliteStorageError::InvalidTimestamp(nanos))
}

fn nanos(timestamp: jiff::Timestamp) -> Result<i64, SqliteStorageError> {
    i64::try_from(timestamp.as_nanosecond())
        .map_err(|_| SqliteStorageError::TimestampRange(timestamp))
}

fn update_type(value: i32) -> Result<UpdateType, SqliteStorageError> {
    match value {
        0 => Ok(UpdateType::Firmware),
        1 => Ok(UpdateType::Software),
        other => Err(SqliteStorageError::InvalidEnum {
            column: "update_type",
            value: other,
        }),
    }
}

fn update_state(value: i32) -> Result<UpdateState, SqliteStorageError> {
    Ok(match value {
        0 => UpdateState::Idle,
        1 => UpdateState::Downloading,
        2 => UpdateState::Downloaded,
        3 => UpdateState::Verifying,
        4 => UpdateState::InstallPending,
        5 => UpdateState::Installing,
        6 => UpdateState::Installed,
        7 => UpdateState::Failed,
        other => {
            return Err(SqliteStorageError::InvalidEnum {
                column: "state",
                value: other,
            });
        }
    })
}

fn update_result(value: i32) -> Result<UpdateResult, SqliteStorageError> {
    Ok(match value {
        0 => UpdateResult::Ok,
        1 => UpdateResult::ConnectionError,
        2 => UpdateResult::NoMemory,
        3 => UpdateResult::NoSpace,
        4 => UpdateResult::ChecksumMismatch,
        5 => UpdateResult::BadPackage,
        6 => UpdateResult::Unsupported,
        7 => UpdateResult::InstallFailure,
        other => {
            return Err(SqliteStorageError::InvalidEnum {
                column: "result",
                value: other,
            });
        }
    })
}

fn avc_status(value: i32) -> Result<AvcStatus, SqliteStorageError> {
    Ok(match value {
        0 => AvcStatus::NoUpdate,
        1 => AvcStatus::DownloadPending,
        2 => AvcStatus::DownloadInProgress,
        3 => AvcStatus::DownloadComplete,
        4 => AvcStatus::DownloadFailed,
        5 => AvcStatus::InstallPending,
        6 => AvcStatus::InstallInProgress,
        7 => AvcStatus::InstallComplete,
        8 => AvcStatus::InstallFailed,
        9 => AvcStatus::SessionStarted,
        10 => AvcStatus::SessionStopped,
        other => {
            return Err(SqliteStorageError::InvalidEnum {
                column: "status",
                value: other,
            });
        }
    })
}

fn error_code(value: i32) -> Result<AvcErrorCode, SqliteStorageError> {
    Ok(match value {
        0 => AvcErrorCode::None,
        1 => AvcErrorCode::Unknown,
        2 => AvcErrorCode::BadPackage,
        3 => AvcErrorCode::Internal,
        4 => AvcErrorCode::SecurityFailure,
        other => {
            return Err(SqliteStorageError::InvalidEnum {
                column: "error_code",
                value: other,
            });
        }
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    type Error = SqliteStorageError;

    async fn save_resume_info(&self, info: &DownloadResumeInfo) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO resume_info
                (id, uri, update_type, bytes_downloaded, package_size, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(info.uri.as_ref())
        .bind(info.update_type as i32)
        .bind(info.bytes_downloaded as i64)
        .bind(info.package_size.map(|size| size as i64))
        .bind(nanos(info.updated_at)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_resume_info(&self) -> Result<Option<DownloadResumeInfo>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT uri, update_type, bytes_downloaded, package_size, updated_at
            FROM resume_info WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<DownloadResumeInfo, SqliteStorageError> {
            Ok(DownloadResumeInfo {
                uri: r.try_get::<String, _>("uri")?.into_boxed_str(),
                update_type: update_type(r.try_get("update_type")?)?,
                bytes_downloaded: r.try_get::<i64, _>("bytes_downloaded")? as u64,
                package_size: r
                    .try_get::<Option<i64>, _>("package_size")?
                    .map(|size| size as u64),
                updated_at: timestamp(r.try_get("updated_at")?)?,
            })
        })
        .transpose()
    }

    async fn delete_resume_info(&self) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM resume_info WHERE id = 1")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_update_record(
        &self,
        update_type: UpdateType,
        record: &UpdateRecord,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO update_records (update_type, state, result, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(update_type as i32)
        .bind(record.state as i32)
        .bind(record.result.map(|result| result as i32))
        .bind(nanos(record.updated_at)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_update_record(
        &self,
        kind: UpdateType,
    ) -> Result<Option<UpdateRecord>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT state, result, updated_at FROM update_records WHERE update_type = ?
            "#,
        )
        .bind(kind as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<UpdateRecord, SqliteStorageError> {
            Ok(UpdateRecord {
                state: update_state(r.try_get("state")?)?,
                result: r
                    .try_get::<Option<i32>, _>("result")?
                    .map(update_result)
                    .transpose()?,
                updated_at: timestamp(r.try_get("updated_at")?)?,
            })
        })
        .transpose()
    }

    async fn save_notification(
        &self,
        notification: &NotificationPending,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO notification
                (id, requested, update_type, status, error_code, result, captured_at)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(notification.requested)
        .bind(notification.update_type as i32)
        .bind(notification.status as i32)
        .bind(notification.error_code as i32)
        .bind(notification.result.map(|result| result as i32))
        .bind(nanos(notification.captured_at)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_notification(&self) -> Result<Option<NotificationPending>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT requested, update_type, status, error_code, result, captured_at
            FROM notification WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<NotificationPending, SqliteStorageError> {
            Ok(NotificationPending {
                requested: r.try_get("requested")?,
                update_type: update_type(r.try_get("update_type")?)?,
                status: avc_status(r.try_get("status")?)?,
                error_code: error_code(r.try_get("error_code")?)?,
                result: r
                    .try_get::<Option<i32>, _>("result")?
                    .map(update_result)
                    .transpose()?,
                captured_at: timestamp(r.try_get("captured_at")?)?,
            })
        })
        .transpose()
    }
}
