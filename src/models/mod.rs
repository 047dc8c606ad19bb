mod headers;
mod ids;
mod message;
mod webhook_event;
mod workspace;

pub use headers::*;
pub use ids::*;
pub use message::*;
pub use webhook_event::*;
pub use workspace::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}
