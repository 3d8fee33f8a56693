pub mod idempotency_repository;

pub use idempotency_repository::PostgresIdempotencyStore;

use sqlx::PgPool;

/// Database connection pool type alias.
pub type DbPool = PgPool;
