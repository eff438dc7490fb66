// Repository layer: each domain lives in its own file with `impl SessionRepository`.

use sqlx::sqlite::SqlitePool;

mod messages;
mod page_views;
mod sessions;

#[cfg(test)]
pub(crate) mod test_helpers;

/// Upper bound for admin session listings
pub const MAX_SESSION_LIST: i64 = 500;
/// Upper bound for page-view listings
pub const MAX_PAGE_VIEW_LIST: i64 = 1000;

#[derive(Clone)]
pub struct SessionRepository {
    pub(crate) pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
