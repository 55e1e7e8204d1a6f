//! Shared test plumbing
//!
//! Database-backed tests share one SQLite file per test process and
//! serialize on a global lock; each test seeds rows with unique names so
//! ordering between tests never matters.

use once_cell::sync::Lazy;
use std::sync::{Mutex, MutexGuard, Once};

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static INIT: Once = Once::new();

/// Acquire the database lock and make sure the schema exists.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    INIT.call_once(|| {
        let path = std::env::temp_dir().join(format!("one-api-test-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        crate::store::use_database(path.to_str().unwrap());
        crate::store::init();
    });
    guard
}
