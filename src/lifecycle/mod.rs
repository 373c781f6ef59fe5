//! Shop token lifecycle: validity, refresh and the batch refresh scheduler.

mod locks;
pub mod manager;
pub mod scheduler;

pub use locks::{ShopGuard, ShopLocks};
pub use manager::{is_valid, is_valid_at, RefreshAttempt, TokenLifecycleManager, DEFAULT_BUFFER_MINUTES};
pub use scheduler::{refresh_daemon, RefreshFailure, RefreshReport, RefreshScheduler};
