mod account;
mod backoff;
mod classifier;
mod concurrency;
mod error;
mod pool;
mod ratelimit;
mod retry;
mod scheduler;
mod session;
mod store;

pub use account::{Account, AccountKind, AccountStatus, OAuthTokens, ProxyMode};
pub use backoff::backoff_delay;
pub use classifier::{classify, Classification, Disposition, DEFAULT_RETRY_AFTER_SECS, OVERLOAD_COOLDOWN_SECS};
pub use concurrency::{ConcurrencyConfig, ConcurrencyManager, SlotGuard, SlotStats};
pub use error::{ProxyError, Result};
pub use pool::{ClientPool, PoolConfig};
pub use ratelimit::{RateDecision, RateLimitConfig, RateLimitRule, RateLimiter};
pub use retry::{Execution, RetryConfig, RetryExecutor, TokenRefresher};
pub use scheduler::{LoadReader, Scheduler, SchedulerConfig, Selection, Strategy};
pub use session::generate_session_hash;
pub use store::{apply_account_action, AccountAction, AccountStore, MemoryAccountStore};
