//! Rate limiting logic: keys, algorithms, scripts and the store.

mod algorithm;
mod backend;
mod distributed;
mod key;
mod local;
mod policy;
mod scripts;
mod store;

pub use algorithm::{
    hybrid_refill_rate, token_bucket_refill_rate, Algorithm, Invocation, ScriptKind, Verdict,
};
pub use backend::ScriptBackend;
pub use distributed::RedisBackend;
pub use key::{Identity, Scope, ScopeKind, GLOBAL_WARM_UP_KEY, KEY_PREFIX};
#[doc(hidden)]
pub use local::{Clock, LocalBackend, SystemClock};
pub use policy::{Admission, LimitPolicy, RoutePolicies, RouteRule};
pub use scripts::ScriptSet;
pub use store::RateLimitStore;
