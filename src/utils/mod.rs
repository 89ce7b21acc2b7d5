// Small cross-cutting helpers shared by every component.

pub mod hash;
pub mod rate_limiter;

pub use hash::{estimate_tokens, sha256_hash};
pub use rate_limiter::RateLimiter;
