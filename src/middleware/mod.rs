//! HTTP middleware guarding downstream handlers.
//!
//! - **Deadline**: runs the rest of the chain on its own task under a time
//!   budget and answers with exactly one response
//! - **Rate Limiting**: per-key fixed windows with lazy reset and background
//!   eviction of idle keys
//! - **Trusted Proxy Validation**: CIDR-based checks before honouring
//!   forwarded client IPs
//!
//! # Architecture
//!
//! ```text
//! Request → Rate Limiter → Deadline ─spawn─▶ Handler
//!              ↓              ↓  ◀─buffered─┘
//!          429 Too Many   504/408 + JSON, or the buffered response
//! ```

pub mod buffered;
pub mod ip;
pub mod limiter;
pub mod rate_limit;
pub mod timeout;

pub use buffered::BufferedResponse;
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip_with_trusted_proxies, peer_key};
pub use limiter::{Admission, TokenBucketLimiter};
pub use rate_limit::{AuthenticatedUser, KeyExtractor, RateLimitConfig, RateLimitLayer};
pub use timeout::{DeadlineExecutor, DownstreamFault, Outcome, TimeoutConfig, TimeoutLayer};
