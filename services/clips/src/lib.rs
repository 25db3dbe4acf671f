//! Clips Service
//!
//! Audio clip catalog for the clips streaming platform. Clients list clips,
//! create new ones, and stream them through a redirect that records a play.
//! Every store-backed request goes through a resilience layer so that a flaky
//! or absent PostgreSQL degrades the service to 503s instead of taking it down.
//!
//! ## Features
//!
//! - **Store Handle Manager**: lazy store initialization, liveness-probed
//!   handles with bounded linear-backoff retry, release on every exit path
//! - **Sliding-Window Rate Limiting**: per-client windows for read and write
//!   routes, rejected with 429 before the store is touched
//! - **Observability Middleware**: one counter and one duration observation per
//!   request, uniform JSON error envelopes, `X-Process-Time` annotation
//! - **Clip Catalog**: listing, creation, popularity and play statistics
//!
//! ## Architecture
//!
//! ```text
//!   HTTP request
//!        │
//!        ▼
//! ┌──────────────┐   metrics    ┌──────────────┐
//! │ Observe      │─────────────▶│ Request      │──▶ /metrics
//! │ Requests     │              │ Metrics      │
//! └──────────────┘              └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐   429
//! │ Rate Limit   │──────────▶ client
//! │ Gate         │
//! └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐  acquire    ┌──────────────┐          ┌──────────────┐
//! │ Clip         │────────────▶│ Store        │─────────▶│ PostgreSQL   │
//! │ Handlers     │◀────────────│ Manager      │  probe   │ clips        │
//! └──────────────┘   handle    └──────────────┘          └──────────────┘
//! ```

pub mod api;
pub mod clip_store;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod rate_limiter;
pub mod retry;
pub mod store_manager;

pub use api::{create_router, AppState};
pub use clip_store::{CatalogStats, Clip, ClipQuery, ClipStats, NewClip, PgDriver};
pub use config::Config;
pub use error::{ErrorEnvelope, ServiceError};
pub use observability::{MetricsSnapshot, RequestMetrics};
pub use rate_limiter::{RateDecision, RateLimitRule, RateLimiter};
pub use retry::RetryPolicy;
pub use store_manager::{StoreDriver, StoreError, StoreHandle, StoreManager, StoreStatus};
