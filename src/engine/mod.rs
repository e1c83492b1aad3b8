//! Reconciliation engine keeping stored tag digests in line with the registries
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Importer   │────▶│  Retention  │────▶│  Discovery  │────▶│   Refresh   │
//! │  (catalog)  │     │   (sweep)   │     │ (new tags)  │     │  (digests)  │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │                   │
//!        │                                       ▼                   ▼
//! ┌─────────────┐                         ┌─────────────────────────────────┐
//! │  Scheduler  │                         │     Rate limiter (shared)       │
//! └─────────────┘                         └─────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`scheduler`]: periodic loop driving the jobs below
//! - [`importer`]: seeds monitored tags from a [`Catalog`](crate::registry::catalog::Catalog)
//! - [`retention`]: age-based deletion of history and inactive tags
//! - [`discovery`]: enrolls tags that appeared since the last pass
//! - [`refresh`]: batched digest reconciliation with 401/429 recovery
//! - [`rate_limiter`]: request pacing shared by discovery and refresh

pub mod discovery;
pub mod importer;
pub mod rate_limiter;
pub mod refresh;
pub mod retention;
pub mod scheduler;
