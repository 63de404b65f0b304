//! Marketplace boundary - the only place wavecrowd talks to the crowd-work service
//!
//! This module provides:
//! - Task, assignment and qualification-requirement types
//! - The `Marketplace` trait every backend implements
//! - `HttpMarketplace`, a JSON-over-HTTP client with NextToken paging
//! - `InMemoryMarketplace`, an in-process backend for trial runs and tests

pub mod client;
pub mod http;
pub mod memory;

pub use client::{
    Assignment, AssignmentStatus, Comparator, Locale, Marketplace, MarketplaceError, QualificationRequirement,
    TaskRequest, TaskStatus, TaskSummary, Visibility,
};
pub use http::{DEFAULT_ENDPOINT, HttpMarketplace, HttpMarketplaceConfig, SANDBOX_ENDPOINT};
pub use memory::InMemoryMarketplace;
