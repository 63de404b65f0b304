//! Wavecrowd - wave scheduling for crowd-sourced pair annotation
//!
//! Wavecrowd ranks groups of documents, publishes their pairs to a
//! crowd-work marketplace in waves, and reconciles submitted work until
//! every pair has three independent annotations. Eligibility tokens rotate
//! between waves so annotator cohorts never see each other's pairs.

pub mod corpus;
pub mod error;
pub mod id;
pub mod marketplace;
pub mod scheduler;
pub mod screening;
pub mod store;
pub mod template;

pub use error::{Result, WaveError};
