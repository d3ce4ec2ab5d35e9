//! `coursegen-core`: domain foundation building blocks.
//!
//! This crate contains **pure** primitives shared by the job engine and its
//! collaborators (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{CourseId, UserId};
