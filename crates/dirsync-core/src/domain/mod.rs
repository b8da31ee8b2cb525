//! Domain entities and business rules
//!
//! This module contains the core domain types for dirsync:
//! - Newtypes for validated paths, remote locations and identifiers
//! - Change kinds and raw filesystem change events
//! - The session lifecycle state machine
//! - Domain-specific error types

pub mod change;
pub mod errors;
pub mod newtypes;
pub mod session;

// Re-export commonly used types
pub use change::{ChangeKind, FileChangeEvent};
pub use errors::DomainError;
pub use newtypes::*;
pub use session::{SessionState, SessionStats};
