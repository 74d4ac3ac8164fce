//! Bidsmith SDK
//!
//! Shared types for the curation engine: errors, BIDS filename entities and
//! the protocol translator codec. Kept free of filesystem access so the types
//! can be reused by anything that reads or writes a translator.

/// Error types and handling
pub mod errors;

/// BIDS filename entities and canonical names
pub mod entities;

/// Protocol translator entries
pub mod translator;

// Re-export commonly used types
pub use entities::{CanonicalName, Stub};
pub use errors::{CurateError, CurateErrorExt};
pub use translator::{IntendedFor, TranslatorEntry};
