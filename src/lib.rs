//! fwsync - firewall rule sync
//!
//! Keeps a host's packet-filter rules in sync with a declarative rule list
//! published at a remote URI.
//!
//! # Architecture
//!
//! - [`core`] - Change detection, normalization, target resolution, artifact rendering and the apply cycle
//! - [`audit`] - JSON-lines audit trail of every cycle
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//!
//! # Safety Features
//!
//! - Every misconfiguration is detected before the first artifact is touched
//! - Unchanged artifacts are never rewritten, so unchanged cycles never reload
//! - Atomic file operations for artifacts, the local reference and the config
//! - The local reference only advances after a successful apply

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod validators;

// Re-export commonly used types
pub use crate::core::error::{Error, Result};
pub use crate::core::rules::{AtomicRule, PortSpec, Protocol, RuleSpec};
