//! Core rule-sync functionality
//!
//! Everything between "a rule document arrived" and "the host firewall was
//! rebuilt" lives here:
//!
//! - [`rules`]: Rule document types and parsing
//! - [`normalize`]: Expansion of rule specs into atomic rules
//! - [`change`]: Remote change detection
//! - [`source`]: HTTP transport and the local reference copy
//! - [`resolve`]: Target address resolution, including tag discovery
//! - [`render`]: Artifact naming, content and stores
//! - [`apply`]: The apply cycle and host actions
//! - [`import`]: One end-to-end import run
//! - [`error`]: Error types

pub mod apply;
pub mod change;
pub mod error;
pub mod import;
pub mod normalize;
pub mod render;
pub mod resolve;
pub mod rules;
pub mod source;

#[cfg(test)]
pub mod test_helpers;
