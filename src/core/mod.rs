//! Core types, constants, errors and collaborator traits.
//!
//! This module has no crypto or I/O dependencies.

mod constants;
mod error;
mod traits;
mod types;

pub use constants::*;
pub use error::*;
pub use traits::*;
pub use types::*;
