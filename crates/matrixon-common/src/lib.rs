//! Matrixon Common Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//!
//! Shared error types for the Matrixon missing-state resolution engine.

pub mod error;

pub use error::{MatrixonError, Result};
