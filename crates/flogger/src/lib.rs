#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the flogger core: the data logger facade, the entry
//! store, the execution pools and the built-in handlers.

pub use flogger_core::*;
