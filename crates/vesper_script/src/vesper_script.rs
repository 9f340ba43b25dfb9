//! Vesper Script - Script assembly and execution layer
//!
//! This crate contains everything the core needs to turn configuration
//! fragments into runnable code:
//! - `assembler`: builds a routine from handle/condition/deny/exception fragments
//! - `unit`: the compiled unit and the `ScriptEngine` capability
//! - `live`: lazily resolved action parameters
//! - `engine`: the bundled reference engine for the statement DSL

pub mod assembler;
pub mod engine;

mod context;
mod live;
mod unit;

pub use context::*;
pub use engine::{Action, ReferenceEngine};
pub use live::*;
pub use unit::*;
