//! Core building blocks for the matrix chat service.
//!
//! This crate provides:
//! - `Matrix` - Validated rectangular `f64` grid
//! - `engine` - Pure matrix operations with explicit failure kinds
//! - `command` - Line grammar that splits chat text from matrix commands

pub mod command;
pub mod engine;
pub mod matrix;

pub use command::{Command, Control, Op, Operation, ParseError, Parsed, parse_command, parse_line};
pub use engine::{MatrixError, Outcome, SINGULARITY_TOLERANCE, evaluate};
pub use matrix::{Matrix, Shape, ShapeError, format_number};

/// Session identifier.
///
/// Allocated in increasing order, so comparing two ids compares join order.
pub type SessionId = u64;
