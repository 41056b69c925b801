// src/gcode/mod.rs
pub mod parser;

pub use parser::{Command, Param};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GCodeError {
    #[error("syntax error in '{line}': {reason}")]
    Syntax { line: String, reason: String },
    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),
}
