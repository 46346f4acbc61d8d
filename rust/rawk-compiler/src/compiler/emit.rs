//! Compiled program serialization to JSON.

use crate::compiler::bytecode::CompiledProgram;

/// Emit a compiled program as pretty-printed JSON.
pub fn emit_json(program: &CompiledProgram) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(program)
}

/// Read a program previously written by [`emit_json`].
pub fn load_json(json: &str) -> Result<CompiledProgram, serde_json::Error> {
    serde_json::from_str(json)
}
