//! rawk compiler
//!
//! Turns AWK source text into a [`CompiledProgram`]: lex, parse, resolve
//! variable scopes and kinds, then lower to stack bytecode.

pub mod compiler;

use compiler::bytecode::CompiledProgram;
use compiler::resolve::{NativeFunc, ResolvedProgram};
use thiserror::Error;
use tracing::debug;

pub use compiler::bytecode;
pub use compiler::disasm::disassemble;
pub use compiler::emit::{emit_json, load_json};

// ── Compile options ─────────────────────────────────────────────────

/// Options for the compile pipeline.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Host functions callable from the program. Their implementations are
    /// registered on the VM under the same names.
    pub natives: Vec<NativeFunc>,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Lex(#[from] compiler::lexer::LexError),
    #[error("{0}")]
    Parse(#[from] compiler::parser::ParseError),
    #[error("{0}")]
    Resolve(#[from] compiler::resolve::ResolveError),
    #[error("{0}")]
    Lower(#[from] compiler::lower::LowerError),
}

/// Parse and resolve without generating code.
pub fn resolve_source(
    source: &str,
    options: &CompileOptions,
) -> Result<ResolvedProgram, CompileError> {
    let tokens = compiler::lexer::lex(source)?;
    debug!(tokens = tokens.len(), "lexed source");
    let program = compiler::parser::parse(tokens)?;
    debug!(
        begin = program.begin.len(),
        actions = program.actions.len(),
        end = program.end.len(),
        functions = program.functions.len(),
        "parsed program"
    );
    Ok(compiler::resolve::resolve(program, &options.natives)?)
}

/// Compile AWK source with default options.
pub fn compile(source: &str) -> Result<CompiledProgram, CompileError> {
    compile_with_options(source, &CompileOptions::default())
}

/// Compile AWK source, declaring the given native functions.
pub fn compile_with_options(
    source: &str,
    options: &CompileOptions,
) -> Result<CompiledProgram, CompileError> {
    let resolved = resolve_source(source, options)?;
    Ok(compiler::lower::lower(&resolved, source)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_ok() {
        let program = compile("BEGIN { x = 1 } { print $1 } END { print x }").unwrap();
        assert_eq!(program.begin.len(), 1);
        assert_eq!(program.actions.len(), 1);
        assert_eq!(program.end.len(), 1);
        assert!(program.reads_input());
    }

    #[test]
    fn test_begin_only_does_not_read_input() {
        let program = compile("BEGIN { print 1 }").unwrap();
        assert!(!program.reads_input());
    }

    #[test]
    fn test_each_stage_reports_errors() {
        assert!(matches!(
            compile("BEGIN { \"abc }"),
            Err(CompileError::Lex(_))
        ));
        assert!(matches!(
            compile("BEGIN { x = }"),
            Err(CompileError::Parse(_))
        ));
        assert!(matches!(
            compile("BEGIN { x[1] = 1; x = 2 }"),
            Err(CompileError::Resolve(_))
        ));
        assert!(matches!(compile("/(/"), Err(CompileError::Lower(_))));
    }

    #[test]
    fn test_error_messages_carry_position() {
        let err = compile("BEGIN {\n  x[1] = 1\n  x = 2\n}").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("can't use array \"x\" as scalar"), "{}", msg);
        assert!(msg.contains("line 3"), "{}", msg);
    }

    #[test]
    fn test_natives_declared_through_options() {
        let options = CompileOptions {
            natives: vec![NativeFunc {
                name: "add".into(),
                arity: None,
            }],
        };
        let program = compile_with_options("BEGIN { print add(1, 2) }", &options).unwrap();
        assert_eq!(program.native_names, vec!["add"]);
        assert!(compile("BEGIN { print add(1, 2) }").is_err());
    }
}
