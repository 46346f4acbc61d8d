pub mod ast;
pub mod bytecode;
pub mod disasm;
pub mod emit;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod resolve;
pub mod specials;
pub mod tokens;
pub mod toposort;
