//! rawk VM: stack-based virtual machine for compiled AWK programs.

pub mod config;
pub mod values;
pub mod vm;

pub use config::VmConfig;
pub use values::Value;
pub use vm::{NativeFn, VmError, VM};
