//! rawk CLI: run AWK programs from the command line.

mod config;

use clap::Parser as ClapParser;
use rawk_compiler::bytecode::CompiledProgram;
use rawk_compiler::{CompileError, CompileOptions};
use rawk_vm::vm::io::split_assignment;
use rawk_vm::{VmConfig, VM};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Deep AWK recursion keeps native frames alive for every call.
const VM_STACK_SIZE: usize = 256 * 1024 * 1024;

#[derive(ClapParser, Debug)]
#[command(
    name = "rawk",
    version,
    about = "An AWK interpreter",
    override_usage = "rawk [-F fs] [-v var=val]... [-f progfile]... [prog] [file...]"
)]
struct Cli {
    /// Input field separator
    #[arg(short = 'F', value_name = "fs")]
    field_sep: Option<String>,

    /// Assign a variable before BEGIN runs
    #[arg(short = 'v', value_name = "var=val")]
    assign: Vec<String>,

    /// Read the program from a file instead of the first operand
    #[arg(short = 'f', value_name = "progfile")]
    progfile: Vec<PathBuf>,

    /// Run a program written earlier by --emit-json
    #[arg(long, value_name = "path", conflicts_with = "progfile")]
    load_json: Option<PathBuf>,

    /// Print the compiled bytecode to stderr before running
    #[arg(long)]
    disasm: bool,

    /// Print the resolved variable kinds and exit
    #[arg(long)]
    dump_types: bool,

    /// Print the compiled program as JSON and exit
    #[arg(long)]
    emit_json: bool,

    /// Use this config file instead of searching for rawk.toml
    #[arg(long, value_name = "path")]
    config: Option<PathBuf>,

    /// Program text (unless -f or --load-json is given), then input files
    /// and var=value assignments. Use `--` before a program that starts
    /// with `-`.
    #[arg(trailing_var_arg = true)]
    operands: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("rawk: {}", e);
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<i32, String> {
    let file_config = match &cli.config {
        Some(path) => config::RawkConfig::load_from(path)?,
        None => config::RawkConfig::load()?,
    };
    let vm_config = vm_config(&cli, file_config.vm)?;

    let mut operands = cli.operands;
    let program = match &cli.load_json {
        Some(path) => load_program(path)?,
        None => {
            let source = if cli.progfile.is_empty() {
                if operands.is_empty() {
                    return Err("no program given".into());
                }
                operands.remove(0)
            } else {
                read_progfiles(&cli.progfile)?
            };

            if cli.dump_types {
                let options = CompileOptions::default();
                let resolved = rawk_compiler::resolve_source(&source, &options)
                    .map_err(compile_error)?;
                print!("{}", resolved.dump());
                return Ok(0);
            }
            rawk_compiler::compile(&source).map_err(compile_error)?
        }
    };
    debug!(hash = %program.source_hash, "compiled program");

    if cli.emit_json {
        let json = rawk_compiler::emit_json(&program)
            .map_err(|e| format!("emitting json: {}", e))?;
        println!("{}", json);
        return Ok(0);
    }
    if cli.disasm {
        eprint!("{}", rawk_compiler::disassemble(&program));
    }

    let program = Arc::new(program);
    let worker = std::thread::Builder::new()
        .name("rawk-vm".into())
        .stack_size(VM_STACK_SIZE)
        .spawn(move || execute(program, vm_config, operands))
        .map_err(|e| format!("cannot start interpreter thread: {}", e))?;
    worker
        .join()
        .map_err(|_| "interpreter thread panicked".to_string())?
}

/// Layer the command-line flags over the config file.
fn vm_config(cli: &Cli, mut config: VmConfig) -> Result<VmConfig, String> {
    if let Some(fs) = &cli.field_sep {
        // `-Ft` is the traditional spelling of a tab separator
        config.field_sep = Some(if fs == "t" { "\t".into() } else { fs.clone() });
    }
    for assign in &cli.assign {
        let (name, value) = split_assignment(assign).ok_or_else(|| {
            format!("invalid -v argument {:?}, expected var=value", assign)
        })?;
        config.vars.insert(name.to_string(), value.to_string());
    }
    Ok(config)
}

fn read_progfiles(paths: &[PathBuf]) -> Result<String, String> {
    let mut source = String::new();
    for path in paths {
        let text = if path.as_os_str() == "-" {
            std::io::read_to_string(std::io::stdin())
        } else {
            std::fs::read_to_string(path)
        }
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        source.push_str(&text);
        source.push('\n');
    }
    Ok(source)
}

fn load_program(path: &Path) -> Result<CompiledProgram, String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    rawk_compiler::load_json(&json)
        .map_err(|e| format!("invalid json in '{}': {}", path.display(), e))
}

fn compile_error(e: CompileError) -> String {
    format!("compile error: {}", e)
}

fn execute(
    program: Arc<CompiledProgram>,
    config: VmConfig,
    operands: Vec<String>,
) -> Result<i32, String> {
    let mut vm = VM::new(program, config).map_err(|e| e.to_string())?;
    vm.set_args(operands);

    let cancel = vm.cancel_handle();
    if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed)) {
        warn!(error = %e, "cannot install interrupt handler");
    }

    vm.run().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn test_attached_field_separator() {
        let cli = parse(&["rawk", "-F:", "{ print $2 }", "data.txt"]);
        assert_eq!(cli.field_sep.as_deref(), Some(":"));
        assert_eq!(cli.operands, vec!["{ print $2 }", "data.txt"]);

        let cli = parse(&["rawk", "-F", ",", "{ print }"]);
        assert_eq!(cli.field_sep.as_deref(), Some(","));
        assert_eq!(cli.operands, vec!["{ print }"]);
    }

    #[test]
    fn test_attached_and_spaced_assignments() {
        let cli = parse(&["rawk", "-vx=3", "-v", "y=4", "BEGIN { print x, y }"]);
        assert_eq!(cli.assign, vec!["x=3", "y=4"]);
        assert_eq!(cli.operands, vec!["BEGIN { print x, y }"]);

        let config = vm_config(&cli, VmConfig::default()).unwrap();
        assert_eq!(config.vars.get("x").map(String::as_str), Some("3"));
        assert_eq!(config.vars.get("y").map(String::as_str), Some("4"));
    }

    #[test]
    fn test_operands_after_program_keep_hyphens() {
        let cli = parse(&["rawk", "{ print }", "-", "n=1", "-x"]);
        assert_eq!(cli.operands, vec!["{ print }", "-", "n=1", "-x"]);

        let cli = parse(&["rawk", "-f", "prog.awk", "-"]);
        assert_eq!(cli.progfile, vec![PathBuf::from("prog.awk")]);
        assert_eq!(cli.operands, vec!["-"]);
    }

    #[test]
    fn test_flags_override_config_file() {
        let cli = parse(&["rawk", "-Ft", "-v", "n=2", "{ print }"]);
        let mut file = VmConfig {
            field_sep: Some(":".into()),
            ..VmConfig::default()
        };
        file.vars.insert("n".into(), "1".into());
        file.vars.insert("m".into(), "5".into());
        let config = vm_config(&cli, file).unwrap();
        assert_eq!(config.field_sep.as_deref(), Some("\t"));
        assert_eq!(config.vars.get("n").map(String::as_str), Some("2"));
        assert_eq!(config.vars.get("m").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_invalid_assignment_is_rejected() {
        let cli = parse(&["rawk", "-v", "1x=3", "BEGIN {}"]);
        assert!(vm_config(&cli, VmConfig::default()).is_err());
    }

    #[test]
    fn test_load_json_runs_emitted_program() {
        let dir = std::env::temp_dir().join(format!("rawk_cli_json_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prog.json");
        let program = rawk_compiler::compile("BEGIN { print 6 * 7 }").unwrap();
        let json = rawk_compiler::emit_json(&program).unwrap();
        std::fs::write(&path, json).unwrap();

        let loaded = load_program(&path).unwrap();
        assert_eq!(loaded.source_hash, program.source_hash);
        let mut vm = VM::new(Arc::new(loaded), VmConfig::default()).unwrap();
        vm.capture_output();
        vm.run().unwrap();
        assert_eq!(vm.take_output(), "42\n");

        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_program(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);

        let cli = parse(&["rawk", "--load-json", "prog.json", "input.txt"]);
        assert_eq!(cli.load_json, Some(PathBuf::from("prog.json")));
        assert_eq!(cli.operands, vec!["input.txt"]);
        let both = ["rawk", "--load-json", "p.json", "-f", "x.awk"];
        assert!(Cli::try_parse_from(both).is_err());
    }
}
