//! Human-readable bytecode listing, one line per op.

use crate::compiler::bytecode::*;
use std::fmt::Write as _;

/// Disassemble every block of `program`.
pub fn disassemble(program: &CompiledProgram) -> String {
    let mut out = String::new();
    let top = Names::top_level();
    for (i, code) in program.begin.iter().enumerate() {
        let _ = writeln!(out, "        // BEGIN {}", i + 1);
        disassemble_block(program, &top, code, &mut out);
        out.push('\n');
    }
    for (i, action) in program.actions.iter().enumerate() {
        match &action.pattern {
            CompiledPattern::All => {}
            CompiledPattern::Expr(code) => {
                let _ = writeln!(out, "        // pattern {}", i + 1);
                disassemble_block(program, &top, code, &mut out);
            }
            CompiledPattern::Range(start, stop) => {
                let _ = writeln!(out, "        // range start {}", i + 1);
                disassemble_block(program, &top, start, &mut out);
                let _ = writeln!(out, "        // range stop {}", i + 1);
                disassemble_block(program, &top, stop, &mut out);
            }
        }
        let _ = writeln!(out, "        // action {}", i + 1);
        match &action.body {
            Some(code) => disassemble_block(program, &top, code, &mut out),
            None => out.push_str("        print $0\n"),
        }
        out.push('\n');
    }
    for (i, code) in program.end.iter().enumerate() {
        let _ = writeln!(out, "        // END {}", i + 1);
        disassemble_block(program, &top, code, &mut out);
        out.push('\n');
    }
    for function in &program.functions {
        let _ = writeln!(
            out,
            "        // function {}({})",
            function.name,
            function.params.join(", ")
        );
        let locals = Names::function(function);
        disassemble_block(program, &locals, &function.body, &mut out);
        out.push('\n');
    }
    out
}

/// Local variable names of the block being listed
struct Names {
    scalars: Vec<String>,
    arrays: Vec<String>,
}

impl Names {
    fn top_level() -> Self {
        Names {
            scalars: Vec::new(),
            arrays: Vec::new(),
        }
    }

    fn function(function: &CompiledFunction) -> Self {
        let mut names = Names::top_level();
        for (param, is_array) in function.params.iter().zip(&function.arrays) {
            if *is_array {
                names.arrays.push(param.clone());
            } else {
                names.scalars.push(param.clone());
            }
        }
        names
    }
}

fn name_at(names: &[String], index: u32) -> String {
    names
        .get(index as usize)
        .cloned()
        .unwrap_or_else(|| format!("?{}", index))
}

fn scalar(program: &CompiledProgram, locals: &Names, r: ScalarRef) -> String {
    match r {
        ScalarRef::Global(i) => name_at(&program.scalar_names, i),
        ScalarRef::Local(i) => name_at(&locals.scalars, i),
        ScalarRef::Special(var) => var.name().to_string(),
    }
}

fn array(program: &CompiledProgram, locals: &Names, r: ArrayRef) -> String {
    match r {
        ArrayRef::Global(i) => name_at(&program.array_names, i),
        ArrayRef::Local(i) => name_at(&locals.arrays, i),
    }
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn disassemble_block(program: &CompiledProgram, locals: &Names, code: &[Op], out: &mut String) {
    for (pc, op) in code.iter().enumerate() {
        let operands = operands(program, locals, pc, op);
        if operands.is_empty() {
            let _ = writeln!(out, "{:04}    {}", pc, op.name());
        } else {
            let _ = writeln!(out, "{:04}    {} {}", pc, op.name(), operands);
        }
    }
}

fn operands(program: &CompiledProgram, locals: &Names, pc: usize, op: &Op) -> String {
    let global = |i: u32| name_at(&program.scalar_names, i);
    let local = |i: u32| name_at(&locals.scalars, i);
    let global_array = |i: u32| name_at(&program.array_names, i);
    let local_array = |i: u32| name_at(&locals.arrays, i);

    if let Some(offset) = op.jump_offset() {
        return format!("{:04}", pc as i64 + 1 + offset as i64);
    }

    match *op {
        Op::Num(i) => program
            .nums
            .get(i as usize)
            .map(|n| fmt_num(*n))
            .unwrap_or_else(|| format!("?{}", i)),
        Op::Str(i) => program
            .strs
            .get(i as usize)
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| format!("?{}", i)),
        Op::Regex(i) => program
            .regexes
            .get(i as usize)
            .map(|r| format!("/{}/", r))
            .unwrap_or_else(|| format!("?{}", i)),
        Op::FieldInt(n) => format!("${}", n),
        Op::Global(i) | Op::AssignGlobal(i) => global(i),
        Op::Local(i) | Op::AssignLocal(i) => local(i),
        Op::Special(var) | Op::AssignSpecial(var) => var.name().to_string(),
        Op::ArrayGlobal(i) | Op::InGlobal(i) | Op::AssignArrayGlobal(i) => global_array(i),
        Op::ArrayLocal(i) | Op::InLocal(i) | Op::AssignArrayLocal(i) => local_array(i),
        Op::Delete(r) | Op::DeleteAll(r) | Op::CallLengthArray(r) | Op::ArrayArg(r) => {
            array(program, locals, r)
        }
        Op::IncrField(amount) => format!("{:+}", amount),
        Op::IncrGlobal { amount, index } => format!("{} {:+}", global(index), amount),
        Op::IncrLocal { amount, index } => format!("{} {:+}", local(index), amount),
        Op::IncrSpecial { amount, var } => format!("{} {:+}", var.name(), amount),
        Op::IncrArrayGlobal { amount, index } => format!("{} {:+}", global_array(index), amount),
        Op::IncrArrayLocal { amount, index } => format!("{} {:+}", local_array(index), amount),
        Op::AugAssignField(op) => op.symbol().to_string(),
        Op::AugAssignGlobal { op, index } => format!("{} {}", global(index), op.symbol()),
        Op::AugAssignLocal { op, index } => format!("{} {}", local(index), op.symbol()),
        Op::AugAssignSpecial { op, var } => format!("{} {}", var.name(), op.symbol()),
        Op::AugAssignArrayGlobal { op, index } => {
            format!("{} {}", global_array(index), op.symbol())
        }
        Op::AugAssignArrayLocal { op, index } => format!("{} {}", local_array(index), op.symbol()),
        Op::IndexMulti(n) | Op::ConcatMulti(n) | Op::Nulls(n) => n.to_string(),
        Op::ForIn {
            var,
            array: arr,
            body_len,
        } => format!(
            "{} in {} (body {:04}..{:04})",
            scalar(program, locals, var),
            array(program, locals, arr),
            pc + 1,
            pc + 1 + body_len as usize
        ),
        Op::CallBuiltin { func, num_args } => format!("{}/{}", func.name(), num_args),
        Op::CallSplit { array: arr, sep } => {
            let suffix = if sep { " sep" } else { "" };
            format!("{}{}", array(program, locals, arr), suffix)
        }
        Op::CallSub { global } => (if global { "gsub" } else { "sub" }).to_string(),
        Op::CallUser {
            func,
            num_array_args,
        } => {
            let name = program
                .functions
                .get(func as usize)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| format!("?{}", func));
            format!("{} arrays={}", name, num_array_args)
        }
        Op::CallNative { func, num_args } => {
            format!("{}/{}", name_at(&program.native_names, func), num_args)
        }
        Op::Print { num_args, redirect } | Op::Printf { num_args, redirect } => {
            match redirect {
                Redirect::Stdout => num_args.to_string(),
                Redirect::File => format!("{} >", num_args),
                Redirect::Append => format!("{} >>", num_args),
                Redirect::Pipe => format!("{} |", num_args),
            }
        }
        Op::Getline(kind) | Op::GetlineField(kind) => getline_kind(kind).to_string(),
        Op::GetlineVar { kind, var } => {
            format!("{} {}", getline_kind(kind), scalar(program, locals, var))
        }
        Op::GetlineArray { kind, array: arr } => {
            format!("{} {}", getline_kind(kind), array(program, locals, arr))
        }
        _ => String::new(),
    }
}

fn getline_kind(kind: GetlineKind) -> &'static str {
    match kind {
        GetlineKind::Main => "main",
        GetlineKind::File => "<",
        GetlineKind::Command => "|",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::lex;
    use crate::compiler::lower::lower;
    use crate::compiler::parser::parse;
    use crate::compiler::resolve::resolve;

    fn disasm_src(src: &str) -> String {
        let program = parse(lex(src).unwrap()).unwrap();
        let resolved = resolve(program, &[]).unwrap();
        disassemble(&lower(&resolved, src).unwrap())
    }

    #[test]
    fn test_names_not_indices() {
        let text = disasm_src("BEGIN { total = 5; print total }");
        assert!(text.contains("// BEGIN 1"));
        assert!(text.contains("0000    Num 5\n"));
        assert!(text.contains("0001    AssignGlobal total\n"));
        assert!(text.contains("0002    Global total\n"));
    }

    #[test]
    fn test_absolute_jump_targets() {
        let text = disasm_src("BEGIN { while (i < 3) i++ }");
        assert!(text.contains("0002    JumpGreaterOrEqual 0007\n"));
        assert!(text.contains("0006    JumpLess 0003\n"));
    }

    #[test]
    fn test_function_locals() {
        let text = disasm_src("function f(a, n) { a[n] = 1; return n } BEGIN { f(x, 1) }");
        assert!(text.contains("// function f(a, n)"));
        assert!(text.contains("AssignArrayLocal a"));
        assert!(text.contains("Local n"));
        assert!(text.contains("CallUser f arrays=1"));
        assert!(text.contains("ArrayArg x"));
    }

    #[test]
    fn test_actions_and_patterns() {
        let text = disasm_src("/x/ { print \"y\" } NR==1, NR==2");
        assert!(text.contains("// pattern 1"));
        assert!(text.contains("Regex /x/"));
        assert!(text.contains("Str \"y\""));
        assert!(text.contains("// range start 2"));
        assert!(text.contains("Special NR"));
        assert!(text.contains("print $0"));
    }
}
