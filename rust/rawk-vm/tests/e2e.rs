//! End-to-end tests: compile AWK source and execute it in the VM.

use rawk_compiler::compiler::resolve::NativeFunc;
use rawk_compiler::{compile, compile_with_options, CompileOptions};
use rawk_vm::{Value, VmConfig, VmError, VM};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

/// Helper: compile `source` into a VM that captures its output.
fn vm_with(source: &str, config: VmConfig) -> VM {
    let program = compile(source).expect("source should compile");
    let mut vm = VM::new(Arc::new(program), config).expect("vm should build");
    vm.capture_output();
    vm
}

/// Helper: run `source` over `input` and return what it printed.
fn run_with_input(source: &str, input: &str) -> String {
    let mut vm = vm_with(source, VmConfig::default());
    vm.set_stdin(Cursor::new(input.to_string()));
    vm.run().expect("program should run");
    vm.take_output()
}

fn run(source: &str) -> String {
    run_with_input(source, "")
}

/// Helper: a fresh scratch directory for file-based tests.
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rawk_e2e_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn vars(pairs: &[(&str, &str)]) -> VmConfig {
    VmConfig {
        vars: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..VmConfig::default()
    }
}

// ─── Values and comparison ───

#[test]
fn e2e_string_literals_compare_as_strings() {
    assert_eq!(
        run(r#"BEGIN { print ("1"==1), ("1.0"==1), ("abc"==0) }"#),
        "1 0 0\n"
    );
}

#[test]
fn e2e_numeric_fields_compare_as_numbers() {
    assert_eq!(
        run_with_input("$1 == 1 { print \"yes\" }", "1.0\n"),
        "yes\n"
    );
    assert_eq!(
        run_with_input("{ print ($1 < $2) }", "10 9\nabc abd\n"),
        "0\n1\n"
    );
}

#[test]
fn e2e_uninitialized_values() {
    let src = r#"BEGIN { print x + 0, "[" x "]", length(x), (x == 0), (x == "") }"#;
    assert_eq!(run(src), "0 [] 0 1 1\n");
}

#[test]
fn e2e_convfmt_applies_to_concatenation() {
    let src = r#"BEGIN { x = 0.1 + 0.2; y = x ""; print y; z = 17 ""; print z }"#;
    assert_eq!(run(src), "0.3\n17\n");
}

#[test]
fn e2e_large_integers_format_as_integers() {
    let src = r#"BEGIN { print 2^60; x = 1e16; print (x "" == "10000000000000000")
                         a[1e16] = 1; for (k in a) print k }"#;
    assert_eq!(run(src), "1152921504606846976\n1\n10000000000000000\n");
}

#[test]
fn e2e_index_of_empty_string_is_one() {
    let src = r#"{ print index($0, ""), index($0, "c"), index($0, "z") }"#;
    assert_eq!(run_with_input(src, "abc\n\n"), "1 3 0\n1 0 0\n");
}

// ─── Control flow ───

#[test]
fn e2e_nested_break_only_leaves_inner_loop() {
    let src = "BEGIN { for (i = 0; i < 3; i++) {
                           for (j = 0; j < 3; j++) { if (j == 1) break; s = s + 1 } }
                       print s }";
    assert_eq!(run(src), "3\n");
}

#[test]
fn e2e_while_do_continue() {
    let src = "BEGIN { i = 0; do { i++; if (i % 2) continue; s = s i } while (i < 6); print s }";
    assert_eq!(run(src), "246\n");
}

#[test]
fn e2e_next_and_exit_still_run_end() {
    let mut vm = vm_with(
        "NR == 2 { next } { print } NR == 3 { exit 3 } END { print \"end\", NR }",
        VmConfig::default(),
    );
    vm.set_stdin(Cursor::new("1\n2\n3\n4\n5\n"));
    let status = vm.run().unwrap();
    assert_eq!(status, 3);
    assert_eq!(vm.take_output(), "1\n3\nend 3\n");
}

#[test]
fn e2e_exit_in_begin_skips_input() {
    let src = "BEGIN { exit 1 } { print } END { print \"done\" }";
    let mut vm = vm_with(src, VmConfig::default());
    vm.set_stdin(Cursor::new("x\n"));
    assert_eq!(vm.run().unwrap(), 1);
    assert_eq!(vm.take_output(), "done\n");
}

#[test]
fn e2e_range_patterns() {
    assert_eq!(
        run_with_input("$1 == 2, $1 == 4", "1\n2\n3\n4\n5\n"),
        "2\n3\n4\n"
    );
    // Start and stop on the same record
    assert_eq!(
        run_with_input("/b/, /b/ { print NR }", "a\nb\nc\nb\n"),
        "2\n4\n"
    );
}

// ─── Functions and arrays ───

#[test]
fn e2e_arrays_pass_by_reference() {
    let src = "function fill(a) { a[\"k\"] = 99 } BEGIN { fill(arr); print arr[\"k\"] }";
    assert_eq!(run(src), "99\n");
}

#[test]
fn e2e_scalars_pass_by_value() {
    let src = "function bump(n) { n++; return n } BEGIN { x = 1; y = bump(x); print x, y }";
    assert_eq!(run(src), "1 2\n");
}

#[test]
fn e2e_recursion_depth_is_bounded() {
    let config = VmConfig {
        max_call_depth: 100,
        ..VmConfig::default()
    };
    let src = "function down(n) { return down(n + 1) } BEGIN { down(1) }";
    let mut vm = vm_with(src, config);
    match vm.run() {
        Err(VmError::CallDepthExceeded { name, max }) => {
            assert_eq!(name, "down");
            assert_eq!(max, 100);
        }
        other => panic!("expected call depth error, got {other:?}"),
    }
}

#[test]
fn e2e_for_in_with_delete() {
    let src = "BEGIN { a[1] = 1; a[2] = 2; a[3] = 3; delete a[2]
                       print (2 in a), (3 in a), length(a);
                       for (k in a) delete a[k]; print length(a) }";
    assert_eq!(run(src), "0 1 2\n0\n");
}

#[test]
fn e2e_delete_whole_array_and_subsep() {
    let src = "BEGIN { m[1, 2] = \"x\"
                       for (k in m) { split(k, parts, SUBSEP); print parts[1], parts[2] }
                       delete m; print length(m) }";
    assert_eq!(run(src), "1 2\n0\n");
}

#[test]
fn e2e_split_records() {
    let src = "{ n = split($0, parts, \",\"); print n, parts[n] }";
    assert_eq!(run_with_input(src, "a,b,c\n"), "3 c\n");
}

// ─── Records and fields ───

#[test]
fn e2e_field_separator_from_config() {
    let config = VmConfig {
        field_sep: Some(":".into()),
        ..VmConfig::default()
    };
    let mut vm = vm_with("{ print $2, NF }", config);
    vm.set_stdin(Cursor::new("a:b:c\n"));
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "b 3\n");
}

#[test]
fn e2e_paragraph_mode() {
    let src = "BEGIN { RS = \"\" } { print NR \": \" $1 \"|\" NF }";
    assert_eq!(run_with_input(src, "a b\nc\n\n\nd\n"), "1: a|3\n2: d|1\n");
}

#[test]
fn e2e_single_char_record_separator() {
    assert_eq!(
        run_with_input("BEGIN { RS = \";\" } { print }", "a;b;c"),
        "a\nb\nc\n"
    );
}

#[test]
fn e2e_field_assignment_rebuilds_with_ofs() {
    let src = "BEGIN { OFS = \"-\"; ORS = \"|\" }
               { $1 = $1; print; print $1, $2; $5 = \"e\"; print NF }";
    assert_eq!(run_with_input(src, "a b\n"), "a-b|a-b|5|");
}

#[test]
fn e2e_dynamic_regex_match() {
    let src = "{ if ($0 ~ \"^a.c$\") print \"hit\"; else print \"miss\" }";
    assert_eq!(run_with_input(src, "abc\nabcd\n"), "hit\nmiss\n");
}

// ─── Output ───

#[test]
fn e2e_printf_formats() {
    let src = r#"BEGIN { printf "%d-%s-%5.2f|%x|%%\n", 42.9, "s", 2.5, 255 }"#;
    assert_eq!(run(src), "42-s- 2.50|ff|%\n");
}

#[test]
fn e2e_print_to_file_and_read_back() {
    let dir = scratch_dir("roundtrip");
    let file = dir.join("out.txt");
    let file = file.to_string_lossy();
    let src = "BEGIN { print \"hello\" > F; print \"world\" >> F; close(F)
                       while ((getline line < F) > 0) print \"got\", line }";
    let mut vm = vm_with(src, vars(&[("F", &file)]));
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "got hello\ngot world\n");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn e2e_output_pipe_is_captured() {
    let src = "BEGIN { print \"b\" | \"sort\"; print \"a\" | \"sort\"; close(\"sort\")
                       print \"after\" }";
    assert_eq!(run(src), "a\nb\nafter\n");
}

// ─── Input ───

#[test]
fn e2e_getline_forms() {
    assert_eq!(
        run_with_input("{ getline; print }", "1\n2\n3\n4\n"),
        "2\n4\n"
    );
    assert_eq!(
        run_with_input("NR == 1 { getline line; print $0, line, NR }", "a\nb\nc\n"),
        "a b 2\n"
    );
}

#[test]
fn e2e_getline_from_missing_file() {
    assert_eq!(
        run("BEGIN { print (getline x < \"/nonexistent/rawk/input\") }"),
        "-1\n"
    );
}

#[test]
fn e2e_command_getline() {
    assert_eq!(
        run("BEGIN { \"echo hi\" | getline x; print x, NR }"),
        "hi 1\n"
    );
}

#[test]
fn e2e_system_status() {
    let src = "BEGIN { print \"a\"; r = system(\"echo sys; exit 3\"); print r }";
    assert_eq!(run(src), "a\nsys\n3\n");
}

#[test]
fn e2e_no_exec_rejects_commands() {
    let config = VmConfig {
        no_exec: true,
        ..VmConfig::default()
    };
    let mut vm = vm_with("BEGIN { system(\"true\") }", config);
    assert!(matches!(vm.run(), Err(VmError::NoExec(_))));
}

#[test]
fn e2e_nextfile_moves_to_next_operand() {
    let dir = scratch_dir("nextfile");
    let first = dir.join("one.txt");
    let second = dir.join("two.txt");
    std::fs::write(&first, "a\nb\nc\n").unwrap();
    std::fs::write(&second, "d\ne\n").unwrap();
    let src = "FNR == 2 { nextfile } { print $0, FNR, NR }";
    let mut vm = vm_with(src, VmConfig::default());
    vm.set_args(vec![
        first.to_string_lossy().into_owned(),
        second.to_string_lossy().into_owned(),
    ]);
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "a 1 1\nd 1 3\n");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn e2e_missing_input_file_is_fatal() {
    let mut vm = vm_with("{ print }", VmConfig::default());
    vm.set_args(vec!["/nonexistent/rawk/input".into()]);
    assert!(matches!(vm.run(), Err(VmError::Io(_))));
}

// ─── Command line ───

#[test]
fn e2e_config_vars_are_numeric_strings() {
    let mut vm = vm_with(
        "BEGIN { print greeting; print (n > 9) }",
        vars(&[("greeting", "hi\\tthere"), ("n", "10")]),
    );
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "hi\tthere\n1\n");
}

#[test]
fn e2e_operand_assignments() {
    let src = "BEGIN { print ARGC, ARGV[1] } { print x, $0 }";
    let mut vm = vm_with(src, VmConfig::default());
    vm.set_args(vec!["x=5".into(), "-".into()]);
    vm.set_stdin(Cursor::new("a\n"));
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "3 x=5\n5 a\n");
}

#[test]
fn e2e_environ() {
    let mut environ = BTreeMap::new();
    environ.insert("HOME".to_string(), "/home/awk".to_string());
    let config = VmConfig {
        environ: Some(environ),
        ..VmConfig::default()
    };
    let src = "BEGIN { print ENVIRON[\"HOME\"], length(ENVIRON) }";
    let mut vm = vm_with(src, config);
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "/home/awk 1\n");
}

// ─── Errors and host API ───

#[test]
fn e2e_division_by_zero() {
    let mut vm = vm_with("BEGIN { x = 0; print 1 / x }", VmConfig::default());
    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmError::DivisionByZero));
    assert_eq!(err.to_string(), "division by zero");

    let mut vm = vm_with("BEGIN { x = 0; print 1 % x }", VmConfig::default());
    assert!(matches!(vm.run(), Err(VmError::DivisionByZeroMod)));
}

#[test]
fn e2e_reset_is_idempotent() {
    let src = "BEGIN { n++; a[n] = n; print n, length(a), NR }";
    let mut vm = vm_with(src, VmConfig::default());
    vm.run().unwrap();
    let first = vm.take_output();
    vm.reset().unwrap();
    vm.run().unwrap();
    assert_eq!(first, "1 1 0\n");
    assert_eq!(vm.take_output(), first);
}

#[test]
fn e2e_native_functions() {
    let options = CompileOptions {
        natives: vec![
            NativeFunc {
                name: "twice".into(),
                arity: Some(1),
            },
            NativeFunc {
                name: "fail".into(),
                arity: None,
            },
        ],
    };
    let src = "BEGIN { print twice(4), twice(\"2.5\") }";
    let program = compile_with_options(src, &options).unwrap();
    let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
    vm.capture_output();
    vm.register_native("twice", |args| Ok(Value::Num(args[0].to_num() * 2.0)))
        .unwrap();
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "8 5\n");

    let program = compile_with_options("BEGIN { fail() }", &options).unwrap();
    let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
    vm.register_native("fail", |_| Err("nope".into())).unwrap();
    match vm.run() {
        Err(VmError::NativeFunction { name, message }) => {
            assert_eq!(name, "fail");
            assert_eq!(message, "nope");
        }
        other => panic!("expected native error, got {other:?}"),
    }
}

#[test]
fn e2e_user_function_shadows_native() {
    let options = CompileOptions {
        natives: ["a", "b", "c"]
            .iter()
            .map(|name| NativeFunc {
                name: name.to_string(),
                arity: None,
            })
            .collect(),
    };
    let program = compile_with_options(
        "function b(x) { return x \"!\" } BEGIN { print c(4), b(\"hi\") }",
        &options,
    )
    .unwrap();
    let mut vm = VM::new(Arc::new(program), VmConfig::default()).unwrap();
    vm.capture_output();
    vm.register_native("a", |_| Ok(Value::Num(1.0))).unwrap();
    vm.register_native("c", |args| Ok(Value::Num(args[0].to_num() * 10.0)))
        .unwrap();
    assert!(vm.register_native("b", |_| Ok(Value::Null)).is_err());
    vm.run().unwrap();
    assert_eq!(vm.take_output(), "40 hi!\n");
}

#[test]
fn e2e_global_lookup_after_run() {
    let mut vm = vm_with("BEGIN { total = 2 + 3 }", VmConfig::default());
    vm.run().unwrap();
    assert_eq!(vm.global("total").map(Value::to_num), Some(5.0));
    assert!(vm.global("missing").is_none());
}
