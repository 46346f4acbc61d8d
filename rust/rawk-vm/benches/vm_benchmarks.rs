//! Benchmarks for the VM: tight loops, field splitting, and associative
//! arrays over generated input.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rawk_compiler::compile;
use rawk_vm::{VmConfig, VM};
use std::io::Cursor;
use std::sync::Arc;

const LOOP_SUM: &str = "BEGIN { for (i = 0; i < 100000; i++) s += i; print s }";

const FIELD_SUM: &str = "{ for (i = 1; i <= NF; i++) total += $i } END { print total }";

const WORD_COUNT: &str = "{ for (i = 1; i <= NF; i++) count[$i]++ }
END { for (w in count) n++; print n }";

fn generated_input(lines: usize) -> String {
    let mut input = String::new();
    for i in 0..lines {
        input += &format!("{} w{} {} w{} {}\n", i, i % 97, i * 3, i % 13, i % 7);
    }
    input
}

fn run_program(source: &str, input: &str) -> String {
    let program = compile(source).expect("benchmark program compiles");
    let mut vm = VM::new(Arc::new(program), VmConfig::default()).expect("vm builds");
    vm.capture_output();
    vm.set_stdin(Cursor::new(input.to_string()));
    vm.run().expect("benchmark program runs");
    vm.take_output()
}

fn bench_loop(c: &mut Criterion) {
    c.bench_function("loop_sum_100k", |b| {
        b.iter(|| run_program(black_box(LOOP_SUM), ""))
    });
}

fn bench_fields(c: &mut Criterion) {
    let input = generated_input(10_000);
    c.bench_function("field_sum_10k_lines", |b| {
        b.iter(|| run_program(black_box(FIELD_SUM), &input))
    });
}

fn bench_arrays(c: &mut Criterion) {
    let input = generated_input(10_000);
    c.bench_function("word_count_10k_lines", |b| {
        b.iter(|| run_program(black_box(WORD_COUNT), &input))
    });
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_word_count", |b| {
        b.iter(|| compile(black_box(WORD_COUNT)).expect("compiles"))
    });
}

criterion_group!(
    benches,
    bench_loop,
    bench_fields,
    bench_arrays,
    bench_compile
);
criterion_main!(benches);
