//! Benchmarks for the hot paths of the runtime: string building through
//! the buffer promotion rule, arithmetic dispatch and tail-call recursion.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io;

use nightscript::{compile, TableHost, VM};

fn run_source(src: &str) {
    let mut vm = VM::with_output(Box::new(io::sink()));
    let chunk = compile(src, &mut vm.heap_mut().strings).expect("benchmark source compiles");
    let mut host = TableHost::new();
    vm.execute(&chunk, &mut host).expect("benchmark source runs");
}

pub fn string_building(c: &mut Criterion) {
    let src = r#"
i = 0
s = ""
while i < 10000 do
  s = s + "ab"
  i = i + 1
end
"#;
    c.bench_function("string_building_10k", |b| {
        b.iter(|| run_source(black_box(src)))
    });
}

pub fn integer_arithmetic(c: &mut Criterion) {
    let src = r#"
i = 0
total = 0
while i < 100000 do
  total = total + i * 2
  i = i + 1
end
"#;
    c.bench_function("integer_arithmetic_100k", |b| {
        b.iter(|| run_source(black_box(src)))
    });
}

pub fn tail_calls(c: &mut Criterion) {
    let src = r#"
function count(n)
  if n == 0 then return "done" end
  return count(n - 1)
end
x = count(20000)
"#;
    c.bench_function("tail_calls_20k", |b| b.iter(|| run_source(black_box(src))));
}

pub fn array_churn(c: &mut Criterion) {
    let src = r#"
xs = {}
i = 0
while i < 5000 do
  add i to xs
  i = i + 1
end
while length of xs > 0 do
  remove xs[-1]
  i = i + 1
end
"#;
    c.bench_function("array_churn_5k", |b| b.iter(|| run_source(black_box(src))));
}

criterion_group!(
    basics,
    string_building,
    integer_arithmetic,
    tail_calls,
    array_churn
);
criterion_main!(basics);
