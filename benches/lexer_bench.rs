use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use eazy::{parse_str, tokenize};

// A reasonably complex program touching most of the token set
const BENCH_SNIPPET: &str = r#"
--- Calculate the nth Fibonacci number ---
var fib = Function {
    0 => 0,
    1 => 1,
    n if n > 1 => fib(n - 1) + fib(n - 2),
}

-- Squares of the even numbers below a bound
var squares = Function { bound ->
    for x in 0..bound if x / 2 == 1 do { x ^ 2 }
}

var Point = Class { x, y ->
    var norm = Function { (x * x + y * y) ^ 0.5 }
}

var numbers = Generator { n ->
    var i = 0
    while i < n do { yield i; i = i + 1 }
}

# Some calls
fib(10); squares(20)
var p = Point(3, 4)
match p.norm() with { 5 => "five", else => "other" }
var profile = Map [ name: "string with \"escapes\"\n", 'raw': 'kept\n', [1 + 1]: 0x2A ]
try { throw profile.name } catch { e => e + """long""" } finally { Nothing }
var List [first, ...rest] = List [ 1_000, 2.5e-3, .5, 0b1010, True, False ]
first is not Nothing and not (2 in rest) or 3 not in rest
"#;

fn bench_input() -> String {
    BENCH_SNIPPET.repeat(4)
}

fn bench_front_end(c: &mut Criterion) {
    let input = bench_input();
    let mut group = c.benchmark_group("Front End");

    group.bench_with_input(
        BenchmarkId::new("tokenize", "complex_input"),
        input.as_str(),
        |b, input| b.iter(|| tokenize(black_box(input))),
    );

    group.bench_with_input(
        BenchmarkId::new("parse_str", "complex_input"),
        input.as_str(),
        |b, input| b.iter(|| parse_str(black_box(input))),
    );

    group.finish();
}

criterion_group!(benches, bench_front_end);
criterion_main!(benches);
