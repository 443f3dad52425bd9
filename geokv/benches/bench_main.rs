use criterion::criterion_main;

mod encoding_benchmarks;

criterion_main! {
    encoding_benchmarks::benches,
}
