//! Benchmarks for the hot byte-level paths: physical key construction, the
//! store comparator, and wire message round trips.

use criterion::{black_box, criterion_group, Criterion};

use geokv::datalayer::{data_key, lock_key};
use geokv::storage::compare_keys;
use geokv::wire::{Message, ReturnCode};

fn bench_data_key(c: &mut Criterion) {
    let table = b"accounts".as_slice();
    let key = b"customer/0000012345".as_slice();
    c.bench_function("data_key", |b| {
        b.iter(|| data_key(black_box(table), black_box(key), black_box(123_456_789)))
    });
    c.bench_function("lock_key", |b| {
        b.iter(|| lock_key(black_box(table), black_box(key)))
    });
}

fn bench_comparator(c: &mut Criterion) {
    let a = data_key(b"accounts", b"customer/0000012345", 100);
    let b_key = data_key(b"accounts", b"customer/0000012345", 200);
    let lock = lock_key(b"accounts", b"customer/0000012345");
    c.bench_function("compare_keys/versions", |b| {
        b.iter(|| compare_keys(black_box(&a), black_box(&b_key)))
    });
    c.bench_function("compare_keys/lock_vs_data", |b| {
        b.iter(|| compare_keys(black_box(&lock), black_box(&a)))
    });
}

fn bench_wire_round_trip(c: &mut Criterion) {
    let msg = Message::KvsRepRdResp {
        state_key: 77,
        rc: ReturnCode::Success,
        timestamp: 123_456_789,
        value: vec![0xab; 128],
    };
    c.bench_function("wire/encode", |b| b.iter(|| black_box(&msg).encode()));
    let encoded = msg.encode();
    c.bench_function("wire/decode", |b| {
        b.iter(|| Message::decode(black_box(&encoded)).unwrap())
    });
}

criterion_group!(benches, bench_data_key, bench_comparator, bench_wire_round_trip);
