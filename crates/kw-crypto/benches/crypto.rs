use kw_crypto::kdf::{Argon2Variant, KdfParams};
use kw_crypto::{read_blocks, write_blocks, CipherId};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1_000, 10_000, 100_000])]
fn bench_aes_kdf(bencher: divan::Bencher, rounds: u64) {
    let params = KdfParams::Aes {
        rounds,
        seed: [0xABu8; 32],
    };
    bencher.bench(|| params.transform(divan::black_box(&[1u8; 32]), None).unwrap());
}

#[divan::bench(args = [1024, 8192])]
fn bench_argon2id(bencher: divan::Bencher, memory_kib: u32) {
    let params = KdfParams::Argon2 {
        variant: Argon2Variant::Id,
        memory_kib,
        iterations: 1,
        parallelism: 1,
        version: 0x13,
        salt: vec![0xCD; 32],
    };
    bencher.bench(|| params.transform(divan::black_box(&[1u8; 32]), None).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576, 4194304])]
fn bench_write_blocks(bencher: divan::Bencher, size: usize) {
    let base = [0x11u8; 32];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| write_blocks(divan::black_box(&base), divan::black_box(&data)).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576, 4194304])]
fn bench_read_blocks(bencher: divan::Bencher, size: usize) {
    let base = [0x11u8; 32];
    let stream = write_blocks(&base, &make_data(size)).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| read_blocks(divan::black_box(&base), divan::black_box(&stream)).unwrap());
}

#[divan::bench(args = [65536, 1048576])]
fn bench_aes_cbc_encrypt(bencher: divan::Bencher, size: usize) {
    let key = [0x22u8; 32];
    let iv = [0u8; 16];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            CipherId::Aes256Cbc
                .encrypt(&key, &iv, divan::black_box(&data))
                .unwrap()
        });
}

fn main() {
    divan::main();
}
