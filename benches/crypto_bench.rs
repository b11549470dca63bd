use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use control_channel::core::legacy::{FieldCipher, LegacyMessage};
use control_channel::utils::crypto::{generate_session_key, Cipher};

#[allow(clippy::unwrap_used)]
fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("aes_cfb");
    let cipher = Cipher::from_session_key(&generate_session_key().unwrap()).unwrap();

    for size in [16usize, 1024, 16 * 1024] {
        let plaintext = vec![0x5a; size];
        let sealed = cipher.encrypt(&plaintext).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encrypt_{size}b"), |b| {
            b.iter(|| cipher.encrypt(&plaintext).unwrap())
        });
        group.bench_function(format!("decrypt_{size}b"), |b| {
            b.iter(|| cipher.decrypt(&sealed).unwrap())
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_legacy_fields(c: &mut Criterion) {
    let key = generate_session_key().unwrap();
    let fields = FieldCipher::new(&key).unwrap();
    let plain = LegacyMessage::msg("client-1", "disk usage 73%");

    c.bench_function("legacy_seal_open", |b| {
        b.iter(|| {
            let mut msg = plain.clone();
            fields.seal(&mut msg).unwrap();
            fields.open(&mut msg).unwrap();
            msg
        })
    });
    c.bench_function("session_key_generation", |b| {
        b.iter(|| generate_session_key().unwrap())
    });
}

criterion_group!(benches, bench_cipher, bench_legacy_fields);
criterion_main!(benches);
