use criterion::{black_box, criterion_group, criterion_main, Criterion};
use line_tlsf::{SystemBacking, Tlsf, LINE_SIZE};

fn tlsf_allocation(c: &mut Criterion) {
    let mut tlsf = Tlsf::new(SystemBacking, 64 * 1024 * 1024, false).unwrap();

    c.bench_function("tlsf_allocation", |b| {
        b.iter(|| {
            let mut pointers = Vec::with_capacity(1024);

            // Allocation test
            for i in 1..1024u64 {
                let ptr = tlsf.allocate(i * 32, LINE_SIZE as u64).unwrap();
                pointers.push(black_box(ptr));
            }

            for ptr in pointers {
                unsafe { tlsf.free(ptr.as_ptr()) };
            }
        })
    });
}

fn tlsf_interleaved(c: &mut Criterion) {
    let mut tlsf = Tlsf::new(SystemBacking, 16 * 1024 * 1024, false).unwrap();

    c.bench_function("tlsf_interleaved", |b| {
        b.iter(|| {
            let mut pointers = Vec::with_capacity(512);
            for i in 0..512u64 {
                pointers.push(tlsf.allocate((i % 37) * 64 + 1, LINE_SIZE as u64).unwrap());
            }
            // Free every other block first so the second pass coalesces on both sides.
            for ptr in pointers.iter().step_by(2) {
                unsafe { tlsf.free(ptr.as_ptr()) };
            }
            for ptr in pointers.iter().skip(1).step_by(2) {
                unsafe { tlsf.free(ptr.as_ptr()) };
            }
        })
    });
}

criterion_group!(benches, tlsf_allocation, tlsf_interleaved);
criterion_main!(benches);
