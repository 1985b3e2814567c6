use criterion::{criterion_group, criterion_main, Criterion};
use lpt_core::Lpt;
use lpt_flash::RamLebDevice;
use lpt_ondisk::{codec, GeometryInput, LptGeometry, RawLtabEntry};
use lpt_types::{Lnum, LptLayout, NodeAddr};
use std::sync::Arc;

fn mount() -> Lpt {
    let geom = LptGeometry::calculate(&GeometryInput {
        leb_size: 128 * 1024,
        min_io_size: 2048,
        leb_cnt: 1024,
        max_leb_cnt: 1024,
        main_lebs: 1000,
        lpt_lebs: 4,
        lsave_cnt: 0,
        big_lpt: false,
    })
    .unwrap();
    let dev = RamLebDevice::new(geom.leb_size, 1024);
    let entries = vec![RawLtabEntry::default(); geom.lpt_lebs as usize];
    dev.leb_write(Lnum(2), 0, &codec::pack_ltab(&geom, &entries))
        .unwrap();
    let layout = LptLayout {
        lpt_first: Lnum(2),
        lpt_lebs: 4,
        root: NodeAddr::new(0, 0),
        ltab: NodeAddr::new(2, 0),
        lsave: None,
        main_first: Lnum(24),
        leb_cnt: 1024,
    };
    Lpt::init(Arc::new(dev), geom, layout, geom.min_io_size, true).unwrap()
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lpt_lookup");

    group.bench_function("cold_tree_1000_lebs", |b| {
        b.iter_batched(
            mount,
            |mut lpt| {
                for lnum in 24..1024 {
                    criterion::black_box(lpt.lookup(Lnum(lnum)).unwrap());
                }
                lpt
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.bench_function("warm_point_lookup", |b| {
        let mut lpt = mount();
        for lnum in 24..1024 {
            lpt.lookup(Lnum(lnum)).unwrap();
        }
        b.iter(|| *criterion::black_box(lpt.lookup(Lnum(500)).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
