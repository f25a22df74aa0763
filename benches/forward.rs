use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use vit_trainer_rs::augment::{cutmix, mixup};
use vit_trainer_rs::{VisionTransformer, VitConfig};

fn small_config() -> VitConfig {
    VitConfig {
        embedding_dim: 32,
        num_heads: 4,
        num_layers: 2,
        mlp_dim: 64,
        ..VitConfig::test()
    }
}

fn bench_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let model = VisionTransformer::new(&small_config(), &device).unwrap();

    let mut group = c.benchmark_group("vit_forward");
    group.sample_size(10);
    for batch in [1usize, 4] {
        let images = Tensor::randn(0f32, 1.0, (batch, 3, 224, 224), &device).unwrap();
        group.bench_with_input(format!("batch_{}", batch), &images, |b, images| {
            b.iter(|| {
                let logits = black_box(model.forward(images).unwrap());
                black_box(logits);
            });
        });
    }
    group.finish();
}

fn bench_mix(c: &mut Criterion) {
    let device = Device::Cpu;
    let images = Tensor::randn(0f32, 1.0, (8, 3, 224, 224), &device).unwrap();
    let targets = Tensor::new(&[0u32, 1, 2, 3, 4, 5, 6, 7], &device).unwrap();

    c.bench_function("mixup_batch_8", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        b.iter(|| black_box(mixup(&images, &targets, 0.4, &mut rng).unwrap()));
    });
    c.bench_function("cutmix_batch_8", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        b.iter(|| black_box(cutmix(&images, &targets, 0.4, &mut rng).unwrap()));
    });
}

criterion_group!(benches, bench_forward, bench_mix);
criterion_main!(benches);
