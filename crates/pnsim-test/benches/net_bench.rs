//! Benchmarks for net execution

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use pnsim_core::{PetriNet, Token};
use pnsim_test::nets;

fn prepared(mut net: PetriNet) -> PetriNet {
    net.prepare().unwrap();
    net
}

fn bench_thermostat_run(c: &mut Criterion) {
    let template = prepared(nets::thermostat("boiler", 20.0, 0.5).unwrap());
    let readings: Vec<Token> = (0..100).map(|i| Token::from(15.0 + f64::from(i) * 0.1)).collect();
    let mut rng = StdRng::seed_from_u64(1);

    c.bench_function("net_run_thermostat_100", |b| {
        b.iter_batched(
            || {
                let mut net = template.clone();
                net.deposit("Readings", readings.clone()).unwrap();
                net
            },
            |mut net| black_box(net.run(&mut rng, &|| false).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_probabilistic_run(c: &mut Criterion) {
    let template = prepared(
        nets::weather_generator("weather", Duration::from_secs(1), 5.0, 15.0).unwrap(),
    );
    let raw: Vec<Token> = (0..100).map(|i| Token::from(f64::from(i) * 0.1)).collect();
    let mut rng = StdRng::seed_from_u64(2);

    c.bench_function("net_run_weather_100", |b| {
        b.iter_batched(
            || {
                let mut net = template.clone();
                net.deposit("Temperature_raw", raw.clone()).unwrap();
                net
            },
            |mut net| black_box(net.run(&mut rng, &|| false).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_prepare(c: &mut Criterion) {
    let net = nets::weather_generator("weather", Duration::from_secs(1), 5.0, 15.0).unwrap();

    c.bench_function("net_prepare_weather", |b| {
        b.iter(|| {
            let mut net = net.clone();
            net.prepare().unwrap();
            black_box(net.firing_order().len())
        })
    });
}

criterion_group!(benches, bench_thermostat_run, bench_probabilistic_run, bench_prepare);
criterion_main!(benches);
