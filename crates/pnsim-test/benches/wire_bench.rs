//! Benchmarks for the PNSim wire formats

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pnsim_core::{Token, Topic};
use pnsim_wire::{decode_tokens, encode_tokens, ControlMessage, PortRequest};

fn sample_tokens() -> Vec<Token> {
    vec![
        Token::from(42),
        Token::from(21.5),
        Token::from("dining room, east"),
        Token::from(true),
        Token::tuple([Token::from("x"), Token::from(false), Token::from(3)]),
    ]
}

fn bench_encode_tokens(c: &mut Criterion) {
    let tokens = sample_tokens();

    c.bench_function("wire_encode_tokens", |b| {
        b.iter(|| black_box(encode_tokens(black_box(&tokens))))
    });
}

fn bench_decode_tokens(c: &mut Criterion) {
    let payload = encode_tokens(&sample_tokens());

    c.bench_function("wire_decode_tokens", |b| {
        b.iter(|| black_box(decode_tokens(black_box(&payload)).unwrap()))
    });
}

fn bench_parse_control(c: &mut Criterion) {
    let request = PortRequest::set_output(
        Topic::new("heater", "Q out"),
        &Topic::new("room", "Q gain"),
    );
    let ack = ControlMessage::ack(&request).to_string();
    let update = "U, update_nets, sim-1, heater&room&weather";

    c.bench_function("wire_parse_ack", |b| {
        b.iter(|| black_box(ControlMessage::parse(black_box(&ack)).unwrap()))
    });
    c.bench_function("wire_parse_update", |b| {
        b.iter(|| black_box(ControlMessage::parse(black_box(update)).unwrap()))
    });
}

criterion_group!(benches, bench_encode_tokens, bench_decode_tokens, bench_parse_control);
criterion_main!(benches);
