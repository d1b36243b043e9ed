use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;

use caplink_core::{Frame, MethodTarget, RpcSession, RpcTarget};

fn bench_target() -> Arc<dyn RpcTarget> {
    let mut target = MethodTarget::new();
    target.method("makeUser", |_| Ok(json!({"id": "u1", "bio": "benchmark"})));
    target.method("getProfile", |args| {
        let id = args
            .as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(json!({"id": id, "bio": "ok"}))
    });
    Arc::new(target)
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    let frames = vec![
        r#"["push",["pipeline",0,["getProfile"],[["pipeline",1,["id"]]]]]"#,
        r#"["pull",1]"#,
        r#"["resolve",1,{"id":"u1","bio":"ok"}]"#,
        r#"["release",-2,3]"#,
    ];

    group.bench_function("parse", |b| {
        b.iter(|| {
            for text in &frames {
                black_box(Frame::parse(text));
            }
        })
    });

    let parsed: Vec<Frame> = frames.iter().map(|t| Frame::parse(t).unwrap()).collect();
    group.bench_function("serialize", |b| {
        b.iter(|| {
            for frame in &parsed {
                black_box(frame.serialize());
            }
        })
    });

    group.finish();
}

fn bench_pipelined_pull(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipelined_pull");

    for chain_len in [1usize, 8, 32].iter() {
        group.bench_with_input(
            BenchmarkId::new("chain", chain_len),
            chain_len,
            |b, &chain_len| {
                b.iter(|| {
                    let session = RpcSession::with_target(bench_target());
                    session.handle_message(r#"["push",["pipeline",0,["makeUser"]]]"#);
                    for i in 0..chain_len {
                        let push = json!([
                            "push",
                            ["pipeline", 0, ["getProfile"], [["pipeline", i + 1, ["id"]]]]
                        ]);
                        session.handle_message(&push.to_string());
                    }
                    let reply = session
                        .handle_message(&format!(r#"["pull",{}]"#, chain_len + 1))
                        .unwrap();
                    black_box(reply)
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_pipelined_pull);
criterion_main!(benches);
