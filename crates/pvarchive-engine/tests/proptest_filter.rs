//! Property-based tests for the per-channel sample filters.
//!
//! Whatever order the server publishes timestamps in, the sink must see a
//! strictly increasing sequence made of exactly the samples that were newer
//! than everything before them, across any number of server restarts.

mod common;

use common::{eventually, pv, TestEngine, WAIT};
use proptest::prelude::*;
use pvarchive_engine::{ChannelState, Sample, SampleValue, Timestamp};

fn run<F: std::future::Future<Output = ()>>(f: F) {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f);
}

/// Timestamps a monotonic filter would let through.
fn expected_forwarded(stamps: &[(i64, u32)]) -> Vec<Timestamp> {
    let mut last: Option<Timestamp> = None;
    let mut out = Vec::new();
    for &(secs, nanos) in stamps {
        let ts = Timestamp::new(secs, nanos);
        if last.map_or(true, |l| ts > l) {
            out.push(ts);
            last = Some(ts);
        }
    }
    out
}

fn any_stamps() -> impl Strategy<Value = Vec<(i64, u32)>> {
    proptest::collection::vec((0i64..40, prop_oneof![Just(0u32), 0u32..3]), 1..40)
}

#[derive(Debug, Clone)]
enum Op {
    Update(i64, u32),
    Restart,
}

fn any_ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        4 => (0i64..40, 0u32..3).prop_map(|(secs, nanos)| Op::Update(secs, nanos)),
        1 => Just(Op::Restart),
    ];
    proptest::collection::vec(op, 1..30)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_forwarded_timestamps_strictly_increase(stamps in any_stamps()) {
        let expected = expected_forwarded(&stamps);
        let total = stamps.len() as u64;
        let forwarded = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let out = forwarded.clone();

        run(async move {
            let engine = TestEngine::new();
            engine.metadata.insert(pv("P"), "DBR_SCALAR_INT", vec![]);
            let sample = |(secs, nanos): (i64, u32)| {
                Sample::new(Timestamp::new(secs, nanos), SampleValue::Int(secs))
            };
            let p = engine.server.create_pv("P", sample(stamps[0])).unwrap();
            engine.registry.add("P").await.unwrap();
            let channel = engine.registry.get("P").unwrap();
            assert!(channel.wait_for_state(ChannelState::Connected, WAIT).await);

            for &stamp in &stamps[1..] {
                engine.server.update(&p, sample(stamp));
            }
            assert!(
                eventually(
                    || {
                        let s = channel.status();
                        s.samples_accepted + s.duplicates_dropped == total
                    },
                    WAIT
                )
                .await
            );
            channel.stop().await;

            let seen: Vec<Timestamp> = engine
                .sink
                .samples(&pv("P"))
                .iter()
                .map(|s| s.timestamp)
                .collect();
            *out.lock().unwrap() = seen;
        });

        let seen = forwarded.lock().unwrap().clone();
        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn test_restarts_neither_duplicate_nor_lose_samples(first in (0i64..40, 0u32..3), ops in any_ops()) {
        let forwarded = std::sync::Arc::new(std::sync::Mutex::new((Vec::new(), Vec::new())));
        let out = forwarded.clone();

        run(async move {
            let engine = TestEngine::new();
            engine.metadata.insert(pv("R"), "DBR_SCALAR_INT", vec![]);
            let sample = |(secs, nanos): (i64, u32)| {
                Sample::new(Timestamp::new(secs, nanos), SampleValue::Int(secs))
            };
            let mut last = sample(first);
            let mut delivered = vec![first];
            let r = engine.server.create_pv("R", last.clone()).unwrap();
            engine.registry.add("R").await.unwrap();
            let channel = engine.registry.get("R").unwrap();
            assert!(channel.wait_for_state(ChannelState::Connected, WAIT).await);

            for op in &ops {
                match *op {
                    Op::Update(secs, nanos) => {
                        last = sample((secs, nanos));
                        delivered.push((secs, nanos));
                        engine.server.update(&r, last.clone());
                    }
                    Op::Restart => {
                        let drops = channel.status().disconnects;
                        engine.server.close_pv(&r);
                        assert!(eventually(|| channel.status().disconnects > drops, WAIT).await);
                        // The restarted server resends the last value it held.
                        engine.server.create_pv("R", last.clone()).unwrap();
                        let ts = last.timestamp;
                        delivered.push((ts.secs, ts.nanos));
                        assert!(channel.wait_for_state(ChannelState::Connected, WAIT).await);
                    }
                }
            }

            let total = delivered.len() as u64;
            assert!(
                eventually(
                    || {
                        let s = channel.status();
                        s.samples_accepted + s.duplicates_dropped == total
                    },
                    WAIT
                )
                .await
            );
            channel.stop().await;
            assert_eq!(channel.status().samples_dropped, 0);

            let seen: Vec<Timestamp> = engine
                .sink
                .samples(&pv("R"))
                .iter()
                .map(|s| s.timestamp)
                .collect();
            *out.lock().unwrap() = (seen, expected_forwarded(&delivered));
        });

        let (seen, expected) = forwarded.lock().unwrap().clone();
        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn test_mismatched_values_never_reach_sink(kinds in proptest::collection::vec(any::<bool>(), 1..30)) {
        let matching = kinds.iter().filter(|k| **k).count();
        let total = kinds.len() as u64;
        let stored = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let out = stored.clone();

        run(async move {
            let engine = TestEngine::new();
            engine.metadata.insert(pv("T"), "DBR_SCALAR_DOUBLE", vec![]);
            let t = engine
                .server
                .create_pv("T", Sample::new(Timestamp::new(0, 0), SampleValue::Double(0.0)))
                .unwrap();
            engine.registry.add("T").await.unwrap();
            let channel = engine.registry.get("T").unwrap();
            assert!(channel.wait_for_state(ChannelState::Connected, WAIT).await);

            for (i, ok) in kinds.iter().enumerate() {
                let value = if *ok {
                    SampleValue::Double(i as f64)
                } else {
                    SampleValue::Str(i.to_string())
                };
                engine.server.update(&t, Sample::new(Timestamp::new(i as i64 + 1, 0), value));
            }
            assert!(
                eventually(
                    || {
                        let s = channel.status();
                        s.samples_accepted + s.type_mismatches == total + 1
                    },
                    WAIT
                )
                .await
            );
            channel.stop().await;
            *out.lock().unwrap() = engine.sink.samples(&pv("T")).len();
        });

        prop_assert_eq!(*stored.lock().unwrap(), matching + 1);
    }
}
