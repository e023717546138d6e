use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::channel::unbounded;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use volga_windowing::common::test_utils::{
    test_buffer, test_context, test_input_schema, window_rows, WindowRow,
};
use volga_windowing::runtime::collector::ResultCollector;
use volga_windowing::runtime::watermark::WatermarkConfig;
use volga_windowing::{
    AggregationSpec, HandlerStatus, RecordBuffer, TerminationType, WindowOperatorConfig,
    WindowOperatorHandler, WindowPipeline, WindowType,
};

const OUTPUT_ORIGIN: u64 = 1000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_tumbling_sum_through_pipeline() {
    init_tracing();
    let config = WindowOperatorConfig::new(
        WindowType::Tumbling { size_ms: 10_000 },
        "ts",
        vec![AggregationSpec::sum("value", "total")],
    )
    .with_watermark(WatermarkConfig::new(vec![1]));
    let handler = Arc::new(WindowOperatorHandler::new(config, test_input_schema(), OUTPUT_ORIGIN).unwrap());
    let collector = ResultCollector::new();
    let pipeline = WindowPipeline::new(Arc::clone(&handler), test_context(1, &collector)).unwrap();

    let (tx, rx) = unbounded();
    let rows = [
        (0, "a", 1.0),
        (3_000, "a", 2.0),
        (7_000, "a", 3.0),
        (12_000, "a", 4.0),
        (15_000, "a", 5.0),
        (22_000, "a", 6.0),
    ];
    tx.send(test_buffer(1, 1, 20_000, &rows).unwrap()).unwrap();
    drop(tx);
    pipeline.run(rx).unwrap();

    let totals: Vec<_> = window_rows(&collector.sorted_by_sequence(), "total")
        .into_iter()
        .map(|r| (r.start, r.end, r.value))
        .collect();
    assert_eq!(
        totals,
        vec![
            (0, 10_000, Some(6.0)),
            (10_000, 20_000, Some(9.0)),
            // emitted by the end-of-stream flush
            (20_000, 30_000, Some(6.0)),
        ]
    );
    assert_eq!(handler.status(), HandlerStatus::Stopped);
}

#[test]
fn test_two_origins_hold_keyed_window_until_both_pass() {
    init_tracing();
    let config = WindowOperatorConfig::new(
        WindowType::Tumbling { size_ms: 5 },
        "ts",
        vec![AggregationSpec::sum("value", "total")],
    )
    .with_key_fields(&["key"])
    .with_watermark(WatermarkConfig::closed(vec![1, 2]));
    let handler = WindowOperatorHandler::new(config, test_input_schema(), OUTPUT_ORIGIN).unwrap();
    let collector = ResultCollector::new();
    let ctx = test_context(2, &collector);
    handler.setup(&ctx, handler.accumulator_entry_size()).unwrap();
    handler.start(&ctx).unwrap();

    handler
        .process_buffer(0, &test_buffer(1, 1, 5, &[(1, "A", 1.0), (2, "B", 2.0)]).unwrap())
        .unwrap();
    assert_eq!(handler.build_watermark(), 0);

    handler
        .process_buffer(1, &test_buffer(2, 1, 3, &[(3, "A", 10.0)]).unwrap())
        .unwrap();
    assert_eq!(handler.build_watermark(), 3);
    assert!(collector.is_empty());

    handler
        .process_buffer(1, &test_buffer(2, 2, 6, &[(4, "B", 20.0), (6, "A", 100.0)]).unwrap())
        .unwrap();
    assert_eq!(handler.build_watermark(), 5);

    let rows: Vec<_> = window_rows(&collector.results(), "total")
        .into_iter()
        .map(|r| (r.start, r.key.unwrap_or_default(), r.value))
        .collect();
    assert_eq!(
        rows,
        vec![(0, "A".to_string(), Some(11.0)), (0, "B".to_string(), Some(22.0))]
    );

    handler.trigger_all_windows().unwrap();
    handler.stop(TerminationType::Graceful, &ctx).unwrap();
    assert_eq!(collector.len(), 2);
}

#[test]
fn test_collected_slices_are_never_resurrected() {
    let config = WindowOperatorConfig::new(
        WindowType::Tumbling { size_ms: 10 },
        "ts",
        vec![AggregationSpec::count("n")],
    )
    .with_watermark(WatermarkConfig::new(vec![1]));
    let handler = WindowOperatorHandler::new(config, test_input_schema(), OUTPUT_ORIGIN).unwrap();
    let collector = ResultCollector::new();
    let ctx = test_context(1, &collector);
    handler.setup(&ctx, handler.accumulator_entry_size()).unwrap();
    handler.start(&ctx).unwrap();

    handler
        .process_buffer(0, &test_buffer(1, 1, 40, &[(5, "a", 1.0), (45, "a", 1.0)]).unwrap())
        .unwrap();
    let first_index = handler.first_slice_index();
    let live = handler.num_live_slices();
    assert_eq!(live, 1);

    for (seq, ts) in (0..40).enumerate() {
        handler
            .process_buffer(0, &test_buffer(1, seq as u64 + 2, 40, &[(ts, "a", 1.0)]).unwrap())
            .unwrap();
        assert_eq!(handler.num_live_slices(), live);
        assert_eq!(handler.first_slice_index(), first_index);
    }
    assert_eq!(handler.metrics().late_records_dropped, 40);

    handler.trigger_all_windows().unwrap();
    let counts: Vec<_> = window_rows(&collector.sorted_by_sequence(), "n")
        .into_iter()
        .map(|r| (r.start, r.value))
        .collect();
    assert_eq!(counts, vec![(0, Some(1.0)), (40, Some(1.0))]);
}

#[test]
fn test_yaml_configured_pipeline() {
    let yaml = r#"
window:
  type: sliding
  size_ms: 4
  slide_ms: 2
time_field: ts
aggregations:
  - function: max
    input_field: value
    output_field: peak
watermark:
  origin_policy: closed
  input_origins: [7]
"#;
    let config = WindowOperatorConfig::from_yaml(yaml).unwrap();
    let handler = Arc::new(WindowOperatorHandler::new(config, test_input_schema(), OUTPUT_ORIGIN).unwrap());
    let collector = ResultCollector::new();
    let pipeline = WindowPipeline::new(Arc::clone(&handler), test_context(2, &collector)).unwrap();

    let (tx, rx) = unbounded();
    tx.send(test_buffer(7, 1, 0, &[(1, "a", 3.0), (3, "a", 9.0), (5, "a", 4.0)]).unwrap())
        .unwrap();
    drop(tx);
    pipeline.run(rx).unwrap();

    let peaks: Vec<_> = window_rows(&collector.sorted_by_sequence(), "peak")
        .into_iter()
        .map(|r| (r.start, r.end, r.value))
        .collect();
    assert_eq!(
        peaks,
        vec![(0, 4, Some(9.0)), (2, 6, Some(9.0)), (4, 8, Some(4.0))]
    );
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Expected {
    sum: f64,
    count: f64,
    min: f64,
    max: f64,
}

const STRESS_KEYS: [&str; 4] = ["k0", "k1", "k2", "k3"];

/// Buffers of `num_origins` origins, each with strictly advancing event time.
fn stress_input(
    num_origins: u64,
    buffers_per_origin: u64,
    records_per_buffer: u64,
    span_ms: u64,
) -> (Vec<RecordBuffer>, Vec<(u64, &'static str, f64)>) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut buffers = Vec::new();
    let mut all_rows = Vec::new();
    for origin in 0..num_origins {
        for seq in 1..=buffers_per_origin {
            let start = (seq - 1) * span_ms;
            let rows: Vec<(u64, &str, f64)> = (0..records_per_buffer)
                .map(|_| {
                    let ts = start + rng.gen_range(0..span_ms);
                    let key = STRESS_KEYS[rng.gen_range(0..STRESS_KEYS.len())];
                    (ts, key, rng.gen_range(0..100) as f64)
                })
                .collect();
            all_rows.extend(rows.iter().copied());
            buffers.push(test_buffer(origin, seq, seq * span_ms, &rows).unwrap());
        }
    }
    buffers.shuffle(&mut rng);
    (buffers, all_rows)
}

/// Single-threaded reference: every record goes to every window containing it.
fn reference_windows(
    rows: &[(u64, &str, f64)],
    size: u64,
    slide: u64,
) -> BTreeMap<(u64, String), Expected> {
    let mut windows: BTreeMap<(u64, String), Expected> = BTreeMap::new();
    for (ts, key, value) in rows {
        let last = ts / slide;
        let first = (ts + 1).saturating_sub(size).div_ceil(slide);
        for k in first..=last {
            let entry = windows.entry((k * slide, key.to_string())).or_insert(Expected {
                sum: 0.0,
                count: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            });
            entry.sum += value;
            entry.count += 1.0;
            entry.min = entry.min.min(*value);
            entry.max = entry.max.max(*value);
        }
    }
    windows
}

#[test]
fn test_parallel_sliding_windows_match_reference() {
    init_tracing();
    const NUM_THREADS: usize = 8;
    const SIZE_MS: u64 = 10_000;
    const SLIDE_MS: u64 = 2_000;

    let origins: Vec<u64> = (0..NUM_THREADS as u64).collect();
    let config = WindowOperatorConfig::new(
        WindowType::Sliding {
            size_ms: SIZE_MS,
            slide_ms: SLIDE_MS,
        },
        "ts",
        vec![
            AggregationSpec::sum("value", "sum"),
            AggregationSpec::count("count"),
            AggregationSpec::min("value", "min"),
            AggregationSpec::max("value", "max"),
        ],
    )
    .with_key_fields(&["key"])
    .with_watermark(WatermarkConfig::closed(origins));
    let handler = Arc::new(WindowOperatorHandler::new(config, test_input_schema(), OUTPUT_ORIGIN).unwrap());
    let collector = ResultCollector::new();
    let pipeline = WindowPipeline::new(Arc::clone(&handler), test_context(NUM_THREADS, &collector)).unwrap();

    // 8 origins x 100 buffers x 1000 records
    let (buffers, rows) = stress_input(NUM_THREADS as u64, 100, 1_000, 700);
    assert_eq!(rows.len(), 800_000);

    let (tx, rx) = unbounded();
    for buffer in buffers {
        tx.send(buffer).unwrap();
    }
    drop(tx);
    let metrics = pipeline.run(rx).unwrap();
    assert_eq!(metrics.records_processed, 800_000);
    assert_eq!(metrics.late_records_dropped, 0);

    let results = collector.sorted_by_sequence();
    let sequences: Vec<_> = results.iter().map(|r| r.sequence_number()).collect();
    assert_eq!(sequences, (1..=results.len() as u64).collect::<Vec<_>>());
    assert!(results.windows(2).all(|w| w[0].window_start < w[1].window_start));

    let column = |name: &str| -> Vec<WindowRow> { window_rows(&results, name) };
    let (sums, counts, mins, maxs) = (column("sum"), column("count"), column("min"), column("max"));
    let mut actual: BTreeMap<(u64, String), Expected> = BTreeMap::new();
    for (((sum, count), min), max) in sums.iter().zip(&counts).zip(&mins).zip(&maxs) {
        assert_eq!(sum.end, sum.start + SIZE_MS);
        let key = (sum.start, sum.key.clone().unwrap_or_default());
        let previous = actual.insert(
            key,
            Expected {
                sum: sum.value.unwrap_or(f64::NAN),
                count: count.value.unwrap_or(f64::NAN),
                min: min.value.unwrap_or(f64::NAN),
                max: max.value.unwrap_or(f64::NAN),
            },
        );
        assert!(previous.is_none(), "window emitted twice");
    }

    let expected = reference_windows(&rows, SIZE_MS, SLIDE_MS);
    assert_eq!(actual.len(), expected.len());
    assert_eq!(actual, expected);
}

#[test]
fn test_racing_late_writers_keep_output_sequence_contiguous() {
    init_tracing();
    let config = WindowOperatorConfig::new(
        WindowType::Tumbling { size_ms: 10 },
        "ts",
        vec![AggregationSpec::sum("value", "total")],
    )
    .with_watermark(WatermarkConfig::closed(vec![1]));
    let handler = Arc::new(WindowOperatorHandler::new(config, test_input_schema(), OUTPUT_ORIGIN).unwrap());
    let collector = ResultCollector::new();
    let pipeline = WindowPipeline::new(Arc::clone(&handler), test_context(4, &collector)).unwrap();

    // Every buffer writes into the window its predecessor completes.
    let (tx, rx) = unbounded();
    for n in 1..=3000u64 {
        let ts = n.saturating_sub(2) * 10 + 5;
        tx.send(test_buffer(1, n, n * 10, &[(ts, "a", 1.0)]).unwrap()).unwrap();
    }
    drop(tx);
    let metrics = pipeline.run(rx).unwrap();

    let results = collector.sorted_by_sequence();
    assert!(!results.is_empty());
    let sequences: Vec<u64> = results.iter().map(|r| r.sequence_number()).collect();
    let expected: Vec<u64> = (1..=results.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert!(results.windows(2).all(|w| w[0].window_end < w[1].window_end));
    assert!(results.iter().all(|r| r.metadata.watermark == r.window_end));
    assert_eq!(metrics.windows_emitted, results.len() as u64);
}
