//! Read-counting pipeline scenarios driven through the public library API:
//! attribution, window semantics, concurrency, and log output format.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use proptest::prelude::*;
use rand::Rng;
use regex::Regex;

use irondome::core::paths::{PathKind, WatchSet, WatchedPath};
use irondome::daemon::signals::ShutdownSignal;
use irondome::logger::dual::{ActivityEvent, DualLoggerConfig, spawn_logger};
use irondome::logger::record::Level;
use irondome::logger::rotating::RotatingFileConfig;
use irondome::monitor::aggregator::ReadRateAggregator;
use irondome::monitor::evaluator::{Alert, ThresholdEvaluator};
use irondome::monitor::events::{FsEvent, FsEventKind};
use irondome::platform::pal::MockPlatform;

fn dir(path: &str) -> WatchedPath {
    WatchedPath {
        path: PathBuf::from(path),
        kind: PathKind::Directory,
    }
}

fn file(path: &str) -> WatchedPath {
    WatchedPath {
        path: PathBuf::from(path),
        kind: PathKind::File,
    }
}

fn aggregator(roots: Vec<WatchedPath>) -> ReadRateAggregator {
    ReadRateAggregator::new(WatchSet::from_roots(roots), Arc::new(MockPlatform::new()))
}

fn open(path: &str) -> FsEvent {
    FsEvent::new(path, FsEventKind::Opened)
}

// ════════════════════════════════════════════════════════════════
// WINDOW SEMANTICS
// ════════════════════════════════════════════════════════════════

#[test]
fn seven_reads_alert_once_then_quiet_window_does_not() {
    let agg = aggregator(vec![dir("/tmp")]);
    let evaluator = ThresholdEvaluator::new(5, Duration::from_secs(1));
    let (tx, rx) = unbounded::<Alert>();

    for _ in 0..7 {
        agg.record(&open("/tmp/loot.db"));
    }
    assert_eq!(evaluator.tick(&agg, &tx), 1);
    let alert = rx.try_recv().expect("alert for first window");
    assert_eq!(alert.path, PathBuf::from("/tmp"));
    assert_eq!(alert.observed, 7);
    assert_eq!(alert.limit, 5);

    for _ in 0..3 {
        agg.record(&open("/tmp/loot.db"));
    }
    assert_eq!(evaluator.tick(&agg, &tx), 0);
    assert!(rx.try_recv().is_err());
}

#[test]
fn exactly_at_limit_does_not_alert() {
    let agg = aggregator(vec![dir("/srv")]);
    let evaluator = ThresholdEvaluator::new(5, Duration::from_secs(1));
    let (tx, rx) = unbounded::<Alert>();
    for _ in 0..5 {
        agg.record(&open("/srv/a"));
    }
    evaluator.tick(&agg, &tx);
    assert!(rx.try_recv().is_err());
}

#[test]
fn sustained_abuse_alerts_every_window() {
    let agg = aggregator(vec![dir("/srv")]);
    let evaluator = ThresholdEvaluator::new(2, Duration::from_secs(1));
    let (tx, rx) = unbounded::<Alert>();
    for _ in 0..4 {
        for _ in 0..3 {
            agg.record(&open("/srv/a"));
        }
        evaluator.tick(&agg, &tx);
    }
    assert_eq!(rx.try_iter().count(), 4);
    assert_eq!(evaluator.alerts_emitted(), 4);
}

#[test]
fn evaluator_loop_driven_by_manual_ticks() {
    let agg = Arc::new(aggregator(vec![dir("/data")]));
    let evaluator = Arc::new(ThresholdEvaluator::new(1, Duration::from_millis(250)));
    let shutdown = ShutdownSignal::new();
    let (tick_tx, tick_rx) = unbounded::<Instant>();
    let (alert_tx, alert_rx) = unbounded::<Alert>();

    let handle = {
        let agg = Arc::clone(&agg);
        let evaluator = Arc::clone(&evaluator);
        let shutdown = shutdown.clone();
        thread::spawn(move || evaluator.run(&agg, &tick_rx, &shutdown, &alert_tx))
    };

    agg.record(&open("/data/x"));
    agg.record(&open("/data/y"));
    tick_tx.send(Instant::now()).expect("tick");
    let alert = alert_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("alert after tick");
    assert_eq!(alert.observed, 2);
    assert_eq!(
        alert.to_string(),
        "Possible disk read abuse detected at /data with 2 reads in the last 0.25 second(s)."
    );

    shutdown.trigger("test");
    handle.join().expect("evaluator joins");
}

// ════════════════════════════════════════════════════════════════
// ATTRIBUTION
// ════════════════════════════════════════════════════════════════

#[test]
fn nested_roots_never_double_count() {
    let agg = aggregator(vec![dir("/srv"), dir("/srv/vault"), dir("/srv/vault/keys")]);
    agg.record(&open("/srv/index.html"));
    agg.record(&open("/srv/vault/ledger"));
    agg.record(&open("/srv/vault/keys/id_ed25519"));
    agg.record(&open("/srv/vault/keys/id_ed25519"));

    let snapshot = agg.snapshot_and_reset();
    assert_eq!(snapshot[&PathBuf::from("/srv")], 1);
    assert_eq!(snapshot[&PathBuf::from("/srv/vault")], 1);
    assert_eq!(snapshot[&PathBuf::from("/srv/vault/keys")], 2);
    assert_eq!(snapshot.values().sum::<u64>(), 4);
}

#[test]
fn file_root_ignores_siblings() {
    let agg = aggregator(vec![file("/etc/shadow")]);
    agg.record(&open("/etc/shadow"));
    agg.record(&open("/etc/passwd"));
    agg.record(&open("/etc/shadow-"));

    let snapshot = agg.snapshot_and_reset();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[&PathBuf::from("/etc/shadow")], 1);
    assert_eq!(agg.totals().unattributed, 2);
}

#[test]
fn prefix_match_is_component_wise() {
    let agg = aggregator(vec![dir("/data")]);
    agg.record(&open("/database/table"));
    assert_eq!(agg.snapshot_and_reset()[&PathBuf::from("/data")], 0);
}

// ════════════════════════════════════════════════════════════════
// COUNTING INVARIANTS
// ════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn snapshot_sums_match_counted_opens(
        picks in proptest::collection::vec((0usize..4, any::<bool>()), 0..200),
        cut in 0usize..200,
    ) {
        let targets = ["/a/x", "/a/b/y", "/c/z", "/elsewhere/w"];
        let agg = aggregator(vec![dir("/a"), dir("/a/b"), dir("/c")]);

        let mut expected: BTreeMap<PathBuf, u64> = BTreeMap::new();
        let mut total: u64 = 0;
        for (i, (target, is_open)) in picks.iter().enumerate() {
            if i == cut {
                for (path, count) in agg.snapshot_and_reset() {
                    *expected.entry(path).or_default() += count;
                }
            }
            let kind = if *is_open { FsEventKind::Opened } else { FsEventKind::Modified };
            agg.record(&FsEvent::new(targets[*target], kind));
            if *is_open && *target != 3 {
                total += 1;
            }
        }
        for (path, count) in agg.snapshot_and_reset() {
            *expected.entry(path).or_default() += count;
        }

        prop_assert_eq!(expected.values().sum::<u64>(), total);
        prop_assert_eq!(agg.totals().reads_counted, total);
        prop_assert_eq!(agg.totals().events_seen, picks.len() as u64);
    }
}

#[test]
fn concurrent_record_and_snapshot_lose_nothing() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 5_000;

    let agg = Arc::new(aggregator(vec![dir("/p"), dir("/q"), dir("/q/r")]));
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let agg = Arc::clone(&agg);
            thread::spawn(move || {
                let mut rng = rand::rng();
                let targets = ["/p/1", "/q/2", "/q/r/3"];
                for _ in 0..PER_WRITER {
                    agg.record(&open(targets[rng.random_range(0..targets.len())]));
                    if rng.random_bool(0.01) {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let collector = {
        let agg = Arc::clone(&agg);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut seen: u64 = 0;
            while !done.load(Ordering::Acquire) {
                seen += agg.snapshot_and_reset().values().sum::<u64>();
                thread::sleep(Duration::from_micros(200));
            }
            seen
        })
    };

    for writer in writers {
        writer.join().expect("writer joins");
    }
    done.store(true, Ordering::Release);
    let mut seen = collector.join().expect("collector joins");
    seen += agg.snapshot_and_reset().values().sum::<u64>();

    assert_eq!(seen, (WRITERS * PER_WRITER) as u64);
    assert_eq!(agg.totals().reads_counted, seen);
}

// ════════════════════════════════════════════════════════════════
// LOG FORMAT
// ════════════════════════════════════════════════════════════════

#[test]
fn log_lines_follow_documented_format() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let log_path = tmp.path().join("irondome.log");
    let (logger, join) = spawn_logger(DualLoggerConfig {
        file: RotatingFileConfig {
            path: log_path.clone(),
            ..RotatingFileConfig::default()
        },
        console: false,
        color: false,
        min_level: Level::Debug,
        channel_capacity: 64,
    })
    .expect("spawn logger");

    logger.send(ActivityEvent::ReadMonitorRunning);
    logger.send(ActivityEvent::ReadObserved {
        path: PathBuf::from("/tmp/a"),
        user: "alice".to_string(),
    });
    logger.send(ActivityEvent::ReadAbuse(Alert {
        path: PathBuf::from("/tmp"),
        observed: 9,
        limit: 5,
        window: Duration::from_secs(1),
    }));
    logger.send(ActivityEvent::MemoryUsage {
        rss_bytes: 12 * 1024 * 1024,
    });
    logger.send(ActivityEvent::ShutdownRequested {
        source: "SIGTERM".to_string(),
    });
    logger.shutdown();
    join.join().expect("logger joins");

    let line_re = Regex::new(
        r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} \| irondome\.[a-z]+ \| (DEBUG|INFO|WARNING|ERROR|CRITICAL) \| \S.*$",
    )
    .expect("regex");
    let content = fs::read_to_string(&log_path).expect("log written");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 5, "log: {content}");
    for line in &lines {
        assert!(line_re.is_match(line), "bad line: {line}");
    }
    assert!(lines[0].ends_with("| irondome.disk | INFO | Running read monitor..."));
    assert!(lines[1].ends_with("| DEBUG | Read operation detected on /tmp/a by alice"));
    assert!(lines[2].contains("| WARNING | Possible disk read abuse detected at /tmp"));
    assert!(lines[3].ends_with("| irondome.memory | DEBUG | Memory usage: 12.00 MB"));
    assert!(lines[4].contains("Received shutdown signal. Stopping..."));
}
