//! End-to-end conformance checks for a small counter service.
//!
//! The implementation is a mutable store; the model is a plain map. The
//! refinement mapping collects the store into the model's state space, and
//! the runner checks equality (or prophecy-selected candidates) per action.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use refinelab::{
    Action, ActionBinding, ActionKind, Candidate, CandidateSet, Category, Choice,
    ConformanceSuite, FieldKind, FieldSpec, GenConfig, ImplEffect, LocalState, ModelOutcome,
    Outcome, PartitionSpec, Phase, ProphecyChoice, ProphecyValues, RunConfig, Runner,
    registry::ProphecySpec,
};

/// Install the test subscriber once; `RUST_LOG` controls per-iteration
/// runner output when debugging a failing scenario.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The system under test: a counter store with explicit lifecycle, so the
/// suite can track setup/teardown pairing.
#[derive(Debug, Clone)]
struct CounterStore {
    counters: BTreeMap<String, i64>,
    teardowns: Arc<AtomicU64>,
}

type CounterModel = BTreeMap<String, i64>;

fn field_str(state: &LocalState, key: &str) -> String {
    state
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn field_i64(state: &LocalState, key: &str) -> i64 {
    state.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn create_counter_action() -> Action {
    Action::builder("create_counter", ActionKind::Write)
        .field(FieldSpec::new("name", FieldKind::Text { max_len: 8 }))
        .build()
}

fn increment_action() -> Action {
    Action::builder("increment", ActionKind::Write)
        .field(FieldSpec::new("name", FieldKind::Text { max_len: 8 }))
        .field(FieldSpec::new("start", FieldKind::Int { min: -1000, max: 1000 }))
        .build()
}

fn empty_store(teardowns: &Arc<AtomicU64>) -> CounterStore {
    CounterStore {
        counters: BTreeMap::new(),
        teardowns: Arc::clone(teardowns),
    }
}

fn seeded_store(state: &LocalState, teardowns: &Arc<AtomicU64>) -> CounterStore {
    let mut store = empty_store(teardowns);
    store
        .counters
        .insert(field_str(state, "name"), field_i64(state, "start"));
    store
}

fn seeded_model(state: &LocalState) -> CounterModel {
    let mut model = CounterModel::new();
    model.insert(field_str(state, "name"), field_i64(state, "start"));
    model
}

fn create_binding(teardowns: &Arc<AtomicU64>) -> ActionBinding<CounterStore, CounterModel> {
    let teardowns = Arc::clone(teardowns);
    ActionBinding::new(
        move |_state| Ok(empty_store(&teardowns)),
        |_state| Ok(CounterModel::new()),
        |store, state, _prophecy| {
            store.counters.insert(field_str(state, "name"), 0);
            Ok(ImplEffect::Committed)
        },
        |pre, state| {
            let mut post = pre.clone();
            post.insert(field_str(state, "name"), 0);
            ModelOutcome::Deterministic(post)
        },
        |store| {
            store.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
}

fn increment_binding(teardowns: &Arc<AtomicU64>) -> ActionBinding<CounterStore, CounterModel> {
    let teardowns = Arc::clone(teardowns);
    ActionBinding::new(
        move |state| Ok(seeded_store(state, &teardowns)),
        |state| Ok(seeded_model(state)),
        |store, state, _prophecy| {
            *store.counters.entry(field_str(state, "name")).or_insert(0) += 1;
            Ok(ImplEffect::Committed)
        },
        |pre, state| {
            let mut post = pre.clone();
            *post.entry(field_str(state, "name")).or_insert(0) += 1;
            ModelOutcome::Deterministic(post)
        },
        |store| {
            store.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
}

fn counter_suite(teardowns: &Arc<AtomicU64>) -> ConformanceSuite<CounterStore, CounterModel> {
    let mut suite = ConformanceSuite::new();
    suite
        .register(create_counter_action(), create_binding(teardowns))
        .expect("register create_counter");
    suite
        .register(increment_action(), increment_binding(teardowns))
        .expect("register increment");
    for action in ["create_counter", "increment"] {
        suite
            .register_mapping(action, |store: &CounterStore, _prophecy| {
                Ok(store.counters.clone())
            })
            .expect("register mapping");
    }
    suite
}

#[test]
fn counter_suite_passes_and_balances_teardowns() {
    init_tracing();
    let teardowns = Arc::new(AtomicU64::new(0));
    let suite = counter_suite(&teardowns);
    let config = RunConfig::seeded(0xc0ffee).with_num_runs(25);
    let report = Runner::new(&suite, config).run().expect("run");

    let summary = report.summary();
    assert_eq!(summary.passed, 50, "summary: {summary:?}");
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.errored, 0);
    assert_eq!(summary.per_action["create_counter"].passed, 25);
    assert_eq!(summary.per_action["increment"].passed, 25);
    // One teardown per iteration, no leaks.
    assert_eq!(teardowns.load(Ordering::SeqCst), 50);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn forgotten_counter_is_caught_with_a_literal_witness() {
    init_tracing();
    // The buggy store drops the new counter when the name is short, a
    // data-dependent bug the random generator must be able to reach.
    let teardowns = Arc::new(AtomicU64::new(0));
    let mut suite = ConformanceSuite::new();
    let binding = ActionBinding::new(
        {
            let teardowns = Arc::clone(&teardowns);
            move |_state: &LocalState| Ok(empty_store(&teardowns))
        },
        |_state| Ok(CounterModel::new()),
        |store: &mut CounterStore, state: &LocalState, _prophecy| {
            let name = field_str(state, "name");
            if name.len() > 2 {
                store.counters.insert(name, 0);
            }
            Ok(ImplEffect::Committed)
        },
        |pre: &CounterModel, state: &LocalState| {
            let mut post = pre.clone();
            post.insert(field_str(state, "name"), 0);
            ModelOutcome::Deterministic(post)
        },
        |store: &mut CounterStore| {
            store.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    suite
        .register(create_counter_action(), binding)
        .expect("register");
    suite
        .register_mapping("create_counter", |store: &CounterStore, _prophecy| {
            Ok(store.counters.clone())
        })
        .expect("mapping");

    let report = Runner::new(&suite, RunConfig::seeded(99).with_num_runs(60))
        .run()
        .expect("run");
    let summary = report.summary();
    assert!(summary.failed > 0, "bug never triggered: {summary:?}");
    // Teardown ran for passing and failing iterations alike.
    assert_eq!(
        teardowns.load(Ordering::SeqCst),
        summary.passed + summary.failed
    );

    // The witness carries the literal generated input, so the failure is
    // reproducible without the RNG.
    let frame = &report.failing_frames()[0];
    let name = field_str(&frame.local_state, "name");
    assert!(name.len() <= 2, "witness input should trigger the bug");
    let runner = Runner::new(&suite, RunConfig::seeded(0));
    let replayed = runner
        .replay(&frame.action, frame.local_state.clone(), frame.prophecy.clone())
        .expect("replay");
    assert_eq!(replayed.outcome, frame.outcome);
}

fn racy_read_action() -> Action {
    Action::builder("read_after_concurrent_write", ActionKind::Read)
        .field(FieldSpec::new("name", FieldKind::Text { max_len: 8 }))
        .field(FieldSpec::new("start", FieldKind::Int { min: 0, max: 1000 }))
        .choice_point(ProphecySpec::new("commit_visibility", 2))
        .build()
}

/// Read racing a concurrent increment: the model permits the pre-commit
/// and post-commit views; the prophecy decides which one this iteration
/// must produce, and the harness steers a stub accordingly.
fn racy_read_binding(teardowns: &Arc<AtomicU64>) -> ActionBinding<CounterStore, CounterModel> {
    let teardowns = Arc::clone(teardowns);
    ActionBinding::new(
        move |state| Ok(seeded_store(state, &teardowns)),
        |state| Ok(seeded_model(state)),
        |store, state, prophecy| {
            if prophecy.index("commit_visibility") == Some(1) {
                *store.counters.entry(field_str(state, "name")).or_insert(0) += 1;
            }
            Ok(ImplEffect::Skipped)
        },
        |pre, state| {
            let mut post = pre.clone();
            *post.entry(field_str(state, "name")).or_insert(0) += 1;
            ModelOutcome::Nondet(CandidateSet::from_candidates(vec![
                Candidate::tagged(pre.clone(), "pre_commit"),
                Candidate::tagged(post, "post_commit"),
            ]))
        },
        |store| {
            store.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
}

#[test]
fn concurrent_read_passes_down_both_predicted_branches() {
    init_tracing();
    let teardowns = Arc::new(AtomicU64::new(0));
    let mut suite = ConformanceSuite::new();
    suite
        .register(racy_read_action(), racy_read_binding(&teardowns))
        .expect("register");
    suite
        .register_mapping("read_after_concurrent_write", |store: &CounterStore, _| {
            Ok(store.counters.clone())
        })
        .expect("mapping");

    let report = Runner::new(&suite, RunConfig::seeded(5).with_num_runs(50))
        .run()
        .expect("run");
    let summary = report.summary();
    assert_eq!(summary.passed, 50, "summary: {summary:?}");

    // Both branches were exercised across 50 draws.
    let indices: Vec<usize> = report
        .frames()
        .iter()
        .filter_map(|f| f.prophecy.index("commit_visibility"))
        .collect();
    assert!(indices.contains(&0));
    assert!(indices.contains(&1));
}

#[test]
fn prophecy_index_beyond_candidates_is_an_infrastructure_error() {
    init_tracing();
    let teardowns = Arc::new(AtomicU64::new(0));
    let mut suite = ConformanceSuite::new();
    suite
        .register(racy_read_action(), racy_read_binding(&teardowns))
        .expect("register");
    suite
        .register_mapping("read_after_concurrent_write", |store: &CounterStore, _| {
            Ok(store.counters.clone())
        })
        .expect("mapping");
    let runner = Runner::new(&suite, RunConfig::seeded(5));

    let mut entries = BTreeMap::new();
    entries.insert("name".to_string(), json!("c"));
    entries.insert("start".to_string(), json!(10));
    let allowed = ["name".to_string(), "start".to_string()].into_iter().collect();
    let state = LocalState::scoped(&allowed, entries).expect("in scope");
    let mut prophecy = ProphecyValues::none();
    prophecy.set("commit_visibility", ProphecyChoice::Index(2));

    let frame = runner
        .replay("read_after_concurrent_write", state, prophecy)
        .expect("replay");
    let Outcome::Errored { phase, detail } = &frame.outcome else {
        panic!("expected errored frame, got {:?}", frame.outcome);
    };
    assert_eq!(*phase, Phase::Asserted);
    assert!(detail.contains("index 2"), "detail: {detail}");
    // The iteration still released its store.
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn two_by_two_partition_emits_exactly_four_frames() {
    init_tracing();
    let teardowns = Arc::new(AtomicU64::new(0));
    let action = Action::builder("schedule_compaction", ActionKind::Write)
        .touches("window_days")
        .touches("cadence")
        .build();
    let binding: ActionBinding<CounterStore, CounterModel> = ActionBinding::new(
        {
            let teardowns = Arc::clone(&teardowns);
            move |_state: &LocalState| Ok(empty_store(&teardowns))
        },
        |_state| Ok(CounterModel::new()),
        |store: &mut CounterStore, state: &LocalState, _prophecy| {
            store
                .counters
                .insert("window_days".to_string(), field_i64(state, "window_days"));
            Ok(ImplEffect::Committed)
        },
        |pre: &CounterModel, state: &LocalState| {
            let mut post = pre.clone();
            post.insert("window_days".to_string(), field_i64(state, "window_days"));
            ModelOutcome::Deterministic(post)
        },
        |_store: &mut CounterStore| Ok(()),
    );

    let spec = PartitionSpec::new()
        .category(Category::new(
            "window",
            vec![
                Choice::new("short", |s| s.set("window_days", json!(7))),
                Choice::new("long", |s| s.set("window_days", json!(365))),
            ],
        ))
        .category(Category::new(
            "cadence",
            vec![
                Choice::new("weekly", |s| s.set("cadence", json!("weekly"))),
                Choice::new("monthly", |s| s.set("cadence", json!("monthly"))),
            ],
        ));

    let mut suite = ConformanceSuite::new();
    suite
        .register_with(action, binding, GenConfig::category_partition(spec))
        .expect("register");
    suite
        .register_mapping("schedule_compaction", |store: &CounterStore, _| {
            Ok(store.counters.clone())
        })
        .expect("mapping");

    // num_runs applies to random actions only; the partition fixes the count.
    let report = Runner::new(&suite, RunConfig::seeded(1).with_num_runs(100))
        .run()
        .expect("run");
    let frames = report.frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(report.summary().passed, 4);

    let labels: Vec<_> = frames
        .iter()
        .map(|f| f.combo_labels.clone().expect("partition labels"))
        .collect();
    for (i, a) in labels.iter().enumerate() {
        for b in &labels[..i] {
            assert_ne!(a, b, "duplicate combination");
        }
    }
}

#[test]
fn failing_report_renders_witness_in_text_and_json() {
    init_tracing();
    let mut suite = ConformanceSuite::new();
    let binding: ActionBinding<CounterStore, CounterModel> = ActionBinding::new(
        |state: &LocalState| Ok(seeded_store(state, &Arc::new(AtomicU64::new(0)))),
        |state| Ok(seeded_model(state)),
        |_store: &mut CounterStore, _state, _prophecy| Ok(ImplEffect::Committed),
        |pre: &CounterModel, state: &LocalState| {
            let mut post = pre.clone();
            *post.entry(field_str(state, "name")).or_insert(0) += 1;
            ModelOutcome::Deterministic(post)
        },
        |_store: &mut CounterStore| Ok(()),
    );
    suite.register(increment_action(), binding).expect("register");
    suite
        .register_mapping("increment", |store: &CounterStore, _| {
            Ok(store.counters.clone())
        })
        .expect("mapping");

    let report = Runner::new(&suite, RunConfig::seeded(3).with_num_runs(2))
        .run()
        .expect("run");
    assert_eq!(report.exit_code(), 1);

    let text = report.to_text();
    assert!(text.contains("FAIL"), "text:\n{text}");
    assert!(text.contains("increment"));
    // Literal witness values are embedded, not summarized.
    let frame = &report.failing_frames()[0];
    let name = field_str(&frame.local_state, "name");
    assert!(text.contains(&name));

    let rendered = report.to_json();
    assert_eq!(rendered["summary"]["failed"], json!(2));
    assert_eq!(
        rendered["failures"][0]["action"],
        json!("increment")
    );
}
