//! Behavioural tests for staging, propagation and streaming.

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use rusqlite::Connection;
use std::{cell::RefCell, fs, path::PathBuf};
use tempfile::TempDir;
use waystage_core::test_support::sample_rules;
use waystage_core::{Entity, RuleTable, StagingConfig, SyntheticIds};
use waystage_data::{StagingOutcome, StagingReader, StagingWriter, StreamKind, StreamMessage};

mod support;

use support::{gate_way, plain_config, store_path, tagged_nodes};

struct StagingPlan {
    config: StagingConfig,
    rules: RuleTable,
    entities: Vec<Entity>,
}

enum StagingRun {
    Finished(StagingOutcome),
    Interrupted { commits: u64 },
}

#[derive(Default)]
struct StreamObservation {
    entities: usize,
    max_ahead: usize,
    markers: usize,
    entity_after_marker: bool,
}

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

#[fixture]
fn staging_plan() -> RefCell<Option<StagingPlan>> {
    RefCell::new(None)
}

#[fixture]
fn staging_run() -> RefCell<Option<StagingRun>> {
    RefCell::new(None)
}

#[fixture]
fn stream_observation() -> RefCell<Option<StreamObservation>> {
    RefCell::new(None)
}

fn take_plan(plan: &RefCell<Option<StagingPlan>>) -> StagingPlan {
    plan.borrow_mut()
        .take()
        .unwrap_or_else(|| panic!("staging plan must be prepared"))
}

fn outcome<T>(run: &RefCell<Option<StagingRun>>, check: impl FnOnce(&StagingOutcome) -> T) -> T {
    match run.borrow().as_ref() {
        Some(StagingRun::Finished(outcome)) => check(outcome),
        Some(StagingRun::Interrupted { .. }) => panic!("expected a finished run"),
        None => panic!("staging must have run"),
    }
}

#[given("a gate way 100 over nodes 1, 2 and 3 with a border rule setting access=no")]
fn gate_scenario(staging_plan: &RefCell<Option<StagingPlan>>) {
    *staging_plan.borrow_mut() = Some(StagingPlan {
        config: plain_config(1_000),
        rules: sample_rules(),
        entities: gate_way(),
    });
}

#[given("a cap of 1 synthetic node per way")]
fn single_synthetic_cap(staging_plan: &RefCell<Option<StagingPlan>>) {
    let mut guard = staging_plan.borrow_mut();
    let plan = guard
        .as_mut()
        .unwrap_or_else(|| panic!("staging plan must be prepared"));
    plan.config.synthetic = SyntheticIds {
        max_per_way: 1,
        ..SyntheticIds::default()
    };
}

#[given("25 tagged nodes with a batch threshold of 10")]
fn twenty_five_nodes(staging_plan: &RefCell<Option<StagingPlan>>) {
    *staging_plan.borrow_mut() = Some(StagingPlan {
        config: plain_config(10),
        rules: RuleTable::default(),
        entities: tagged_nodes(25),
    });
}

#[given("30 tagged nodes with a batch threshold of 10")]
fn thirty_nodes(staging_plan: &RefCell<Option<StagingPlan>>) {
    *staging_plan.borrow_mut() = Some(StagingPlan {
        config: plain_config(10),
        rules: RuleTable::default(),
        entities: tagged_nodes(30),
    });
}

#[when("the entities are staged")]
fn stage_entities(
    temp_dir: &TempDir,
    staging_plan: &RefCell<Option<StagingPlan>>,
    staging_run: &RefCell<Option<StagingRun>>,
) {
    let plan = take_plan(staging_plan);
    let mut writer = StagingWriter::create(&store_path(temp_dir), plan.config, plan.rules)
        .expect("create writer");
    writer.write_all(plan.entities).expect("stage entities");
    let outcome = writer.finish().expect("finish run");
    *staging_run.borrow_mut() = Some(StagingRun::Finished(outcome));
}

#[when("staging is interrupted before the run finishes")]
fn interrupt_staging(
    temp_dir: &TempDir,
    staging_plan: &RefCell<Option<StagingPlan>>,
    staging_run: &RefCell<Option<StagingRun>>,
) {
    let plan = take_plan(staging_plan);
    let mut writer = StagingWriter::create(&store_path(temp_dir), plan.config, plan.rules)
        .expect("create writer");
    writer.write_all(plan.entities).expect("stage entities");
    let commits = writer.summary().commits;
    drop(writer);
    *staging_run.borrow_mut() = Some(StagingRun::Interrupted { commits });
}

#[when("I drain the node stream through a queue of 4 entities")]
fn drain_node_stream(
    temp_dir: &TempDir,
    stream_observation: &RefCell<Option<StreamObservation>>,
) {
    let reader = StagingReader::open(&store_path(temp_dir)).expect("open reader");
    let mut stream = reader.stream(StreamKind::Node, 4).expect("start stream");
    let mut observation = StreamObservation::default();
    while let Some(message) = stream.next_message() {
        match message {
            StreamMessage::Entity(_) => {
                observation.entity_after_marker |= observation.markers > 0;
                observation.entities += 1;
            }
            StreamMessage::EndOfStream => observation.markers += 1,
            StreamMessage::Failed(err) => panic!("stream failed: {err}"),
        }
        let ahead = stream.produced().saturating_sub(observation.entities);
        observation.max_ahead = observation.max_ahead.max(ahead);
    }
    *stream_observation.borrow_mut() = Some(observation);
}

#[then("nodes 1 and 3 carry access=no through the anchor lookup")]
fn gate_ends_closed(staging_run: &RefCell<Option<StagingRun>>) {
    outcome(staging_run, |outcome| {
        for id in [1, 3] {
            let tags = outcome.index.propagated_tags(id);
            assert_eq!(
                tags.get("access").map(String::as_str),
                Some("no"),
                "node {id} should close access"
            );
        }
    });
}

#[then("node 2 carries no propagated tags")]
fn gate_middle_open(staging_run: &RefCell<Option<StagingRun>>) {
    outcome(staging_run, |outcome| {
        assert!(outcome.index.propagated_tags(2).is_empty());
    });
}

#[then("the run made 3 commits")]
fn three_commits(staging_run: &RefCell<Option<StagingRun>>) {
    let commits = outcome(staging_run, |outcome| outcome.summary.commits);
    assert_eq!(commits, 3);
}

#[then("the interrupted run made 2 commits")]
fn two_commits(staging_run: &RefCell<Option<StagingRun>>) {
    match staging_run.borrow().as_ref() {
        Some(StagingRun::Interrupted { commits }) => assert_eq!(*commits, 2),
        Some(StagingRun::Finished(_)) => panic!("expected an interrupted run"),
        None => panic!("staging must have run"),
    }
}

#[then("the store holds 25 streamable nodes")]
fn twenty_five_streamable(temp_dir: &TempDir) {
    let counts = StagingReader::open(&store_path(temp_dir))
        .and_then(|reader| reader.counts())
        .expect("count staged entities");
    assert_eq!(counts.nodes, 25);
}

#[then("the store holds 20 streamable nodes")]
fn twenty_streamable(temp_dir: &TempDir) {
    let counts = StagingReader::open(&store_path(temp_dir))
        .and_then(|reader| reader.counts())
        .expect("count staged entities");
    assert_eq!(counts.nodes, 20);
}

#[then("no more than 4 entities were queued ahead of the consumer")]
fn queue_bounded(stream_observation: &RefCell<Option<StreamObservation>>) {
    let guard = stream_observation.borrow();
    let observation = guard
        .as_ref()
        .unwrap_or_else(|| panic!("stream must have been drained"));
    assert!(
        observation.max_ahead <= 4,
        "producer ran {} entities ahead",
        observation.max_ahead
    );
    assert_eq!(observation.entities, 30);
}

#[then("the end-of-stream marker arrived once after the last entity")]
fn single_marker(stream_observation: &RefCell<Option<StreamObservation>>) {
    let guard = stream_observation.borrow();
    let observation = guard
        .as_ref()
        .unwrap_or_else(|| panic!("stream must have been drained"));
    assert_eq!(observation.markers, 1);
    assert!(!observation.entity_after_marker);
}

#[then("way 100 keeps nodes 1, 2 and 3")]
fn way_unchanged(temp_dir: &TempDir) {
    let connection =
        Connection::open(store_path(temp_dir).as_std_path()).expect("open SQLite database");
    let mut statement = connection
        .prepare("SELECT node FROM ways WHERE id = 100 ORDER BY ord")
        .expect("prepare select");
    let nodes: Vec<i64> = statement
        .query_map([], |row| row.get(0))
        .expect("query way rows")
        .collect::<Result<_, _>>()
        .expect("collect way rows");
    assert_eq!(nodes, vec![1, 2, 3]);
}

#[then("one synthetic overflow is reported")]
fn overflow_reported(staging_run: &RefCell<Option<StagingRun>>) {
    outcome(staging_run, |outcome| {
        assert_eq!(outcome.summary.synthetic_overflows, 1);
        assert_eq!(outcome.summary.synthetic_nodes, 0);
        assert!(outcome.index.is_empty());
    });
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/features/staging.feature");
    let contents = fs::read_to_string(&feature).unwrap_or_else(|err| {
        panic!("failed to read feature file {feature:?}: {err}");
    });
    let titles: Vec<String> = contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scenario: "))
        .map(str::to_owned)
        .collect();
    let expected = [
        "propagating a gate to the ends of its way",
        "committing the remainder when a run finishes",
        "losing only the open batch when a run is interrupted",
        "bounding the stream queue",
        "abandoning an overflowing way",
    ];
    assert_eq!(titles, expected, "scenario order changed in feature file");
}

#[scenario(path = "tests/features/staging.feature", index = 0)]
fn propagating_gates(
    temp_dir: TempDir,
    staging_plan: RefCell<Option<StagingPlan>>,
    staging_run: RefCell<Option<StagingRun>>,
) {
    let _ = (temp_dir, staging_plan, staging_run);
}

#[scenario(path = "tests/features/staging.feature", index = 1)]
fn committing_the_remainder(
    temp_dir: TempDir,
    staging_plan: RefCell<Option<StagingPlan>>,
    staging_run: RefCell<Option<StagingRun>>,
) {
    let _ = (temp_dir, staging_plan, staging_run);
}

#[scenario(path = "tests/features/staging.feature", index = 2)]
fn losing_the_open_batch(
    temp_dir: TempDir,
    staging_plan: RefCell<Option<StagingPlan>>,
    staging_run: RefCell<Option<StagingRun>>,
) {
    let _ = (temp_dir, staging_plan, staging_run);
}

#[scenario(path = "tests/features/staging.feature", index = 3)]
fn bounding_the_queue(
    temp_dir: TempDir,
    staging_plan: RefCell<Option<StagingPlan>>,
    staging_run: RefCell<Option<StagingRun>>,
    stream_observation: RefCell<Option<StreamObservation>>,
) {
    let _ = (temp_dir, staging_plan, staging_run, stream_observation);
}

#[scenario(path = "tests/features/staging.feature", index = 4)]
fn abandoning_overflowing_ways(
    temp_dir: TempDir,
    staging_plan: RefCell<Option<StagingPlan>>,
    staging_run: RefCell<Option<StagingRun>>,
) {
    let _ = (temp_dir, staging_plan, staging_run);
}
