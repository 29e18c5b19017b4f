//! End-to-end builds on the local backend

use std::fs;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use hpcrun::backend::SystemRunner;
use hpcrun::evaluate::{PassCriteria, RegexCheck, ReturnCodeMatch, Stream};
use hpcrun::registry::ExecutorOverrides;
use hpcrun::store::{resolve, Filter, ReportQuery, Selection};
use hpcrun::{
    BuildState, ExecutorRegistry, JobState, RunOptions, Runner, Store, TestFile, TestSpec, Verdict,
};

fn local_runner(temp: &TempDir) -> Runner {
    let store = Store::open(temp.path().join("store")).unwrap();
    let registry = ExecutorRegistry::from_value(
        &json!({ "local": { "sh": { "shell": "sh" } } }),
        ExecutorOverrides::default(),
    )
    .unwrap();
    let options = RunOptions {
        command: "hpcrun run tests.toml".to_string(),
        pool_size: 2,
        max_poll_errors: 3,
    };
    Runner::new(store, registry, Arc::new(SystemRunner::default()), options)
}

#[test]
fn test_exit_zero_passes_and_exit_one_fails() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner(&temp);
    let tests = vec![
        TestSpec::new("ok", "local/sh", "echo fine"),
        TestSpec::new("broken", "local/sh", "echo oops >&2; exit 1"),
    ];

    let outcome = runner.run(&tests).unwrap();
    assert_eq!(outcome.jobs.len(), 2);
    assert_eq!(outcome.build.state, BuildState::Complete);
    assert_eq!(outcome.exit_code(), 1);

    let ok = outcome.jobs.iter().find(|j| j.test_name == "ok").unwrap();
    assert_eq!(ok.state, JobState::Completed);
    assert_eq!(ok.verdict, Some(Verdict::Pass));
    assert_eq!(ok.returncode, Some(0));
    assert_eq!(fs::read_to_string(&ok.output_path).unwrap().trim(), "fine");

    let broken = outcome.jobs.iter().find(|j| j.test_name == "broken").unwrap();
    assert_eq!(broken.state, JobState::Completed);
    assert_eq!(broken.verdict, Some(Verdict::Fail));
    assert_eq!(broken.returncode, Some(1));
    assert_eq!(fs::read_to_string(&broken.error_path).unwrap().trim(), "oops");
}

#[test]
fn test_declared_criteria() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner(&temp);

    let mut expected_two = TestSpec::new("two", "local/sh", "exit 2");
    expected_two.status = Some(PassCriteria {
        returncode: Some(ReturnCodeMatch::AnyOf(vec![0, 2])),
        ..Default::default()
    });
    let mut greeting = TestSpec::new("greet", "local/sh", "echo \"$GREETING world\"");
    greeting.env.insert("GREETING".to_string(), "hello".to_string());
    greeting.status = Some(PassCriteria {
        regex: Some(RegexCheck {
            stream: Stream::Stdout,
            exp: "^hello world$".to_string(),
        }),
        ..Default::default()
    });

    let outcome = runner.run(&[expected_two, greeting]).unwrap();
    assert!(outcome.jobs.iter().all(|j| j.verdict == Some(Verdict::Pass)));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.summary.passed, 2);
}

#[test]
fn test_invalid_regex_fails_only_that_test() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner(&temp);

    let mut bad = TestSpec::new("bad", "local/sh", "true");
    bad.status = Some(PassCriteria {
        regex: Some(RegexCheck {
            stream: Stream::Stdout,
            exp: "(".to_string(),
        }),
        ..Default::default()
    });
    let good = TestSpec::new("good", "local/sh", "true");

    let outcome = runner.run(&[bad, good]).unwrap();
    let bad = outcome.jobs.iter().find(|j| j.test_name == "bad").unwrap();
    assert_eq!(bad.verdict, Some(Verdict::Fail));
    assert!(bad.diagnostics.iter().any(|d| d.starts_with("evaluation failed")));

    let good = outcome.jobs.iter().find(|j| j.test_name == "good").unwrap();
    assert_eq!(good.verdict, Some(Verdict::Pass));
}

#[test]
fn test_regex_matches_binary_output() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner(&temp);

    let mut binary = TestSpec::new("binary", "local/sh", "printf '\\377\\376 done\\n'");
    binary.status = Some(PassCriteria {
        regex: Some(RegexCheck {
            stream: Stream::Stdout,
            exp: "done".to_string(),
        }),
        ..Default::default()
    });

    let outcome = runner.run(&[binary]).unwrap();
    let job = &outcome.jobs[0];
    assert_eq!(job.verdict, Some(Verdict::Pass));
    assert!(fs::read_to_string(&job.output_path).is_err());
}

#[test]
fn test_results_are_recorded_and_resolvable() {
    let temp = TempDir::new().unwrap();
    let runner = local_runner(&temp);
    let tests = TestFile::parse(
        r#"
        [[test]]
        name = "hello"
        executor = "local/sh"
        command = "echo hello"
        tags = ["smoke"]
        "#,
    )
    .unwrap()
    .tests;

    let first = runner.run(&tests).unwrap();
    let second = runner.run(&tests).unwrap();
    assert_eq!(first.build.build_id, 0);
    assert_eq!(second.build.build_id, 1);

    let store = runner.store();
    let records = store.reports().unwrap();
    assert_eq!(records.len(), 2);

    // Most recent run wins for a bare name
    let latest = resolve(&records, "hello").unwrap();
    assert_eq!(latest.id, second.jobs[0].id);

    let first_id = first.jobs[0].id;
    assert_eq!(resolve(&records, &first_id.to_string()).unwrap().id, first_id);
    let prefixed = format!("hello/{}", &first_id.to_string()[..8]);
    assert_eq!(resolve(&records, &prefixed).unwrap().id, first_id);

    let builds = store.list_builds(false).unwrap();
    assert_eq!(builds.len(), 2);
    assert_eq!(builds[0].job_ids, vec![first_id]);
    assert!(first.jobs[0].record_path().exists());

    let query = ReportQuery {
        filter: Filter::parse("name=hello,tags=smoke").unwrap(),
        selection: Selection::Latest,
        count: None,
    };
    let selected = hpcrun::store::query::select(&records, &query);
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].id, second.jobs[0].id);

    let log = fs::read_to_string(&second.build.log_path).unwrap();
    assert!(log.contains("hello"));
    assert!(log.contains("COMPLETED PASS"));
}

#[test]
fn test_missing_shell_fails_to_dispatch() {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path()).unwrap();
    let registry = ExecutorRegistry::from_value(
        &json!({ "local": { "ghost": { "shell": "/nonexistent/shell" } } }),
        ExecutorOverrides::default(),
    )
    .unwrap();
    let runner = Runner::new(store, registry, Arc::new(SystemRunner::default()), RunOptions::default());

    let outcome = runner
        .run(&[TestSpec::new("a", "local/ghost", "true")])
        .unwrap();
    let job = &outcome.jobs[0];
    assert_eq!(job.state, JobState::FailedToSubmit);
    assert!(job.diagnostics[0].starts_with("submission failed"));
    assert_eq!(outcome.summary.failed_to_submit, 1);
    assert_eq!(outcome.exit_code(), 1);
}
