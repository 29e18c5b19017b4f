//! Store guarantees under concurrent writers

use std::fs::OpenOptions;
use std::io::Write;
use std::thread;

use chrono::Utc;
use tempfile::TempDir;

use hpcrun::store::REPORT_FILENAME;
use hpcrun::{BuildState, Job, JobState, Store, TestSpec};

fn finished_job(store: &Store, build_id: u64, name: &str) -> Job {
    let mut job = Job::new(&TestSpec::new(name, "local/sh", "true"), build_id, &store.tests_root());
    job.transition(JobState::Submitted).unwrap();
    job.complete(0, Utc::now()).unwrap();
    job
}

#[test]
fn test_concurrent_build_ids_are_a_permutation() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    const INVOCATIONS: u64 = 8;

    let handles: Vec<_> = (0..INVOCATIONS)
        .map(|i| {
            let root = root.clone();
            thread::spawn(move || {
                // Each invocation opens its own handle, like separate processes
                let store = Store::open(&root).unwrap();
                store.begin_build(&format!("run {}", i)).unwrap().build_id
            })
        })
        .collect();

    let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..INVOCATIONS).collect::<Vec<_>>());

    let store = Store::open(&root).unwrap();
    assert_eq!(store.recover_incomplete().unwrap().len(), INVOCATIONS as usize);
}

#[test]
fn test_concurrent_finalize_into_one_build() {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path()).unwrap();
    let build = store.begin_build("run").unwrap();

    let jobs: Vec<Job> = (0..6)
        .map(|i| finished_job(&store, build.build_id, &format!("t{}", i)))
        .collect();

    thread::scope(|scope| {
        for job in &jobs {
            let store = store.clone();
            scope.spawn(move || store.finalize(job).unwrap());
        }
    });

    let build = store.complete_build(build.build_id, BuildState::Complete).unwrap();
    let mut recorded = build.job_ids.clone();
    recorded.sort();
    let mut expected: Vec<_> = jobs.iter().map(|j| j.id).collect();
    expected.sort();
    assert_eq!(recorded, expected);

    let reports = store.reports().unwrap();
    assert_eq!(reports.len(), jobs.len());
    for job in &jobs {
        assert!(reports.contains(job));
        assert!(job.record_path().exists());
    }
}

#[test]
fn test_torn_trailing_line_keeps_prior_records() {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path()).unwrap();
    let build = store.begin_build("run").unwrap();

    let before = finished_job(&store, build.build_id, "before");
    store.finalize(&before).unwrap();

    // A writer died mid-line
    let mut file = OpenOptions::new()
        .append(true)
        .open(temp.path().join(REPORT_FILENAME))
        .unwrap();
    file.write_all(b"{\"id\":\"0b1e").unwrap();
    drop(file);

    assert_eq!(store.reports().unwrap(), vec![before.clone()]);

    let after = finished_job(&store, build.build_id, "after");
    store.finalize(&after).unwrap();
    assert_eq!(store.reports().unwrap(), vec![before, after]);
}

#[test]
fn test_deleted_history_ids_are_never_reused() {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path()).unwrap();

    for _ in 0..3 {
        let build = store.begin_build("run").unwrap();
        store.complete_build(build.build_id, BuildState::Complete).unwrap();
    }
    store.delete_build(2).unwrap();
    store.delete_build(1).unwrap();

    let next = store.begin_build("run").unwrap();
    assert_eq!(next.build_id, 3);
    let ids: Vec<u64> = store
        .list_builds(true)
        .unwrap()
        .iter()
        .map(|b| b.build_id)
        .collect();
    assert_eq!(ids, vec![0, 3]);
}
