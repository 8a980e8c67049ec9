//! File-backed persistence: reload, schema evolution, corruption and
//! process ownership.

use overlord_state::{LaneId, State, StateError, Status, TaskSet};
use std::fs;
use std::path::Path;

fn open(path: &Path) -> State {
    State::open(path).unwrap()
}

#[test]
fn missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let state = open(&dir.path().join("state.json"));
    let st = state.lock();
    assert_eq!(st.changes().count(), 0);
    assert_eq!(st.last_task_id(), 0);
}

#[test]
fn reload_preserves_graph_and_in_progress_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let (chg, prepare, link, lane) = {
        let state = open(&path);
        let mut st = state.lock();
        let chg = st.new_change("install-snap", "Install \"hello\"");
        let prepare = st.new_task(chg, "prepare-snap", "Prepare").unwrap();
        let link = st.new_task(chg, "link-snap", "Link").unwrap();
        st.wait_for(link, prepare).unwrap();
        let lane = st.new_lane();
        TaskSet::new([prepare, link]).join_lane(&mut st, lane).unwrap();
        st.task_mut(prepare).unwrap().set("snap-name", &"hello").unwrap();
        st.set_status(prepare, Status::Doing).unwrap();
        st.unlock().unwrap();
        (chg, prepare, link, lane)
    };

    let state = open(&path);
    let st = state.lock();
    assert_eq!(st.change_status(chg), Some(Status::Doing));
    let t = st.task(prepare).unwrap();
    assert_eq!(t.status(), Status::Doing, "in-progress status survives restart");
    assert_eq!(t.get::<String>("snap-name").unwrap(), "hello");
    assert_eq!(t.lanes(), &[lane]);
    assert_eq!(st.task(link).unwrap().wait_tasks(), &[prepare]);
    assert_eq!(st.last_lane_id(), lane.get());
}

#[test]
fn ids_are_not_recycled_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let first = {
        let state = open(&path);
        let mut st = state.lock();
        let chg = st.new_change("remove-snap", "Remove");
        let t = st.new_task(chg, "unlink-snap", "Unlink").unwrap();
        st.remove_change(chg);
        t
    };

    let state = open(&path);
    let mut st = state.lock();
    let chg = st.new_change("remove-snap", "Remove");
    let second = st.new_task(chg, "unlink-snap", "Unlink").unwrap();
    assert!(second > first);
}

#[test]
fn legacy_file_without_checksum_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(
        &path,
        r#"{
            "changes": {"1": {"id": 1, "kind": "install-snap", "summary": "Install",
                              "task_ids": [1], "spawn_time": "2024-01-01T00:00:00Z"}},
            "tasks": {"1": {"id": 1, "kind": "prepare-snap", "summary": "Prepare",
                            "status": "Do", "change": 1,
                            "spawn_time": "2024-01-01T00:00:00Z"}}
        }"#,
    )
    .unwrap();

    let state = open(&path);
    let mut st = state.lock();
    // counters were absent and must have been repaired from stored ids
    assert_eq!(st.last_task_id(), 1);
    assert_eq!(st.last_change_id(), 1);
    let chg = st.new_change("install-snap", "Again");
    assert_eq!(chg.get(), 2);
}

#[test]
fn unknown_fields_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(
        &path,
        r#"{"last_change_id": 4, "notices": {"1": {"type": "refresh"}},
            "data": {"seeded": true}}"#,
    )
    .unwrap();

    let state = open(&path);
    let st = state.lock();
    assert_eq!(st.last_change_id(), 4);
    assert!(st.get::<bool>("seeded").unwrap());
}

#[test]
fn truncated_file_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    {
        let state = open(&path);
        let mut st = state.lock();
        st.new_change("install-snap", "Install");
    }
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let err = State::open(&path).unwrap_err();
    assert!(matches!(err, StateError::Corrupt { .. }), "got {err}");
}

#[test]
fn checksum_mismatch_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    {
        let state = open(&path);
        let mut st = state.lock();
        st.set("refresh-hold", &"forever").unwrap();
    }
    let text = fs::read_to_string(&path).unwrap().replace("forever", "never!!");
    fs::write(&path, text).unwrap();

    let err = State::open(&path).unwrap_err();
    assert!(matches!(err, StateError::Corrupt { .. }));
}

#[test]
fn dangling_edge_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(
        &path,
        r#"{"tasks": {"1": {"id": 1, "kind": "k", "summary": "s", "status": "Do",
                            "change": 1, "wait_tasks": [9],
                            "spawn_time": "2024-01-01T00:00:00Z"}}}"#,
    )
    .unwrap();
    assert!(matches!(
        State::open(&path).unwrap_err(),
        StateError::Corrupt { .. }
    ));
}

#[test]
fn orphan_tasks_are_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(
        &path,
        r#"{"tasks": {"3": {"id": 3, "kind": "k", "summary": "s", "status": "Do",
                            "change": 7, "spawn_time": "2024-01-01T00:00:00Z"}}}"#,
    )
    .unwrap();
    let state = open(&path);
    let mut st = state.lock();
    let report = st.prune(chrono::Utc::now(), &Default::default());
    assert_eq!(report.removed_orphans.len(), 1);
    assert_eq!(st.tasks().count(), 0);
}

#[test]
fn second_owner_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let _owner = open(&path);
    let err = State::open(&path).unwrap_err();
    assert!(matches!(err, StateError::LockFailed(_)));
}

#[test]
fn owner_released_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    drop(open(&path));
    assert!(State::open(&path).is_ok());
}

#[test]
fn clones_share_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let state = open(&dir.path().join("state.json"));
    let other = state.clone();
    {
        let mut st = state.lock();
        st.new_lane();
    }
    assert_eq!(other.lock().last_lane_id(), 1);
    assert!(other.same_as(&state));
    assert!(!LaneId::new(1).is_none());
}
