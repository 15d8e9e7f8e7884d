//! End-to-end runs of the collection pipeline against local directories

use log_collector::collect::locations::resolve_locations;
use log_collector::collect::results::{Property, PropertyChange};
use log_collector::collect::writer::{CompositeWriter, ResultWriter};
use log_collector::collect::{
    ContentReader, Credentials, FileData, FileInfo, JobParams, JobResults, JobState, Location,
    LocationKind, LogEvent, LogPattern, Pipeline, PipelineOptions,
};
use log_collector::fs::FileServiceSelector;
use log_collector::storage::Catalog;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn location(code: &str, root: &Path) -> Location {
    Location {
        code: code.to_string(),
        kind: LocationKind::Local,
        host: None,
        port: None,
        credentials: Credentials::default(),
        path: root.to_string_lossy().to_string(),
    }
}

fn pattern(code: &str, includes: &[&str], line_regex: Option<&str>) -> LogPattern {
    LogPattern {
        code: code.to_string(),
        name: code.to_string(),
        includes: includes.iter().map(|s| s.to_string()).collect(),
        line_regex: line_regex.map(str::to_string),
        timestamp_format: None,
    }
}

fn pipeline(catalog: Catalog, workers: usize, results: JobResults) -> Pipeline {
    let catalog = Arc::new(catalog);
    Pipeline::new(
        catalog.clone(),
        catalog,
        Arc::new(FileServiceSelector::default()),
        results,
        PipelineOptions {
            scan_workers: workers,
            process_workers: workers,
            shutdown_grace: Duration::from_secs(30),
            ..Default::default()
        },
    )
}

fn params(pattern: &str, locations: &str) -> JobParams {
    JobParams {
        pattern_code: pattern.to_string(),
        locations: locations.to_string(),
        ..Default::default()
    }
}

fn archive_names(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

fn write_logs(dir: &Path, count: usize, body: &str) {
    fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        fs::write(dir.join(format!("app-{:02}.log", i)), body).unwrap();
    }
}

#[test]
fn test_only_locations_with_matching_files_are_handed_off() {
    let tmp = tempfile::tempdir().unwrap();
    let full = tmp.path().join("full");
    let empty = tmp.path().join("empty");
    write_logs(&full, 3, "hello\n");
    fs::create_dir_all(&empty).unwrap();
    fs::write(empty.join("notes.txt"), "not a log\n").unwrap();

    let catalog = Catalog::new(
        vec![location("L1", &full), location("L2", &empty)],
        vec![pattern("all", &["*.log"], None)],
    );
    let p = pipeline(catalog, 2, JobResults::new(100));
    let summary = p.run_job(&params("all", "L1,L2")).unwrap();

    assert_eq!(summary.locations, 2);
    assert_eq!(summary.dirs, 1);
    assert_eq!(summary.files_to_process, 3);
    assert_eq!(summary.processed_files, 3);
    assert_eq!(summary.selected_files, 3);
    assert!(p.results().is_success());
}

#[test]
fn test_package_all_controls_unmatched_files() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    write_logs(&logs, 4, "INFO all quiet\n");

    for (package_all, expected) in [(false, 0), (true, 4)] {
        let archive = tmp.path().join(format!("out-{}.zip", package_all));
        let catalog = Catalog::new(
            vec![location("app", &logs)],
            vec![pattern("errors", &["*.log"], Some("ERROR"))],
        );
        let p = pipeline(catalog, 2, JobResults::new(100));

        let summary = p
            .run_job(&JobParams {
                save_to_archive: true,
                archive_path: Some(archive.clone()),
                package_all: Some(package_all),
                ..params("errors", "app")
            })
            .unwrap();

        assert_eq!(summary.events_total, 0);
        assert_eq!(summary.selected_files, 0);
        assert_eq!(summary.processed_files, 4);
        assert_eq!(archive_names(&archive).len(), expected);
    }
}

#[test]
fn test_stop_from_listener_drains_and_keeps_archive_valid() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    write_logs(&logs, 20, "ERROR first\nok\nERROR second\n");
    let archive = tmp.path().join("out.zip");

    let results = JobResults::new(1000);
    let states = Arc::new(Mutex::new(Vec::new()));
    {
        let states = states.clone();
        results.add_listener(
            Some(Property::JobState),
            Arc::new(move |change: &PropertyChange| {
                if let PropertyChange::JobState { new, .. } = change {
                    states.lock().push(*new);
                }
            }),
        );
    }
    {
        let handle = results.clone();
        results.add_listener(
            Some(Property::ProcessedFiles),
            Arc::new(move |change: &PropertyChange| {
                if let PropertyChange::ProcessedFiles { new, .. } = change {
                    if *new >= 1 {
                        handle.request_stop();
                    }
                }
            }),
        );
    }

    let catalog = Catalog::new(
        vec![location("app", &logs)],
        vec![pattern("errors", &["*.log"], Some("ERROR"))],
    );
    let p = pipeline(catalog, 1, results.clone());
    let summary = p
        .run_job(&JobParams {
            save_to_archive: true,
            archive_path: Some(archive.clone()),
            ..params("errors", "app")
        })
        .unwrap();

    assert!(summary.cancelled);
    assert!(summary.processed_files < 20);
    assert_eq!(
        *states.lock(),
        vec![JobState::Running, JobState::Stopping, JobState::Stopped]
    );
    assert_eq!(results.state(), JobState::Stopped);
    assert!(results.is_success());

    let names = archive_names(&archive);
    assert!(names.len() as u64 <= summary.processed_files);
}

fn sorted_events(events: Vec<LogEvent>) -> Vec<(PathBuf, u64, String)> {
    let mut keys: Vec<_> = events.into_iter().map(|e| (e.file, e.line, e.text)).collect();
    keys.sort();
    keys
}

#[test]
fn test_results_do_not_depend_on_pool_size() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    write_logs(&a, 6, "ERROR one\nfine\nERROR two\n");
    write_logs(&b, 5, "fine\nERROR three\n");
    fs::create_dir_all(b.join("nested")).unwrap();
    fs::write(b.join("nested").join("deep.log"), "ERROR deep\n").unwrap();

    let mut runs = Vec::new();
    for workers in [1, 2, 8] {
        let catalog = Catalog::new(
            vec![location("A", &a), location("B", &b)],
            vec![pattern("errors", &["*.log"], Some("ERROR"))],
        );
        let p = pipeline(catalog, workers, JobResults::new(1000));
        let summary = p.run_job(&params("errors", "A,B")).unwrap();
        runs.push((
            summary.files_to_process,
            summary.processed_files,
            summary.selected_files,
            sorted_events(p.results().events()),
        ));
    }

    assert_eq!(runs[0].0, 12);
    assert_eq!(runs[0].3.len(), 6 * 2 + 5 + 1);
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[test]
fn test_files_without_matches_are_not_selected() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    write_logs(&logs, 2, "INFO nothing here\n");
    fs::write(logs.join("bad.log"), "ERROR here\n").unwrap();

    let catalog = Catalog::new(
        vec![location("app", &logs)],
        vec![pattern("errors", &["*.log"], Some("ERROR"))],
    );
    let p = pipeline(catalog, 2, JobResults::new(100));
    let summary = p.run_job(&params("errors", "app")).unwrap();

    assert_eq!(summary.processed_files, 3);
    assert_eq!(summary.selected_files, 1);
    assert_eq!(summary.events_total, 1);
}

#[test]
fn test_repeated_location_code_is_scanned_once() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    write_logs(&logs, 3, "ERROR x\n");
    let archive = tmp.path().join("out.zip");

    let catalog = Catalog::new(
        vec![location("app", &logs)],
        vec![pattern("errors", &["*.log"], Some("ERROR"))],
    );
    let p = pipeline(catalog, 4, JobResults::new(100));
    // The same code listed twice resolves to one location
    let summary = p
        .run_job(&JobParams {
            save_to_archive: true,
            archive_path: Some(archive.clone()),
            ..params("errors", "app, app")
        })
        .unwrap();

    assert_eq!(summary.locations, 1);
    assert_eq!(
        archive_names(&archive),
        vec!["app/app-00.log", "app/app-01.log", "app/app-02.log"]
    );
}

#[test]
fn test_location_resolution_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(
        vec![location("a", tmp.path()), location("b", tmp.path())],
        Vec::new(),
    );

    let first = resolve_locations(" b, a,missing,,a ", &catalog);
    let second = resolve_locations(" b, a,missing,,a ", &catalog);
    let codes: Vec<_> = first.iter().map(|l| l.code.as_str()).collect();

    assert_eq!(codes, vec!["b", "a"]);
    assert_eq!(first, second);
}

#[test]
fn test_copy_and_archive_receive_the_same_files() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    fs::create_dir_all(logs.join("sub")).unwrap();
    fs::write(logs.join("top.log"), "ERROR top\n").unwrap();
    fs::write(logs.join("sub").join("inner.log"), "ERROR inner\n").unwrap();
    fs::write(logs.join("quiet.log"), "INFO\n").unwrap();
    let archive = tmp.path().join("out").join("bundle.zip");
    let copy = tmp.path().join("copy");

    let catalog = Catalog::new(
        vec![location("app", &logs)],
        vec![pattern("errors", &["*.log"], Some("ERROR"))],
    );
    let p = pipeline(catalog, 2, JobResults::new(100));
    p.run_job(&JobParams {
        save_to_archive: true,
        archive_path: Some(archive.clone()),
        copy_path: Some(copy.clone()),
        ..params("errors", "app")
    })
    .unwrap();

    assert_eq!(
        archive_names(&archive),
        vec!["app/sub/inner.log", "app/top.log"]
    );
    assert_eq!(
        fs::read_to_string(copy.join("app").join("sub").join("inner.log")).unwrap(),
        "ERROR inner\n"
    );
    assert!(copy.join("app").join("top.log").exists());
    assert!(!copy.join("app").join("quiet.log").exists());
}

#[test]
fn test_event_total_survives_buffer_eviction() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    write_logs(&logs, 3, "ERROR a\nERROR b\nERROR c\nERROR d\n");

    let catalog = Catalog::new(
        vec![location("app", &logs)],
        vec![pattern("errors", &["*.log"], Some("ERROR"))],
    );
    let p = pipeline(catalog, 2, JobResults::new(5));
    let summary = p.run_job(&params("errors", "app")).unwrap();

    assert_eq!(summary.events_total, 12);
    assert_eq!(summary.events_buffered, 5);
    assert_eq!(p.results().snapshot().total_events, 12);
}

fn file_data(root: &Path, name: &str, content: &str) -> FileData {
    fs::create_dir_all(root).unwrap();
    let path = root.join(name);
    fs::write(&path, content).unwrap();
    let location = location("app", root);
    FileData::new(ContentReader::new(
        Arc::new(FileServiceSelector::default()),
        Arc::new(location),
        FileInfo {
            path,
            relative_path: name.to_string(),
            location_code: "app".to_string(),
            host: None,
            size: content.len() as u64,
            modified: chrono::Utc::now(),
        },
    ))
}

#[test]
fn test_same_zip_path_is_packaged_once() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("out.zip");
    let copy = tmp.path().join("copy");
    let writer = CompositeWriter::from_params(&JobParams {
        save_to_archive: true,
        archive_path: Some(archive.clone()),
        copy_path: Some(copy.clone()),
        ..params("errors", "app")
    })
    .unwrap();

    // Two roots that both map to app/a.log
    writer.write(&file_data(&tmp.path().join("one"), "a.log", "first")).unwrap();
    writer.write(&file_data(&tmp.path().join("two"), "a.log", "second")).unwrap();
    writer.close().unwrap();

    assert_eq!(archive_names(&archive), vec!["app/a.log"]);
    assert_eq!(fs::read_to_string(copy.join("app").join("a.log")).unwrap(), "first");
}
