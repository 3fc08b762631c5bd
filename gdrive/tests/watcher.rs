//! End-to-end watcher scenarios over a scripted Drive API double.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gdrive::api::{ApiError, ChangeFile, ChangePage, DriveApi, DriveChange, DriveFile, ListPage};
use gdrive::{Config, Controller, WatchOptions};
use models::{FileChange, NodeInfo};
use storage::{MemoryRealm, Realm, RealmExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_TIME: &str = "2024-01-02T03:04:05Z";

struct MockDrive {
    root: DriveFile,
    files: HashMap<String, DriveFile>,
    listing: Vec<DriveFile>,
    start_token: String,
    pages: Mutex<HashMap<String, ChangePage>>,
    fail_once: Mutex<HashSet<String>>,
    list_calls: Arc<Mutex<usize>>,
}

impl MockDrive {
    fn new(root_id: &str) -> Self {
        MockDrive {
            root: folder(root_id, "My Drive", &[]),
            files: HashMap::new(),
            listing: Vec::new(),
            start_token: "t0".to_string(),
            pages: Mutex::new(HashMap::new()),
            fail_once: Mutex::new(HashSet::new()),
            list_calls: Arc::new(Mutex::new(0)),
        }
    }

    fn with_listing(mut self, files: &[DriveFile]) -> Self {
        for file in files {
            self.files.insert(file.id.clone(), file.clone());
        }
        self.listing = files.to_vec();
        self
    }

    fn with_page(self, token: &str, page: ChangePage) -> Self {
        self.pages.lock().unwrap().insert(token.to_string(), page);
        self
    }

    fn failing_once_at(self, token: &str) -> Self {
        self.fail_once.lock().unwrap().insert(token.to_string());
        self
    }
}

#[async_trait]
impl DriveApi for MockDrive {
    async fn file_info(&self, file_id: &str) -> Result<DriveFile, ApiError> {
        if file_id == "root" || file_id == self.root.id {
            return Ok(self.root.clone());
        }
        self.files
            .get(file_id)
            .cloned()
            .ok_or_else(|| ApiError::Fatal(format!("/files/{file_id} answered 404 Not Found")))
    }

    async fn start_page_token(&self) -> Result<String, ApiError> {
        Ok(self.start_token.clone())
    }

    async fn list_page(&self, _page_token: Option<&str>) -> Result<ListPage, ApiError> {
        *self.list_calls.lock().unwrap() += 1;
        Ok(ListPage {
            files: self.listing.clone(),
            next_page_token: None,
        })
    }

    async fn changes_page(&self, page_token: &str) -> Result<ChangePage, ApiError> {
        if self.fail_once.lock().unwrap().remove(page_token) {
            return Err(ApiError::Transient("changes page answered 503".into()));
        }
        match self.pages.lock().unwrap().get(page_token) {
            Some(page) => Ok(page.clone()),
            None => Ok(ChangePage {
                changes: vec![],
                next_page_token: None,
                new_start_page_token: Some(page_token.to_string()),
            }),
        }
    }
}

fn folder(id: &str, name: &str, parents: &[&str]) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: name.to_string(),
        folder: true,
        parents: parents.iter().map(|p| p.to_string()).collect(),
    }
}

fn file(id: &str, name: &str, parents: &[&str]) -> DriveFile {
    DriveFile {
        folder: false,
        ..folder(id, name, parents)
    }
}

fn created(file: &DriveFile) -> DriveChange {
    DriveChange {
        change_type: "file".to_string(),
        file_id: file.id.clone(),
        removed: false,
        time: EVENT_TIME.to_string(),
        file: Some(ChangeFile {
            name: file.name.clone(),
            folder: file.folder,
            trashed: false,
            parents: file.parents.clone(),
        }),
    }
}

fn removed(file_id: &str) -> DriveChange {
    DriveChange {
        change_type: "file".to_string(),
        file_id: file_id.to_string(),
        removed: true,
        time: EVENT_TIME.to_string(),
        file: None,
    }
}

fn page(changes: Vec<DriveChange>, new_start: &str) -> ChangePage {
    ChangePage {
        changes,
        next_page_token: None,
        new_start_page_token: Some(new_start.to_string()),
    }
}

struct Harness {
    state: Arc<MemoryRealm>,
    index: Arc<MemoryRealm>,
    cancel: CancellationToken,
    controller: Controller,
    output: mpsc::Receiver<Vec<FileChange>>,
    killed: Arc<AtomicBool>,
}

fn start(api: MockDrive, options: WatchOptions) -> Harness {
    start_with_realms(
        api,
        options,
        Arc::new(MemoryRealm::new()),
        Arc::new(MemoryRealm::new()),
    )
}

fn start_with_realms(
    api: MockDrive,
    options: WatchOptions,
    state: Arc<MemoryRealm>,
    index: Arc<MemoryRealm>,
) -> Harness {
    let cancel = CancellationToken::new();
    let killed = Arc::new(AtomicBool::new(false));
    let kill_flag = Arc::clone(&killed);
    let (tx, rx) = mpsc::channel(1);
    let controller = Controller::with_api(
        cancel.clone(),
        Arc::new(api),
        options,
        Config {
            poll_interval: Duration::from_secs(1),
            state: Box::new(Arc::clone(&state)),
            index: Box::new(Arc::clone(&index)),
            kill_switch: Arc::new(move || {
                kill_flag.store(true, Ordering::SeqCst);
            }),
            output: tx,
        },
    );
    Harness {
        state,
        index,
        cancel,
        controller,
        output: rx,
        killed,
    }
}

impl Harness {
    async fn next_batch(&mut self) -> Vec<FileChange> {
        tokio::time::timeout(Duration::from_secs(120), self.output.recv())
            .await
            .expect("timed out waiting for a change batch")
            .expect("change channel closed")
    }

    async fn shutdown(self) -> (Arc<MemoryRealm>, Arc<MemoryRealm>, bool) {
        self.cancel.cancel();
        self.controller.wait_until_full_stop().await;
        (self.state, self.index, self.killed.load(Ordering::SeqCst))
    }

    async fn wait_for_validation(&self) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while !self.state.has("indexOK") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state validation never completed");
    }
}

fn paths(batch: &[FileChange]) -> Vec<Vec<String>> {
    batch.iter().map(|c| c.paths.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn fresh_start_resets_state_and_aliases_the_team_drive() {
    let api = MockDrive::new("R").with_listing(&[folder("d1", "docs", &["R"])]);
    let mut options = WatchOptions::default();
    options.team_drive = Some("T".to_string());
    let harness = start(api, options);
    harness.wait_for_validation().await;
    let (state, index, killed) = harness.shutdown().await;

    assert!(!killed);
    assert_eq!(
        state.get::<String>("rootFolderID").unwrap().unwrap(),
        "R"
    );
    assert_eq!(state.get::<String>("nextStartPage").unwrap().unwrap(), "t0");
    assert!(state.get::<bool>("indexOK").unwrap().unwrap());
    let root: NodeInfo = index.get("R").unwrap().unwrap();
    let alias: NodeInfo = index.get("T").unwrap().unwrap();
    assert_eq!(root, alias);
    assert!(index.has("d1"));
}

#[tokio::test(start_paused = true)]
async fn plain_create_resolves_to_one_parent_path() {
    let docs = folder("d1", "docs", &["R"]);
    let f = file("f1", "F", &["d1"]);
    let api = MockDrive::new("R")
        .with_listing(&[docs])
        .with_page("t0", page(vec![created(&f)], "t1"));
    let mut harness = start(api, WatchOptions::default());

    let batch = harness.next_batch().await;
    assert_eq!(batch.len(), 1);
    let change = &batch[0];
    assert!(!change.folder);
    assert!(!change.deleted);
    assert_eq!(change.paths, vec!["/docs/F"]);
    assert_eq!(
        change.event_time,
        time::macros::datetime!(2024-01-02 03:04:05 UTC)
    );

    let (state, index, killed) = harness.shutdown().await;
    assert!(!killed);
    // Cursor lands on the remote's final marker, never an intermediate.
    assert_eq!(state.get::<String>("nextStartPage").unwrap().unwrap(), "t1");
    assert!(index.has("f1"));
}

#[tokio::test(start_paused = true)]
async fn multi_parent_files_emit_every_path() {
    let a = folder("a1", "a", &["R"]);
    let b = folder("b1", "b", &["R"]);
    let f = file("f1", "F", &["a1", "b1"]);
    let api = MockDrive::new("R")
        .with_listing(&[a, b])
        .with_page("t0", page(vec![created(&f)], "t1"));
    let mut harness = start(api, WatchOptions::default());

    let batch = harness.next_batch().await;
    assert_eq!(batch.len(), 1);
    let mut got = batch[0].paths.clone();
    got.sort();
    assert_eq!(got, vec!["/a/F", "/b/F"]);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_parents_are_fetched_transitively() {
    // Neither ancestor is in the listing; both must be looked up before
    // the change's paths can resolve.
    let deep = folder("p9", "deep", &["q9"]);
    let deeper = folder("q9", "deeper", &["R"]);
    let f = file("f1", "F", &["p9"]);
    let mut api = MockDrive::new("R").with_page("t0", page(vec![created(&f)], "t1"));
    api.files.insert(deep.id.clone(), deep);
    api.files.insert(deeper.id.clone(), deeper);
    let mut harness = start(api, WatchOptions::default());

    let batch = harness.next_batch().await;
    assert_eq!(paths(&batch), vec![vec!["/deeper/deep/F".to_string()]]);

    let (_, index, _) = harness.shutdown().await;
    // Index closure: every referenced parent made it into the index.
    assert!(index.has("p9"));
    assert!(index.has("q9"));
}

#[tokio::test(start_paused = true)]
async fn rewrites_collapse_into_the_creation_alone() {
    let x = folder("x1", "x", &["R"]);
    let old = file("f1", "y", &["x1"]);
    let new = file("g1", "y", &["x1"]);
    let api = MockDrive::new("R")
        .with_listing(&[x, old])
        .with_page("t0", page(vec![removed("f1"), created(&new)], "t1"));
    let mut harness = start(api, WatchOptions::default());

    let batch = harness.next_batch().await;
    assert_eq!(batch.len(), 1);
    assert!(!batch[0].deleted);
    assert_eq!(batch[0].paths, vec!["/x/y"]);

    let (_, index, _) = harness.shutdown().await;
    // The removed id was purged once its paths were out.
    assert!(!index.has("f1"));
    assert!(index.has("g1"));
}

#[tokio::test(start_paused = true)]
async fn custom_sub_root_scopes_and_rebases_paths() {
    let d = folder("d1", "d", &["R"]);
    let e = folder("e1", "E", &["d1"]);
    let f = file("f1", "F", &["e1"]);
    let sibling = file("s1", "S", &["R"]);
    let api = MockDrive::new("R")
        .with_listing(&[d, e])
        .with_page("t0", page(vec![created(&f), created(&sibling)], "t1"));
    let mut options = WatchOptions::default();
    options.root_folder_id = Some("d1".to_string());
    let mut harness = start(api, options);

    let batch = harness.next_batch().await;
    assert_eq!(paths(&batch), vec![vec!["/E/F".to_string()]]);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_keep_the_cursor_and_retry() {
    let docs = folder("d1", "docs", &["R"]);
    let f = file("f1", "F", &["d1"]);
    let api = MockDrive::new("R")
        .with_listing(&[docs])
        .with_page("t0", page(vec![created(&f)], "t1"))
        .failing_once_at("t0");
    let mut harness = start(api, WatchOptions::default());

    // First tick fails and must leave the cursor alone; the next tick
    // replays the same page and delivers the batch.
    let batch = harness.next_batch().await;
    assert_eq!(paths(&batch), vec![vec!["/docs/F".to_string()]]);

    let (state, _, killed) = harness.shutdown().await;
    assert!(!killed);
    assert_eq!(state.get::<String>("nextStartPage").unwrap().unwrap(), "t1");
}

#[tokio::test(start_paused = true)]
async fn replaying_the_same_cursor_is_idempotent() {
    let docs = folder("d1", "docs", &["R"]);
    let f = file("f1", "F", &["d1"]);
    let api = MockDrive::new("R")
        .with_listing(&[docs])
        .with_page("t0", page(vec![created(&f)], "t1"));
    let mut harness = start(api, WatchOptions::default());

    let first = harness.next_batch().await;
    // Re-inject the consumed cursor, as if the pass never happened.
    harness.state.set("nextStartPage", "t0").unwrap();
    let second = harness.next_batch().await;
    assert_eq!(first, second);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_with_a_valid_state_skips_the_rebuild() {
    let listing = [folder("d1", "docs", &["R"])];
    let api = MockDrive::new("R").with_listing(&listing);
    let harness = start(api, WatchOptions::default());
    harness.wait_for_validation().await;
    let (state, index, _) = harness.shutdown().await;

    // Second run over the same realms: validation must accept the stored
    // state without relisting the drive.
    let api = MockDrive::new("R").with_listing(&listing);
    let list_calls = Arc::clone(&api.list_calls);
    let harness = start_with_realms(api, WatchOptions::default(), state, index);
    harness.wait_for_validation().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let (state, _, killed) = harness.shutdown().await;

    assert!(!killed);
    assert_eq!(*list_calls.lock().unwrap(), 0);
    assert_eq!(state.get::<String>("nextStartPage").unwrap().unwrap(), "t0");
}

#[tokio::test(start_paused = true)]
async fn a_different_remote_root_forces_a_reset() {
    let api = MockDrive::new("R1").with_listing(&[folder("d1", "docs", &["R1"])]);
    let harness = start(api, WatchOptions::default());
    harness.wait_for_validation().await;
    let (state, index, _) = harness.shutdown().await;
    index
        .set("stale", &NodeInfo {
            name: "stale".to_string(),
            folder: false,
            parents: vec!["R1".to_string()],
        })
        .unwrap();

    let api = MockDrive::new("R2").with_listing(&[folder("m1", "media", &["R2"])]);
    let list_calls = Arc::clone(&api.list_calls);
    let harness = start_with_realms(api, WatchOptions::default(), state, index);
    harness.wait_for_validation().await;
    let (state, index, _) = harness.shutdown().await;

    assert_eq!(state.get::<String>("rootFolderID").unwrap().unwrap(), "R2");
    assert!(*list_calls.lock().unwrap() > 0);
    // The old drive's nodes are gone after the reset.
    assert!(!index.has("d1"));
    assert!(!index.has("stale"));
    assert!(index.has("m1"));
}

#[tokio::test(start_paused = true)]
async fn trashed_files_count_as_deletions() {
    let x = folder("x1", "x", &["R"]);
    let f = file("f1", "y", &["x1"]);
    let api = MockDrive::new("R").with_listing(&[x, f.clone()]).with_page(
        "t0",
        page(
            vec![DriveChange {
                change_type: "file".to_string(),
                file_id: "f1".to_string(),
                removed: false,
                time: EVENT_TIME.to_string(),
                file: Some(ChangeFile {
                    name: "y".to_string(),
                    folder: false,
                    trashed: true,
                    parents: vec!["x1".to_string()],
                }),
            }],
            "t1",
        ),
    );
    let mut harness = start(api, WatchOptions::default());

    let batch = harness.next_batch().await;
    assert_eq!(batch.len(), 1);
    assert!(batch[0].deleted);
    assert_eq!(batch[0].paths, vec!["/x/y"]);

    let (_, index, _) = harness.shutdown().await;
    assert!(!index.has("f1"));
}

#[tokio::test(start_paused = true)]
async fn unchanged_remote_emits_nothing() {
    let api = MockDrive::new("R").with_listing(&[folder("d1", "docs", &["R"])]);
    let mut harness = start(api, WatchOptions::default());
    harness.wait_for_validation().await;

    // Let several polling ticks elapse against an empty feed.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.output.try_recv().is_err());

    let (state, _, killed) = harness.shutdown().await;
    assert!(!killed);
    assert_eq!(state.get::<String>("nextStartPage").unwrap().unwrap(), "t0");
}
