use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drivesync_core::{store, FileSystem, RemoteChangePackage, RemoteFileMetadata, RemoteId};
use drivesync_sync::{
    read_fs, shared, ChangesApplier, ChangesWatcher, FolderBackend, LocalChangesWatcher,
    LocalEvent, MemoryBackend, RemoteBackend, RemoteChangesWatcher, RemoteError, SharedFileSystem,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    fs: SharedFileSystem,
    local: Arc<LocalChangesWatcher>,
    remote: Arc<RemoteChangesWatcher>,
    applier: ChangesApplier,
}

fn harness(backend: Arc<dyn RemoteBackend>) -> Harness {
    init_logging();
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).expect("create root");
    let fs = shared(FileSystem::new());
    let local = Arc::new(LocalChangesWatcher::new(
        &root,
        fs.clone(),
        Duration::from_secs(5),
    ));
    let remote = Arc::new(RemoteChangesWatcher::new(
        backend.clone(),
        fs.clone(),
        Duration::from_secs(30),
    ));
    remote.start().expect("start remote watcher");
    let applier = ChangesApplier::new(local.clone(), remote.clone(), backend, fs.clone());
    Harness {
        _tmp: tmp,
        root,
        fs,
        local,
        remote,
        applier,
    }
}

fn write(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, contents).expect("write file");
}

#[test]
fn uploaded_file_is_not_downloaded_back() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());

    write(&h.root.join("a/b.txt"), b"hello");
    h.local
        .observe(LocalEvent::created(h.root.join("a")))
        .expect("observe dir");
    h.local
        .observe(LocalEvent::created(h.root.join("a/b.txt")))
        .expect("observe file");

    let first = h.applier.merge().expect("merge runs");
    assert_eq!(first.uploaded, 2);
    let r1 = backend.lookup("a/b.txt").expect("uploaded").id;

    // The next poll sees our own upload in the delta and must filter it.
    assert_eq!(h.remote.poll().expect("poll"), 0);
    assert!(!h.remote.pending().contains(&r1));

    let second = h.applier.merge().expect("merge runs");
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(backend.upload_count(), 1);
}

#[test]
fn third_party_edit_inside_echo_window_still_arrives() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());

    write(&h.root.join("notes.txt"), b"mine");
    h.local.seed([h.root.join("notes.txt")]);
    h.applier.merge().expect("merge runs");
    let id = backend.lookup("notes.txt").expect("uploaded").id;

    backend
        .put_file(&RemoteId::root(), "notes.txt", b"theirs")
        .expect("remote edit");
    assert_eq!(h.remote.poll().expect("poll"), 1);

    let summary = h.applier.merge().expect("merge runs");
    assert_eq!(summary.downloaded, 1);
    assert_eq!(fs::read(h.root.join("notes.txt")).expect("read"), b"theirs");
    assert_eq!(
        read_fs(&h.fs).get(&id).and_then(|e| e.checksum.clone()),
        backend.lookup("notes.txt").and_then(|m| m.checksum)
    );
}

#[test]
fn local_edit_inside_echo_window_is_uploaded() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());

    backend
        .put_file(&RemoteId::root(), "a.txt", b"remote")
        .expect("remote file");
    assert_eq!(h.remote.poll().expect("poll"), 1);
    assert_eq!(h.applier.merge().expect("merge runs").downloaded, 1);

    // The download's own notification is still an echo.
    let path = h.root.join("a.txt");
    assert_eq!(h.local.observe(LocalEvent::modified(&path)).expect("observe"), 0);

    // Seconds later, well inside the window, the user edits the file.
    write(&path, b"user edit");
    assert_eq!(h.local.observe(LocalEvent::modified(&path)).expect("observe"), 1);

    let summary = h.applier.merge().expect("merge runs");
    assert_eq!(summary.uploaded, 1);
    let staged = h.root.with_file_name("check.out");
    let id = backend.lookup("a.txt").expect("remote file").id;
    backend.download(&id, &staged).expect("download");
    assert_eq!(fs::read(&staged).expect("read"), b"user edit");
}

#[test]
fn restart_replays_unapplied_remote_changes() {
    let home = TempDir::new().expect("home");
    let backend = Arc::new(MemoryBackend::new());
    backend
        .put_file(&RemoteId::root(), "old.txt", b"x")
        .expect("history");
    let h = harness(backend.clone());
    assert_eq!(h.remote.committed_revision(), 1);

    backend
        .put_file(&RemoteId::root(), "new.txt", b"y")
        .expect("remote file");
    assert_eq!(h.remote.poll().expect("poll"), 1);
    assert_eq!(h.remote.committed_revision(), 1);
    store::save_checkpoint_at(home.path(), &read_fs(&h.fs), h.remote.committed_revision())
        .expect("save");

    // A process that stops here never applied new.txt.
    let reloaded = shared(store::load_at(home.path()).expect("load"));
    let restarted =
        RemoteChangesWatcher::new(backend.clone(), reloaded, Duration::from_secs(30));
    assert_eq!(restarted.start().expect("start"), 1);
    assert_eq!(restarted.poll().expect("poll"), 1);

    // Once applied, the committed cursor catches up.
    let summary = h.applier.merge().expect("merge runs");
    assert_eq!(summary.downloaded, 1);
    assert_eq!(h.remote.committed_revision(), 2);
}

#[test]
fn child_waits_for_parent_directory() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());

    write(&h.root.join("docs/report.txt"), b"draft");
    let dir = h.root.join("docs");
    let file = h.root.join("docs/report.txt");
    h.local.seed([dir.clone(), file.clone()]);

    // The directory's lookup fails, so its child cannot be placed either.
    backend.fail_next(1);
    let first = h.applier.merge().expect("merge runs");
    assert_eq!(first.uploaded, 0);
    assert_eq!(first.local_pending, 2);
    assert!(h.local.pending().contains(&dir));
    assert!(h.local.pending().contains(&file));

    let second = h.applier.merge().expect("merge runs");
    assert_eq!(second.uploaded, 2);
    assert_eq!(second.local_pending, 0);
    let remote_dir = backend.lookup("docs").expect("dir uploaded");
    let remote_file = backend.lookup("docs/report.txt").expect("file uploaded");
    assert_eq!(remote_file.parent, Some(remote_dir.id));
}

#[test]
fn remote_changes_reach_local_tree_in_order() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());

    let photos = backend
        .put_directory(&RemoteId::root(), "photos")
        .expect("dir");
    let year = backend.put_directory(&photos.id, "2024").expect("dir");
    backend.put_file(&year.id, "cat.jpg", b"meow").expect("file");
    h.remote.poll().expect("poll");

    let summary = h.applier.merge().expect("merge runs");
    assert_eq!(summary.downloaded, 3);
    assert_eq!(
        fs::read(h.root.join("photos/2024/cat.jpg")).expect("read"),
        b"meow"
    );

    // Notifications for our own writes come back from the OS afterwards.
    for path in ["photos", "photos/2024", "photos/2024/cat.jpg"] {
        h.local
            .observe(LocalEvent::created(h.root.join(path)))
            .expect("observe");
    }
    assert!(h.local.pending().is_empty());
}

#[test]
fn cursor_is_monotonic_and_follows_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());

    let mut last = h.remote.revision();
    for round in 0..5 {
        backend
            .put_file(&RemoteId::root(), &format!("f{round}.txt"), b"x")
            .expect("file");
        h.remote.poll().expect("poll");
        let now = h.remote.revision();
        assert!(now >= last);
        assert_eq!(now, backend.revision());
        last = now;
    }

    backend.fail_next(1);
    backend
        .put_file(&RemoteId::root(), "late.txt", b"x")
        .expect("file");
    assert!(h.remote.poll().is_err());
    assert_eq!(h.remote.revision(), last);
}

#[test]
fn repoll_without_remote_mutation_is_empty() {
    let backend = Arc::new(MemoryBackend::new());
    let h = harness(backend.clone());
    backend
        .put_file(&RemoteId::root(), "a.txt", b"x")
        .expect("file");

    assert_eq!(h.remote.poll().expect("poll"), 1);
    let revision = h.remote.revision();
    assert_eq!(h.remote.poll().expect("poll"), 0);
    assert_eq!(h.remote.revision(), revision);
}

/// Delegates to a [`MemoryBackend`] and records the cursor of every poll.
struct RecordingBackend {
    inner: MemoryBackend,
    polled: Mutex<Vec<u64>>,
}

impl RemoteBackend for RecordingBackend {
    fn current_revision(&self) -> Result<u64, RemoteError> {
        self.inner.current_revision()
    }
    fn poll_changes(&self, since: u64) -> Result<RemoteChangePackage, RemoteError> {
        self.polled.lock().expect("lock").push(since);
        self.inner.poll_changes(since)
    }
    fn upload(&self, parent: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError> {
        self.inner.upload(parent, local)
    }
    fn update(&self, id: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError> {
        self.inner.update(id, local)
    }
    fn download(&self, id: &RemoteId, destination: &Path) -> Result<(), RemoteError> {
        self.inner.download(id, destination)
    }
    fn delete(&self, id: &RemoteId) -> Result<(), RemoteError> {
        self.inner.delete(id)
    }
    fn create_directory(
        &self,
        parent: &RemoteId,
        name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        self.inner.create_directory(parent, name)
    }
    fn move_to(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        self.inner.move_to(id, new_parent, new_name)
    }
    fn list_children(&self, parent: &RemoteId) -> Result<Vec<RemoteFileMetadata>, RemoteError> {
        self.inner.list_children(parent)
    }
    fn find_child(
        &self,
        parent: &RemoteId,
        name_or_id: &str,
    ) -> Result<Option<RemoteFileMetadata>, RemoteError> {
        self.inner.find_child(parent, name_or_id)
    }
}

#[test]
fn first_start_jumps_to_current_revision() {
    init_logging();
    let inner = MemoryBackend::new();
    for round in 0..42 {
        inner
            .put_file(&RemoteId::root(), "history.txt", format!("v{round}").as_bytes())
            .expect("history");
    }
    let backend = Arc::new(RecordingBackend {
        inner,
        polled: Mutex::new(Vec::new()),
    });
    let fs = shared(FileSystem::new());
    let watcher = RemoteChangesWatcher::new(backend.clone(), fs.clone(), Duration::from_secs(30));

    assert_eq!(watcher.start().expect("start"), 42);
    assert_eq!(read_fs(&fs).revision(), 42);
    assert_eq!(watcher.poll().expect("poll"), 0);
    assert_eq!(*backend.polled.lock().expect("lock"), vec![42]);
}

#[test]
fn restart_resumes_from_persisted_cursor() {
    init_logging();
    let backend = Arc::new(MemoryBackend::new());
    for name in ["a.txt", "b.txt", "c.txt"] {
        backend
            .put_file(&RemoteId::root(), name, b"x")
            .expect("file");
    }
    let mut model = FileSystem::new();
    model.update_revision(1);
    let watcher = RemoteChangesWatcher::new(backend, shared(model), Duration::from_secs(30));

    assert_eq!(watcher.start().expect("start"), 1);
    assert_eq!(watcher.poll().expect("poll"), 2);
}

#[test]
fn folder_remote_syncs_between_two_roots() {
    init_logging();
    let share = TempDir::new().expect("share");
    let alice_backend: Arc<dyn RemoteBackend> =
        Arc::new(FolderBackend::open(share.path()).expect("open share"));
    let bob_backend: Arc<dyn RemoteBackend> =
        Arc::new(FolderBackend::open(share.path()).expect("open share"));
    let alice = harness(alice_backend);
    let bob = harness(bob_backend);

    write(&alice.root.join("shared/plan.md"), b"# plan");
    alice.local.seed([alice.root.join("shared")]);
    let pushed = alice.applier.merge().expect("merge runs");
    assert_eq!(pushed.uploaded, 2);

    bob.remote.poll().expect("poll");
    let pulled = bob.applier.merge().expect("merge runs");
    assert_eq!(pulled.downloaded, 2);
    assert_eq!(
        fs::read(bob.root.join("shared/plan.md")).expect("read"),
        b"# plan"
    );

    let ids: HashSet<RemoteId> = read_fs(&alice.fs).entries().map(|e| e.id.clone()).collect();
    let bob_ids: HashSet<RemoteId> = read_fs(&bob.fs).entries().map(|e| e.id.clone()).collect();
    assert_eq!(ids, bob_ids);
}
