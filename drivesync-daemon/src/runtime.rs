use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use drivesync_core::{config, store, Config, RemoteConfig};
use drivesync_sync::{
    initial_sync, read_fs, rescan, shared, ChangesApplier, ChangesWatcher, FolderBackend,
    LocalChangesWatcher, MergeSummary, RemoteBackend, RemoteChangesWatcher, SharedFileSystem,
};

use crate::error::{io_err, DaemonError};
use crate::events::translate;
use crate::paths::{drivesync_root, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Request for an immediate poll + merge, answered once it has run.
struct MergeJob {
    source: &'static str,
    respond_to: oneshot::Sender<Result<Option<MergeSummary>, String>>,
}

/// Everything the tasks share once startup has succeeded.
pub struct Engine {
    home: PathBuf,
    config: Config,
    root: PathBuf,
    fs: SharedFileSystem,
    local: Arc<LocalChangesWatcher>,
    remote: Arc<RemoteChangesWatcher>,
    applier: Arc<ChangesApplier>,
    last_merge: RwLock<Option<MergeSummary>>,
    started_at_unix: u64,
}

/// Open the remote named by `config`.
pub fn open_backend(config: &Config) -> Result<Arc<dyn RemoteBackend>, DaemonError> {
    match &config.remote {
        RemoteConfig::Folder { path } => Ok(Arc::new(FolderBackend::open(path)?)),
    }
}

impl Engine {
    /// Load config and state and open the remote named in the config.
    pub fn prepare(home: &Path) -> Result<Self, DaemonError> {
        let config = config::load_at(home)?;
        let backend = open_backend(&config)?;
        Self::assemble(home, config, backend)
    }

    /// Startup sequence. Every error here is fatal: the daemon never reaches
    /// its scheduling loop.
    pub fn assemble(
        home: &Path,
        config: Config,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let root = fs::canonicalize(&config.root).map_err(|e| io_err(&config.root, e))?;

        let model = store::load_at(home)?;
        let fresh = model.is_empty();
        let fs = shared(model);

        let local = Arc::new(
            LocalChangesWatcher::new(&root, fs.clone(), config.local_echo_window())
                .with_ignore(config.ignore.clone()),
        );
        let remote = Arc::new(RemoteChangesWatcher::new(
            backend.clone(),
            fs.clone(),
            config.remote_echo_window(),
        ));
        remote.start()?;

        if fresh {
            let report = initial_sync(backend.as_ref(), &fs, &root, &local)?;
            tracing::info!(
                downloaded = report.downloaded,
                directories = report.directories,
                adopted = report.adopted,
                seeded = report.seeded,
                "initial sync finished",
            );
        } else {
            let report = rescan(&fs, &root, &local)?;
            tracing::info!(
                created = report.created,
                modified = report.modified,
                deleted = report.deleted,
                "local rescan finished",
            );
        }
        store::save_checkpoint_at(home, &read_fs(&fs), remote.committed_revision())?;

        let applier = Arc::new(ChangesApplier::new(
            local.clone(),
            remote.clone(),
            backend,
            fs.clone(),
        ));
        Ok(Self {
            home: home.to_path_buf(),
            config,
            root,
            fs,
            local,
            remote,
            applier,
            last_merge: RwLock::new(None),
            started_at_unix: unix_seconds_now(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist the model with the committed cursor, so remote changes that
    /// were polled but not applied yet are polled again after a restart.
    fn save_state(&self) -> Result<(), DaemonError> {
        let committed = self.remote.committed_revision();
        store::save_checkpoint_at(&self.home, &read_fs(&self.fs), committed)?;
        Ok(())
    }

    /// Poll then merge, blocking. Used for manual syncs.
    fn poll_and_merge(&self) -> Result<Option<MergeSummary>, DaemonError> {
        if let Err(err) = self.remote.poll() {
            tracing::warn!(error = %err, "remote poll before manual sync failed");
        }
        self.merge()
    }

    fn merge(&self) -> Result<Option<MergeSummary>, DaemonError> {
        let summary = self.applier.merge();
        if summary.is_some() {
            self.save_state()?;
        }
        Ok(summary)
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon until `stop`, ctrl-c or a task failure.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let base = drivesync_root(&home);
    fs::create_dir_all(&base).map_err(|e| io_err(&base, e))?;

    let engine = {
        let home = home.clone();
        tokio::task::spawn_blocking(move || Engine::prepare(&home))
            .await
            .map_err(|err| DaemonError::Protocol(format!("startup join error: {err}")))??
    };
    let engine = Arc::new(engine);
    tracing::info!(
        root = %engine.root.display(),
        revision = engine.remote.revision(),
        "daemon started",
    );

    let (merge_tx, merge_rx) = mpsc::channel::<MergeJob>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let ingest_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = ingest_task(engine, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let poll_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = poll_task(engine, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let merge_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = merge_task(engine, merge_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(engine, merge_tx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (ingest_result, poll_result, merge_result, socket_result, signal_result) = tokio::join!(
        ingest_handle,
        poll_handle,
        merge_handle,
        socket_handle,
        signal_handle
    );

    handle_join("ingest", ingest_result)?;
    handle_join("remote_poll", poll_result)?;
    handle_join("merge", merge_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Feed OS notifications for the synced root into the local watcher.
async fn ingest_task(
    engine: Arc<Engine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event: notify::Result<Event>| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&engine.root, RecursiveMode::Recursive)?;
    tracing::debug!(path = %engine.root.display(), "watching synced root");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                for local_event in translate(&event) {
                    if let Err(err) = engine.local.observe(local_event) {
                        tracing::warn!(error = %err, "could not record local event");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Fixed-delay remote poll: the next poll is scheduled only after the
/// previous one has returned.
async fn poll_task(
    engine: Arc<Engine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let interval = engine.config.poll_interval();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {
                let polling = engine.clone();
                let result = tokio::task::spawn_blocking(move || polling.remote.poll())
                    .await
                    .map_err(|err| DaemonError::Protocol(format!("poll join error: {err}")))?;
                match result {
                    Ok(0) => {}
                    Ok(queued) => tracing::debug!(queued, "remote changes queued"),
                    Err(err) => tracing::warn!(error = %err, "remote poll failed, retrying next tick"),
                }
            }
        }
    }
    Ok(())
}

/// Fixed-delay merge loop. Manual sync jobs run on the same task, so a
/// manual sync never overlaps a scheduled one.
async fn merge_task(
    engine: Arc<Engine>,
    mut merge_rx: mpsc::Receiver<MergeJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let interval = engine.config.merge_interval();
    // Manual jobs do not push the schedule back.
    let tick = tokio::time::sleep(interval);
    tokio::pin!(tick);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = merge_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let outcome = run_merge(engine.clone(), true)
                    .await
                    .map_err(|err| err.to_string());
                if let Ok(Some(summary)) = &outcome {
                    tracing::info!(source = job.source, iteration = summary.iteration, "manual sync completed");
                }
                let _ = job.respond_to.send(outcome);
            }
            () = &mut tick => {
                if let Err(err) = run_merge(engine.clone(), false).await {
                    tracing::error!(error = %err, "merge iteration failed");
                }
                tick.as_mut().reset(tokio::time::Instant::now() + interval);
            }
        }
    }

    let saving = engine.clone();
    tokio::task::spawn_blocking(move || saving.save_state())
        .await
        .map_err(|err| DaemonError::Protocol(format!("final save join error: {err}")))??;
    Ok(())
}

async fn run_merge(engine: Arc<Engine>, poll_first: bool) -> Result<Option<MergeSummary>, DaemonError> {
    let merging = engine.clone();
    let summary = tokio::task::spawn_blocking(move || {
        if poll_first {
            merging.poll_and_merge()
        } else {
            merging.merge()
        }
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("merge join error: {err}")))??;

    if let Some(summary) = &summary {
        if summary.uploaded > 0 || summary.downloaded > 0 {
            tracing::info!(
                iteration = summary.iteration,
                uploaded = summary.uploaded,
                downloaded = summary.downloaded,
                revision = summary.revision,
                duration_ms = summary.duration_ms,
                "merge iteration completed",
            );
        }
        *engine.last_merge.write().await = Some(summary.clone());
    }
    Ok(summary)
}

async fn socket_server_task(
    engine: Arc<Engine>,
    merge_tx: mpsc::Sender<MergeJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&engine.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let engine = engine.clone();
                let merge_tx = merge_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, engine, merge_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    engine: Arc<Engine>,
    merge_tx: mpsc::Sender<MergeJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&engine).await),
            "sync" => match enqueue_merge(&merge_tx, "socket").await {
                Ok(summary) => DaemonResponse::ok(json!(summary)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(engine: &Engine) -> Value {
    let (revision, tracked) = {
        let fs = read_fs(&engine.fs);
        (fs.revision(), fs.len())
    };
    let last_merge = engine.last_merge.read().await.clone();
    let remote = match &engine.config.remote {
        RemoteConfig::Folder { path } => json!({ "kind": "folder", "path": path.display().to_string() }),
    };

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": engine.started_at_unix,
        "root": engine.root.display().to_string(),
        "remote": remote,
        "revision": revision,
        "committed_revision": engine.remote.committed_revision(),
        "tracked": tracked,
        "local_pending": engine.local.pending().len(),
        "remote_pending": engine.remote.pending().len(),
        "iterations": engine.applier.iterations(),
        "last_merge": last_merge,
        "socket": socket_path(&engine.home).display().to_string(),
    })
}

async fn enqueue_merge(
    merge_tx: &mpsc::Sender<MergeJob>,
    source: &'static str,
) -> Result<Option<MergeSummary>, DaemonError> {
    let (tx, rx) = oneshot::channel();
    merge_tx
        .send(MergeJob {
            source,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("merge queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("merge response"))?;
    outcome.map_err(DaemonError::Protocol)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the fmt subscriber (`RUST_LOG`, default `info`). Also receives
/// records logged through the `log` facade by the sync crate.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
