//! Drives real worker processes. The media engine is replaced by small shell scripts that emit
//! silence, so nothing here needs ffmpeg.

use std::{
    fs,
    os::unix::fs::{FileTypeExt as _, PermissionsExt as _},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use audio_worker::{
    config::SupervisorConfig,
    error::{Error, RegistryError, SpawnError},
    protocol::CommandRecord,
    registry::{Phase, Registry},
    spawn::{WorkerProgram, CHILD_READ_FD, CHILD_WRITE_FD},
    supervisor::{Supervisor, WorkerEvent, WorkerEventKind, STATUS_CHANNEL_LOST},
    worker::STATUS_ENGINE_UNAVAILABLE,
};
use tempfile::TempDir;
use tokio::{io::AsyncReadExt as _, sync::mpsc, time::timeout};

const LIMIT: Duration = Duration::from_secs(10);

/// Half a second of 48 kHz stereo s16le.
const SHORT_TRACK_BYTES: usize = 96_000;

struct Engines {
    endless: PathBuf,
    short: PathBuf,
}

/// Writes the stub engines once, before any test gets to spawn a process. A script that is still
/// open for writing while another thread forks cannot be executed.
fn engines() -> &'static Engines {
    static ENGINES: OnceLock<Engines> = OnceLock::new();
    ENGINES.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap().into_path();
        let script = |name: &str, body: &str| {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        Engines {
            endless: script("endless", "exec cat /dev/zero"),
            short: script(
                "short",
                &format!("exec head -c {SHORT_TRACK_BYTES} /dev/zero"),
            ),
        }
    })
}

fn supervisor(
    engine: &Path,
) -> (
    TempDir,
    Supervisor,
    mpsc::UnboundedReceiver<WorkerEvent>,
) {
    supervisor_running(
        engine,
        WorkerProgram::Path(PathBuf::from(env!("CARGO_BIN_EXE_audio-worker"))),
    )
}

fn supervisor_running(
    engine: &Path,
    worker_program: WorkerProgram,
) -> (
    TempDir,
    Supervisor,
    mpsc::UnboundedReceiver<WorkerEvent>,
) {
    engines();
    let fifo_dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig {
        fifo_dir: fifo_dir.path().to_path_buf(),
        engine: engine.to_path_buf(),
        worker_program,
        ..SupervisorConfig::default()
    };
    let (supervisor, events) = Supervisor::new(config, Arc::new(Registry::new()));
    (fifo_dir, supervisor, events)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEventKind {
    timeout(LIMIT, events.recv())
        .await
        .expect("no event in time")
        .expect("event stream closed")
        .kind
}

fn fd_is_open(fd: i32) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// How many descriptors in a `/proc/<pid>/fd` directory refer to `target`.
#[cfg(target_os = "linux")]
fn descriptors_on(fd_dir: &str, target: &Path) -> usize {
    fs::read_dir(fd_dir)
        .unwrap()
        .filter_map(|entry| fs::read_link(entry.ok()?.path()).ok())
        .filter(|link| link == target)
        .count()
}

/// Whether a live process still has `fifo` as its audio FIFO in its environment.
#[cfg(target_os = "linux")]
fn process_using(fifo: &Path) -> bool {
    let needle = format!("AUDIO_WORKER_FIFO={}", fifo.display());
    fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|entry| fs::read(entry.path().join("environ")).ok())
        .any(|environ| {
            environ
                .split(|&b| b == 0)
                .any(|var| var == needle.as_bytes())
        })
}

async fn wait_for_phase(supervisor: &Supervisor, id: &str, phase: Phase) {
    timeout(LIMIT, async {
        while supervisor.registry().lookup(id).unwrap().phase != phase {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never reached {phase:?}"));
}

#[tokio::test]
async fn spawn_shutdown_and_reap() {
    let (_dir, supervisor, mut events) = supervisor(&engines().endless);

    let state = supervisor
        .spawn(CommandRecord::create_processor("w1", "/tmp/a.mp3"))
        .await
        .unwrap();
    assert_eq!(state.id, "w1");
    let pid = state.pid.expect("worker has no pid");
    let descriptors = state.descriptors.unwrap();
    assert!(fd_is_open(descriptors.parent_read));
    assert!(fd_is_open(descriptors.parent_write));
    assert!(pid > 0);
    let fifo = state.audio_stream_fifo_path.clone();
    assert!(fs::metadata(&fifo).unwrap().file_type().is_fifo());

    #[cfg(target_os = "linux")]
    {
        // The worker holds its ends at the fixed numbers.
        let fds = PathBuf::from(format!("/proc/{pid}/fd"));
        assert!(fds.join(CHILD_READ_FD.to_string()).exists());
        assert!(fds.join(CHILD_WRITE_FD.to_string()).exists());

        // Each pipe has exactly one end in each process: the parent reads what the worker writes
        // on its fixed write end, and the other way around.
        let worker_fds = format!("/proc/{pid}/fd");
        for (parent_fd, worker_fd) in [
            (descriptors.parent_read, CHILD_WRITE_FD),
            (descriptors.parent_write, CHILD_READ_FD),
        ] {
            let pipe = fs::read_link(format!("/proc/self/fd/{parent_fd}")).unwrap();
            assert!(pipe.to_string_lossy().starts_with("pipe:["), "{pipe:?}");
            assert_eq!(fs::read_link(fds.join(worker_fd.to_string())).unwrap(), pipe);
            assert_eq!(descriptors_on("/proc/self/fd", &pipe), 1);
            assert_eq!(descriptors_on(&worker_fds, &pipe), 1);
        }
        assert_ne!(
            fs::read_link(format!("/proc/self/fd/{}", descriptors.parent_read)).unwrap(),
            fs::read_link(format!("/proc/self/fd/{}", descriptors.parent_write)).unwrap(),
        );
    }

    assert_eq!(supervisor.wait_ready("w1", LIMIT).await.unwrap(), 0);
    assert_eq!(next_event(&mut events).await, WorkerEventKind::Ready(0));

    let mut audio = supervisor.open_audio_stream("w1").unwrap();
    assert_eq!(
        supervisor.registry().lookup("w1").unwrap().phase,
        Phase::Running
    );
    let mut buf = [0xffu8; 4096];
    audio.read_exact(&mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    // Live updates are accepted while streaming.
    let mut update = CommandRecord::update("w1");
    update.volume = Some(50);
    update.seek = Some("0:01".into());
    supervisor.send("w1", update).unwrap();
    supervisor.wake("w1").unwrap();

    supervisor.shutdown("w1").unwrap();
    assert_eq!(
        timeout(LIMIT, supervisor.wait_exit("w1")).await.unwrap().unwrap(),
        0
    );
    assert_eq!(next_event(&mut events).await, WorkerEventKind::Finished);

    let reaped = supervisor.reap("w1").await.unwrap();
    assert_eq!(reaped.phase, Phase::Reaped);
    assert_eq!(reaped.ready, Some(0));
    assert!(!fifo.exists());
    assert!(matches!(
        supervisor.registry().lookup("w1"),
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn track_end_finishes_the_worker() {
    let (_dir, supervisor, mut events) = supervisor(&engines().short);

    let state = supervisor
        .spawn(CommandRecord::create_processor("", "/tmp/short.ogg"))
        .await
        .unwrap();
    let id = state.id;
    assert!(id.starts_with("w-"));

    assert_eq!(supervisor.wait_ready(&id, LIMIT).await.unwrap(), 0);
    let mut audio = supervisor.open_audio_stream(&id).unwrap();
    let mut received = Vec::new();
    timeout(LIMIT, audio.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), SHORT_TRACK_BYTES);

    assert_eq!(next_event(&mut events).await, WorkerEventKind::Ready(0));
    assert_eq!(next_event(&mut events).await, WorkerEventKind::Finished);
    assert_eq!(supervisor.wait_exit(&id).await.unwrap(), 0);
    supervisor.reap(&id).await.unwrap();
}

#[tokio::test]
async fn missing_engine_reports_a_failed_start() {
    let (_dir, supervisor, mut events) = supervisor(Path::new("/nonexistent/engine"));

    let state = supervisor
        .spawn(CommandRecord::create_processor("w2", "/tmp/a.mp3"))
        .await
        .unwrap();
    let status = supervisor.wait_ready("w2", LIMIT).await.unwrap();
    assert_eq!(status, STATUS_ENGINE_UNAVAILABLE);
    assert_eq!(
        supervisor.registry().lookup("w2").unwrap().phase,
        Phase::Failed
    );
    assert_eq!(
        next_event(&mut events).await,
        WorkerEventKind::Ready(STATUS_ENGINE_UNAVAILABLE)
    );
    assert!(matches!(
        next_event(&mut events).await,
        WorkerEventKind::Failed(_)
    ));
    assert_eq!(
        supervisor.wait_exit("w2").await.unwrap(),
        STATUS_ENGINE_UNAVAILABLE
    );

    supervisor.reap("w2").await.unwrap();
    assert!(!state.audio_stream_fifo_path.exists());
}

#[tokio::test]
async fn live_ids_cannot_be_reused() {
    let (_dir, supervisor, _events) = supervisor(&engines().endless);

    let state = supervisor
        .spawn(CommandRecord::create_processor("w3", "/tmp/a.mp3"))
        .await
        .unwrap();
    let err = supervisor
        .spawn(CommandRecord::create_processor("w3", "/tmp/b.mp3"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SpawnError::Registry(RegistryError::DuplicateId(_))
    ));
    // The live worker keeps its FIFO.
    assert!(state.audio_stream_fifo_path.exists());

    let reaped = supervisor.teardown("w3").await.unwrap();
    assert_eq!(reaped.phase, Phase::Reaped);
    assert!(!state.audio_stream_fifo_path.exists());

    // Reaped ids are free again.
    supervisor
        .spawn(CommandRecord::create_processor("w3", "/tmp/b.mp3"))
        .await
        .unwrap();
    supervisor.teardown("w3").await.unwrap();
}

#[tokio::test]
async fn waiting_for_an_unknown_worker_fails() {
    let (_dir, supervisor, _events) = supervisor(&engines().endless);
    let err = supervisor
        .wait_ready("missing-id", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Registry(RegistryError::NotFound(ref id)) if id == "missing-id"
    ));
}

#[tokio::test]
async fn killed_worker_is_reported_failed() {
    let (_dir, supervisor, mut events) = supervisor(&engines().endless);

    let state = supervisor
        .spawn(CommandRecord::create_processor("w4", "/tmp/a.mp3"))
        .await
        .unwrap();
    let pid = state.pid.unwrap();
    assert_eq!(supervisor.wait_ready("w4", LIMIT).await.unwrap(), 0);
    assert_eq!(next_event(&mut events).await, WorkerEventKind::Ready(0));

    let mut audio = supervisor.open_audio_stream("w4").unwrap();
    let mut buf = [0u8; 4096];
    audio.read_exact(&mut buf).await.unwrap();

    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) }, 0);

    match next_event(&mut events).await {
        WorkerEventKind::Failed(reason) => assert!(reason.contains("137"), "{reason}"),
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_phase(&supervisor, "w4", Phase::Failed).await;
    assert_eq!(supervisor.wait_exit("w4").await.unwrap(), 128 + libc::SIGKILL);

    drop(audio);
    let reaped = supervisor.reap("w4").await.unwrap();
    assert_eq!(reaped.phase, Phase::Reaped);
    assert!(!state.audio_stream_fifo_path.exists());
}

#[tokio::test]
async fn lost_channel_releases_readiness_waiters() {
    // A program that exits without ever reading its create record.
    let quitter = which::which("true").unwrap();
    let (_dir, supervisor, _events) =
        supervisor_running(&engines().endless, WorkerProgram::Path(quitter));

    let state = supervisor
        .spawn(CommandRecord::create_processor("w5", "/tmp/a.mp3"))
        .await
        .unwrap();

    // Far from the ready timeout: the waiter is released by the channel going away.
    let status = timeout(LIMIT, supervisor.wait_ready("w5", Duration::from_secs(600)))
        .await
        .expect("waiter was not released")
        .unwrap();
    assert_eq!(status, STATUS_CHANNEL_LOST);
    wait_for_phase(&supervisor, "w5", Phase::Failed).await;

    supervisor.reap("w5").await.unwrap();
    assert!(!state.audio_stream_fifo_path.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_racing_reap_leaves_nothing_behind() {
    let (dir, supervisor, _events) = supervisor(&engines().endless);
    let supervisor = Arc::new(supervisor);

    for round in 0..20 {
        let id = format!("race-{round}");
        let fifo = audio_worker::fifo::fifo_path(dir.path(), &id);

        let reaper = {
            let supervisor = supervisor.clone();
            let id = id.clone();
            tokio::spawn(async move {
                // Keep reaping until something was there to reap.
                while supervisor.reap(&id).await.is_err() {
                    tokio::task::yield_now().await;
                }
            })
        };
        let spawned = supervisor
            .spawn(CommandRecord::create_processor(&id, "/tmp/a.mp3"))
            .await;
        match spawned {
            Ok(_) => {}
            Err(SpawnError::Registry(RegistryError::NotFound(_))) => {}
            Err(e) => panic!("unexpected spawn error: {e}"),
        }
        timeout(LIMIT, reaper).await.unwrap().unwrap();

        assert!(!fifo.exists(), "{id} left its fifo behind");
        timeout(LIMIT, async {
            while process_using(&fifo) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} left its worker running"));
    }
}
