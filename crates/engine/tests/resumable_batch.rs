use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine::fingerprint::fingerprint;
use engine::policy::resolve;
use engine::scan::default_extensions;
use engine::{
    BatchError, BatchEvent, BatchObserver, CancellationController, Discoverer, DispatchOptions, Dispatcher,
    EncodingProfile, Ledger, NullObserver, RunState, SkipReason, TranscodeOutput, Transcoder,
};

/// Halves every input; fails any input whose name contains "broken"
#[derive(Default)]
struct FakeTranscoder {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
    /// Requested to stop after this many calls have started
    stop_after: Option<(usize, CancellationController)>,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(&self, input: &Path, output: &Path, _profile: &EncodingProfile) -> anyhow::Result<TranscodeOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some((n, cancel)) = &self.stop_after {
            if call == *n {
                cancel.request_stop();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = if input.to_string_lossy().contains("broken") {
            Ok(TranscodeOutput {
                success: false,
                exit_code: Some(1),
                diagnostics: "Invalid data found when processing input".to_string(),
            })
        } else {
            let data = fs::read(input)?;
            fs::write(output, &data[..data.len() / 2])?;
            Ok(TranscodeOutput {
                success: true,
                exit_code: Some(0),
                diagnostics: String::new(),
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct RecordingObserver {
    skipped: Mutex<Vec<(PathBuf, SkipReason)>>,
    finished: AtomicUsize,
}

impl BatchObserver for RecordingObserver {
    fn on_event(&self, event: &BatchEvent) {
        match event {
            BatchEvent::Skipped { path, reason, .. } => self.skipped.lock().unwrap().push((path.clone(), *reason)),
            BatchEvent::JobFinished { .. } => {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

fn write_video(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, name.repeat(200)).unwrap();
    path
}

struct Harness {
    media: tempfile::TempDir,
    ledger_path: PathBuf,
    _state: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let state = tempfile::tempdir().unwrap();
        Harness {
            media: tempfile::tempdir().unwrap(),
            ledger_path: state.path().join("process_log.json"),
            _state: state,
        }
    }

    fn root(&self) -> &Path {
        self.media.path()
    }

    fn files(&self) -> Box<dyn Iterator<Item = PathBuf> + Send> {
        Discoverer::new(self.root(), true, default_extensions()).unwrap().iter()
    }

    async fn run_with(
        &self,
        transcoder: Arc<FakeTranscoder>,
        observer: Arc<dyn BatchObserver>,
        cancel: CancellationController,
        options: DispatchOptions,
    ) -> Result<engine::Summary, BatchError> {
        let ledger = Arc::new(Ledger::load(&self.ledger_path)?);
        let dispatcher = Dispatcher::new(ledger, transcoder, observer, cancel, options)?;
        dispatcher.run(self.files(), &resolve("x265").unwrap()).await
    }

    async fn run(&self, transcoder: Arc<FakeTranscoder>, options: DispatchOptions) -> engine::Summary {
        self.run_with(transcoder, Arc::new(NullObserver), CancellationController::new(), options)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn second_run_transcodes_nothing() {
    let h = Harness::new();
    for name in ["a.mp4", "b.mkv", "season/c.avi"] {
        write_video(h.root(), name);
    }

    let transcoder = Arc::new(FakeTranscoder::default());
    let first = h.run(transcoder.clone(), DispatchOptions::default()).await;
    assert_eq!(first.processed, 3);
    assert_eq!(first.failed, 0);
    assert!(first.bytes_saved > 0);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 3);
    let ledger_after_first = fs::read(&h.ledger_path).unwrap();

    let observer = Arc::new(RecordingObserver::default());
    let second = h
        .run_with(
            transcoder.clone(),
            observer.clone(),
            CancellationController::new(),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    // The three inputs plus the three outputs written next to them
    assert_eq!(second.total_discovered, 6);
    assert_eq!(second.skipped, 6);
    assert_eq!(second.processed, 0);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 3);

    let skipped = observer.skipped.lock().unwrap();
    let previous_outputs = skipped.iter().filter(|(_, r)| *r == SkipReason::PreviousOutput).count();
    assert_eq!(previous_outputs, 3);

    // A run that only skips leaves the ledger untouched
    assert_eq!(fs::read(&h.ledger_path).unwrap(), ledger_after_first);
}

/// A log written by the earlier tool: keyed by relative name, output stored
/// relative to the scanned directory, no output fingerprint
fn write_legacy_log(h: &Harness, input_name: &str, input: &engine::FileFingerprint, output_name: &str, output_size: u64) {
    let log = format!(
        r#"{{"{}": {{"processed": true, "input_size": {}, "output_size": {}, "size_difference": {},
            "output_file": "{}", "input_hash": "{}"}}}}"#,
        input_name,
        input.size,
        output_size,
        input.size as i64 - output_size as i64,
        output_name,
        input.digest_hex()
    );
    fs::write(&h.ledger_path, log).unwrap();
}

#[tokio::test]
async fn legacy_log_outputs_are_not_transcoded() {
    let h = Harness::new();
    let input = write_video(h.root(), "season/a.mp4");
    let output = h.root().join("season/a_1080p_web.mp4");
    fs::write(&output, b"already encoded").unwrap();
    write_legacy_log(&h, "season/a.mp4", &fingerprint(&input).unwrap(), "season/a_1080p_web.mp4", 15);

    let transcoder = Arc::new(FakeTranscoder::default());
    let observer = Arc::new(RecordingObserver::default());
    let summary = h
        .run_with(
            transcoder.clone(),
            observer.clone(),
            CancellationController::new(),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.skipped, 2);
    let skipped = observer.skipped.lock().unwrap();
    assert!(skipped.contains(&(input, SkipReason::AlreadyProcessed)));
    assert!(skipped.contains(&(output, SkipReason::PreviousOutput)));
}

#[tokio::test]
async fn legacy_output_survives_deleted_input() {
    let h = Harness::new();
    let input = write_video(h.root(), "b.mkv");
    let input_fp = fingerprint(&input).unwrap();
    fs::remove_file(&input).unwrap();
    let output = h.root().join("b_1080p_web.mp4");
    fs::write(&output, b"already encoded").unwrap();
    write_legacy_log(&h, "b.mkv", &input_fp, "b_1080p_web.mp4", 15);

    let transcoder = Arc::new(FakeTranscoder::default());
    let summary = h
        .run(
            transcoder.clone(),
            DispatchOptions {
                delete_input: true,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.skipped, 1);
    assert!(output.exists());
    assert!(!h.root().join("b_1080p_web_1080p_web.mp4").exists());
}

#[tokio::test]
async fn renamed_input_is_still_skipped() {
    let h = Harness::new();
    let original = write_video(h.root(), "holiday.mp4");
    let transcoder = Arc::new(FakeTranscoder::default());
    h.run(transcoder.clone(), DispatchOptions::default()).await;

    let moved = h.root().join("archive/2019 holiday.mov");
    fs::create_dir_all(moved.parent().unwrap()).unwrap();
    fs::rename(&original, &moved).unwrap();

    let observer = Arc::new(RecordingObserver::default());
    let summary = h
        .run_with(
            transcoder.clone(),
            observer.clone(),
            CancellationController::new(),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(summary.processed, 0);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    let skipped = observer.skipped.lock().unwrap();
    assert!(skipped.contains(&(moved, SkipReason::AlreadyProcessed)));
}

#[tokio::test]
async fn force_rerun_redoes_inputs_but_not_outputs() {
    let h = Harness::new();
    write_video(h.root(), "a.mp4");
    write_video(h.root(), "b.mp4");

    let transcoder = Arc::new(FakeTranscoder::default());
    h.run(transcoder.clone(), DispatchOptions::default()).await;

    let forced = h
        .run(
            transcoder.clone(),
            DispatchOptions {
                force_rerun: true,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(forced.processed, 2);
    assert_eq!(forced.skipped, 2);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 4);
    assert_eq!(Ledger::load(&h.ledger_path).unwrap().len(), 2);
}

#[tokio::test]
async fn failed_jobs_are_recorded_and_retried() {
    let h = Harness::new();
    let good = write_video(h.root(), "good.mp4");
    let broken = write_video(h.root(), "broken.mp4");

    let transcoder = Arc::new(FakeTranscoder::default());
    let first = h.run(transcoder.clone(), DispatchOptions::default()).await;
    assert_eq!(first.processed, 1);
    assert_eq!(first.failed, 1);

    let ledger = Ledger::load(&h.ledger_path).unwrap();
    let entry = ledger.lookup(&fingerprint(&broken).unwrap()).unwrap();
    assert!(!entry.processed);
    assert!(entry.output_size.is_none());
    assert!(ledger.lookup(&fingerprint(&good).unwrap()).unwrap().processed);
    assert!(!h.root().join("broken_1080p_web.mp4").exists());
    assert!(!h.root().join("broken_1080p_web.mp4.part").exists());

    // Only the failed file is attempted again
    let second = h.run(transcoder.clone(), DispatchOptions::default()).await;
    assert_eq!(second.failed, 1);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stop_finishes_running_job_and_resumes_later() {
    let h = Harness::new();
    for i in 0..5 {
        write_video(h.root(), &format!("ep{}.mkv", i));
    }

    let cancel = CancellationController::new();
    let transcoder = Arc::new(FakeTranscoder {
        stop_after: Some((1, cancel.clone())),
        ..Default::default()
    });
    let summary = h
        .run_with(transcoder.clone(), Arc::new(NullObserver), cancel.clone(), DispatchOptions::default())
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.total_discovered, 5);
    assert_eq!(summary.not_started, 4);
    assert!(summary.settled() < summary.total_discovered);
    assert_eq!(summary.exit_code(false), 130);
    assert_eq!(cancel.state(), RunState::Stopped);

    // The in-flight job was committed before the run returned
    assert_eq!(Ledger::load(&h.ledger_path).unwrap().len(), 1);

    let resumed = h.run(transcoder.clone(), DispatchOptions::default()).await;
    assert!(!resumed.interrupted);
    assert_eq!(resumed.processed, 4);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn concurrent_jobs_respect_limit_and_never_duplicate() {
    let h = Harness::new();
    for i in 0..12 {
        write_video(h.root(), &format!("clip{:02}.mp4", i));
    }

    let transcoder = Arc::new(FakeTranscoder {
        delay: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    let observer = Arc::new(RecordingObserver::default());
    let summary = h
        .run_with(
            transcoder.clone(),
            observer.clone(),
            CancellationController::new(),
            DispatchOptions {
                concurrency: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.processed, 12);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 12);
    assert_eq!(observer.finished.load(Ordering::SeqCst), 12);
    assert!(transcoder.max_in_flight.load(Ordering::SeqCst) <= 4);

    let ledger = Ledger::load(&h.ledger_path).unwrap();
    assert_eq!(ledger.len(), 12);
    assert_eq!(ledger.snapshot_stats().processed_count, 12);
}

#[tokio::test]
async fn delete_input_happens_after_commit() {
    let h = Harness::new();
    let input = write_video(h.root(), "old.wmv");
    let fp = fingerprint(&input).unwrap();

    let summary = h
        .run(
            Arc::new(FakeTranscoder::default()),
            DispatchOptions {
                delete_input: true,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(summary.processed, 1);
    assert!(!input.exists());

    let entry = Ledger::load(&h.ledger_path).unwrap().lookup(&fp).unwrap();
    assert!(entry.processed);
    let output = PathBuf::from(entry.output_file.unwrap());
    assert!(output.exists());
    assert_eq!(entry.output_hash.unwrap(), fingerprint(&output).unwrap().to_string());
}

#[tokio::test]
async fn broken_inputs_are_never_deleted() {
    let h = Harness::new();
    let broken = write_video(h.root(), "broken.flv");

    h.run(
        Arc::new(FakeTranscoder::default()),
        DispatchOptions {
            delete_input: true,
            ..Default::default()
        },
    )
    .await;

    assert!(broken.exists());
}

#[tokio::test]
async fn outputs_go_to_output_dir() {
    let h = Harness::new();
    write_video(h.root(), "a.mp4");
    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("web");

    let summary = h
        .run(
            Arc::new(FakeTranscoder::default()),
            DispatchOptions {
                output_dir: Some(target.clone()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(summary.processed, 1);
    assert!(target.join("a_1080p_web.mp4").exists());
    assert!(!h.root().join("a_1080p_web.mp4").exists());
}

#[tokio::test]
async fn unwritable_ledger_aborts_the_run() {
    let h = Harness::new();
    write_video(h.root(), "a.mp4");
    write_video(h.root(), "b.mp4");

    let blocker = h.root().join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();
    let ledger = Arc::new(Ledger::empty(&blocker.join("process_log.json")));

    let dispatcher = Dispatcher::new(
        ledger,
        Arc::new(FakeTranscoder::default()),
        Arc::new(NullObserver),
        CancellationController::new(),
        DispatchOptions::default(),
    )
    .unwrap();
    let err = dispatcher
        .run(h.files(), &resolve("x265").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::LedgerWrite { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn corrupt_ledger_is_surfaced() {
    let h = Harness::new();
    write_video(h.root(), "a.mp4");
    fs::write(&h.ledger_path, "{ not json").unwrap();

    let err = h
        .run_with(
            Arc::new(FakeTranscoder::default()),
            Arc::new(NullObserver),
            CancellationController::new(),
            DispatchOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::LedgerCorruption { .. }));
    assert_eq!(fs::read_to_string(&h.ledger_path).unwrap(), "{ not json");
}
