//! Per-session attendance controller.
//!
//! State machine `Idle -> Running -> Stopped`. `start` opens the video source
//! and spawns two threads:
//!
//! - the capture loop pulls frames, renders each frame the preview sink
//!   asks for and runs detection + matching on every Nth frame, emitting a
//!   [`MatchEvent`] per identified face that is not yet marked;
//! - the attendance consumer owns the marked set, performs the
//!   `mark_attendance` writes and publishes marked-set snapshots back to the
//!   loop (for overlay colours) and to `status()`/`stop()`.
//!
//! The event queue is bounded and the loop never waits on it: when the queue
//! is full the event is dropped and the face is picked up again on a later
//! detection cycle.

use crate::overlay;
use chrono::{DateTime, Local};
use presence_core::{FaceRegion, FeatureExtractor, Identification, KnownSetCell, Matcher};
use presence_hw::{PreviewSink, SourceError, VideoSource};
use presence_store::{AttendanceStore, SessionStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

// --- Named constants ---
const DEFAULT_THROTTLE: u32 = 5;
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);
const DEFAULT_EVENT_QUEUE: usize = 64;
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("invalid session state: expected {expected:?}, controller is {actual:?}")]
    SessionState {
        expected: ControllerState,
        actual: ControllerState,
    },
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ControllerState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl ControllerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ControllerState::Idle,
            1 => ControllerState::Running,
            _ => ControllerState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Run detection on every Nth frame.
    pub throttle: u32,
    /// How long `stop` waits for each worker thread.
    pub stop_grace: Duration,
    /// Capacity of the loop-to-consumer event queue.
    pub event_queue: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            stop_grace: DEFAULT_STOP_GRACE,
            event_queue: DEFAULT_EVENT_QUEUE,
        }
    }
}

/// A face identified during a detection cycle.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub student_id: i64,
    pub display_name: String,
    pub confidence: f32,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub marked_count: usize,
    pub marked_ids: Vec<i64>,
}

impl SessionSummary {
    fn from_marked(marked: &BTreeSet<i64>) -> Self {
        Self {
            marked_count: marked.len(),
            marked_ids: marked.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub session_id: Option<i64>,
    pub marked_count: usize,
    pub marked_ids: Vec<i64>,
    pub frames_read: u64,
    pub detection_cycles: u64,
}

type MarkedSnapshot = Arc<BTreeSet<i64>>;

#[derive(Default)]
struct LoopCounters {
    frames_read: AtomicU64,
    detection_cycles: AtomicU64,
}

struct Workers {
    capture: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// Drives one attendance session. A new session needs a new controller.
pub struct SessionController {
    extractor: Arc<FeatureExtractor>,
    matcher: Arc<dyn Matcher + Send + Sync>,
    attendance: Arc<dyn AttendanceStore>,
    sessions: Arc<dyn SessionStore>,
    options: ControllerOptions,
    source: Option<Box<dyn VideoSource>>,
    preview: Option<Box<dyn PreviewSink>>,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    counters: Arc<LoopCounters>,
    marked: Option<watch::Receiver<MarkedSnapshot>>,
    session_id: Option<i64>,
    workers: Option<Workers>,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractor: Arc<FeatureExtractor>,
        matcher: Arc<dyn Matcher + Send + Sync>,
        attendance: Arc<dyn AttendanceStore>,
        sessions: Arc<dyn SessionStore>,
        source: Box<dyn VideoSource>,
        preview: Box<dyn PreviewSink>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            extractor,
            matcher,
            attendance,
            sessions,
            options: ControllerOptions {
                throttle: options.throttle.max(1),
                event_queue: options.event_queue.max(1),
                ..options
            },
            source: Some(source),
            preview: Some(preview),
            state: Arc::new(AtomicU8::new(ControllerState::Idle as u8)),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(LoopCounters::default()),
            marked: None,
            session_id: None,
            workers: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Open the source and launch the capture loop. Returns without waiting
    /// for the loop.
    pub fn start(&mut self, session_id: i64, known: Arc<KnownSetCell>) -> Result<(), ControllerError> {
        let actual = self.state();
        if actual != ControllerState::Idle {
            return Err(ControllerError::SessionState {
                expected: ControllerState::Idle,
                actual,
            });
        }

        let (Some(mut source), Some(preview)) = (self.source.take(), self.preview.take()) else {
            return Err(ControllerError::SessionState {
                expected: ControllerState::Idle,
                actual: ControllerState::Stopped,
            });
        };

        if let Err(e) = source.open() {
            tracing::warn!(source = %source.describe(), error = %e, "failed to open video source");
            self.source = Some(source);
            self.preview = Some(preview);
            return Err(ControllerError::CameraUnavailable(e.to_string()));
        }

        let (event_tx, event_rx) = mpsc::channel::<MatchEvent>(self.options.event_queue);
        let (marked_tx, marked_rx) = watch::channel::<MarkedSnapshot>(Arc::new(BTreeSet::new()));

        self.running.store(true, Ordering::Release);
        self.state.store(ControllerState::Running as u8, Ordering::Release);
        self.session_id = Some(session_id);
        self.marked = Some(marked_rx.clone());

        let consumer = AttendanceConsumer {
            session_id,
            attendance: Arc::clone(&self.attendance),
            sessions: Arc::clone(&self.sessions),
            marked_tx,
        };
        let consumer = match std::thread::Builder::new()
            .name("presence-attendance".into())
            .spawn(move || consumer.run(event_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                source.close();
                self.running.store(false, Ordering::Release);
                self.state.store(ControllerState::Idle as u8, Ordering::Release);
                self.source = Some(source);
                self.preview = Some(preview);
                return Err(ControllerError::Spawn(e));
            }
        };

        let capture = CaptureLoop {
            session_id,
            extractor: Arc::clone(&self.extractor),
            matcher: Arc::clone(&self.matcher),
            known,
            source,
            preview,
            throttle: self.options.throttle,
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            events: event_tx,
            marked: marked_rx,
        };
        let capture = match std::thread::Builder::new()
            .name("presence-capture".into())
            .spawn(move || capture.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                // The consumer sees the closed channel, ends the session and exits.
                self.running.store(false, Ordering::Release);
                self.state.store(ControllerState::Stopped as u8, Ordering::Release);
                return Err(ControllerError::Spawn(e));
            }
        };

        self.workers = Some(Workers { capture, consumer });
        tracing::info!(session_id, throttle = self.options.throttle, "session started");
        Ok(())
    }

    /// Signal the loop to exit, wait up to the grace period for it to release
    /// the source, and report who was marked present.
    ///
    /// Outside `Running` this does nothing and returns an empty summary.
    pub fn stop(&mut self) -> SessionSummary {
        if self.state() != ControllerState::Running {
            self.reap_finished_workers();
            return SessionSummary::default();
        }

        self.running.store(false, Ordering::Release);

        if let Some(workers) = self.workers.take() {
            let deadline = Instant::now() + self.options.stop_grace;
            if join_until(workers.capture, deadline, "capture") {
                // Consumer exits once the loop drops its sender and the queue drains.
                let deadline = Instant::now() + self.options.stop_grace;
                join_until(workers.consumer, deadline, "attendance");
            }
        }

        self.state.store(ControllerState::Stopped as u8, Ordering::Release);
        let summary = self.summary();
        tracing::info!(
            session_id = ?self.session_id,
            marked = summary.marked_count,
            "session stopped"
        );
        summary
    }

    /// Latest published marked set, whatever the state.
    pub fn summary(&self) -> SessionSummary {
        match &self.marked {
            Some(rx) => SessionSummary::from_marked(&rx.borrow()),
            None => SessionSummary::default(),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        let summary = self.summary();
        ControllerStatus {
            state: self.state(),
            session_id: self.session_id,
            marked_count: summary.marked_count,
            marked_ids: summary.marked_ids,
            frames_read: self.counters.frames_read.load(Ordering::Relaxed),
            detection_cycles: self.counters.detection_cycles.load(Ordering::Relaxed),
        }
    }

    /// Join workers of a loop that already ended on its own, so the consumer
    /// has drained before `summary()` is read.
    fn reap_finished_workers(&mut self) {
        if let Some(workers) = self.workers.take() {
            let deadline = Instant::now() + self.options.stop_grace;
            if join_until(workers.capture, deadline, "capture") {
                join_until(workers.consumer, deadline, "attendance");
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Join `handle` if it finishes before `deadline`; otherwise detach it.
fn join_until(handle: JoinHandle<()>, deadline: Instant, name: &str) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(worker = name, "worker did not finish within grace period; detaching");
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        tracing::error!(worker = name, "worker panicked");
    }
    true
}

/// Owns the source for the lifetime of the loop.
struct CaptureLoop {
    session_id: i64,
    extractor: Arc<FeatureExtractor>,
    matcher: Arc<dyn Matcher + Send + Sync>,
    known: Arc<KnownSetCell>,
    source: Box<dyn VideoSource>,
    preview: Box<dyn PreviewSink>,
    throttle: u32,
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    counters: Arc<LoopCounters>,
    events: mpsc::Sender<MatchEvent>,
    marked: watch::Receiver<MarkedSnapshot>,
}

impl CaptureLoop {
    fn run(mut self) {
        tracing::info!(session_id = self.session_id, source = %self.source.describe(), "capture loop started");

        let mut frame_index: u64 = 0;
        let mut boxes: Vec<(FaceRegion, Option<i64>)> = Vec::new();

        while self.running.load(Ordering::Acquire) {
            let frame = match self.source.read_frame() {
                Ok(frame) => frame,
                Err(SourceError::EndOfStream) => {
                    tracing::info!(session_id = self.session_id, "video source ended");
                    break;
                }
                Err(e) => {
                    tracing::warn!(session_id = self.session_id, error = %e, "frame read failed; ending capture loop");
                    break;
                }
            };
            self.counters.frames_read.fetch_add(1, Ordering::Relaxed);

            if frame_index % self.throttle as u64 == 0 {
                self.counters.detection_cycles.fetch_add(1, Ordering::Relaxed);
                boxes = self.detection_cycle(&frame.image);
            }
            frame_index += 1;

            if self.preview.wants_frame() {
                let marked = Arc::clone(&self.marked.borrow());
                let annotated = overlay::annotate(&frame.image, &boxes, &marked);
                if let Err(e) = self.preview.render_frame(annotated) {
                    tracing::debug!(error = %e, "preview render failed");
                }
            }
        }

        self.source.close();
        self.running.store(false, Ordering::Release);
        let _ = self.state.compare_exchange(
            ControllerState::Running as u8,
            ControllerState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::info!(
            session_id = self.session_id,
            frames = self.counters.frames_read.load(Ordering::Relaxed),
            "capture loop exited"
        );
    }

    /// Detect, encode and identify every face; queue the unmarked ones.
    fn detection_cycle(&self, image: &image::RgbImage) -> Vec<(FaceRegion, Option<i64>)> {
        let snapshot = self.known.snapshot();
        let marked = Arc::clone(&self.marked.borrow());
        let threshold = self.extractor.match_threshold();
        let mut boxes = Vec::new();

        for region in self.extractor.detect_faces(image) {
            let vector = match self.extractor.encode_region(image, &region) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(?region, error = %e, "skipping face this cycle");
                    boxes.push((region, None));
                    continue;
                }
            };

            let identification = match self.matcher.identify(&vector, &snapshot, threshold) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot match face against known set");
                    boxes.push((region, None));
                    continue;
                }
            };

            match identification {
                Identification::Known {
                    id,
                    display_name,
                    confidence,
                    ..
                } => {
                    boxes.push((region, Some(id)));
                    if !marked.contains(&id) {
                        self.emit(MatchEvent {
                            student_id: id,
                            display_name,
                            confidence,
                            timestamp: Local::now(),
                        });
                    }
                }
                Identification::Unknown => boxes.push((region, None)),
            }
        }

        boxes
    }

    fn emit(&self, event: MatchEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(student_id = event.student_id, "event queue full; dropping match");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("attendance consumer gone; match not recorded");
            }
        }
    }
}

/// Sole owner of the marked set and of attendance writes.
struct AttendanceConsumer {
    session_id: i64,
    attendance: Arc<dyn AttendanceStore>,
    sessions: Arc<dyn SessionStore>,
    marked_tx: watch::Sender<MarkedSnapshot>,
}

impl AttendanceConsumer {
    fn run(self, mut events: mpsc::Receiver<MatchEvent>) {
        let mut marked: BTreeSet<i64> = BTreeSet::new();
        // Already present in the store from an earlier run; never written again.
        let mut preexisting: HashSet<i64> = HashSet::new();

        while let Some(event) = events.blocking_recv() {
            if marked.contains(&event.student_id) || preexisting.contains(&event.student_id) {
                continue;
            }
            match self.attendance.mark_attendance(self.session_id, event.student_id) {
                Ok(true) => {
                    marked.insert(event.student_id);
                    self.marked_tx.send_replace(Arc::new(marked.clone()));
                    tracing::info!(
                        session_id = self.session_id,
                        student_id = event.student_id,
                        name = %event.display_name,
                        confidence = event.confidence,
                        at = %event.timestamp.format("%H:%M:%S"),
                        "attendance marked"
                    );
                }
                Ok(false) => {
                    tracing::debug!(student_id = event.student_id, "attendance already recorded");
                    preexisting.insert(event.student_id);
                }
                Err(e) => {
                    tracing::warn!(student_id = event.student_id, error = %e, "failed to record attendance");
                }
            }
        }

        if let Err(e) = self.sessions.end_session(self.session_id) {
            tracing::warn!(session_id = self.session_id, error = %e, "failed to end session");
        }
        tracing::debug!(session_id = self.session_id, marked = marked.len(), "attendance consumer exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use parking_lot::Mutex;
    use presence_core::fixtures::{self, frame_with_palettes, Palette};
    use presence_core::EuclideanMatcher;
    use presence_hw::{Frame, PreviewError};
    use presence_store::{IdentityStore, NewStudent, SqliteStore, StoreError};
    use std::sync::atomic::AtomicUsize;

    /// Replays fixed frames; optionally loops forever.
    struct ScriptedSource {
        frames: Vec<RgbImage>,
        looping: bool,
        available: bool,
        cursor: usize,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<RgbImage>, looping: bool) -> Self {
            Self {
                frames,
                looping,
                available: true,
                cursor: 0,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl VideoSource for ScriptedSource {
        fn open(&mut self) -> Result<(), SourceError> {
            if self.available {
                Ok(())
            } else {
                Err(SourceError::Unavailable("no such camera".into()))
            }
        }

        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            if self.cursor >= self.frames.len() {
                if !self.looping {
                    return Err(SourceError::EndOfStream);
                }
                self.cursor = 0;
                std::thread::sleep(Duration::from_millis(1));
            }
            let frame = Frame::new(self.frames[self.cursor].clone(), self.cursor as u32);
            self.cursor += 1;
            Ok(frame)
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Serves `ready` frames, then blocks in `read_frame` for `stall`.
    struct StallingSource {
        frame: RgbImage,
        ready: usize,
        stall: Duration,
        reads: Arc<AtomicUsize>,
    }

    impl VideoSource for StallingSource {
        fn open(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n >= self.ready {
                std::thread::sleep(self.stall);
                return Err(SourceError::EndOfStream);
            }
            Ok(Frame::new(self.frame.clone(), n as u32))
        }

        fn close(&mut self) {}

        fn describe(&self) -> String {
            "stalling".into()
        }
    }

    struct CountingPreview {
        rendered: Arc<AtomicUsize>,
        fail: bool,
        wants: bool,
    }

    impl PreviewSink for CountingPreview {
        fn wants_frame(&mut self) -> bool {
            self.wants
        }

        fn render_frame(&mut self, _frame: RgbImage) -> Result<(), PreviewError> {
            self.rendered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PreviewError::Io(std::io::Error::other("display gone")));
            }
            Ok(())
        }
    }

    /// Store wrapper that counts attendance writes.
    struct CountingStore {
        inner: SqliteStore,
        mark_calls: Mutex<Vec<(i64, i64)>>,
    }

    impl AttendanceStore for CountingStore {
        fn mark_attendance(&self, session_id: i64, student_id: i64) -> Result<bool, StoreError> {
            self.mark_calls.lock().push((session_id, student_id));
            self.inner.mark_attendance(session_id, student_id)
        }
    }

    impl SessionStore for CountingStore {
        fn create_session(&self, professor_id: i64, subject: &str) -> Result<i64, StoreError> {
            self.inner.create_session(professor_id, subject)
        }

        fn end_session(&self, session_id: i64) -> Result<(), StoreError> {
            self.inner.end_session(session_id)
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        known: Arc<KnownSetCell>,
        extractor: Arc<FeatureExtractor>,
        session_id: i64,
        student_id: i64,
        rendered: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let extractor = Arc::new(fixtures::fixture_extractor());
        let store = Arc::new(CountingStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            mark_calls: Mutex::new(Vec::new()),
        });

        let enrolled = extractor
            .enroll(&frame_with_palettes(&[(40, 30, 48, Palette::DEFAULT)]))
            .unwrap();
        let student_id = store
            .inner
            .add_student(&NewStudent {
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                photo_path: None,
                vector: enrolled.vector,
            })
            .unwrap();

        let known = Arc::new(KnownSetCell::new(extractor.empty_known_set()));
        known.reload(store.inner.list_identities().unwrap());

        let professor = store.inner.add_professor("Alan", "Turing", "Logic").unwrap();
        let session_id = store.create_session(professor, "Logic").unwrap();

        Harness {
            store,
            known,
            extractor,
            session_id,
            student_id,
            rendered: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn controller_with(
        h: &Harness,
        source: Box<dyn VideoSource>,
        preview: CountingPreview,
        options: ControllerOptions,
    ) -> SessionController {
        SessionController::new(
            Arc::clone(&h.extractor),
            Arc::new(EuclideanMatcher),
            h.store.clone(),
            h.store.clone(),
            source,
            Box::new(preview),
            options,
        )
    }

    fn controller(h: &Harness, source: ScriptedSource, fail_preview: bool) -> SessionController {
        let preview = CountingPreview {
            rendered: Arc::clone(&h.rendered),
            fail: fail_preview,
            wants: true,
        };
        controller_with(h, Box::new(source), preview, ControllerOptions::default())
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn known_face() -> RgbImage {
        frame_with_palettes(&[(40, 30, 48, Palette::DEFAULT)])
    }

    fn stranger() -> RgbImage {
        frame_with_palettes(&[(40, 30, 48, Palette::ALT)])
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let h = harness();
        let mut c = controller(&h, ScriptedSource::new(vec![known_face()], false), false);
        assert_eq!(c.stop(), SessionSummary { marked_count: 0, marked_ids: vec![] });
        assert_eq!(c.state(), ControllerState::Idle);
    }

    #[test]
    fn test_start_with_unavailable_camera_stays_idle() {
        let h = harness();
        let mut source = ScriptedSource::new(vec![known_face()], false);
        source.available = false;
        let mut c = controller(&h, source, false);

        let err = c.start(h.session_id, Arc::clone(&h.known)).unwrap_err();
        assert!(matches!(err, ControllerError::CameraUnavailable(_)));
        assert_eq!(c.state(), ControllerState::Idle);
    }

    #[test]
    fn test_start_while_running_fails() {
        let h = harness();
        let mut c = controller(&h, ScriptedSource::new(vec![stranger()], true), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();

        let err = c.start(h.session_id, Arc::clone(&h.known)).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::SessionState {
                expected: ControllerState::Idle,
                actual: ControllerState::Running
            }
        ));
        assert_eq!(c.state(), ControllerState::Running);

        c.stop();
        assert_eq!(c.state(), ControllerState::Stopped);
    }

    #[test]
    fn test_marks_known_face_exactly_once() {
        let h = harness();
        let source = ScriptedSource::new(vec![known_face()], true);
        let closed = Arc::clone(&source.closed);
        let mut c = controller(&h, source, false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();

        // Let several detection cycles re-detect the same face.
        wait_until(|| c.status().marked_count == 1 && c.status().detection_cycles >= 4);
        let summary = c.stop();

        assert_eq!(summary.marked_ids, vec![h.student_id]);
        assert_eq!(c.state(), ControllerState::Stopped);
        assert!(closed.load(Ordering::SeqCst), "source released on stop");
        assert_eq!(h.store.inner.session_attendance(h.session_id).unwrap().len(), 1);
        assert_eq!(h.store.mark_calls.lock().len(), 1);
        assert!(h.store.inner.session(h.session_id).unwrap().unwrap().end_time.is_some());
    }

    #[test]
    fn test_stop_after_stop_is_noop() {
        let h = harness();
        let mut c = controller(&h, ScriptedSource::new(vec![known_face()], true), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.status().marked_count == 1);
        assert_eq!(c.stop().marked_count, 1);
        assert_eq!(c.stop(), SessionSummary::default());
        assert!(c.start(h.session_id, Arc::clone(&h.known)).is_err());
    }

    #[test]
    fn test_end_of_stream_stops_loop() {
        let h = harness();
        let frames = vec![known_face(); 3];
        let mut c = controller(&h, ScriptedSource::new(frames, false), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();

        wait_until(|| c.state() == ControllerState::Stopped);
        // The loop already stopped itself; stop() has nothing to do.
        assert_eq!(c.stop(), SessionSummary::default());

        wait_until(|| h.store.inner.session(h.session_id).unwrap().unwrap().end_time.is_some());
        assert_eq!(c.summary().marked_ids, vec![h.student_id]);
        assert_eq!(h.rendered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_detection_is_throttled() {
        let h = harness();
        let frames = vec![stranger(); 11];
        let mut c = controller(&h, ScriptedSource::new(frames, false), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.state() == ControllerState::Stopped);

        let status = c.status();
        assert_eq!(status.frames_read, 11);
        // Frames 0, 5 and 10.
        assert_eq!(status.detection_cycles, 3);
        assert_eq!(h.rendered.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_unknown_face_is_not_marked() {
        let h = harness();
        let frames = vec![stranger(); 6];
        let mut c = controller(&h, ScriptedSource::new(frames, false), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.state() == ControllerState::Stopped);
        wait_until(|| h.store.inner.session(h.session_id).unwrap().unwrap().end_time.is_some());

        assert_eq!(c.summary(), SessionSummary::default());
        assert!(h.store.mark_calls.lock().is_empty());
    }

    #[test]
    fn test_preview_failures_are_ignored() {
        let h = harness();
        let mut c = controller(&h, ScriptedSource::new(vec![known_face()], true), true);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.status().marked_count == 1);
        assert_eq!(c.stop().marked_ids, vec![h.student_id]);
    }

    #[test]
    fn test_stop_gives_up_on_stuck_source_after_grace() {
        let h = harness();
        let reads = Arc::new(AtomicUsize::new(0));
        let source = StallingSource {
            frame: known_face(),
            ready: 1,
            stall: Duration::from_secs(5),
            reads: Arc::clone(&reads),
        };
        let preview = CountingPreview {
            rendered: Arc::clone(&h.rendered),
            fail: false,
            wants: true,
        };
        let grace = Duration::from_millis(200);
        let options = ControllerOptions {
            stop_grace: grace,
            ..ControllerOptions::default()
        };
        let mut c = controller_with(&h, Box::new(source), preview, options);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();

        // First frame marks the student; the second read never returns in time.
        wait_until(|| c.status().marked_count == 1 && reads.load(Ordering::SeqCst) >= 2);

        let began = Instant::now();
        let summary = c.stop();
        let elapsed = began.elapsed();

        assert!(elapsed >= grace, "returned before the grace period: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "stop waited on the stuck loop: {elapsed:?}");
        assert_eq!(c.state(), ControllerState::Stopped);
        assert_eq!(summary.marked_ids, vec![h.student_id]);
        assert_eq!(summary, c.summary());
    }

    #[test]
    fn test_unwanted_preview_frames_are_not_annotated() {
        let h = harness();
        let preview = CountingPreview {
            rendered: Arc::clone(&h.rendered),
            fail: false,
            wants: false,
        };
        let source = ScriptedSource::new(vec![known_face(); 4], false);
        let mut c = controller_with(&h, Box::new(source), preview, ControllerOptions::default());
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.state() == ControllerState::Stopped);

        assert_eq!(c.status().frames_read, 4);
        assert_eq!(h.rendered.load(Ordering::SeqCst), 0);
        // Detection still runs without a preview.
        wait_until(|| c.summary().marked_count == 1);
    }

    #[test]
    fn test_preexisting_record_is_not_rewritten() {
        let h = harness();
        assert!(h.store.inner.mark_attendance(h.session_id, h.student_id).unwrap());

        let frames = vec![known_face(); 16];
        let mut c = controller(&h, ScriptedSource::new(frames, false), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.state() == ControllerState::Stopped);
        wait_until(|| h.store.inner.session(h.session_id).unwrap().unwrap().end_time.is_some());

        // The store declined the duplicate, so nothing enters the marked set
        // and the store is asked only once.
        assert_eq!(c.summary(), SessionSummary::default());
        assert_eq!(h.store.mark_calls.lock().len(), 1);
        assert_eq!(h.store.inner.session_attendance(h.session_id).unwrap().len(), 1);
    }

    #[test]
    fn test_reload_is_picked_up_by_running_loop() {
        let h = harness();
        // Start with nobody known.
        h.known.reload(Vec::new());
        let mut c = controller(&h, ScriptedSource::new(vec![known_face()], true), false);
        c.start(h.session_id, Arc::clone(&h.known)).unwrap();
        wait_until(|| c.status().detection_cycles >= 2);
        assert_eq!(c.status().marked_count, 0);

        h.known.reload(h.store.inner.list_identities().unwrap());
        wait_until(|| c.status().marked_count == 1);
        assert_eq!(c.stop().marked_ids, vec![h.student_id]);
    }
}
