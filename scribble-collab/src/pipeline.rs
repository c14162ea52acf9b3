//! Stroke continuity pipeline: raw pointer points in, `AddStroke` commands out.
//!
//! Architecture:
//! ```text
//!   push(StrokeInput) ──► bounded queue (drop oldest) ──► batcher
//!                                                          │ 10 items or 75ms
//!                                                          ▼
//!                                               ContinuityTracker::process_batch
//!                                                          │ ConnectedStroke per segment
//!                                                          ▼
//!                                            dispatcher (≤ 10 in flight, 2s each)
//!                                                          │
//!                                                          ▼
//!                                                  dyn CommandSink (router)
//! ```
//!
//! Batches are cut by count or time, whichever comes first, and processed
//! strictly in arrival order. Points reach the client in network-sized
//! chunks, so without splicing every chunk would render as its own stroke
//! with a visible seam. The tracker remembers where each user's last chunk
//! ended and, when the next one starts close by, soon after and with the
//! same brush, moves its first point onto that end.
//!
//! Performance targets:
//! | Operation                                 | Target   |
//! |-------------------------------------------|----------|
//! | process_batch, 10 points                  | < 5µs    |
//! | process_batch, 100 users × 10 points      | < 200µs  |
//!
//! Continuity state lives in memory only; losing it on restart costs a
//! seam, never data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};

use scribble_core::{
    Color, CommandResult, ConnectedStroke, Point, SessionCommand, SessionId, StrokeIdGenerator,
    StrokeWidth, UserId,
};

use crate::config::PipelineConfig;
use crate::region::SessionRouter;

/// One client drawing event.
#[derive(Debug, Clone, PartialEq)]
pub enum StrokeInput {
    AddPoint {
        user_id: UserId,
        point: Point,
        width: StrokeWidth,
        color: Color,
    },
    StrokeCompleted {
        user_id: UserId,
    },
}

impl StrokeInput {
    pub fn user_id(&self) -> &UserId {
        match self {
            StrokeInput::AddPoint { user_id, .. } | StrokeInput::StrokeCompleted { user_id } => user_id,
        }
    }
}

// ─── Continuity tracker ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Continuity {
    last_point: Point,
    width: StrokeWidth,
    color: Color,
    last_update: Instant,
}

/// Consecutive points of one user with one brush.
struct Segment {
    points: Vec<Point>,
    width: StrokeWidth,
    color: Color,
    /// A completion marker ended this segment.
    completed: bool,
}

/// Per-user splice state. Pure apart from the clock passed in.
pub struct ContinuityTracker {
    states: HashMap<UserId, Continuity>,
    ids: StrokeIdGenerator,
    splice_distance: f64,
    splice_window: Duration,
}

impl ContinuityTracker {
    pub fn new(splice_distance: f64, splice_window: Duration) -> Self {
        Self::with_ids(splice_distance, splice_window, StrokeIdGenerator::new())
    }

    pub fn with_ids(splice_distance: f64, splice_window: Duration, ids: StrokeIdGenerator) -> Self {
        Self {
            states: HashMap::new(),
            ids,
            splice_distance,
            splice_window,
        }
    }

    pub fn tracked_users(&self) -> usize {
        self.states.len()
    }

    /// Turns one batch into strokes, one per non-empty segment, in order of
    /// each user's first appearance in the batch.
    pub fn process_batch(&mut self, batch: &[StrokeInput], now: Instant) -> Vec<ConnectedStroke> {
        let mut users: Vec<&UserId> = Vec::new();
        let mut per_user: HashMap<&UserId, Vec<&StrokeInput>> = HashMap::new();
        for input in batch {
            let user = input.user_id();
            per_user
                .entry(user)
                .or_insert_with(|| {
                    users.push(user);
                    Vec::new()
                })
                .push(input);
        }

        let mut strokes = Vec::new();
        for user in users {
            for segment in segments(&per_user[user]) {
                if let Some(stroke) = self.continue_segment(user, segment, now) {
                    strokes.push(stroke);
                }
            }
        }
        strokes
    }

    fn continue_segment(&mut self, user: &UserId, mut segment: Segment, now: Instant) -> Option<ConnectedStroke> {
        let previous = self.states.remove(user);

        if let (Some(previous), Some(first)) = (previous, segment.points.first_mut()) {
            let same_brush = previous.width == segment.width && previous.color == segment.color;
            let close = previous.last_point.distance(first) <= self.splice_distance;
            let recent = now.saturating_duration_since(previous.last_update) <= self.splice_window;
            if same_brush && close && recent {
                *first = previous.last_point;
            }
        }

        let last = segment.points.last().copied();
        if let (Some(last_point), false) = (last, segment.completed) {
            self.states.insert(
                user.clone(),
                Continuity {
                    last_point,
                    width: segment.width,
                    color: segment.color.clone(),
                    last_update: now,
                },
            );
        }

        if segment.points.is_empty() {
            return None;
        }
        Some(ConnectedStroke::new(
            self.ids.next_id(user),
            segment.points,
            segment.width,
            segment.color,
        ))
    }

    /// Forgets users idle for longer than `inactivity`. Returns how many.
    pub fn evict_inactive(&mut self, now: Instant, inactivity: Duration) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, state| now.saturating_duration_since(state.last_update) <= inactivity);
        before - self.states.len()
    }
}

/// Cuts one user's inputs at completion markers and brush changes.
fn segments(inputs: &[&StrokeInput]) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current: Option<Segment> = None;

    for input in inputs {
        match input {
            StrokeInput::AddPoint {
                point, width, color, ..
            } => {
                let brush_changed = current
                    .as_ref()
                    .is_some_and(|seg| seg.width != *width || seg.color != *color);
                if brush_changed {
                    out.extend(current.take());
                }
                current
                    .get_or_insert_with(|| Segment {
                        points: Vec::new(),
                        width: *width,
                        color: color.clone(),
                        completed: false,
                    })
                    .points
                    .push(*point);
            }
            StrokeInput::StrokeCompleted { .. } => {
                let mut seg = current.take().unwrap_or_else(|| Segment {
                    points: Vec::new(),
                    width: StrokeWidth::default(),
                    color: Color::default(),
                    completed: true,
                });
                seg.completed = true;
                out.push(seg);
            }
        }
    }
    out.extend(current);
    out
}

// ─── Command sink ───────────────────────────────────────────────────

/// Where finished strokes go.
pub trait CommandSink: Send + Sync + 'static {
    fn dispatch(&self, command: SessionCommand) -> BoxFuture<'static, CommandResult>;
}

impl CommandSink for SessionRouter {
    fn dispatch(&self, command: SessionCommand) -> BoxFuture<'static, CommandResult> {
        let router = self.clone();
        Box::pin(async move { router.ask_command(command).await })
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────

/// Producer handle. Dropping every clone flushes the last batch and stops
/// the pipeline.
#[derive(Clone)]
pub struct StrokePipeline {
    input: broadcast::Sender<StrokeInput>,
}

impl StrokePipeline {
    /// Returns the handle plus the batcher and dispatcher tasks.
    pub fn spawn(
        session_id: SessionId,
        config: &PipelineConfig,
        sink: Arc<dyn CommandSink>,
    ) -> (Self, JoinHandle<()>, JoinHandle<()>) {
        let max_in_flight = config.max_in_flight.max(1);
        let (input, rx) = broadcast::channel(config.queue_capacity.max(1));
        // A full hand-off stalls the batcher, so overload lands on the input queue
        let (commands_tx, commands_rx) = mpsc::channel(max_in_flight);
        let tracker = ContinuityTracker::new(config.splice_distance, config.splice_window);

        let batcher = tokio::spawn(run_batcher(
            session_id.clone(),
            rx,
            tracker,
            config.clone(),
            commands_tx,
        ));
        let dispatcher = tokio::spawn(run_dispatcher(
            session_id,
            commands_rx,
            sink,
            max_in_flight,
            config.command_timeout,
        ));
        (Self { input }, batcher, dispatcher)
    }

    /// Enqueues one input. When the queue is full the oldest input is
    /// dropped. Returns false once the pipeline has stopped.
    pub fn push(&self, input: StrokeInput) -> bool {
        self.input.send(input).is_ok()
    }
}

async fn run_batcher(
    session_id: SessionId,
    mut rx: broadcast::Receiver<StrokeInput>,
    mut tracker: ContinuityTracker,
    config: PipelineConfig,
    commands: mpsc::Sender<SessionCommand>,
) {
    let batch_size = config.batch_size.max(1);
    let mut evict = interval_at(
        Instant::now() + config.inactivity_timeout,
        config.inactivity_timeout,
    );
    evict.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<StrokeInput> = Vec::with_capacity(batch_size);
    let mut open = true;

    while open {
        // First item opens the batch window
        tokio::select! {
            received = rx.recv() => match received {
                Ok(input) => batch.push(input),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    log::warn!("Pipeline for {session_id} overloaded; dropped {dropped} oldest inputs");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = evict.tick() => {
                let evicted = tracker.evict_inactive(Instant::now(), config.inactivity_timeout);
                if evicted > 0 {
                    log::debug!("Pipeline for {session_id}: evicted {evicted} idle users");
                }
                continue;
            }
        }

        let deadline = Instant::now() + config.batch_window;
        while batch.len() < batch_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Ok(input)) => batch.push(input),
                Ok(Err(broadcast::error::RecvError::Lagged(dropped))) => {
                    log::warn!("Pipeline for {session_id} overloaded; dropped {dropped} oldest inputs");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    open = false;
                    break;
                }
                Err(_) => break,
            }
        }

        let strokes = tracker.process_batch(&batch, Instant::now());
        log::debug!(
            "Pipeline for {session_id}: batch of {} inputs → {} strokes",
            batch.len(),
            strokes.len()
        );
        batch.clear();
        for stroke in strokes {
            let command = SessionCommand::AddStroke {
                session_id: session_id.clone(),
                stroke,
            };
            if commands.send(command).await.is_err() {
                return;
            }
        }
    }
    log::debug!("Pipeline for {session_id} drained");
}

async fn run_dispatcher(
    session_id: SessionId,
    commands: mpsc::Receiver<SessionCommand>,
    sink: Arc<dyn CommandSink>,
    max_in_flight: usize,
    command_timeout: Duration,
) {
    let incoming = stream::unfold(commands, |mut rx| async move {
        rx.recv().await.map(|command| (command, rx))
    });

    incoming
        .map(|command| {
            let sink = sink.clone();
            async move {
                let name = command.name();
                match timeout(command_timeout, sink.dispatch(command)).await {
                    Ok(result) => (name, Some(result)),
                    Err(_) => (name, None),
                }
            }
        })
        .buffered(max_in_flight)
        .for_each(|(name, result)| {
            match result {
                Some(result) if result.is_error() => {
                    log::warn!("{name} for {session_id} rejected: {result}");
                }
                Some(_) => {}
                None => log::warn!("{name} for {session_id} timed out after {command_timeout:?}; dropped"),
            }
            futures_util::future::ready(())
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn add(user: &str, x: f64, y: f64) -> StrokeInput {
        StrokeInput::AddPoint {
            user_id: UserId::from(user),
            point: Point::new(x, y),
            width: StrokeWidth::default(),
            color: Color::default(),
        }
    }

    fn add_with(user: &str, x: f64, width: u32, color: &str) -> StrokeInput {
        StrokeInput::AddPoint {
            user_id: UserId::from(user),
            point: Point::new(x, 0.0),
            width: StrokeWidth::new(width).unwrap(),
            color: Color::new(color),
        }
    }

    fn done(user: &str) -> StrokeInput {
        StrokeInput::StrokeCompleted {
            user_id: UserId::from(user),
        }
    }

    fn tracker() -> ContinuityTracker {
        ContinuityTracker::with_ids(250.0, Duration::from_millis(200), StrokeIdGenerator::with_seed(7))
    }

    #[test]
    fn test_splices_consecutive_batches() {
        let mut t = tracker();
        let now = Instant::now();
        let first = t.process_batch(&[add("u", 0.0, 0.0), add("u", 1.0, 1.0)], now);
        let second = t.process_batch(
            &[add("u", 2.0, 2.0), add("u", 3.0, 3.0)],
            now + Duration::from_millis(50),
        );
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].first_point(), first[0].last_point());
        assert_eq!(second[0].point_count(), 2);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn test_no_splice_when_far_late_or_rebrushed() {
        let now = Instant::now();

        let mut far = tracker();
        far.process_batch(&[add("u", 0.0, 0.0)], now);
        let out = far.process_batch(&[add("u", 1000.0, 0.0)], now);
        assert_eq!(out[0].first_point(), Some(&Point::new(1000.0, 0.0)));

        let mut late = tracker();
        late.process_batch(&[add("u", 0.0, 0.0)], now);
        let out = late.process_batch(&[add("u", 5.0, 0.0)], now + Duration::from_millis(201));
        assert_eq!(out[0].first_point(), Some(&Point::new(5.0, 0.0)));

        let mut rebrushed = tracker();
        rebrushed.process_batch(&[add_with("u", 0.0, 1, "#000000")], now);
        let out = rebrushed.process_batch(&[add_with("u", 5.0, 3, "#000000")], now);
        assert_eq!(out[0].first_point(), Some(&Point::new(5.0, 0.0)));
    }

    #[test]
    fn test_completion_marker_clears_state() {
        let mut t = tracker();
        let now = Instant::now();
        let out = t.process_batch(&[add("u", 0.0, 0.0), add("u", 1.0, 0.0), done("u")], now);
        assert_eq!(out.len(), 1);
        assert_eq!(t.tracked_users(), 0);

        let out = t.process_batch(&[add("u", 2.0, 0.0)], now);
        assert_eq!(out[0].first_point(), Some(&Point::new(2.0, 0.0)));
    }

    #[test]
    fn test_markers_and_brush_changes_cut_segments() {
        let mut t = tracker();
        let batch = [
            add_with("u", 0.0, 1, "red"),
            add_with("u", 1.0, 1, "red"),
            done("u"),
            add_with("u", 2.0, 1, "red"),
            add_with("u", 3.0, 2, "red"),
            add_with("u", 4.0, 2, "red"),
        ];
        let out = t.process_batch(&batch, Instant::now());
        let counts: Vec<usize> = out.iter().map(ConnectedStroke::point_count).collect();
        assert_eq!(counts, vec![2, 1, 2]);
        // Brush change inside the batch: no splice onto the 1-point stroke
        assert_eq!(out[2].first_point(), Some(&Point::new(3.0, 0.0)));
    }

    #[test]
    fn test_users_are_independent() {
        let mut t = tracker();
        let now = Instant::now();
        let out = t.process_batch(&[add("a", 0.0, 0.0), add("b", 100.0, 0.0), add("a", 1.0, 0.0)], now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].point_count(), 2);
        assert_eq!(out[1].point_count(), 1);

        let out = t.process_batch(&[add("b", 101.0, 0.0)], now);
        assert_eq!(out[0].first_point(), Some(&Point::new(100.0, 0.0)));
    }

    #[test]
    fn test_evicts_idle_users() {
        let mut t = tracker();
        let now = Instant::now();
        t.process_batch(&[add("a", 0.0, 0.0)], now);
        t.process_batch(&[add("b", 0.0, 0.0)], now + Duration::from_secs(20));
        let evicted = t.evict_inactive(now + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(evicted, 1);
        assert_eq!(t.tracked_users(), 1);
    }

    #[test]
    fn test_arbitrary_batching_preserves_points_and_gaps() {
        // 100 points, small deltas, split into batches of 1..=10
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..20 {
            let mut t = tracker();
            let now = Instant::now();
            let mut points = Vec::new();
            let (mut x, mut y) = (0.0_f64, 0.0_f64);
            for _ in 0..100 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                x += ((seed >> 33) % 3) as f64;
                y += ((seed >> 40) % 3) as f64;
                points.push(add("u", x, y));
            }

            let mut strokes = Vec::new();
            let mut rest = &points[..];
            while !rest.is_empty() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let n = (((seed >> 33) % 10) as usize + 1).min(rest.len());
                strokes.extend(t.process_batch(&rest[..n], now));
                rest = &rest[n..];
            }

            let total: usize = strokes.iter().map(ConnectedStroke::point_count).sum();
            assert_eq!(total, 100);
            for pair in strokes.windows(2) {
                let (Some(end), Some(start)) = (pair[0].last_point(), pair[1].first_point()) else {
                    panic!("empty stroke");
                };
                assert!(end.distance(start) < 250.0);
                assert_eq!(end, start, "contiguous batches splice exactly");
            }
        }
    }

    struct Recorder(Mutex<Vec<SessionCommand>>);

    impl CommandSink for Recorder {
        fn dispatch(&self, command: SessionCommand) -> BoxFuture<'static, CommandResult> {
            self.0.lock().unwrap().push(command);
            Box::pin(async { CommandResult::ok() })
        }
    }

    fn recorded_points(recorder: &Recorder) -> usize {
        recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|command| match command {
                SessionCommand::AddStroke { stroke, .. } => stroke.point_count(),
                _ => 0,
            })
            .sum()
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_flushes_on_count_and_window() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let config = PipelineConfig::default();
        let (pipeline, _b, _d) = StrokePipeline::spawn(SessionId::from("s1"), &config, recorder.clone());

        for i in 0..10 {
            assert!(pipeline.push(add("u", f64::from(i), 0.0)));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(recorded_points(&recorder), 10, "full batch flushes without waiting");

        pipeline.push(add("u", 10.0, 0.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorded_points(&recorder), 10);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorded_points(&recorder), 11, "window closes the partial batch");

        let commands = recorder.0.lock().unwrap().clone();
        assert!(commands
            .iter()
            .all(|c| c.session_id() == &SessionId::from("s1")));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let config = PipelineConfig {
            queue_capacity: 4,
            batch_window: Duration::from_millis(5),
            ..PipelineConfig::default()
        };
        let (pipeline, batcher, dispatcher) =
            StrokePipeline::spawn(SessionId::from("s1"), &config, recorder.clone());

        // The batcher has not run yet; only the newest 4 survive
        for i in 0..10 {
            pipeline.push(add("u", f64::from(i), 0.0));
        }
        drop(pipeline);
        batcher.await.unwrap();
        dispatcher.await.unwrap();

        let commands = recorder.0.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            SessionCommand::AddStroke { stroke, .. } => {
                assert_eq!(stroke.point_count(), 4);
                assert_eq!(stroke.first_point(), Some(&Point::new(6.0, 0.0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct Stalled;

    impl CommandSink for Stalled {
        fn dispatch(&self, _command: SessionCommand) -> BoxFuture<'static, CommandResult> {
            Box::pin(futures_util::future::pending())
        }
    }

    struct Slow(Mutex<Vec<SessionCommand>>);

    impl CommandSink for Slow {
        fn dispatch(&self, command: SessionCommand) -> BoxFuture<'static, CommandResult> {
            self.0.lock().unwrap().push(command);
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                CommandResult::ok()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_drops_oldest_inputs() {
        let sink = Arc::new(Slow(Mutex::new(Vec::new())));
        let config = PipelineConfig {
            queue_capacity: 4,
            ..PipelineConfig::default()
        };
        let (pipeline, batcher, dispatcher) = StrokePipeline::spawn(SessionId::from("s1"), &config, sink.clone());

        for i in 0..5000 {
            assert!(pipeline.push(add("u", f64::from(i), 0.0)));
            tokio::task::yield_now().await;
        }
        drop(pipeline);
        batcher.await.unwrap();
        dispatcher.await.unwrap();

        let commands = sink.0.lock().unwrap().clone();
        let strokes: Vec<&ConnectedStroke> = commands
            .iter()
            .filter_map(|command| match command {
                SessionCommand::AddStroke { stroke, .. } => Some(stroke),
                _ => None,
            })
            .collect();
        let delivered: usize = strokes.iter().map(|s| s.point_count()).sum();
        // Only what fits in flight, in the hand-off and in the queue gets through
        assert!(delivered < 1000, "delivered {delivered}");
        assert!(strokes
            .iter()
            .any(|s| s.last_point() == Some(&Point::new(4999.0, 0.0))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_times_out_without_blocking_producer() {
        let config = PipelineConfig::default();
        let (pipeline, _b, dispatcher) = StrokePipeline::spawn(SessionId::from("s1"), &config, Arc::new(Stalled));
        for i in 0..200 {
            assert!(pipeline.push(add("u", f64::from(i), 0.0)));
            tokio::task::yield_now().await;
        }
        drop(pipeline);
        // Every command times out after 2s, ten at a time
        tokio::time::timeout(Duration::from_secs(120), dispatcher)
            .await
            .unwrap()
            .unwrap();
    }
}
