//! The fixed-rate capture loop.
//!
//! ```text
//! Idle ──run──> Running ──window elapsed──> Completed   (close, finalize)
//!                  │
//!                  └──fatal error or cancel──> Aborted  (finalize skipped)
//! ```
//!
//! Each tick fetches one frame, records it and sleeps until `tick_start +
//! interval`. A slow tick shortens the following sleep, down to zero; ticks
//! are never skipped and never bunched up to catch up. A corrupted frame is
//! retried straight away without sleeping and without consuming a sequence
//! number.

use crate::analyzer::{AnalyzerError, AnalyzerRuntime};
use crate::camera::{CameraError, CameraSession};
use crate::metadata::FrameMetadata;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that end a sampling run early.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error("Sampling cancelled")]
    Cancelled,

    #[error("Giving up after {0} consecutive corrupted frames")]
    TooManyCorruptedFrames(u32),
}

impl SamplerError {
    /// Whether the camera session should still be closed on this exit path.
    ///
    /// An unreachable camera is abandoned as is.
    fn closes_session(&self) -> bool {
        !matches!(self, Self::Camera(_))
    }
}

/// Lifecycle of one sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Counters for one sampling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub frames_captured: u64,
    pub corrupted_frames: u64,
    pub bytes_received: u64,
}

/// How long to sleep before the next tick so that ticks start every
/// `interval` from `tick_start`.
pub fn next_tick_delay(tick_start: Instant, interval: Duration, now: Instant) -> Duration {
    match tick_start.checked_add(interval) {
        Some(deadline) => deadline.saturating_duration_since(now),
        None => interval.saturating_sub(now.saturating_duration_since(tick_start)),
    }
}

/// Drives a camera session and an analyzer for one sampling window.
#[derive(Debug)]
pub struct FrameSampler {
    interval: Duration,
    duration: Duration,
    max_consecutive_corrupted: Option<u32>,
    state: SamplerState,
    stats: SamplerStats,
}

impl FrameSampler {
    pub fn new(interval: Duration, duration: Duration) -> Self {
        Self {
            interval,
            duration,
            max_consecutive_corrupted: None,
            state: SamplerState::Idle,
            stats: SamplerStats::default(),
        }
    }

    /// Abort after `limit` corrupted frames in a row. `None` retries forever.
    pub fn with_corrupted_frame_limit(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_corrupted = limit;
        self
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// Run the capture loop on an open session.
    ///
    /// On success the session is closed and the analyzer finalized. On
    /// cancellation, analyzer failure or too many corrupted frames the session
    /// is closed and finalize is skipped. When the camera becomes unreachable
    /// neither happens.
    pub async fn run(
        &mut self,
        session: &mut CameraSession,
        runtime: &mut AnalyzerRuntime,
        cancel: &CancellationToken,
    ) -> Result<(), SamplerError> {
        self.state = SamplerState::Running;

        match self.sample(session, runtime, cancel).await {
            Ok(()) => {
                self.state = SamplerState::Completed;
                info!(
                    camera_id = %runtime.camera().camera_id,
                    frames = self.stats.frames_captured,
                    corrupted = self.stats.corrupted_frames,
                    "Sampling window elapsed"
                );
                session.close().await;
                runtime.finalize().await?;
                Ok(())
            }
            Err(e) => {
                self.state = SamplerState::Aborted;
                if e.closes_session() {
                    session.close().await;
                }
                Err(e)
            }
        }
    }

    async fn sample(
        &mut self,
        session: &mut CameraSession,
        runtime: &mut AnalyzerRuntime,
        cancel: &CancellationToken,
    ) -> Result<(), SamplerError> {
        let start = Instant::now();
        let mut sequence_num = 0u64;
        let mut consecutive_corrupted = 0u32;

        while start.elapsed() < self.duration {
            if cancel.is_cancelled() {
                return Err(SamplerError::Cancelled);
            }

            let tick_start = Instant::now();

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SamplerError::Cancelled),
                result = session.fetch_frame() => result,
            };

            let frame = match fetched {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => {
                    self.stats.corrupted_frames += 1;
                    consecutive_corrupted += 1;
                    metrics::counter!("camfleet.frames.corrupted").increment(1);
                    warn!(
                        camera_id = %runtime.camera().camera_id,
                        consecutive = consecutive_corrupted,
                        error = %e,
                        "Corrupted frame, retrying"
                    );

                    if let Some(limit) = self.max_consecutive_corrupted {
                        if consecutive_corrupted >= limit {
                            return Err(SamplerError::TooManyCorruptedFrames(
                                consecutive_corrupted,
                            ));
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            consecutive_corrupted = 0;

            let size = frame.size as u64;
            let metadata = FrameMetadata::new(runtime.camera().clone(), sequence_num, Utc::now());
            debug!(
                camera_id = %runtime.camera().camera_id,
                sequence_num = sequence_num,
                size_bytes = size,
                "Frame captured"
            );

            self.stats.frames_captured += 1;
            self.stats.bytes_received += size;
            metrics::counter!("camfleet.frames.captured").increment(1);
            metrics::counter!("camfleet.bytes.received").increment(size);

            runtime.push_frame(frame, metadata).await?;
            sequence_num += 1;

            metrics::histogram!("camfleet.tick.processing_seconds")
                .record(tick_start.elapsed().as_secs_f64());

            let delay = next_tick_delay(tick_start, self.interval, Instant::now());
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SamplerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalysisContext, AnalysisError, Analyzer};
    use crate::camera::{Camera, StreamFormat};
    use crate::frame_buffer::Frame;
    use crate::metadata::CameraMetadata;
    use crate::sink::MockResultSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Frame,
        Corrupt,
        Unreachable,
    }

    #[derive(Default)]
    struct CameraCalls {
        fetches: usize,
        closes: usize,
    }

    /// Plays a script of fetch outcomes, then keeps returning frames.
    struct ScriptedCamera {
        script: VecDeque<Step>,
        latency: Duration,
        calls: Arc<Mutex<CameraCalls>>,
    }

    #[async_trait]
    impl Camera for ScriptedCamera {
        async fn open(&mut self, _format: StreamFormat) -> Result<(), CameraError> {
            Ok(())
        }

        async fn fetch_frame(&mut self) -> Result<Frame, CameraError> {
            self.calls.lock().fetches += 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            match self.script.pop_front().unwrap_or(Step::Frame) {
                Step::Frame => Ok(Frame::new(Bytes::from_static(b"jpeg-bytes"), 64, 64)),
                Step::Corrupt => Err(CameraError::CorruptedFrame("truncated".into())),
                Step::Unreachable => Err(CameraError::Unreachable("timed out".into())),
            }
        }

        async fn close(&mut self) {
            self.calls.lock().closes += 1;
        }
    }

    #[derive(Default)]
    struct AnalyzerCalls {
        frames: Vec<(u64, Duration)>,
        finalized: bool,
    }

    struct Recorder {
        start: Instant,
        calls: Arc<Mutex<AnalyzerCalls>>,
        fail_on: Option<u64>,
    }

    #[async_trait]
    impl Analyzer for Recorder {
        async fn on_new_frame(&mut self, ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
            let sequence_num = ctx.frame_metadata(0)?.sequence_num();
            if self.fail_on == Some(sequence_num) {
                return Err(AnalysisError::Failed("analysis exploded".into()));
            }
            self.calls
                .lock()
                .frames
                .push((sequence_num, self.start.elapsed()));
            Ok(())
        }

        async fn finalize(&mut self, _ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
            self.calls.lock().finalized = true;
            Ok(())
        }
    }

    struct Harness {
        session: CameraSession,
        runtime: AnalyzerRuntime,
        camera_calls: Arc<Mutex<CameraCalls>>,
        analyzer_calls: Arc<Mutex<AnalyzerCalls>>,
    }

    async fn harness(
        script: Vec<Step>,
        latency: Duration,
        capacity: usize,
        fail_on: Option<u64>,
    ) -> Harness {
        let camera_calls = Arc::new(Mutex::new(CameraCalls::default()));
        let analyzer_calls = Arc::new(Mutex::new(AnalyzerCalls::default()));

        let camera = ScriptedCamera {
            script: script.into(),
            latency,
            calls: camera_calls.clone(),
        };
        let mut session = CameraSession::new("cam", Box::new(camera));
        session.open(StreamFormat::Image).await.unwrap();

        let analyzer = Recorder {
            start: Instant::now(),
            calls: analyzer_calls.clone(),
            fail_on,
        };
        let metadata = Arc::new(CameraMetadata {
            camera_id: "cam".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        });
        let runtime = AnalyzerRuntime::new(
            Box::new(analyzer),
            capacity,
            Box::new(MockResultSink::new()),
            metadata,
        )
        .unwrap();

        Harness {
            session,
            runtime,
            camera_calls,
            analyzer_calls,
        }
    }

    fn secs(s: f64) -> Duration {
        Duration::from_millis((s * 1000.0).round() as u64)
    }

    fn buffered_sequences(runtime: &AnalyzerRuntime) -> Vec<u64> {
        runtime
            .buffer()
            .iter()
            .map(|r| r.metadata().sequence_num())
            .collect()
    }

    #[test]
    fn test_next_tick_delay() {
        let start = Instant::now();
        let interval = secs(1.0);

        assert_eq!(next_tick_delay(start, interval, start), secs(1.0));
        assert_eq!(
            next_tick_delay(start, interval, start + Duration::from_millis(300)),
            Duration::from_millis(700)
        );
        assert_eq!(next_tick_delay(start, interval, start + interval), Duration::ZERO);
        assert_eq!(next_tick_delay(start, interval, start + secs(2.5)), Duration::ZERO);
    }

    #[test]
    fn test_next_tick_delay_past_clock_range() {
        let start = Instant::now();
        let delay = next_tick_delay(start, Duration::MAX, start + secs(1.0));
        assert_eq!(delay, Duration::MAX - secs(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_ticks_in_three_and_a_half_seconds() {
        let mut h = harness(vec![], Duration::ZERO, 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(3.5));

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        let calls = h.analyzer_calls.lock();
        let ticks: Vec<(u64, Duration)> = calls.frames.clone();
        assert_eq!(
            ticks,
            vec![
                (0, secs(0.0)),
                (1, secs(1.0)),
                (2, secs(2.0)),
                (3, secs(3.0)),
            ]
        );
        assert!(calls.finalized);
        assert_eq!(h.camera_calls.lock().closes, 1);
        assert_eq!(sampler.state(), SamplerState::Completed);
        assert_eq!(sampler.stats().frames_captured, 4);
        assert_eq!(sampler.stats().bytes_received, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_keeps_newest_three() {
        let mut h = harness(vec![], Duration::ZERO, 3, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(4.5));

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.analyzer_calls.lock().frames.len(), 5);
        assert_eq!(buffered_sequences(&h.runtime), vec![4, 3, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_retried_without_consuming_sequence() {
        let script = vec![Step::Frame, Step::Frame, Step::Corrupt, Step::Frame, Step::Frame];
        let mut h = harness(script, Duration::ZERO, 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(3.5));

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        let calls = h.analyzer_calls.lock();
        let sequences: Vec<u64> = calls.frames.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        // The retry happens at once, in the same second as the corrupted fetch.
        assert_eq!(calls.frames[2].1, secs(2.0));
        assert_eq!(h.camera_calls.lock().fetches, 5);
        assert_eq!(sampler.stats().corrupted_frames, 1);
        assert!(calls.finalized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_camera_skips_finalize_and_close() {
        let script = vec![Step::Frame, Step::Frame, Step::Unreachable];
        let mut h = harness(script, Duration::ZERO, 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(10.0));

        let err = sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SamplerError::Camera(CameraError::Unreachable(_))));
        assert_eq!(sampler.state(), SamplerState::Aborted);
        assert_eq!(h.analyzer_calls.lock().frames.len(), 2);
        assert!(!h.analyzer_calls.lock().finalized);
        assert_eq!(h.camera_calls.lock().fetches, 3);
        assert_eq!(h.camera_calls.lock().closes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticks_shorten_the_sleep() {
        let mut h = harness(vec![], Duration::from_millis(300), 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(3.5));

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        let starts: Vec<Duration> = h.analyzer_calls.lock().frames.iter().map(|f| f.1).collect();
        assert_eq!(starts, vec![secs(0.3), secs(1.3), secs(2.3), secs(3.3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_tick_starts_next_immediately() {
        let mut h = harness(vec![], Duration::from_millis(1500), 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(3.5));

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        let starts: Vec<Duration> = h.analyzer_calls.lock().frames.iter().map(|f| f.1).collect();
        assert_eq!(starts, vec![secs(1.5), secs(3.0), secs(4.5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_runs_no_ticks() {
        let mut h = harness(vec![], Duration::ZERO, 1, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), Duration::ZERO);

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.camera_calls.lock().fetches, 0);
        assert!(h.analyzer_calls.lock().finalized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep() {
        let mut h = harness(vec![], Duration::ZERO, 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(10.0));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(2.5)).await;
            trigger.cancel();
        });

        let err = sampler
            .run(&mut h.session, &mut h.runtime, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SamplerError::Cancelled));
        assert_eq!(h.analyzer_calls.lock().frames.len(), 3);
        assert!(!h.analyzer_calls.lock().finalized);
        assert_eq!(h.camera_calls.lock().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_fetch() {
        let mut h = harness(vec![], secs(30.0), 10, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(60.0));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(1.0)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = sampler
            .run(&mut h.session, &mut h.runtime, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SamplerError::Cancelled));
        assert!(started.elapsed() < secs(2.0));
        assert!(h.analyzer_calls.lock().frames.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_runs_no_ticks() {
        let mut h = harness(vec![], Duration::ZERO, 1, None).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(5.0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = sampler
            .run(&mut h.session, &mut h.runtime, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SamplerError::Cancelled));
        assert_eq!(h.camera_calls.lock().fetches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_limit() {
        let script = vec![Step::Frame, Step::Corrupt, Step::Corrupt, Step::Corrupt];
        let mut h = harness(script, Duration::ZERO, 10, None).await;
        let mut sampler =
            FrameSampler::new(secs(1.0), secs(10.0)).with_corrupted_frame_limit(Some(3));

        let err = sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SamplerError::TooManyCorruptedFrames(3)));
        assert_eq!(sampler.stats().corrupted_frames, 3);
        assert_eq!(h.camera_calls.lock().closes, 1);
        assert!(!h.analyzer_calls.lock().finalized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_streak_resets_after_success() {
        let script = vec![Step::Corrupt, Step::Frame, Step::Corrupt, Step::Frame];
        let mut h = harness(script, Duration::ZERO, 10, None).await;
        let mut sampler =
            FrameSampler::new(secs(1.0), secs(1.5)).with_corrupted_frame_limit(Some(2));

        sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.analyzer_calls.lock().frames.len(), 2);
        assert_eq!(sampler.stats().corrupted_frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyzer_failure_aborts() {
        let mut h = harness(vec![], Duration::ZERO, 10, Some(1)).await;
        let mut sampler = FrameSampler::new(secs(1.0), secs(10.0));

        let err = sampler
            .run(&mut h.session, &mut h.runtime, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SamplerError::Analyzer(AnalyzerError::Frame { sequence_num: 1, .. })
        ));
        assert_eq!(sampler.state(), SamplerState::Aborted);
        assert!(!h.analyzer_calls.lock().finalized);
        assert_eq!(h.camera_calls.lock().closes, 1);
    }
}
