//! Capture adapters for microphone, camera, and screen sources.
//!
//! Real device capture lives behind [`MediaSourceFactory`]; the built-in
//! [`SyntheticMediaFactory`] produces deterministic frames so the pipeline
//! can run headless. The controller owns at most one audio source and one
//! video source at a time and fully releases a source before acquiring a
//! replacement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::protocol::VideoMode;

#[derive(Debug, Error)]
pub enum MediaAcquisitionError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture device not found")]
    DeviceNotFound,
    #[error("capture device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Which device a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTrack {
    Microphone,
    Camera,
    Screen,
}

impl MediaTrack {
    pub fn video_mode(self) -> Option<VideoMode> {
        match self {
            MediaTrack::Microphone => None,
            MediaTrack::Camera => Some(VideoMode::Camera),
            MediaTrack::Screen => Some(VideoMode::Screen),
        }
    }
}

/// A raw captured chunk. Audio chunks carry PCM bytes; video frames carry
/// an encoded image.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub track: MediaTrack,
    pub payload: Bytes,
    pub mime: String,
}

/// A frame after base64 encoding, ready for the wire.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub track: MediaTrack,
    pub data: String,
    pub mime: String,
}

pub type FrameSink = Arc<dyn Fn(EncodedFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrophoneSettings {
    pub sample_rate_hz: u32,
    pub channels: u16,
    /// How much audio each emitted chunk covers.
    pub chunk_interval: Duration,
}

impl Default for MicrophoneSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            channels: 1,
            chunk_interval: Duration::from_millis(100),
        }
    }
}

impl MicrophoneSettings {
    /// 16-bit samples per chunk, in bytes.
    pub fn chunk_len(&self) -> usize {
        let samples_per_sec = self.sample_rate_hz as u64 * self.channels as u64;
        let bytes_per_sec = samples_per_sec * 2;
        (bytes_per_sec * self.chunk_interval.as_millis() as u64 / 1000) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    /// Requested device frame rate; the stream itself is sampled at
    /// `frame_interval`.
    pub frame_rate_hint: u32,
    pub frame_interval: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate_hint: 15,
            frame_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSettings {
    pub width: u32,
    pub height: u32,
    /// Lower than camera capture; screen content changes slowly.
    pub frame_rate_hint: u32,
    pub frame_interval: Duration,
}

impl Default for ScreenSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate_hint: 5,
            frame_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaSettings {
    pub microphone: MicrophoneSettings,
    pub camera: CameraSettings,
    pub screen: ScreenSettings,
}

/// A running capture device. `start` begins pushing frames into the sender
/// until `stop` releases the device.
#[async_trait]
pub trait MediaSource: Send {
    async fn start(
        &mut self,
        frames: UnboundedSender<MediaFrame>,
    ) -> Result<(), MediaAcquisitionError>;

    async fn stop(&mut self);
}

/// Opens capture devices. Acquisition failures surface here or from
/// [`MediaSource::start`]; they are never retried automatically.
pub trait MediaSourceFactory: Send + Sync {
    fn open_microphone(
        &self,
        settings: MicrophoneSettings,
    ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError>;

    fn open_camera(
        &self,
        settings: CameraSettings,
    ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError>;

    fn open_screen(
        &self,
        settings: ScreenSettings,
    ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError>;
}

/// Produces deterministic placeholder frames on the configured cadence.
pub struct SyntheticMediaFactory;

impl MediaSourceFactory for SyntheticMediaFactory {
    fn open_microphone(
        &self,
        settings: MicrophoneSettings,
    ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError> {
        Ok(Box::new(SyntheticSource::new(
            MediaTrack::Microphone,
            settings.chunk_len(),
            "audio/pcm".to_string(),
            settings.chunk_interval,
        )))
    }

    fn open_camera(
        &self,
        settings: CameraSettings,
    ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError> {
        Ok(Box::new(SyntheticSource::new(
            MediaTrack::Camera,
            64,
            "image/jpeg".to_string(),
            settings.frame_interval,
        )))
    }

    fn open_screen(
        &self,
        settings: ScreenSettings,
    ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError> {
        Ok(Box::new(SyntheticSource::new(
            MediaTrack::Screen,
            64,
            "image/jpeg".to_string(),
            settings.frame_interval,
        )))
    }
}

pub struct SyntheticSource {
    track: MediaTrack,
    frame_len: usize,
    mime: String,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(track: MediaTrack, frame_len: usize, mime: String, interval: Duration) -> Self {
        Self {
            track,
            frame_len,
            mime,
            interval,
            task: None,
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn start(
        &mut self,
        frames: UnboundedSender<MediaFrame>,
    ) -> Result<(), MediaAcquisitionError> {
        let track = self.track;
        let frame_len = self.frame_len;
        let mime = self.mime.clone();
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut counter = 0u8;
            loop {
                ticker.tick().await;
                let payload = Bytes::from(vec![counter; frame_len]);
                counter = counter.wrapping_add(1);
                let frame = MediaFrame {
                    track,
                    payload,
                    mime: mime.clone(),
                };
                if frames.send(frame).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ActiveSource {
    source: Box<dyn MediaSource>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct ControllerState {
    microphone: Option<ActiveSource>,
    video: Option<(VideoMode, ActiveSource)>,
}

/// Owns capture sources and pushes their frames, base64-encoded, into the
/// sink. At most one video source is live at a time; switching between
/// camera and screen releases the previous device first.
pub struct MediaController {
    factory: Arc<dyn MediaSourceFactory>,
    settings: MediaSettings,
    sink: FrameSink,
    state: Mutex<ControllerState>,
}

impl MediaController {
    pub fn new(factory: Arc<dyn MediaSourceFactory>, settings: MediaSettings, sink: FrameSink) -> Self {
        Self {
            factory,
            settings,
            sink,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.state.lock().await.microphone.is_some()
    }

    pub async fn active_video(&self) -> Option<VideoMode> {
        self.state.lock().await.video.as_ref().map(|(mode, _)| *mode)
    }

    /// Acquire the microphone and begin streaming chunks. A second call
    /// while recording is a no-op.
    pub async fn start_microphone(&self) -> Result<(), MediaAcquisitionError> {
        let mut state = self.state.lock().await;
        if state.microphone.is_some() {
            tracing::debug!(target: "aisle::media", "microphone already active");
            return Ok(());
        }
        let source = self.factory.open_microphone(self.settings.microphone)?;
        let active = self.activate(source).await?;
        state.microphone = Some(active);
        tracing::debug!(target: "aisle::media", "microphone capture started");
        Ok(())
    }

    pub async fn stop_microphone(&self) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.microphone.take() {
            release(active).await;
            tracing::debug!(target: "aisle::media", "microphone capture stopped");
        }
    }

    /// Acquire a video source. Any previously active video source is fully
    /// released before the new device is opened.
    pub async fn start_video(&self, mode: VideoMode) -> Result<(), MediaAcquisitionError> {
        let mut state = self.state.lock().await;
        if let Some((active_mode, _)) = &state.video {
            if *active_mode == mode {
                tracing::debug!(target: "aisle::media", mode = mode.as_str(), "video already active");
                return Ok(());
            }
        }
        if let Some((old_mode, active)) = state.video.take() {
            release(active).await;
            tracing::debug!(target: "aisle::media", mode = old_mode.as_str(), "released video source");
        }
        let source = match mode {
            VideoMode::Camera => self.factory.open_camera(self.settings.camera)?,
            VideoMode::Screen => self.factory.open_screen(self.settings.screen)?,
        };
        let active = self.activate(source).await?;
        state.video = Some((mode, active));
        tracing::debug!(target: "aisle::media", mode = mode.as_str(), "video capture started");
        Ok(())
    }

    pub async fn stop_video(&self) {
        let mut state = self.state.lock().await;
        if let Some((mode, active)) = state.video.take() {
            release(active).await;
            tracing::debug!(target: "aisle::media", mode = mode.as_str(), "video capture stopped");
        }
    }

    pub async fn stop_all(&self) {
        self.stop_microphone().await;
        self.stop_video().await;
    }

    async fn activate(
        &self,
        mut source: Box<dyn MediaSource>,
    ) -> Result<ActiveSource, MediaAcquisitionError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.start(tx).await?;
        let sink = Arc::clone(&self.sink);
        let pump = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let encoded = EncodedFrame {
                    track: frame.track,
                    data: BASE64.encode(&frame.payload),
                    mime: frame.mime,
                };
                (sink)(encoded);
            }
        });
        Ok(ActiveSource { source, pump })
    }
}

async fn release(mut active: ActiveSource) {
    active.source.stop().await;
    active.pump.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagSource {
        track: MediaTrack,
        running: Arc<AtomicBool>,
        log: Arc<StdMutex<Vec<String>>>,
        emit_on_start: bool,
    }

    #[async_trait]
    impl MediaSource for FlagSource {
        async fn start(
            &mut self,
            frames: UnboundedSender<MediaFrame>,
        ) -> Result<(), MediaAcquisitionError> {
            self.running.store(true, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push(format!("start {:?}", self.track));
            if self.emit_on_start {
                let _ = frames.send(MediaFrame {
                    track: self.track,
                    payload: Bytes::from_static(b"frame"),
                    mime: "image/jpeg".to_string(),
                });
            }
            Ok(())
        }

        async fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push(format!("stop {:?}", self.track));
        }
    }

    struct FlagFactory {
        camera_running: Arc<AtomicBool>,
        screen_running: Arc<AtomicBool>,
        mic_running: Arc<AtomicBool>,
        log: Arc<StdMutex<Vec<String>>>,
        deny_camera: bool,
    }

    impl FlagFactory {
        fn new() -> Self {
            Self {
                camera_running: Arc::new(AtomicBool::new(false)),
                screen_running: Arc::new(AtomicBool::new(false)),
                mic_running: Arc::new(AtomicBool::new(false)),
                log: Arc::new(StdMutex::new(Vec::new())),
                deny_camera: false,
            }
        }
    }

    impl MediaSourceFactory for FlagFactory {
        fn open_microphone(
            &self,
            _settings: MicrophoneSettings,
        ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError> {
            Ok(Box::new(FlagSource {
                track: MediaTrack::Microphone,
                running: Arc::clone(&self.mic_running),
                log: Arc::clone(&self.log),
                emit_on_start: false,
            }))
        }

        fn open_camera(
            &self,
            _settings: CameraSettings,
        ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError> {
            if self.deny_camera {
                return Err(MediaAcquisitionError::PermissionDenied);
            }
            Ok(Box::new(FlagSource {
                track: MediaTrack::Camera,
                running: Arc::clone(&self.camera_running),
                log: Arc::clone(&self.log),
                emit_on_start: true,
            }))
        }

        fn open_screen(
            &self,
            _settings: ScreenSettings,
        ) -> Result<Box<dyn MediaSource>, MediaAcquisitionError> {
            Ok(Box::new(FlagSource {
                track: MediaTrack::Screen,
                running: Arc::clone(&self.screen_running),
                log: Arc::clone(&self.log),
                emit_on_start: false,
            }))
        }
    }

    fn drop_sink() -> FrameSink {
        Arc::new(|_frame| {})
    }

    #[test_timeout::tokio_timeout_test]
    async fn switching_video_releases_the_previous_source_first() {
        let factory = FlagFactory::new();
        let camera = Arc::clone(&factory.camera_running);
        let screen = Arc::clone(&factory.screen_running);
        let log = Arc::clone(&factory.log);
        let controller =
            MediaController::new(Arc::new(factory), MediaSettings::default(), drop_sink());

        controller.start_video(VideoMode::Camera).await.unwrap();
        assert!(camera.load(Ordering::SeqCst));
        assert_eq!(controller.active_video().await, Some(VideoMode::Camera));

        controller.start_video(VideoMode::Screen).await.unwrap();
        assert!(!camera.load(Ordering::SeqCst));
        assert!(screen.load(Ordering::SeqCst));
        assert_eq!(controller.active_video().await, Some(VideoMode::Screen));

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec!["start Camera", "stop Camera", "start Screen"]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn restarting_the_same_video_mode_is_a_noop() {
        let factory = FlagFactory::new();
        let log = Arc::clone(&factory.log);
        let controller =
            MediaController::new(Arc::new(factory), MediaSettings::default(), drop_sink());

        controller.start_video(VideoMode::Camera).await.unwrap();
        controller.start_video(VideoMode::Camera).await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn acquisition_failure_leaves_no_active_source() {
        let mut factory = FlagFactory::new();
        factory.deny_camera = true;
        let controller =
            MediaController::new(Arc::new(factory), MediaSettings::default(), drop_sink());

        let err = controller.start_video(VideoMode::Camera).await.unwrap_err();
        assert!(matches!(err, MediaAcquisitionError::PermissionDenied));
        assert_eq!(controller.active_video().await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn frames_reach_the_sink_base64_encoded() {
        let factory = FlagFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: FrameSink = Arc::new(move |frame| {
            let _ = tx.send(frame);
        });
        let controller = MediaController::new(Arc::new(factory), MediaSettings::default(), sink);

        controller.start_video(VideoMode::Camera).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.track, MediaTrack::Camera);
        assert_eq!(frame.mime, "image/jpeg");
        assert_eq!(frame.data, BASE64.encode(b"frame"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn microphone_start_is_idempotent_and_stop_releases() {
        let factory = FlagFactory::new();
        let mic = Arc::clone(&factory.mic_running);
        let controller =
            MediaController::new(Arc::new(factory), MediaSettings::default(), drop_sink());

        controller.start_microphone().await.unwrap();
        controller.start_microphone().await.unwrap();
        assert!(controller.is_recording().await);
        assert!(mic.load(Ordering::SeqCst));

        controller.stop_microphone().await;
        assert!(!controller.is_recording().await);
        assert!(!mic.load(Ordering::SeqCst));
    }

    #[test]
    fn microphone_chunk_len_matches_pcm_rate() {
        let settings = MicrophoneSettings::default();
        assert_eq!(settings.chunk_len(), 3200);
    }
}
