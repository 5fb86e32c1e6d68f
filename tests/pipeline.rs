// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end scenarios over the software providers: capture from the test
//! pattern camera, feed the loopback encoder, and decode the result back.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use videohal::backend::loopback::LoopbackProvider;
use videohal::backend::test_pattern::TestPatternProvider;
use videohal::backend::test_pattern::CAMERA_ID;
use videohal::camera::CameraError;
use videohal::camera::CameraListener;
use videohal::camera::CameraManager;
use videohal::camera::CameraProvider;
use videohal::camera::CaptureMode;
use videohal::codec::CodecManager;
use videohal::codec::CodecProvider;
use videohal::codec::CodecType;
use videohal::codec::CodedFrame;
use videohal::codec::DecoderListener;
use videohal::codec::DecoderMetadata;
use videohal::codec::EncodedFrame;
use videohal::codec::EncoderListener;
use videohal::codec::EncoderMetadata;
use videohal::codec::FrameType;
use videohal::codec::VideoDecoder;
use videohal::codec::VideoEncoder;
use videohal::video_frame::GraphicBuffer;
use videohal::video_frame::YcbcrFrame;
use videohal::Resolution;

const MODE: CaptureMode = CaptureMode { width: 320, height: 240, fps: 30 };

/// The test-pattern provider is a process-wide singleton with one physical
/// slot, so tests touching the camera must not run concurrently.
static CAMERA_LOCK: Mutex<()> = Mutex::new(());

fn hold_camera() -> std::sync::MutexGuard<'static, ()> {
    CAMERA_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn empty_world_has_no_cameras() {
    init_logs();
    let cameras = CameraManager::with_providers([]);
    assert_eq!(cameras.num_cameras(), 0);
    assert!(cameras.enumerate().is_empty());
    assert!(matches!(cameras.open_camera("test:rear:0"), Err(CameraError::NotFound(_))));
}

#[derive(Default)]
struct FrameRecorder {
    timestamps: Mutex<Vec<u64>>,
    errors: AtomicUsize,
}

impl CameraListener for FrameRecorder {
    fn on_frame(&self, frame: Arc<GraphicBuffer>) {
        self.timestamps.lock().unwrap().push(frame.timestamp_us());
    }

    fn on_error(&self, _description: &str) {
        self.errors.fetch_add(1, SeqCst);
    }
}

#[test]
fn test_pattern_capture_runs_at_the_requested_rate() {
    let _camera = hold_camera();
    init_logs();
    let cameras = CameraManager::with_providers([
        TestPatternProvider::instance() as &'static dyn CameraProvider
    ]);
    assert_eq!(cameras.num_cameras(), 1);
    let info = cameras.enumerate().remove(0);
    assert_eq!(info.id, CAMERA_ID);
    assert_eq!(cameras.query_capabilities(CAMERA_ID).unwrap(), vec![MODE]);

    let camera = cameras.open_camera(CAMERA_ID).unwrap();
    let recorder = Arc::new(FrameRecorder::default());
    camera.set_listener(recorder.clone());

    camera.start_capture(&MODE).unwrap();
    assert!(camera.capture_started());
    wait_until("a steady stream of frames", || recorder.timestamps.lock().unwrap().len() >= 10);
    camera.stop_capture();
    assert!(!camera.capture_started());

    let timestamps = recorder.timestamps.lock().unwrap().clone();
    assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]), "timestamps must increase");
    // ~30 fps: consecutive deliveries are a frame interval apart, with a
    // generous allowance for scheduling noise.
    let spans: Vec<u64> = timestamps.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let average = spans.iter().sum::<u64>() / spans.len() as u64;
    assert!((15_000..70_000).contains(&average), "average frame interval {}us", average);

    // The capture loop is joined; nothing arrives after stop.
    let count = recorder.timestamps.lock().unwrap().len();
    thread::sleep(Duration::from_millis(120));
    assert_eq!(recorder.timestamps.lock().unwrap().len(), count);
    assert_eq!(recorder.errors.load(SeqCst), 0);
}

#[test]
fn second_open_preempts_the_first_capture() {
    let _camera = hold_camera();
    init_logs();
    let provider = TestPatternProvider::instance();
    let first = provider.open_camera(CAMERA_ID).unwrap();
    let second = provider.open_camera(CAMERA_ID).unwrap();

    first.start_capture(&MODE).unwrap();
    second.start_capture(&MODE).unwrap();

    assert!(!first.capture_started(), "the older instance must lose the device");
    assert!(second.capture_started());
    second.stop_capture();
}

/// Camera listener that pushes every frame into an encoder.
struct EncoderFeed {
    encoder: Arc<dyn VideoEncoder>,
    fed: AtomicUsize,
}

impl CameraListener for EncoderFeed {
    fn on_frame(&self, frame: Arc<GraphicBuffer>) {
        let Some(view) = frame.map_ycbcr() else {
            return;
        };
        if self.encoder.encode(&view, false).is_ok() {
            self.fed.fetch_add(1, SeqCst);
        }
    }

    fn on_error(&self, description: &str) {
        panic!("camera error during the pipeline run: {}", description);
    }
}

/// Encoder listener that re-queues every coded frame into a decoder.
struct DecoderFeed {
    decoder: Arc<dyn VideoDecoder>,
    sent: AtomicUsize,
    released: Arc<AtomicUsize>,
    first_was_key: AtomicBool,
    saw_any: AtomicBool,
}

impl EncoderListener for DecoderFeed {
    fn on_encoded_frame(&self, frame: EncodedFrame) {
        if !self.saw_any.swap(true, SeqCst) {
            self.first_was_key.store(frame.frame_type == FrameType::Key, SeqCst);
        }
        let released = Arc::clone(&self.released);
        let coded = CodedFrame::with_release(
            frame.data().to_vec(),
            frame.timestamp_us,
            frame.frame_type,
            move || {
                released.fetch_add(1, SeqCst);
            },
        );
        if self.decoder.decode(coded).is_ok() {
            self.sent.fetch_add(1, SeqCst);
        }
    }

    fn on_encoder_error(&self, description: &str) {
        panic!("encoder error during the pipeline run: {}", description);
    }
}

#[derive(Default)]
struct DecodedSink {
    frames: Mutex<Vec<(u64, u32, u32)>>,
    eos: AtomicBool,
}

impl DecoderListener for DecodedSink {
    fn on_decoded_frame(&self, frame: &YcbcrFrame) {
        self.frames.lock().unwrap().push((frame.timestamp_us(), frame.width(), frame.height()));
    }

    fn on_decoder_error(&self, description: &str) {
        panic!("decoder error during the pipeline run: {}", description);
    }

    fn on_decoder_eos(&self) {
        self.eos.store(true, SeqCst);
    }
}

#[test]
fn camera_frames_survive_an_encode_decode_roundtrip() {
    let _camera = hold_camera();
    init_logs();
    let codecs = CodecManager::with_providers([
        LoopbackProvider::instance() as &'static dyn CodecProvider
    ]);
    assert!(codecs.encoder_available(CodecType::H264));

    let decoder = codecs.create_decoder(CodecType::H264).unwrap();
    let sink = Arc::new(DecodedSink::default());
    decoder.set_listener(sink.clone());
    decoder
        .init(DecoderMetadata {
            codec: CodecType::H264,
            size: Resolution { width: MODE.width, height: MODE.height },
            framerate: MODE.fps,
            codec_specific: Vec::new(),
        })
        .unwrap();

    let encoder = codecs.create_encoder(CodecType::H264).unwrap();
    let bridge = Arc::new(DecoderFeed {
        decoder: Arc::clone(&decoder),
        sent: AtomicUsize::new(0),
        released: Arc::new(AtomicUsize::new(0)),
        first_was_key: AtomicBool::new(false),
        saw_any: AtomicBool::new(false),
    });
    encoder.set_listener(bridge.clone());
    encoder
        .init(EncoderMetadata {
            codec: CodecType::H264,
            size: Resolution { width: MODE.width, height: MODE.height },
            bitrate: 1_000_000,
            framerate: MODE.fps,
        })
        .unwrap();

    let camera = TestPatternProvider::instance().open_camera(CAMERA_ID).unwrap();
    let feed = Arc::new(EncoderFeed { encoder: Arc::clone(&encoder), fed: AtomicUsize::new(0) });
    camera.set_listener(feed.clone());
    camera.start_capture(&MODE).unwrap();

    wait_until("decoded frames out of the pipeline", || sink.frames.lock().unwrap().len() >= 5);
    camera.stop_capture();

    // Let coded frames still queued in the decoder emerge, then end the
    // stream.
    let sent = bridge.sent.load(SeqCst);
    assert!(sent > 0);
    decoder.drain();
    wait_until("decoder EOS", || sink.eos.load(SeqCst));

    let frames = sink.frames.lock().unwrap().clone();
    assert!(frames.len() >= 5);
    for (_, width, height) in &frames {
        assert_eq!((*width, *height), (MODE.width, MODE.height));
    }
    assert!(
        frames.windows(2).all(|pair| pair[0].0 < pair[1].0),
        "decoded timestamps must keep capture order"
    );
    assert!(bridge.first_was_key.load(SeqCst), "a stream must open with a sync frame");

    // Every coded frame handed to the decoder is released exactly once.
    wait_until("all coded-frame release hooks", || bridge.released.load(SeqCst) == sent);
    decoder.stop();
    assert_eq!(bridge.released.load(SeqCst), sent);
}
