use std::io::Write;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use camerad::capture::PixelFormat;
use camerad::{Config, ConvertBackend, InitializationError, SourceKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMERAD_CONFIG",
        "CAMERAD_PIPELINE__TARGET_RATE_HZ",
        "CAMERAD_CAPTURE__SOURCE",
        "CAMERAD_CAPTURE__WIDTH",
        "CAMERAD_CONVERT__BACKEND",
        "CAMERAD_CAPTURE__FORMAT",
    ] {
        std::env::remove_var(key);
    }
}

fn write_toml(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_describe_two_road_streams() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = Config::load(None).expect("load defaults");
    assert_eq!(cfg.capture.source, SourceKind::V4l2);
    assert_eq!(cfg.capture.format, PixelFormat::Mjpeg);
    assert_eq!((cfg.capture.width, cfg.capture.height), (1920, 1080));
    assert_eq!(cfg.pipeline.target_rate_hz, 30.0);
    assert_eq!(cfg.pipeline.distributor_buffer_count, 5);
    assert_eq!(cfg.pipeline.delay_warn_threshold_ms, None);
    assert_eq!(cfg.convert.backend, ConvertBackend::Gpu);
    assert_eq!(cfg.topics(), vec!["roadCameraState", "wideRoadCameraState"]);

    let controls: Vec<(&str, i64)> = cfg
        .capture
        .controls
        .iter()
        .map(|(name, &value)| (name.as_str(), value))
        .collect();
    assert_eq!(
        controls,
        vec![
            ("auto_exposure", 1),
            ("backlight_compensation", 1),
            ("focus_absolute", 5),
            ("focus_automatic_continuous", 0),
            ("sharpness", 200),
        ]
    );

    let settings = cfg.settings();
    assert_eq!(settings.streams.len(), 2);
    assert_eq!(settings.streams[0].stream_key, "road");
    assert_eq!(settings.streams[1].metadata_topic, "wideRoadCameraState");
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_toml(
        r#"
        [capture]
        source = "test_pattern"
        width = 640
        height = 480
        drop_every = 7

        [capture.controls]
        focus_automatic_continuous = 0
        focus_absolute = 0

        [convert]
        backend = "cpu"

        [pipeline]
        target_rate_hz = 20.0
        delay_warn_threshold_ms = 5

        [[streams]]
        stream_key = "driver"
        metadata_topic = "driverCameraState"
        "#,
    );

    std::env::set_var("CAMERAD_PIPELINE__TARGET_RATE_HZ", "15");
    std::env::set_var("CAMERAD_CAPTURE__WIDTH", "320");

    let cfg = Config::load(Some(file.path())).expect("load config");

    assert_eq!(cfg.capture.source, SourceKind::TestPattern);
    assert_eq!((cfg.capture.width, cfg.capture.height), (320, 480));
    assert_eq!(cfg.capture.drop_every, Some(7));
    assert_eq!(cfg.capture.controls.get("focus_absolute"), Some(&0));
    assert_eq!(cfg.capture.controls.get("sharpness"), Some(&200));
    // Untouched keys keep their defaults
    assert_eq!(cfg.capture.device, "/dev/video0");
    assert_eq!(cfg.convert.backend, ConvertBackend::Cpu);
    assert_eq!(cfg.pipeline.target_rate_hz, 15.0);
    assert_eq!(cfg.pipeline.delay_warn_threshold_ms, Some(5));
    assert_eq!(cfg.pipeline.distributor_buffer_count, 5);
    assert_eq!(cfg.topics(), vec!["driverCameraState"]);

    clear_env();
}

#[test]
fn rejects_invalid_rate() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_toml("[pipeline]\ntarget_rate_hz = 0.0\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, InitializationError::InvalidRate(_)), "{err}");
}

#[test]
fn rejects_duplicate_stream_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_toml(
        r#"
        [[streams]]
        stream_key = "road"
        metadata_topic = "roadCameraState"

        [[streams]]
        stream_key = "road"
        metadata_topic = "wideRoadCameraState"
        "#,
    );
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(
        matches!(err, InitializationError::DuplicateStream { kind: "stream key", .. }),
        "{err}"
    );
}

#[test]
fn missing_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, InitializationError::Config(_)), "{err}");
}

#[test]
fn unknown_enum_value_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERAD_CONVERT__BACKEND", "opencl");
    let result = Config::load(None);
    clear_env();
    assert!(matches!(result, Err(InitializationError::Config(_))));

    // Capture formats are the ones a device can deliver; NV12 is output only
    std::env::set_var("CAMERAD_CAPTURE__FORMAT", "nv12");
    let result = Config::load(None);
    clear_env();
    assert!(matches!(result, Err(InitializationError::Config(_))));
}
