use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    relay: Relay,
    devices: Devices,
    timing: Timing,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Relay {
    backend: String,
    native_sample_rate: u32,
    fallback_sample_rate: u32,
    buffer_multiplier: usize,
    min_period_samples: usize,
    default_volume: f32,
    max_volume: f32,
    capture_source: String,
}

#[derive(Deserialize)]
struct Devices {
    capture_device: String,
    playback_device: String,
    require_headset_output: bool,
}

#[derive(Deserialize)]
struct Timing {
    read_backoff_ms: u64,
    max_consecutive_errors: u32,
    start_timeout_ms: u64,
    stop_timeout_ms: u64,
    realtime_priority: i32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 中继引擎配置
    println!("cargo:rustc-env=RELAY_BACKEND={}", config.relay.backend);
    println!("cargo:rustc-env=RELAY_NATIVE_SAMPLE_RATE={}", config.relay.native_sample_rate);
    println!("cargo:rustc-env=RELAY_FALLBACK_SAMPLE_RATE={}", config.relay.fallback_sample_rate);
    println!("cargo:rustc-env=RELAY_BUFFER_MULTIPLIER={}", config.relay.buffer_multiplier);
    println!("cargo:rustc-env=RELAY_MIN_PERIOD_SAMPLES={}", config.relay.min_period_samples);
    println!("cargo:rustc-env=RELAY_DEFAULT_VOLUME={}", config.relay.default_volume);
    println!("cargo:rustc-env=RELAY_MAX_VOLUME={}", config.relay.max_volume);
    println!("cargo:rustc-env=RELAY_CAPTURE_SOURCE={}", config.relay.capture_source);

    // 设备配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.devices.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.devices.playback_device);
    println!("cargo:rustc-env=REQUIRE_HEADSET_OUTPUT={}", config.devices.require_headset_output);

    // 时序配置
    println!("cargo:rustc-env=READ_BACKOFF_MS={}", config.timing.read_backoff_ms);
    println!("cargo:rustc-env=MAX_CONSECUTIVE_ERRORS={}", config.timing.max_consecutive_errors);
    println!("cargo:rustc-env=START_TIMEOUT_MS={}", config.timing.start_timeout_ms);
    println!("cargo:rustc-env=STOP_TIMEOUT_MS={}", config.timing.stop_timeout_ms);
    println!("cargo:rustc-env=REALTIME_PRIORITY={}", config.timing.realtime_priority);
}
