extern crate log;
use env_logger::Builder;

pub fn initialize_logging_layer() {
    let mut builder = Builder::new();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    builder.filter_level(level_from_str(&log_level));

    if builder.try_init().is_ok() {
        log::info!("Initialized the logger ..")
    }

    log_worker_pool_size();
}

fn level_from_str(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

fn log_worker_pool_size() {
    match std::thread::available_parallelism() {
        Ok(n) => log::info!("Available parallelism: {} threads", n),
        Err(_) => log::info!("Could not detect available parallelism .."),
    }
}
