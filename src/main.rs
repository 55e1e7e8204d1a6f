use one_api::{config, logger, monitor, server, store};

#[tokio::main]
async fn main() {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };
        let location = if let Some(location) = panic_info.location() {
            format!("{}:{}:{}", location.file(), location.line(), location.column())
        } else {
            "Unknown location".to_string()
        };
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    let cfg = config::load();
    store::use_database(&cfg.database_path);
    store::init();
    logger::init();
    logger::info("app", "one-api starting");

    monitor::init();
    tokio::spawn(monitor::probe_loop());

    server::serve().await;
    logger::info("app", "one-api stopped");
}
