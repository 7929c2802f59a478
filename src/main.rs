fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = asr_relay::run() {
        log::error!("{}", e);
        eprintln!("asr-relay: {}", e);
        std::process::exit(1);
    }
}
