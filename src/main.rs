use std::path::PathBuf;

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    modelgate::logging::init_tracing(&modelgate::logging::bootstrap_log_level());

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    if let Err(e) = runtime.block_on(modelgate::run(config_path)) {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
