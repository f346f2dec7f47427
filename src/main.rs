use autopilot::core::terminal;

#[tokio::main]
async fn main() {
    if let Err(e) = autopilot::cli::run_main().await {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
