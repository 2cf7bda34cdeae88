use model_monitor::{cli::Cli, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    model_monitor::run(Cli::parse_args()).await
}
