use clap::Parser;
use std::process::ExitCode;
use tributary::core::error::ErrorPayload;

fn main() -> anyhow::Result<ExitCode> {
    tributary::init_tracing();
    let cli = tributary::Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    match runtime.block_on(tributary::run(cli)) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&ErrorPayload::from(&e))?);
            Ok(ExitCode::FAILURE)
        }
    }
}
