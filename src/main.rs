use anyhow::{anyhow, Context};
use clap::Parser;

use splatforge::app::{self, Invocation};
use splatforge::cli::Cli;
use splatforge::system::paths::WorkspaceLayout;
use splatforge::LogCollector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let start = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let layout = WorkspaceLayout::discover(&start);

    // =========================================================================
    // LOGGING - MUST BE FIRST
    // =========================================================================
    let collector = LogCollector::new(&layout.logs_dir(), cli.verbose)
        .map_err(|e| anyhow!("LogCollector initialization failed: {}", e))?;
    if let Err(e) = collector.install() {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    log::info!(
        target: "parsed",
        "[Main] splatforge {} in {}",
        env!("CARGO_PKG_VERSION"),
        layout.root().display()
    );

    // Environment is read exactly once; everything below receives it explicitly.
    let env: Vec<(String, String)> = std::env::vars().collect();
    let invocation = Invocation::new(layout, cli.config.clone(), env);

    let code = match app::dispatch(&cli, &invocation).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("[Main] {}", err.user_message());
            eprintln!("\nError: {}", err.user_message());
            let diagnostics = err.diagnostics();
            if !diagnostics.is_empty() {
                eprintln!("\nLast tool output:");
                for line in diagnostics {
                    eprintln!("  {}", line);
                }
            }
            eprintln!("\nNext step: {}", err.remediation());
            eprintln!("Full log: {}", collector.session().full.display());
            err.exit_code()
        }
    };

    if let Err(e) = collector.wait_for_empty() {
        eprintln!("[Main] WARNING: Log flush incomplete: {}", e);
    }
    std::process::exit(code);
}
