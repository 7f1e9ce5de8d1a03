use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use checkrun::catalog;
use checkrun::cli::{self, Cli, Command, RunOptions};
use checkrun::config::ProjectConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::SessionExec { .. } | Command::Classify { .. }
    );

    let filter = if quiet_command && cli.verbose == 0 {
        "checkrun=warn"
    } else {
        cli::log_filter(cli.verbose)
    };
    // Logs go to stderr so `session-exec` output stays clean on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .checkrun/config.toml found, using defaults"),
    }

    match cli.command {
        Command::Run {
            check,
            no_session,
            no_capture,
        } => {
            let options = RunOptions {
                check,
                no_session,
                no_capture,
            };
            cli::run_checks(&config, &cwd, &options)?;
        }
        Command::List => {
            let resolution = catalog::resolve(&config.harness, &config.checks, &cwd);
            print!("{}", cli::render_catalog(&resolution));
        }
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    cli::render_config_json(&config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    cli::render_config_human(&config, config_path.as_deref())
                );
            }
        }
        Command::SessionExec { session, commands } => {
            let output = cli::session_exec(&config, session, &commands)?;
            println!("{output}");
        }
        Command::Classify { file } => {
            let classification = cli::classify_file(&file)?;
            match classification.matched_text {
                Some(matched) => println!("{} ({matched})", classification.verdict),
                None => println!("{} (no marker; fail-closed)", classification.verdict),
            }
        }
    }

    Ok(())
}
