// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use clap::Parser;
use clap::error::ErrorKind as ClapErrorKind;
use frpmgr::cli::Cli;
use frpmgr::commands::App;
use frpmgr::context::ExecutionContext;
use frpmgr::settings::Settings;
use log::{LevelFilter, debug};

async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            // Usage errors exit 1; 2 is reserved for validation failures.
            let _ = e.print();
            return 1;
        }
    };

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return 1;
        }
    };

    let level = if cli.quiet {
        settings.log_level.min(LevelFilter::Warn)
    } else {
        settings.log_level
    };
    if let Err(e) = frpmgr_log::init(level, settings.log_file.as_deref()) {
        eprintln!("Error: {e}");
        return 1;
    }
    debug!(
        "registry {}, runtime {}",
        settings.registry_path.display(),
        settings.runtime_dir.display()
    );

    let ctx = ExecutionContext::new(
        cli.yes,
        cli.quiet,
        cli.timeout.unwrap_or(settings.default_timeout),
    );
    let app = App::new(&settings);
    match app.execute(cli.command, &ctx).await {
        Ok(()) => 0,
        Err(e) => ctx.report(&e),
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
