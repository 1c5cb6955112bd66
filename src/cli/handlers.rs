use super::commands::{BuildArgs, LevelsArgs};
use crate::build::{Builder, RunReport};
use crate::config::BuildConfig;
use crate::docker::{connect, load_credentials, BollardDaemon};
use crate::manifest::{load_manifest, Manifest};
use crate::scheduler::schedule;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Builds every step and prints the run report. Returns the process exit code.
pub async fn handle_build(args: &BuildArgs, quiet: bool) -> i32 {
    let mut config = BuildConfig::from_env();
    args.apply(&mut config);

    match run_build(config).await {
        Ok(report) => {
            if !quiet || !report.is_success() {
                print!("{}", report);
            }
            if report.is_success() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

async fn run_build(config: BuildConfig) -> Result<RunReport> {
    config.validate().context("Invalid configuration")?;
    debug!("{}", config);

    let manifest = load(&config)?;

    let docker = connect(&config)
        .with_context(|| format!("Failed to connect to Docker daemon at {}", config.docker_host))?;
    let credentials = load_credentials().context("Failed to load registry credentials")?;
    if credentials.is_some() {
        debug!("Registry credentials found");
    }

    let builder = Builder::new(manifest, config, Arc::new(BollardDaemon::new(docker, credentials)));
    info!("Build session {}", builder.session().builder_id);

    let report = builder.run().await.context("Failed to schedule build steps")?;
    Ok(report)
}

/// Prints the levels steps would build in, one line per level.
pub fn handle_levels(args: &LevelsArgs) -> i32 {
    let mut config = BuildConfig::from_env();
    args.manifest.apply(&mut config);

    match levels(&config) {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn levels(config: &BuildConfig) -> Result<Vec<String>> {
    let manifest = load(config)?;
    let plan = schedule(&manifest, &config.workdir).context("Failed to schedule build steps")?;

    Ok(plan
        .step_names(&manifest)
        .iter()
        .enumerate()
        .map(|(level, names)| format!("Level {}: {}", level, names.join(", ")))
        .collect())
}

fn load(config: &BuildConfig) -> Result<Manifest> {
    let path = config.manifest_file();
    load_manifest(&path).with_context(|| format!("Failed to load manifest {}", path.display()))
}
