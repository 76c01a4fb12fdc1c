mod pipelines;
mod utils;
mod config;
mod cli;

use std::time::{Instant, SystemTime};
use std::{env, fs};
use std::path::PathBuf;
use std::sync::Arc;
use std::io::Write;

use anyhow::Result;
use chrono::DateTime;
use log::{LevelFilter, error, info};
use env_logger::Builder;

use crate::cli::parse;
use crate::config::defs::{PipelineError, RunConfig};
use pipelines::aggregate;
use pipelines::functional;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Shotgun Aggregate\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let out_dir = setup_output_dir(&args, &dir)?;
    let module = args.module.clone();
    let run_config = Arc::new(RunConfig {
        cwd: dir,
        out_dir,
        args,
        log_level,
    });

    if let Err(e) = match module.as_str() {
        "aggregate" => aggregate_run(run_config).await,
        "functional" => functional_run(run_config).await,
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    } {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn aggregate_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    aggregate::run(run_config).await
}

async fn functional_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    functional::run(run_config).await
}

/// Sets up the output directory for the store and flat exports.
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `<prefix>_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &cli::args::Arguments, cwd: &PathBuf) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => {
            let path = PathBuf::from(out);
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        }
        None => {
            let timestamp = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .map(|secs| {
                    let dt = DateTime::from_timestamp(secs as i64, 0)
                        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());
                    dt.format("%Y%m%d").to_string()
                })
                .unwrap_or_else(|_| "19700101".to_string());
            cwd.join(format!("{}_{}", args.prefix, timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
