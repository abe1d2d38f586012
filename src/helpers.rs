use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::InferArgs;

/// Log format for harness diagnostics. Progress output and the run banner
/// always go to stdout; tracing goes to stderr.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq)]
#[clap(rename_all = "snake_case")]
pub enum LogFormat {
    Jsonl,
    #[default]
    Pretty,
}

pub fn setup_logging(format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Jsonl => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .json()
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
        }
    }
}

/// One-screen summary of the run parameters, printed before inference starts.
pub fn print_banner(args: &InferArgs, writer: &mut impl std::io::Write) -> Result<()> {
    writeln!(writer, "model:       {}", args.model_name)?;
    writeln!(writer, "splits:      {}", args.split.join(", "))?;
    let modes: Vec<String> = args.mode.iter().map(|mode| mode.to_string()).collect();
    writeln!(writer, "modes:       {}", modes.join(", "))?;
    writeln!(writer, "output dir:  {}", args.output_dir.display())?;
    writeln!(
        writer,
        "concurrency: {} workers x batch size {}",
        args.num_workers, args.batch_size
    )?;
    if args.world_size > 1 {
        writeln!(writer, "shard:       {}/{}", args.index, args.world_size)?;
    }
    if let Some(limit) = args.infer_limit {
        writeln!(writer, "item cap:    {limit}")?;
    }
    writeln!(writer)?;
    Ok(())
}
