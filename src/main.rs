use anyhow::Result;
use bio_eval::helpers::{LogFormat, print_banner, setup_logging};
use bio_eval::report::{ScoreArgs, run_score};
use bio_eval::{InferArgs, run_inference};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run inference over one or more (split, mode) pairs.
    Infer(InferArgs),
    /// Score finalized inference output files.
    Score(ScoreArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_format)?;
    let mut writer = std::io::stdout();
    match cli.command {
        Command::Infer(args) => {
            print_banner(&args, &mut writer)?;
            run_inference(args).await
        }
        Command::Score(args) => run_score(&args, &mut writer),
    }
}
