use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

pub mod backends;
pub mod config;
pub mod dataset;
pub mod extract;
pub mod helpers;
pub mod ledger;
pub mod postprocess;
pub mod report;
pub mod sample;
pub mod scoring;

use backends::ModelBackend;
use config::{HarnessConfig, ReservedKeys, Templates};
use dataset::Mode;
use ledger::{CompletionLedger, writable};
use postprocess::{PostContext, PostProcessor};
use sample::{ResponsePayload, Sample, Status};
use scoring::QuestionKind;

#[derive(Parser, Debug, Clone)]
pub struct InferArgs {
    /// Name of the configured model backend to run.
    #[arg(short, long)]
    pub model_name: String,

    /// Path to the harness config file.
    #[arg(long, default_value = "config/bio-eval.toml")]
    pub config_file: PathBuf,

    /// Dataset splits to run. Each (split, mode) pair produces one output file.
    #[arg(short, long, required = true)]
    pub split: Vec<String>,

    /// Interaction modes to run for each split.
    #[arg(long, value_enum, default_values_t = vec![Mode::ZeroShot])]
    pub mode: Vec<Mode>,

    #[arg(short, long, default_value = "results")]
    pub output_dir: PathBuf,

    /// Cap on the number of samples submitted for inference per (split, mode).
    /// Already completed samples pass through regardless.
    #[arg(long)]
    pub infer_limit: Option<usize>,

    /// Number of concurrent backend calls.
    #[arg(short, long, default_value_t = 1)]
    pub num_workers: usize,

    /// Number of samples sharing one backend call.
    #[arg(short, long, default_value_t = 1)]
    pub batch_size: usize,

    /// Shard index of this process. Items are partitioned by dataset position
    /// modulo `world_size`, so shards never overlap.
    #[arg(long, default_value_t = 0)]
    pub index: usize,

    /// Total number of shards.
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    /// Send requests to the backend's accelerated endpoint.
    #[arg(long, default_value_t = false)]
    pub use_accel: bool,

    /// Keep the prompt field in the final output.
    #[arg(long, default_value_t = false)]
    pub save_prompt: bool,
}

fn validate_args(args: &InferArgs) -> Result<()> {
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }
    if args.num_workers == 0 {
        bail!("--num-workers must be at least 1");
    }
    if args.world_size == 0 {
        bail!("--world-size must be at least 1");
    }
    if args.index >= args.world_size {
        bail!(
            "--index {} is out of range for --world-size {}",
            args.index,
            args.world_size
        );
    }
    Ok(())
}

/// Output file stem for one (split, mode) pair. Sharded runs carry the shard
/// coordinates so concurrent shards never collide on one file.
fn output_stem(args: &InferArgs, split: &str, mode: Mode) -> String {
    let model = args.model_name.replace('/', "-");
    let mut stem = format!("{model}_{split}_{mode}");
    if args.world_size > 1 {
        stem.push_str(&format!("_{}_{}", args.index, args.world_size));
    }
    stem
}

pub async fn run_inference(args: InferArgs) -> Result<()> {
    let config = HarnessConfig::load(&args.config_file)?;
    // Fail on an unknown model before any files are touched, even though the
    // backend itself is loaded lazily.
    config.backend(&args.model_name)?;
    run_inference_inner(args, config, None).await
}

/// Entry point with an injected backend, bypassing config-driven loading.
pub async fn run_inference_with_backend(
    args: InferArgs,
    config: HarnessConfig,
    backend: Arc<dyn ModelBackend>,
) -> Result<()> {
    run_inference_inner(args, config, Some(backend)).await
}

async fn run_inference_inner(
    args: InferArgs,
    config: HarnessConfig,
    mut backend_slot: Option<Arc<dyn ModelBackend>>,
) -> Result<()> {
    validate_args(&args)?;
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;
    let templates = config.templates()?;
    for split in &args.split {
        for mode in &args.mode {
            run_split_mode(&args, &config, &templates, split, *mode, &mut backend_slot).await?;
        }
    }
    Ok(())
}

struct IntakeResult {
    queue: Vec<Sample>,
    passed_through: usize,
}

/// Streams the dataset, writes prior completed records straight through, and
/// queues everything that still needs inference.
fn intake(
    args: &InferArgs,
    config: &HarnessConfig,
    templates: &Templates,
    split: &str,
    mode: Mode,
    ledger: &CompletionLedger,
    writer: &mut impl Write,
) -> Result<IntakeResult> {
    let keys = &config.keys;
    let pairs = dataset::load_data(config, templates, split, mode)?;
    let mut queue = Vec::new();
    let mut passed_through = 0usize;
    for (position, (prompt, mut sample)) in pairs.into_iter().enumerate() {
        if position % args.world_size != args.index {
            continue;
        }
        let id = sample.id(keys)?;
        if let Some(prior) = ledger.completed.get(&id) {
            write_record(writer, prior)?;
            passed_through += 1;
            continue;
        }
        let capped = args
            .infer_limit
            .is_some_and(|limit| queue.len() >= limit);
        if let Some(prior) = ledger.resumable.get(&id) {
            if capped {
                // Preserve the partial record; terminal statuses survive
                // finalization, in-flight ones are reported as failures.
                write_record(writer, prior)?;
                continue;
            }
            let mut resumed = prior.clone();
            resumed.set_status(keys, Status::Resume);
            write_record(writer, &resumed)?;
            if resumed.prompt(keys).is_none() {
                resumed.set_prompt(keys, prompt);
            }
            queue.push(resumed);
        } else {
            if capped {
                continue;
            }
            sample.set_prompt(keys, prompt);
            queue.push(sample);
        }
    }
    writer.flush()?;
    Ok(IntakeResult {
        queue,
        passed_through,
    })
}

fn write_record(writer: &mut impl Write, sample: &Sample) -> Result<()> {
    writeln!(writer, "{}", serde_json::to_string(sample)?)?;
    Ok(())
}

fn spawn_batch(
    join_set: &mut JoinSet<Result<Vec<Sample>>>,
    mut batch: Vec<Sample>,
    backend: Arc<dyn ModelBackend>,
    semaphore: Arc<Semaphore>,
    keys: ReservedKeys,
) {
    join_set.spawn(async move {
        let _permit = semaphore.acquire().await?;
        let prompts: Vec<String> = batch
            .iter()
            .map(|sample| sample.prompt(&keys).unwrap_or_default().to_string())
            .collect();
        let histories: Vec<sample::History> =
            batch.iter().map(|sample| sample.history(&keys)).collect();
        match backend.infer(&prompts, &histories).await {
            Ok(payloads) if payloads.len() == batch.len() => {
                for (sample, payload) in batch.iter_mut().zip(payloads) {
                    sample.set_response(&keys, payload);
                }
            }
            Ok(payloads) => {
                warn!(
                    expected = batch.len(),
                    got = payloads.len(),
                    "backend returned wrong response count, marking batch failed"
                );
                for sample in &mut batch {
                    sample.set_response(
                        &keys,
                        ResponsePayload::error("backend returned wrong response count"),
                    );
                }
            }
            // Retry budget already spent inside the adapter; surface the
            // failure per sample so the pool keeps draining.
            Err(error) => {
                for sample in &mut batch {
                    sample.set_response(&keys, ResponsePayload::error(error.to_string()));
                }
            }
        }
        Ok(batch)
    });
}

fn is_terminal_record(sample: &Sample, keys: &ReservedKeys) -> bool {
    match sample.status(keys) {
        None => true,
        Some(status) => status.is_terminal(),
    }
}

#[instrument(skip_all, fields(split = %split, mode = %mode))]
async fn run_split_mode(
    args: &InferArgs,
    config: &HarnessConfig,
    templates: &Templates,
    split: &str,
    mode: Mode,
    backend_slot: &mut Option<Arc<dyn ModelBackend>>,
) -> Result<()> {
    let keys = &config.keys;
    let stem = output_stem(args, split, mode);
    let final_path = args.output_dir.join(format!("{stem}.jsonl"));
    let temp_path = args.output_dir.join(format!("{stem}.jsonl.tmp"));

    // The final log takes precedence over an orphaned temp log from a killed
    // run; both contribute to what can be skipped or resumed.
    let ledger = CompletionLedger::scan(&final_path, keys)
        .merged_over(CompletionLedger::scan(&temp_path, keys));

    let temp_file = File::create(&temp_path)
        .with_context(|| format!("failed to create {}", temp_path.display()))?;
    let mut writer = BufWriter::new(temp_file);

    let IntakeResult {
        queue,
        passed_through,
    } = intake(args, config, templates, split, mode, &ledger, &mut writer)?;
    info!(
        queued = queue.len(),
        passed_through,
        "intake complete"
    );

    if !queue.is_empty() && backend_slot.is_none() {
        *backend_slot = Some(backends::load(&args.model_name, config, args.use_accel)?);
    }

    let processor = PostProcessor::for_mode(mode);
    let ctx = PostContext {
        keys,
        templates,
        max_rounds: config.max_rounds,
        kind: QuestionKind::from_split(split),
    };
    let progress = ProgressBar::new(queue.len() as u64);

    let mut join_set: JoinSet<Result<Vec<Sample>>> = JoinSet::new();
    if let Some(backend) = backend_slot.as_ref() {
        let semaphore = Arc::new(Semaphore::new(args.num_workers));
        for batch in queue.chunks(args.batch_size) {
            spawn_batch(
                &mut join_set,
                batch.to_vec(),
                backend.clone(),
                semaphore.clone(),
                keys.clone(),
            );
        }

        // Samples needing another round regroup here until a full batch forms;
        // the remainder is flushed once nothing else is in flight.
        let mut pending: Vec<Sample> = Vec::new();
        while let Some(result) = join_set.join_next().await {
            let batch = result.context("inference task panicked")??;
            let processed = processor.process(batch, &ctx)?;
            for sample in &processed.to_save {
                write_record(&mut writer, sample)?;
                if is_terminal_record(sample, keys) {
                    progress.inc(1);
                }
            }
            writer.flush()?;
            pending.extend(processed.to_return);
            while pending.len() >= args.batch_size {
                let batch: Vec<Sample> = pending.drain(..args.batch_size).collect();
                spawn_batch(
                    &mut join_set,
                    batch,
                    backend.clone(),
                    semaphore.clone(),
                    keys.clone(),
                );
            }
            if join_set.is_empty() && !pending.is_empty() {
                let batch = std::mem::take(&mut pending);
                spawn_batch(
                    &mut join_set,
                    batch,
                    backend.clone(),
                    semaphore.clone(),
                    keys.clone(),
                );
            }
        }
    }
    progress.finish_and_clear();
    drop(writer);

    finalize_output(&temp_path, &final_path, keys, args.save_prompt)
}

/// Filters the temp log down to terminal records, atomically replaces the
/// final log, and reports every id that never reached a terminal state.
fn finalize_output(
    temp_path: &std::path::Path,
    final_path: &std::path::Path,
    keys: &ReservedKeys,
    save_prompt: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(temp_path)
        .with_context(|| format!("failed to read {}", temp_path.display()))?;

    // Last record per id wins; multi-round runs log interim records.
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, Sample> = HashMap::new();
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let sample: Sample = serde_json::from_str(line)
            .with_context(|| format!("corrupt record in {}", temp_path.display()))?;
        let id = sample.id(keys)?;
        if !latest.contains_key(&id) {
            order.push(id.clone());
        }
        latest.insert(id, sample);
    }

    let staging_path = final_path.with_extension("jsonl.new");
    let staging_file = File::create(&staging_path)
        .with_context(|| format!("failed to create {}", staging_path.display()))?;
    let mut writer = BufWriter::new(staging_file);
    let mut written = 0usize;
    let mut failed: Vec<String> = Vec::new();
    for id in &order {
        let Some(sample) = latest.get(id) else {
            continue;
        };
        if !writable(sample.status(keys)) {
            failed.push(id.clone());
            continue;
        }
        if !sample.has_usable_response(keys) {
            failed.push(id.clone());
        }
        let mut record = sample.clone();
        if !save_prompt {
            record.remove(&keys.prompt);
        }
        write_record(&mut writer, &record)?;
        written += 1;
    }
    writer.flush()?;
    drop(writer);

    std::fs::rename(&staging_path, final_path)
        .with_context(|| format!("failed to finalize {}", final_path.display()))?;
    std::fs::remove_file(temp_path)
        .with_context(|| format!("failed to remove {}", temp_path.display()))?;

    info!(path = %final_path.display(), written, "finalized output");
    if !failed.is_empty() {
        warn!(
            count = failed.len(),
            ids = ?failed,
            "samples never produced a usable terminal record"
        );
    } else {
        debug!("all samples reached a terminal state");
    }
    Ok(())
}
