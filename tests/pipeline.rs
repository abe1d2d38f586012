use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bio_eval::backends::{BackendError, ModelBackend};
use bio_eval::config::HarnessConfig;
use bio_eval::dataset::Mode;
use bio_eval::sample::{History, ResponsePayload};
use bio_eval::{InferArgs, run_inference_with_backend};
use serde_json::{Value, json};

/// Scripted backend: the closure decides each response from the prompt and
/// accumulated history, while the struct records what it was asked.
struct MockBackend {
    batches: AtomicUsize,
    prompts_seen: Mutex<Vec<String>>,
    script: Box<dyn Fn(&str, &History) -> String + Send + Sync>,
}

impl MockBackend {
    fn new(script: impl Fn(&str, &History) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(MockBackend {
            batches: AtomicUsize::new(0),
            prompts_seen: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    fn constant(text: &str) -> Arc<Self> {
        let text = text.to_string();
        Self::new(move |_, _| text.clone())
    }

    fn prompt_count(&self) -> usize {
        self.prompts_seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn infer(
        &self,
        prompts: &[String],
        histories: &[History],
    ) -> Result<Vec<ResponsePayload>, BackendError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut seen = self.prompts_seen.lock().unwrap();
        let mut payloads = Vec::with_capacity(prompts.len());
        for (prompt, history) in prompts.iter().zip(histories) {
            seen.push(prompt.clone());
            payloads.push(ResponsePayload::Text((self.script)(prompt, history)));
        }
        Ok(payloads)
    }
}

fn write_dataset(data_dir: &Path, split: &str, count: usize) {
    std::fs::create_dir_all(data_dir).unwrap();
    let lines: Vec<String> = (0..count)
        .map(|idx| {
            json!({
                "idx": idx,
                "question": format!("Question {idx}?"),
                "options": ["right", "wrong"],
                "answer": "right"
            })
            .to_string()
        })
        .collect();
    std::fs::write(
        data_dir.join(format!("{split}.jsonl")),
        lines.join("\n") + "\n",
    )
    .unwrap();
}

fn test_config(data_dir: &Path, max_rounds: u32) -> HarnessConfig {
    HarnessConfig {
        data_dir: data_dir.to_path_buf(),
        max_rounds,
        ..HarnessConfig::default()
    }
}

fn infer_args(root: &Path) -> InferArgs {
    InferArgs {
        model_name: "mock".to_string(),
        config_file: PathBuf::from("unused.toml"),
        split: vec!["hard".to_string()],
        mode: vec![Mode::ZeroShot],
        output_dir: root.join("results"),
        infer_limit: None,
        num_workers: 2,
        batch_size: 2,
        index: 0,
        world_size: 1,
        use_accel: false,
        save_prompt: false,
    }
}

fn read_records(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_else(|_| panic!("missing output file {}", path.display()))
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_zero_shot_run_finalizes_all_samples() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 4);
    let config = test_config(&root.path().join("data"), 5);
    let args = infer_args(root.path());
    let backend = MockBackend::constant("Reasoning.\nANSWER: A");

    run_inference_with_backend(args.clone(), config, backend.clone())
        .await
        .unwrap();

    let final_path = args.output_dir.join("mock_hard_zero-shot.jsonl");
    let records = read_records(&final_path);
    assert_eq!(records.len(), 4);
    assert_eq!(backend.prompt_count(), 4);
    assert_eq!(backend.batches.load(Ordering::SeqCst), 2);
    for record in &records {
        assert!(record.get("response").is_some());
        // prompt is stripped at finalization unless --save-prompt is set
        assert!(record.get("prompt").is_none());
        assert!(record.get("status").is_none());
    }
    assert!(!args.output_dir.join("mock_hard_zero-shot.jsonl.tmp").exists());
}

#[tokio::test]
async fn test_second_run_skips_completed_samples() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 3);
    let args = infer_args(root.path());

    let first = MockBackend::constant("ANSWER: A");
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 5),
        first.clone(),
    )
    .await
    .unwrap();
    assert_eq!(first.prompt_count(), 3);

    let second = MockBackend::constant("ANSWER: A");
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 5),
        second.clone(),
    )
    .await
    .unwrap();
    assert_eq!(second.prompt_count(), 0);

    let records = read_records(&args.output_dir.join("mock_hard_zero-shot.jsonl"));
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn test_orphaned_temp_log_resumes_without_duplicate_calls() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 4);
    let args = infer_args(root.path());
    std::fs::create_dir_all(&args.output_dir).unwrap();

    // Simulate a killed run that already answered samples 0 and 1.
    let orphan = [
        json!({"idx": 0, "question": "Question 0?", "options": ["right", "wrong"],
               "answer": "right", "response": "ANSWER: A"}),
        json!({"idx": 1, "question": "Question 1?", "options": ["right", "wrong"],
               "answer": "right", "response": "ANSWER: A"}),
    ];
    let lines: Vec<String> = orphan.iter().map(|record| record.to_string()).collect();
    std::fs::write(
        args.output_dir.join("mock_hard_zero-shot.jsonl.tmp"),
        lines.join("\n") + "\n",
    )
    .unwrap();

    let backend = MockBackend::constant("ANSWER: A");
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 5),
        backend.clone(),
    )
    .await
    .unwrap();

    assert_eq!(backend.prompt_count(), 2);
    let records = read_records(&args.output_dir.join("mock_hard_zero-shot.jsonl"));
    assert_eq!(records.len(), 4);
}

#[tokio::test]
async fn test_sharding_partitions_by_dataset_position() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 5);
    let mut args = infer_args(root.path());
    args.world_size = 2;
    args.index = 0;

    let backend = MockBackend::constant("ANSWER: A");
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 5),
        backend.clone(),
    )
    .await
    .unwrap();

    // Sharded output files carry the shard coordinates.
    let records = read_records(&args.output_dir.join("mock_hard_zero-shot_0_2.jsonl"));
    let ids: Vec<u64> = records
        .iter()
        .map(|record| record.get("idx").unwrap().as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![0, 2, 4]);
    assert_eq!(backend.prompt_count(), 3);
}

#[tokio::test]
async fn test_infer_limit_caps_intake() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 5);
    let mut args = infer_args(root.path());
    args.infer_limit = Some(2);

    let backend = MockBackend::constant("ANSWER: A");
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 5),
        backend.clone(),
    )
    .await
    .unwrap();

    assert_eq!(backend.prompt_count(), 2);
    let records = read_records(&args.output_dir.join("mock_hard_zero-shot.jsonl"));
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_self_correction_exhausts_round_budget() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 1);
    let mut args = infer_args(root.path());
    args.mode = vec![Mode::SelfCorrection];
    args.batch_size = 1;

    let backend = MockBackend::constant("ANSWER: B");
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 3),
        backend.clone(),
    )
    .await
    .unwrap();

    // One inference per round, up to max_rounds.
    assert_eq!(backend.prompt_count(), 3);
    let records = read_records(&args.output_dir.join("mock_hard_self-correction.jsonl"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("status"), Some(&json!("max_rounds")));
    // The final wrong round is not appended, so two rounds of history remain.
    let history = records[0].get("history").unwrap().as_object().unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_self_correction_recovers_on_second_round() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 1);
    let mut args = infer_args(root.path());
    args.mode = vec![Mode::SelfCorrection];
    args.batch_size = 1;

    let backend = MockBackend::new(|_, history| {
        if history.is_empty() {
            "ANSWER: B".to_string()
        } else {
            "On reflection, ANSWER: A".to_string()
        }
    });
    run_inference_with_backend(
        args.clone(),
        test_config(&root.path().join("data"), 5),
        backend.clone(),
    )
    .await
    .unwrap();

    assert_eq!(backend.prompt_count(), 2);
    let records = read_records(&args.output_dir.join("mock_hard_self-correction.jsonl"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("status"), Some(&json!("completed")));
    let history = records[0].get("history").unwrap().as_object().unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_option_generation_reaches_target_size() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    let options: Vec<String> = (0..9).map(|i| format!("option {i}")).collect();
    std::fs::write(
        data_dir.join("seed.jsonl"),
        json!({
            "idx": 0,
            "question": "Q?",
            "options": options,
            "answer": "option 0"
        })
        .to_string()
            + "\n",
    )
    .unwrap();
    let mut args = infer_args(root.path());
    args.split = vec!["seed".to_string()];
    args.mode = vec![Mode::OptionGeneration];
    args.batch_size = 1;

    let backend = MockBackend::constant("Here: <distractor>a tenth option</distractor>");
    run_inference_with_backend(
        args.clone(),
        test_config(&data_dir, 5),
        backend.clone(),
    )
    .await
    .unwrap();

    assert_eq!(backend.prompt_count(), 1);
    let records = read_records(&args.output_dir.join("mock_seed_gen_confusion_options.jsonl"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("status"), Some(&json!("completed")));
    let final_options = records[0].get("options").unwrap().as_array().unwrap();
    assert_eq!(final_options.len(), 10);
}

#[tokio::test]
async fn test_invalid_shard_arguments_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("data"), "hard", 1);
    let mut args = infer_args(root.path());
    args.index = 2;
    args.world_size = 2;

    let backend = MockBackend::constant("ANSWER: A");
    let result = run_inference_with_backend(
        args,
        test_config(&root.path().join("data"), 5),
        backend,
    )
    .await;
    assert!(result.is_err());
}
