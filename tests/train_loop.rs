mod common;

use burn_ndarray::NdArrayDevice;
use common::{config_yaml, write_fixture, TrainBackend};
use std::path::Path;
use styletts_train::train::report::ScalarRecord;
use styletts_train::train::{train, CheckpointPaths};
use styletts_train::weights::CheckpointArchive;
use styletts_train::{load_config, Config, TrainError};

fn scalars(log_dir: &Path) -> Vec<ScalarRecord> {
    let text = std::fs::read_to_string(log_dir.join("tensorboard/scalars.jsonl")).expect("scalars");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("scalar record"))
        .collect()
}

fn run(config: &Config, config_path: &Path, workers: usize) -> styletts_train::train::TrainSummary {
    train::<TrainBackend>(config, config_path, workers, &NdArrayDevice::default()).expect("train")
}

#[test]
fn missing_symbol_aborts_before_any_side_effect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let yaml: String = config_yaml(dir.path())
        .lines()
        .filter(|line| {
            !(line.starts_with("symbol")
                || ["pad:", "punctuation:", "letters:", "letters_ipa:", "extend:"]
                    .iter()
                    .any(|key| line.trim_start().starts_with(key)))
        })
        .map(|line| format!("{line}\n"))
        .collect();
    let config_path = dir.path().join("config.yml");
    std::fs::write(&config_path, yaml).expect("write config");
    let config = load_config(&config_path).expect("parse");

    let err = train::<TrainBackend>(&config, &config_path, 2, &NdArrayDevice::default())
        .expect_err("missing symbol");
    match err.downcast_ref::<TrainError>() {
        Some(TrainError::MissingConfig { field }) => assert_eq!(field, "symbol"),
        other => panic!("unexpected error {other:?}"),
    }
    // Neither the log directory nor the pretrained checkpoint were touched.
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn missing_pretrained_file_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = write_fixture(dir.path());
    std::fs::remove_file(dir.path().join("pretrained.safetensors")).expect("remove");
    let config = load_config(&config_path).expect("parse");
    let err = train::<TrainBackend>(&config, &config_path, 1, &NdArrayDevice::default())
        .expect_err("missing checkpoint");
    assert!(format!("{err:#}").contains("No such file"));
}

#[test]
fn one_epoch_writes_logs_scalars_and_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = write_fixture(dir.path());
    let config = load_config(&config_path).expect("parse");
    let summary = run(&config, &config_path, 1);

    assert_eq!(summary.epoch, 1);
    // Four utterances in batches of two.
    assert_eq!(summary.trained_batches + summary.skipped_batches, 2);
    assert_eq!(summary.iters, summary.trained_batches);
    let validation = summary.last_validation.expect("validation ran");
    assert!(validation.mel.is_finite());
    assert_eq!(summary.best_loss, validation.mel);

    let log_dir = dir.path().join("logs");
    assert!(log_dir.join("config.yml").exists());
    let paths = CheckpointPaths::new(&log_dir);
    let epoch = CheckpointArchive::read(paths.epoch(0)).expect("epoch checkpoint");
    assert_eq!(epoch.meta.epoch, 0);
    assert_eq!(epoch.meta.iters, summary.iters);
    if summary.iters > 0 {
        let interim = CheckpointArchive::read(paths.interim()).expect("interim checkpoint");
        assert_eq!(interim.meta.iters, summary.iters);
    }

    let records = scalars(&log_dir);
    let eval: Vec<_> = records.iter().filter(|r| r.tag.starts_with("eval/")).collect();
    assert_eq!(eval.len(), 3);
    assert!(eval.iter().all(|r| r.step == 1));
    if summary.iters > 0 {
        assert!(records.iter().any(|r| r.tag == "train/mel_loss"));
    }
}

#[test]
fn resume_restarts_at_the_recorded_epoch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = write_fixture(dir.path());
    let config = load_config(&config_path).expect("parse");
    let first = run(&config, &config_path, 1);

    let mut resumed = config.clone();
    resumed.pretrained_model = CheckpointPaths::new(&config.log_dir)
        .epoch(0)
        .display()
        .to_string();
    resumed.load_only_params = false;
    resumed.epochs = 2;
    let second = run(&resumed, &config_path, 1);

    // Epoch 0 is re-run, then epoch 1.
    assert_eq!(second.epoch, 2);
    assert_eq!(
        second.iters,
        first.iters + second.trained_batches,
        "step counter continues from the checkpoint"
    );
    assert_eq!(second.trained_batches + second.skipped_batches, 4);
    assert!(CheckpointPaths::new(&config.log_dir).epoch(1).exists());
}

#[test]
fn workers_share_validation_losses() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = write_fixture(dir.path());
    let config = load_config(&config_path).expect("parse");
    let summary = run(&config, &config_path, 2);

    assert_eq!(summary.rank, 0);
    assert_eq!(summary.epoch, 1);
    // Each worker holds half of the four training utterances: one batch.
    assert_eq!(summary.trained_batches + summary.skipped_batches, 1);
    let eval: Vec<_> = scalars(&dir.path().join("logs"))
        .into_iter()
        .filter(|r| r.tag.starts_with("eval/"))
        .collect();
    assert_eq!(eval.len(), 3, "only the master reports");
}
