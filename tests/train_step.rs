mod common;

use burn::tensor::Tensor;
use burn_ndarray::NdArrayDevice;
use common::{module_bytes, synthetic_batch, tiny_config, tiny_dims, TrainBackend};
use styletts_train::error::{SkipReason, TrainError};
use styletts_train::model::{ModuleName, TtsModel};
use styletts_train::runtime::WorkerContext;
use styletts_train::train::{BatchOutcome, OptimizerCoordinator, StepExecutor};

struct Fixture {
    model: TtsModel<TrainBackend>,
    optimizer: OptimizerCoordinator<TrainBackend>,
    executor: StepExecutor<TrainBackend>,
    n_token: usize,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config(dir.path());
    let device = NdArrayDevice::default();
    let dims = tiny_dims(&config);
    Fixture {
        model: TtsModel::new(&dims, 11, &device),
        optimizer: OptimizerCoordinator::new(&config.optimizer_params, 100),
        executor: StepExecutor::new(&config, 5, &device),
        n_token: dims.n_token,
    }
}

fn snapshot(model: &TtsModel<TrainBackend>) -> Vec<(ModuleName, Vec<u8>)> {
    ModuleName::ALL
        .into_iter()
        .map(|name| (name, module_bytes(model, name)))
        .collect()
}

fn changed(before: &[(ModuleName, Vec<u8>)], model: &TtsModel<TrainBackend>) -> Vec<ModuleName> {
    before
        .iter()
        .filter(|(name, bytes)| module_bytes(model, *name) != *bytes)
        .map(|(name, _)| *name)
        .collect()
}

#[test]
fn trained_batch_updates_every_stepped_module() {
    let mut f = fixture();
    let batch = synthetic_batch(&[(6, 40), (4, 36)], f.n_token);
    let before = snapshot(&f.model);

    let outcome = f
        .executor
        .train_batch(&mut f.model, &mut f.optimizer, &WorkerContext::single(), &batch, 0)
        .expect("train batch");
    let BatchOutcome::Trained(terms) = outcome else {
        panic!("batch was skipped: {outcome:?}");
    };
    for (tag, value) in terms.scalars() {
        assert!(value.is_finite(), "{tag} = {value}");
    }
    assert!(terms.total.is_finite());

    let updated = changed(&before, &f.model);
    for name in [
        ModuleName::Msd,
        ModuleName::Mpd,
        ModuleName::Predictor,
        ModuleName::Decoder,
        ModuleName::TextAligner,
    ] {
        assert!(updated.contains(&name), "{name} was not updated");
    }
    assert!(!updated.contains(&ModuleName::PitchExtractor));
    assert_eq!(f.optimizer.step_count(ModuleName::Decoder), 1);
    assert_eq!(f.optimizer.step_count(ModuleName::PitchExtractor), 0);
}

#[test]
fn non_finite_loss_aborts_before_generator_update() {
    let mut f = fixture();
    f.executor.lambdas_mut().lambda_mel = f32::NAN;
    let batch = synthetic_batch(&[(6, 40), (4, 36)], f.n_token);
    let before = snapshot(&f.model);

    let err = f
        .executor
        .train_batch(&mut f.model, &mut f.optimizer, &WorkerContext::single(), &batch, 41)
        .expect_err("NaN loss must abort");
    match err.downcast_ref::<TrainError>() {
        Some(TrainError::NonFiniteLoss { step, value }) => {
            assert_eq!(*step, 41);
            assert!(value.is_nan());
        }
        other => panic!("unexpected error {other:?}"),
    }

    let updated = changed(&before, &f.model);
    for name in ModuleName::GENERATOR {
        assert!(!updated.contains(&name), "{name} was updated");
        assert_eq!(f.optimizer.step_count(name), 0);
    }
}

#[test]
fn frozen_modules_keep_their_weights() {
    let mut f = fixture();
    f.optimizer.freeze(ModuleName::Decoder);
    f.optimizer.freeze(ModuleName::Mpd);
    assert_eq!(f.optimizer.lr(ModuleName::Decoder), 0.0);
    let batch = synthetic_batch(&[(5, 32), (5, 32)], f.n_token);
    let before = snapshot(&f.model);

    let outcome = f
        .executor
        .train_batch(&mut f.model, &mut f.optimizer, &WorkerContext::single(), &batch, 0)
        .expect("train batch");
    assert!(matches!(outcome, BatchOutcome::Trained(_)));

    let updated = changed(&before, &f.model);
    assert!(!updated.contains(&ModuleName::Decoder));
    assert!(!updated.contains(&ModuleName::Mpd));
    assert!(updated.contains(&ModuleName::Msd));
    assert!(updated.contains(&ModuleName::Predictor));
}

#[test]
fn invalid_lengths_skip_without_touching_weights() {
    let mut f = fixture();
    let mut batch = synthetic_batch(&[(6, 40), (4, 36)], f.n_token);
    batch.input_lengths[1] = 0;
    let before = snapshot(&f.model);

    let outcome = f
        .executor
        .train_batch(&mut f.model, &mut f.optimizer, &WorkerContext::single(), &batch, 0)
        .expect("skip is not an error");
    assert!(matches!(
        outcome,
        BatchOutcome::Skipped(SkipReason::InvalidLengths(_))
    ));
    assert!(changed(&before, &f.model).is_empty());
    assert_eq!(f.optimizer.step_count(ModuleName::Msd), 0);
}

#[test]
fn too_short_utterance_skips_the_batch() {
    let mut f = fixture();
    // Window = shortest / 2 - 1 = 0 aligner frames.
    let batch = synthetic_batch(&[(4, 40), (2, 2)], f.n_token);
    let outcome = f
        .executor
        .train_batch(&mut f.model, &mut f.optimizer, &WorkerContext::single(), &batch, 0)
        .expect("skip is not an error");
    assert!(matches!(outcome, BatchOutcome::Skipped(_)));
}

#[test]
fn step_updates_only_the_named_module() {
    let mut f = fixture();
    let device = NdArrayDevice::default();
    let wave = Tensor::<TrainBackend, 2>::ones([2, 64], &device).mul_scalar(0.3);
    let before = snapshot(&f.model);

    f.optimizer.zero_grad();
    let msd = f.model.msd.forward(wave.clone());
    let mpd = f.model.mpd.forward(wave);
    let loss = msd
        .scores
        .into_iter()
        .chain(mpd.scores)
        .map(|score| score.powf_scalar(2.0).mean())
        .reduce(|a, b| a + b)
        .expect("at least one score");
    f.optimizer.backward(loss);
    f.optimizer.step(ModuleName::Msd, &mut f.model);

    assert_eq!(changed(&before, &f.model), vec![ModuleName::Msd]);
    assert_eq!(f.optimizer.step_count(ModuleName::Msd), 1);
    assert_eq!(f.optimizer.step_count(ModuleName::Mpd), 0);
}
