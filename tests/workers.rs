mod common;

use burn_ndarray::NdArrayDevice;
use common::{synthetic_batch, tiny_config, tiny_dims, TrainBackend};
use styletts_train::model::TtsModel;
use styletts_train::runtime::launch;
use styletts_train::train::{BatchOutcome, OptimizerCoordinator, StepExecutor};
use styletts_train::TrainError;

#[test]
fn reductions_agree_across_many_rounds() {
    let results = launch(3, |ctx| {
        let mut seen = Vec::new();
        for round in 0..20 {
            ctx.sync_point("discriminator")?;
            let local = (ctx.rank * 10 + round) as f64;
            seen.push(ctx.all_reduce_mean("loss_test", local)?);
            ctx.sync_point("generator")?;
        }
        Ok(seen)
    })
    .expect("launch");
    for round in 0..20 {
        let expected = (0.0 + 10.0 + 20.0) / 3.0 + round as f64;
        for worker in &results {
            assert!((worker[round] - expected).abs() < 1e-12);
        }
    }
}

#[test]
fn diverging_worker_aborts_its_peers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config(dir.path());
    let dims = tiny_dims(&config);

    let err = launch(2, |ctx| {
        let device = NdArrayDevice::default();
        let mut model = TtsModel::<TrainBackend>::new(&dims, 3, &device);
        let mut optimizer = OptimizerCoordinator::new(&config.optimizer_params, 10);
        let mut executor = StepExecutor::new(&config, ctx.seed(config.seed), &device);
        if ctx.rank == 1 {
            executor.lambdas_mut().lambda_gen = f32::INFINITY;
        }
        let batch = synthetic_batch(&[(5, 32), (4, 30)], dims.n_token);
        for step in 0..3 {
            let outcome = executor.train_batch(&mut model, &mut optimizer, &ctx, &batch, step)?;
            assert!(matches!(outcome, BatchOutcome::Trained(_)));
        }
        Ok(())
    })
    .expect_err("one worker diverges");

    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::NonFiniteLoss { step: 0, .. })
    ));
}
