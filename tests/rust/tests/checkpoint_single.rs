//! Save/load behaviour of a single, non-distributed process


use anyhow::Result;
use checkpoint::codec::MonolithicCodec;
use checkpoint::paths::{read_tracker, tracker_path};
use checkpoint::record::{CHECKPOINT_VERSION_KEY, LEGACY_ITERATION_KEY, MODEL_KEY};
use checkpoint::{LoadSource, Module, StateDict, StateValue, Tensor, TrackerEntry};
use common::*;
use parking_lot::Mutex;
use rand::Rng;
use runtime_core::{Error, LocalProcessGroup, SampleCounters, TrainingArgs};
use std::sync::Arc;
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;

fn args() -> TrainingArgs {
    let mut args = TrainingArgs::default();
    args.train_iters = 1000;
    args.checkpoint.save = Some(ROOT.to_string());
    args.checkpoint.load = Some(ROOT.to_string());
    args
}

fn wrapped(weight: Vec<f32>) -> Vec<Box<dyn Module>> {
    vec![Box::new(Wrapper(Box::new(Wrapper(Box::new(Stage::new(0, weight))))))]
}

#[tokio::test]
async fn test_round_trip_restores_everything() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group.clone(), 1234, false);
    let args = args();

    let counters = SampleCounters {
        consumed_train_samples: 4096,
        consumed_valid_samples: 256,
    };
    let optimizer = MockOptimizer::for_rank(group.as_ref(), 42);
    let scheduler = MockScheduler { num_steps: 42 };

    // Advance the streams so the saved positions are not the seed positions
    {
        let mut rng = ckpt.rng().lock();
        rng.host.gen::<u64>();
        rng.device.gen::<u32>();
        if let Some(tracker) = rng.tracker.fork("model-parallel-rng") {
            tracker.gen::<u64>();
        }
    }

    ckpt.save_checkpoint(
        &args,
        &counters,
        100,
        &wrapped(vec![0.25; 8]),
        Some(&optimizer),
        Some(&scheduler),
        4.4e12,
    )
    .await?;

    let expected = {
        let mut saved = ckpt.rng().lock().clone();
        let tracker: u64 = saved.tracker.fork("model-parallel-rng").map(|r| r.gen()).unwrap_or_default();
        (saved.host.gen::<u64>(), saved.array.gen::<u64>(), saved.framework.gen::<u64>(), saved.device.gen::<u64>(), tracker)
    };

    // Training continues and moves every stream
    {
        let mut rng = ckpt.rng().lock();
        for _ in 0..16 {
            rng.host.gen::<u64>();
            rng.array.gen::<u64>();
            rng.framework.gen::<u64>();
            rng.device.gen::<u64>();
        }
    }

    let mut models = wrapped(vec![0.0; 8]);
    let mut restored_optimizer = MockOptimizer::default();
    let mut restored_scheduler = MockScheduler::default();
    let mut live = SampleCounters::default();
    let (iteration, flops) = ckpt
        .load_checkpoint(
            &args,
            &mut live,
            &mut models,
            Some(&mut restored_optimizer),
            Some(&mut restored_scheduler),
            LoadSource::Load,
            true,
        )
        .await?;

    assert_eq!(iteration, 100);
    assert_eq!(flops, 4.4e12);
    assert_eq!(live, counters);
    assert_eq!(restored_optimizer.step, 42);
    assert_eq!(restored_scheduler.num_steps, 42);

    let state = checkpoint::unwrap_module(models[0].as_ref()).state_dict_for_save_checkpoint()?;
    assert_eq!(
        state.get("weight").and_then(StateValue::as_tensor).map(|t| t.data.clone()),
        Some(vec![0.25; 8])
    );

    let actual = {
        let mut rng = ckpt.rng().lock();
        let tracker: u64 = rng.tracker.fork("model-parallel-rng").map(|r| r.gen()).unwrap_or_default();
        (rng.host.gen::<u64>(), rng.array.gen::<u64>(), rng.framework.gen::<u64>(), rng.device.gen::<u64>(), tracker)
    };
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test]
async fn test_load_twice_yields_same_iteration() -> Result<()> {
    let temp = TempDir::new()?;
    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 7, false);
    let args = args();

    let counters = SampleCounters {
        consumed_train_samples: 64,
        consumed_valid_samples: 0,
    };
    ckpt.save_checkpoint(&args, &counters, 30, &wrapped(vec![1.0; 4]), None, None, 99.0)
        .await?;

    let mut results = Vec::new();
    for _ in 0..2 {
        let mut live = SampleCounters::default();
        let result = ckpt
            .load_checkpoint(&args, &mut live, &mut wrapped(vec![0.0; 4]), None, None, LoadSource::Load, true)
            .await?;
        assert_eq!(live, counters);
        results.push(result);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], (30, 99.0));
    Ok(())
}

#[tokio::test]
async fn test_flops_past_integer_range_survive_resume() -> Result<()> {
    let temp = TempDir::new()?;
    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 7, false);
    let args = args();

    // A 1B-parameter model over 1.5T tokens
    let flops = 9.0e21;
    assert!(flops > i64::MAX as f64 && flops > u64::MAX as f64);
    ckpt.save_checkpoint(&args, &SampleCounters::default(), 5, &wrapped(vec![1.0]), None, None, flops)
        .await?;

    let (iteration, restored) = ckpt
        .load_checkpoint(
            &args,
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.0]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await?;
    assert_eq!((iteration, restored), (5, flops));

    let summary = ckpt.inspect(ROOT, None).await?.expect("checkpoint present");
    assert_eq!(summary.num_floating_point_operations_so_far, flops);
    Ok(())
}

#[tokio::test]
async fn test_tracker_reflects_latest_save_after_retry() -> Result<()> {
    let temp = TempDir::new()?;
    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 7, false);
    let storage = LocalStorage::new(temp.path());
    let args = args();
    let counters = SampleCounters::default();

    for iteration in [10, 20, 30] {
        ckpt.save_checkpoint(&args, &counters, iteration, &wrapped(vec![1.0]), None, None, 0.0)
            .await?;
        assert_eq!(
            read_tracker(&storage, ROOT).await?,
            Some(TrackerEntry::Iteration(iteration))
        );
    }

    // Retrying an earlier save must not move the tracker backwards
    ckpt.save_checkpoint(&args, &counters, 20, &wrapped(vec![1.0]), None, None, 0.0)
        .await?;
    assert_eq!(read_tracker(&storage, ROOT).await?, Some(TrackerEntry::Iteration(30)));

    let (iteration, _) = ckpt
        .load_checkpoint(
            &args,
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.0]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await?;
    assert_eq!(iteration, 30);
    Ok(())
}

#[tokio::test]
async fn test_release_checkpoint_skips_optimizer_and_rng() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = LocalStorage::new(temp.path());

    // A release record: no iteration, no optimizer, no rng
    let mut model = StateDict::new();
    model.insert("weight".to_string(), Tensor::new(vec![2], vec![3.0, 4.0]).into());
    let mut record = StateDict::new();
    record.insert(MODEL_KEY.to_string(), StateValue::Map(model));
    record.insert(CHECKPOINT_VERSION_KEY.to_string(), StateValue::Float(3.0));
    storage
        .write("ckpt/release/mp_rank_00/model_optim_rng.pt", MonolithicCodec::encode(&record)?)
        .await?;
    storage.write(&tracker_path(ROOT), "release".into()).await?;

    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group.clone(), 5, false);
    let before = ckpt.rng().lock().clone();

    let mut optimizer = MockOptimizer::for_rank(group.as_ref(), 11);
    let mut scheduler = MockScheduler { num_steps: 11 };
    let mut models = wrapped(vec![0.0; 2]);
    let (iteration, flops) = ckpt
        .load_checkpoint(
            &args(),
            &mut SampleCounters::default(),
            &mut models,
            Some(&mut optimizer),
            Some(&mut scheduler),
            LoadSource::Load,
            true,
        )
        .await?;

    assert_eq!((iteration, flops), (0, 0.0));
    assert_eq!(optimizer.step, 11);
    assert_eq!(scheduler.num_steps, 11);
    assert_eq!(ckpt.rng().lock().host, before.host);

    let state = checkpoint::unwrap_module(models[0].as_ref()).state_dict_for_save_checkpoint()?;
    assert_eq!(
        state.get("weight").and_then(StateValue::as_tensor).map(|t| t.data.clone()),
        Some(vec![3.0, 4.0])
    );
    Ok(())
}

#[tokio::test]
async fn test_three_stages_are_keyed_and_restored_in_order() -> Result<()> {
    let temp = TempDir::new()?;
    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group.clone(), 3, false);
    let args = args();

    let stages: Vec<Box<dyn Module>> = (0..3)
        .map(|i| Box::new(Wrapper(Box::new(Stage::new(i, vec![i as f32; 2])))) as Box<dyn Module>)
        .collect();
    ckpt.save_checkpoint(&args, &SampleCounters::default(), 12, &stages, None, None, 0.0)
        .await?;
    assert_eq!(group.stage_history(), vec![0, 1, 2]);

    let summary = ckpt.inspect(ROOT, None).await?.expect("checkpoint present");
    for key in ["model0", "model1", "model2"] {
        assert!(summary.keys.iter().any(|k| k == key), "missing {}", key);
    }
    assert!(!summary.keys.iter().any(|k| k == MODEL_KEY));

    let loads = Arc::new(Mutex::new(Vec::new()));
    let mut fresh: Vec<Box<dyn Module>> = (0..3)
        .map(|i| {
            Box::new(Stage::new(i, vec![-1.0; 2]).observed_by(group.clone(), loads.clone())) as Box<dyn Module>
        })
        .collect();
    ckpt.load_checkpoint(
        &args,
        &mut SampleCounters::default(),
        &mut fresh,
        None,
        None,
        LoadSource::Load,
        true,
    )
    .await?;

    assert_eq!(*loads.lock(), vec![(0, Some(0)), (1, Some(1)), (2, Some(2))]);
    for (i, stage) in fresh.iter().enumerate() {
        let state = stage.state_dict_for_save_checkpoint()?;
        assert_eq!(
            state.get("weight").and_then(StateValue::as_tensor).map(|t| t.data[0]),
            Some(i as f32)
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_legacy_module_names_load_through_aliases() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = LocalStorage::new(temp.path());

    let mut model = StateDict::new();
    model.insert("weight".to_string(), Tensor::new(vec![1], vec![9.0]).into());
    let mut record = StateDict::new();
    record.insert(MODEL_KEY.to_string(), StateValue::Map(model));
    record.insert(LEGACY_ITERATION_KEY.to_string(), StateValue::Int(77));
    let data = MonolithicCodec::encode_with_modules(&record, &["megatron.model", "megatron.fp16.loss_scaler"])?;
    storage
        .write("ckpt/iter_0000077/mp_rank_00/model_optim_rng.pt", data)
        .await?;
    storage.write(&tracker_path(ROOT), "77".into()).await?;

    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 1, false);
    let mut args = args();
    args.checkpoint.no_load_rng = true;

    let (iteration, flops) = ckpt
        .load_checkpoint(
            &args,
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.0]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await?;
    assert_eq!((iteration, flops), (77, 0.0));
    Ok(())
}

#[tokio::test]
async fn test_missing_rng_state_is_fatal_with_hint() -> Result<()> {
    let temp = TempDir::new()?;
    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 1, false);
    let mut args = args();
    args.checkpoint.no_save_rng = true;
    ckpt.save_checkpoint(&args, &SampleCounters::default(), 4, &wrapped(vec![1.0]), None, None, 0.0)
        .await?;

    let err = ckpt
        .load_checkpoint(
            &args,
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.0]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingRngState { .. }));
    assert!(err.operator_hint().unwrap_or_default().contains("--no-load-rng"));

    args.checkpoint.no_load_rng = true;
    let (iteration, _) = ckpt
        .load_checkpoint(
            &args,
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.0]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await?;
    assert_eq!(iteration, 4);
    Ok(())
}

#[tokio::test]
async fn test_malformed_tracker_is_fatal() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = LocalStorage::new(temp.path());
    storage.write(&tracker_path(ROOT), "0".into()).await?;

    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 1, false);
    let result = ckpt
        .load_checkpoint(
            &args(),
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.0]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await;
    assert!(matches!(result, Err(Error::MalformedTracker { .. })));
    Ok(())
}

#[tokio::test]
async fn test_lenient_load_tolerates_missing_weights() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = LocalStorage::new(temp.path());
    let mut record = StateDict::new();
    record.insert(MODEL_KEY.to_string(), StateValue::Map(StateDict::new()));
    record.insert("iteration".to_string(), StateValue::Int(8));
    storage
        .write("ckpt/iter_0000008/mp_rank_00/model_optim_rng.pt", MonolithicCodec::encode(&record)?)
        .await?;
    storage.write(&tracker_path(ROOT), "8".into()).await?;

    let group = Arc::new(LocalProcessGroup::single());
    let ckpt = checkpointer(temp.path(), group, 1, false);
    let mut args = args();
    args.checkpoint.no_load_rng = true;

    let strict = ckpt
        .load_checkpoint(
            &args,
            &mut SampleCounters::default(),
            &mut wrapped(vec![0.5]),
            None,
            None,
            LoadSource::Load,
            true,
        )
        .await;
    assert!(matches!(strict, Err(Error::StateKeyMismatch { .. })));

    let mut models = wrapped(vec![0.5]);
    ckpt.load_checkpoint(
        &args,
        &mut SampleCounters::default(),
        &mut models,
        None,
        None,
        LoadSource::Load,
        false,
    )
    .await?;
    let state = checkpoint::unwrap_module(models[0].as_ref()).state_dict_for_save_checkpoint()?;
    assert_eq!(
        state.get("weight").and_then(StateValue::as_tensor).map(|t| t.data.clone()),
        Some(vec![0.5])
    );
    Ok(())
}
