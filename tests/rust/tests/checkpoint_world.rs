//! Save/load across a simulated multi-rank world.
//!
//! Each phase builds fresh process groups over the same directory, the way a
//! restarted job would.


use anyhow::Result;
use checkpoint::paths::{checkpoint_dir, distributed_optimizer_path, model_checkpoint_path};
use checkpoint::{LoadSource, Module, StateValue, TrackerEntry};
use common::*;
use parking_lot::Mutex;
use rand::Rng;
use runtime_core::{CheckpointFormat, Error, ProcessGroup, SampleCounters, TrainingArgs};
use std::sync::Arc;
use storage::{join, LocalStorage, StorageBackend};
use tempfile::TempDir;

const SEED: u64 = 1234;

fn world_args(tensor: usize, pipeline: usize, context: usize, data: usize) -> TrainingArgs {
    let mut args = TrainingArgs::default();
    args.train_iters = 1000;
    args.parallel.tensor_model_parallel_size = tensor;
    args.parallel.pipeline_model_parallel_size = pipeline;
    args.parallel.context_parallel_size = context;
    args.parallel.data_parallel_size = data;
    args.checkpoint.save = Some(ROOT.to_string());
    args.checkpoint.load = Some(ROOT.to_string());
    args
}

fn counters() -> SampleCounters {
    SampleCounters {
        consumed_train_samples: 2048,
        consumed_valid_samples: 64,
    }
}

fn unwrap_weight(model: &dyn Module) -> Vec<f32> {
    model
        .state_dict_for_save_checkpoint()
        .ok()
        .and_then(|state| state.get("weight").and_then(StateValue::as_tensor).map(|t| t.data.clone()))
        .unwrap_or_default()
}

#[tokio::test]
async fn test_sharded_round_trip_restores_rank_slices_and_rng() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let dir = temp.path().to_path_buf();

    // Save: each tensor rank owns one half of the weight
    let saved = run_world(topology(2, 1, 1, 1), |group| {
        let dir = dir.clone();
        async move {
            let ckpt = checkpointer(&dir, group.clone(), SEED, false);
            let mut args = world_args(2, 1, 1, 1);
            args.checkpoint.use_dist_ckpt = true;

            let tensor = group.ranks().tensor;
            {
                let mut rng = ckpt.rng().lock();
                for _ in 0..3 {
                    rng.host.gen::<u64>();
                }
            }
            let models: Vec<Box<dyn Module>> = vec![Box::new(
                Stage::new(0, vec![tensor as f32 + 1.0; 4]).with_layout(ShardLayout::Split { rank: tensor, size: 2 }),
            )];
            let optimizer = MockOptimizer::for_rank(group.as_ref(), 7);
            ckpt.save_checkpoint(&args, &counters(), 50, &models, Some(&optimizer), None, 0.0)
                .await?;

            let next = ckpt.rng().lock().clone().host.gen::<u64>();
            Ok(next)
        }
    })
    .await
    .into_iter()
    .collect::<runtime_core::Result<Vec<_>>>()?;

    // Load into fresh ranks at the same layout
    let loaded = run_world(topology(2, 1, 1, 1), |group| {
        let dir = dir.clone();
        async move {
            let ckpt = checkpointer(&dir, group.clone(), SEED, false);
            let mut args = world_args(2, 1, 1, 1);
            args.checkpoint.auto_detect_ckpt_format = true;

            let tensor = group.ranks().tensor;
            let mut models: Vec<Box<dyn Module>> = vec![Box::new(
                Stage::new(0, vec![0.0; 4]).with_layout(ShardLayout::Split { rank: tensor, size: 2 }),
            )];
            let mut optimizer = MockOptimizer::for_rank(group.as_ref(), 0);
            let mut counters = SampleCounters::default();
            let (iteration, _) = ckpt
                .load_checkpoint(
                    &args,
                    &mut counters,
                    &mut models,
                    Some(&mut optimizer),
                    None,
                    LoadSource::Load,
                    true,
                )
                .await?;

            let next = ckpt.rng().lock().host.gen::<u64>();
            Ok((iteration, counters, unwrap_weight(models[0].as_ref()), optimizer.step, next))
        }
    })
    .await
    .into_iter()
    .collect::<runtime_core::Result<Vec<_>>>()?;

    for (tensor, (iteration, counters, weight, step, next)) in loaded.into_iter().enumerate() {
        assert_eq!(iteration, 50);
        assert_eq!(counters.consumed_train_samples, 2048);
        assert_eq!(weight, vec![tensor as f32 + 1.0; 4]);
        assert_eq!(step, 7);
        assert_eq!(next, saved[tensor], "rank {} host stream not restored", tensor);
    }

    let storage = LocalStorage::new(temp.path());
    let group = Arc::new(runtime_core::LocalProcessGroup::single());
    let summary = checkpointer(temp.path(), group, SEED, false)
        .inspect(ROOT, None)
        .await?
        .expect("checkpoint present");
    assert_eq!(summary.format, CheckpointFormat::Sharded);
    assert_eq!(summary.iteration, Some(50));

    let dir = checkpoint_dir(ROOT, TrackerEntry::Iteration(50));
    assert!(storage.exists(&join(&dir, "metadata.json")).await?);
    Ok(())
}

#[tokio::test]
async fn test_sharded_parallelism_change() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let dir = temp.path().to_path_buf();

    // Saved at TP=2, PP=2 with the distributed optimizer; rank 0 holds the
    // replica that gets written
    run_world(topology(2, 2, 1, 1), |group| {
        let dir = dir.clone();
        async move {
            let ckpt = checkpointer(&dir, group.clone(), SEED, false);
            let mut args = world_args(2, 2, 1, 1);
            args.checkpoint.use_dist_ckpt = true;
            args.optimizer.use_distributed_optimizer = true;

            let global = group.ranks().global;
            let models: Vec<Box<dyn Module>> = vec![Box::new(
                Stage::new(0, vec![global as f32; 4]).with_layout(ShardLayout::Replicated { replica: global }),
            )];
            let optimizer = MockOptimizer::for_rank(group.as_ref(), 3);
            ckpt.save_checkpoint(&args, &counters(), 20, &models, Some(&optimizer), None, 0.0)
                .await
        }
    })
    .await
    .into_iter()
    .collect::<runtime_core::Result<Vec<_>>>()?;

    let resume = |use_distributed_optimizer: bool| {
        let dir = dir.clone();
        run_world(topology(4, 1, 1, 1), move |group| {
            let dir = dir.clone();
            async move {
                let ckpt = checkpointer(&dir, group.clone(), SEED, false);
                let mut args = world_args(4, 1, 1, 1);
                args.checkpoint.use_dist_ckpt = true;
                args.optimizer.use_distributed_optimizer = use_distributed_optimizer;

                let global = group.ranks().global;
                let mut models: Vec<Box<dyn Module>> = vec![Box::new(
                    Stage::new(0, vec![9.0; 4]).with_layout(ShardLayout::Replicated { replica: global }),
                )];
                let mut optimizer = MockOptimizer::for_rank(group.as_ref(), 0);
                let before = ckpt.rng().lock().clone().host.gen::<u64>();
                let (iteration, _) = ckpt
                    .load_checkpoint(
                        &args,
                        &mut SampleCounters::default(),
                        &mut models,
                        Some(&mut optimizer),
                        None,
                        LoadSource::Load,
                        true,
                    )
                    .await?;
                let after = ckpt.rng().lock().host.gen::<u64>();
                Ok((iteration, unwrap_weight(models[0].as_ref()), optimizer.step, before == after))
            }
        })
    };

    // The distributed optimizer cannot be resharded, every rank must refuse
    for result in resume(true).await {
        match result {
            Err(Error::ParallelismMismatch {
                checkpoint_tp,
                checkpoint_pp,
                run_tp,
                run_pp,
            }) => assert_eq!((checkpoint_tp, checkpoint_pp, run_tp, run_pp), (2, 2, 4, 1)),
            other => panic!("expected a parallelism mismatch, got {:?}", other.map(|r| r.0)),
        }
    }

    // Without it the load goes through and leaves the RNG streams alone
    for result in resume(false).await {
        let (iteration, weight, step, rng_untouched) = result?;
        assert_eq!(iteration, 20);
        assert_eq!(weight, vec![0.0; 4]);
        assert_eq!(step, 3);
        assert!(rng_untouched);
    }
    Ok(())
}

#[tokio::test]
async fn test_zero2_partitions_per_data_and_context_rank() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let dir = temp.path().to_path_buf();
    let world = topology(1, 1, 2, 4);

    run_world(world, |group| {
        let dir = dir.clone();
        async move {
            let ckpt = checkpointer(&dir, group.clone(), SEED, false);
            let mut args = world_args(1, 1, 2, 4);
            args.optimizer.use_zero2 = true;

            let models: Vec<Box<dyn Module>> = vec![Box::new(Stage::new(0, vec![0.5; 4]))];
            let optimizer = MockOptimizer::for_rank(group.as_ref(), 11);
            ckpt.save_checkpoint(&args, &counters(), 30, &models, Some(&optimizer), None, 0.0)
                .await
        }
    })
    .await
    .into_iter()
    .collect::<runtime_core::Result<Vec<_>>>()?;

    let storage = LocalStorage::new(temp.path());
    let model_dir = join(&checkpoint_dir(ROOT, TrackerEntry::Iteration(30)), "mp_rank_00");
    let partitions: Vec<String> = storage
        .list_dir(&model_dir)
        .await?
        .into_iter()
        .filter(|name| name.starts_with("zero2_optim_"))
        .collect();
    assert_eq!(partitions.len(), 8);
    assert!(partitions.contains(&"zero2_optim_dp3_cp1.pt".to_string()));

    let loaded = run_world(world, |group| {
        let dir = dir.clone();
        async move {
            let ckpt = checkpointer(&dir, group.clone(), SEED, false);
            let mut args = world_args(1, 1, 2, 4);
            args.optimizer.use_zero2 = true;

            let mut models: Vec<Box<dyn Module>> = vec![Box::new(Stage::new(0, vec![0.0; 4]))];
            let mut optimizer = MockOptimizer::for_rank(group.as_ref(), 0);
            let (iteration, _) = ckpt
                .load_checkpoint(
                    &args,
                    &mut SampleCounters::default(),
                    &mut models,
                    Some(&mut optimizer),
                    None,
                    LoadSource::Load,
                    true,
                )
                .await?;
            let labels: Vec<String> = optimizer
                .partitions
                .iter()
                .filter_map(|p| p.get("label").and_then(StateValue::as_text).map(str::to_string))
                .collect();
            Ok((iteration, labels, unwrap_weight(models[0].as_ref())))
        }
    })
    .await
    .into_iter()
    .collect::<runtime_core::Result<Vec<_>>>()?;

    let expected: Vec<String> = (0..4)
        .flat_map(|d| (0..2).map(move |c| format!("dp{}_cp{}", d, c)))
        .collect();
    for (iteration, labels, weight) in loaded {
        assert_eq!(iteration, 30);
        assert_eq!(labels, expected);
        assert_eq!(weight, vec![0.5; 4]);
    }

    let group = Arc::new(runtime_core::LocalProcessGroup::single());
    let summary = checkpointer(temp.path(), group, SEED, false)
        .inspect(ROOT, None)
        .await?
        .expect("checkpoint present");
    assert_eq!(summary.format, CheckpointFormat::Zero2);
    Ok(())
}

#[tokio::test]
async fn test_distributed_optimizer_parameter_state_per_replica() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let dir = temp.path().to_path_buf();
    let world = topology(2, 1, 1, 2);

    let run = |load: bool| {
        let dir = dir.clone();
        run_world(world, move |group| {
            let dir = dir.clone();
            async move {
                let ckpt = checkpointer(&dir, group.clone(), SEED, false);
                let mut args = world_args(2, 1, 1, 2);
                args.optimizer.use_distributed_optimizer = true;

                let mut models: Vec<Box<dyn Module>> = vec![Box::new(Stage::new(0, vec![1.0; 4]))];
                let mut optimizer = MockOptimizer::for_rank(group.as_ref(), 5);
                if load {
                    optimizer.owner = -1;
                    ckpt.load_checkpoint(
                        &args,
                        &mut SampleCounters::default(),
                        &mut models,
                        Some(&mut optimizer),
                        None,
                        LoadSource::Load,
                        true,
                    )
                    .await?;
                } else {
                    ckpt.save_checkpoint(&args, &counters(), 40, &models, Some(&optimizer), None, 0.0)
                        .await?;
                }
                Ok((group.ranks().global as i64, optimizer.restored_owner))
            }
        })
    };

    run(false).await.into_iter().collect::<runtime_core::Result<Vec<_>>>()?;

    let storage = LocalStorage::new(temp.path());
    let entry = TrackerEntry::Iteration(40);
    for tensor in 0..2 {
        let ranks = runtime_core::ParallelRanks {
            tensor,
            ..Default::default()
        };
        let path = distributed_optimizer_path(ROOT, entry, &ranks, &world);
        assert!(storage.exists(&path).await?, "missing {}", path);
        assert!(storage.exists(&model_checkpoint_path(ROOT, entry, &ranks, &world)).await?);
    }

    for result in run(true).await {
        let (global, restored) = result?;
        assert_eq!(restored, Some(global));
    }
    Ok(())
}

#[tokio::test]
async fn test_data_parallel_random_init_restores_each_replica() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let dir = temp.path().to_path_buf();
    let world = topology(1, 1, 1, 2);
    let expected = Arc::new(Mutex::new(vec![0u64; 2]));

    {
        let expected = expected.clone();
        run_world(world, move |group| {
            let dir = dir.clone();
            let expected = expected.clone();
            async move {
                let ckpt = checkpointer(&dir, group.clone(), SEED, true);
                let mut args = world_args(1, 1, 1, 2);
                args.data_parallel_random_init = true;

                let models: Vec<Box<dyn Module>> = vec![Box::new(Stage::new(0, vec![1.0; 4]))];
                ckpt.save_checkpoint(&args, &counters(), 60, &models, None, None, 0.0).await?;
                let next = ckpt.rng().lock().clone().host.gen::<u64>();
                expected.lock()[group.ranks().data] = next;
                Ok(())
            }
        })
        .await
        .into_iter()
        .collect::<runtime_core::Result<Vec<_>>>()?;
    }

    let dir = temp.path().to_path_buf();
    let restored = run_world(world, move |group| {
        let dir = dir.clone();
        async move {
            // A different seed, so only the checkpoint can line the streams up
            let ckpt = checkpointer(&dir, group.clone(), SEED + 1, true);
            let mut args = world_args(1, 1, 1, 2);
            args.data_parallel_random_init = true;
            args.checkpoint.no_load_optim = true;

            let mut models: Vec<Box<dyn Module>> = vec![Box::new(Stage::new(0, vec![0.0; 4]))];
            ckpt.load_checkpoint(
                &args,
                &mut SampleCounters::default(),
                &mut models,
                None,
                None,
                LoadSource::Load,
                true,
            )
            .await?;
            let next = ckpt.rng().lock().host.gen::<u64>();
            Ok(next)
        }
    })
    .await
    .into_iter()
    .collect::<runtime_core::Result<Vec<_>>>()?;

    let expected = expected.lock().clone();
    assert_ne!(expected[0], expected[1], "replicas should draw different streams");
    assert_eq!(restored, expected);
    Ok(())
}

#[tokio::test]
async fn test_configured_parallelism_must_match_group() -> Result<()> {
    init_tracing();
    let temp = TempDir::new()?;
    let dir = temp.path().to_path_buf();
    let world = topology(2, 1, 1, 1);

    let run = |args: TrainingArgs| {
        let dir = dir.clone();
        run_world(world, move |group| {
            let dir = dir.clone();
            let args = args.clone();
            async move {
                let ckpt = checkpointer(&dir, group.clone(), SEED, false);
                let tensor = group.ranks().tensor;
                let models: Vec<Box<dyn Module>> = vec![Box::new(
                    Stage::new(0, vec![1.0; 4]).with_layout(ShardLayout::Split { rank: tensor, size: 2 }),
                )];
                let optimizer = MockOptimizer::for_rank(group.as_ref(), 1);
                ckpt.save_checkpoint(&args, &counters(), 10, &models, Some(&optimizer), None, 0.0)
                    .await?;

                let mut models: Vec<Box<dyn Module>> = vec![Box::new(
                    Stage::new(0, vec![0.0; 4]).with_layout(ShardLayout::Split { rank: tensor, size: 2 }),
                )];
                let mut optimizer = MockOptimizer::for_rank(group.as_ref(), 0);
                let (iteration, _) = ckpt
                    .load_checkpoint(
                        &args,
                        &mut SampleCounters::default(),
                        &mut models,
                        Some(&mut optimizer),
                        None,
                        LoadSource::Load,
                        true,
                    )
                    .await?;
                Ok(iteration)
            }
        })
    };

    // Parallel sizes left at their defaults on a TP=2 world
    let mut stale = TrainingArgs::default();
    stale.train_iters = 1000;
    stale.checkpoint.save = Some(ROOT.to_string());
    stale.checkpoint.load = Some(ROOT.to_string());
    stale.checkpoint.use_dist_ckpt = true;
    stale.optimizer.use_distributed_optimizer = true;
    for result in run(stale.clone()).await {
        assert!(matches!(result, Err(Error::InvalidConfig { .. })), "got {:?}", result);
    }
    let storage = LocalStorage::new(temp.path());
    assert!(!storage.exists(&checkpoint::paths::tracker_path(ROOT)).await?);

    // The same run described correctly saves and resumes
    let mut args = world_args(2, 1, 1, 1);
    args.checkpoint = stale.checkpoint.clone();
    args.optimizer.use_distributed_optimizer = true;
    for result in run(args).await {
        assert_eq!(result?, 10);
    }
    Ok(())
}
