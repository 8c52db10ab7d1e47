use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use conditions_core::prelude::*;

const ALIGNMENT: ConditionKey = ConditionKey(0xAABB);

fn manager() -> (Arc<ConditionsManager>, Arc<IovType>) {
    let manager = ConditionsManager::builder()
        .max_iov_types(4)
        .cleanup(None)
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    (manager, run)
}

fn key(first: i64, second: i64) -> IovKey {
    IovKey::new(first, second).unwrap()
}

fn content(keys: &[ConditionKey]) -> Arc<ConditionsContent> {
    let mut content = ConditionsContent::new();
    for key in keys {
        content.insert_key(*key, format!("conditions/{}", key));
    }
    Arc::new(content)
}

#[test]
fn prepare_resolves_the_pool_covering_the_point() {
    let (manager, run) = manager();
    let first = manager.register_iov(&run, key(1, 10)).unwrap();
    let second = manager.register_iov(&run, key(11, 20)).unwrap();
    assert!(manager
        .register_unlocked(&first, ConditionBuilder::new(ALIGNMENT).with_value(1i32))
        .unwrap());
    assert!(manager
        .register_unlocked(&second, ConditionBuilder::new(ALIGNMENT).with_value(2i32))
        .unwrap());

    let mut slice = ConditionsSlice::new(manager.clone(), content(&[ALIGNMENT]));

    let result = slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap();
    assert_eq!(result.selected, 1);
    assert_eq!(slice.get_key(ALIGNMENT).unwrap().value::<i32>(), Some(&1));
    assert_eq!(slice.validity().unwrap().key(), key(1, 10));

    let result = slice.prepare(&Iov::discrete(run.clone(), 15)).unwrap();
    assert_eq!(result.selected, 1);
    assert_eq!(slice.get_key(ALIGNMENT).unwrap().value::<i32>(), Some(&2));

    let result = slice.prepare(&Iov::discrete(run, 25)).unwrap();
    assert_eq!(result.missing, 1);
    assert_eq!(result.total(), 1);
    assert!(slice.get_key(ALIGNMENT).is_none());
}

#[test]
fn iov_type_registration_is_idempotent() {
    let (manager, run) = manager();
    let again = manager.register_iov_type(0, "run").unwrap();
    assert_eq!(*again, *run);

    assert!(matches!(
        manager.register_iov_type(0, "event"),
        Err(ConditionsError::IovTypeConflict { index: 0, .. })
    ));
    assert!(matches!(
        manager.register_iov_type(4, "lumi"),
        Err(ConditionsError::IovTypeOutOfBounds { capacity: 4, .. })
    ));

    let event = manager.register_iov_type(3, "event").unwrap();
    assert_eq!(manager.iov_type_by_name("event").unwrap().index(), 3);
    assert_eq!(manager.iov_type(0).unwrap().name(), "run");
    assert!(manager.iov_type(1).is_none());
    assert_eq!(manager.iov_types(), vec![run, event]);
}

#[test]
fn prepare_rejects_ranges_and_unknown_types() {
    let (manager, run) = manager();
    let mut slice = ConditionsSlice::new(manager.clone(), content(&[ALIGNMENT]));

    assert!(matches!(
        slice.prepare(&Iov::range(run, 1, 10).unwrap()),
        Err(ConditionsError::InvalidIov(_))
    ));

    let other = ConditionsManager::builder().max_iov_types(4).build();
    let foreign = other.register_iov_type(1, "event").unwrap();
    assert!(matches!(
        slice.prepare(&Iov::discrete(foreign, 1)),
        Err(ConditionsError::UnknownIovType(_))
    ));
}

#[test]
fn loaded_conditions_are_registered_and_reused() {
    let loader = Arc::new(MemoryLoader::new());
    loader.insert(ConditionKey(1), key(1, 10), 1.5f64);
    loader.insert(ConditionKey(2), key(1, 100), 2.5f64);
    let manager = ConditionsManager::builder()
        .max_iov_types(2)
        .loader(loader.clone())
        .cleanup(None)
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    let keys = [ConditionKey(1), ConditionKey(2), ConditionKey(3)];
    let mut slice = ConditionsSlice::new(manager.clone(), content(&keys));

    let first = slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap();
    assert_eq!(first.loaded, 2);
    assert_eq!(first.missing, 1);
    assert_eq!(first.total(), keys.len());
    assert_eq!(slice.validity().unwrap().key(), key(1, 10));

    let second = slice.prepare(&Iov::discrete(run.clone(), 6)).unwrap();
    assert_eq!(second.selected, 2);
    assert_eq!(second.loaded, 0);
    assert_eq!(second.computed, 0);
    assert_eq!(loader.load_count(), 2);

    let loaded = slice.get_key(ConditionKey(1)).unwrap();
    assert!(loaded.is_active());
    assert_eq!(loaded.address(), Some("conditions/0000000000000001"));
    assert_eq!(manager.statistics().pools(), 2);
}

#[test]
fn loaded_validity_must_cover_the_point() {
    struct StaleLoader;

    impl DataLoader for StaleLoader {
        fn load(&self, key: ConditionKey, _info: &LoadInfo, _iov: &Iov) -> Result<Loaded, LoaderError> {
            Ok(Loaded {
                validity: IovKey::new(100, 200).unwrap(),
                condition: ConditionBuilder::new(key).with_value(0u8),
            })
        }
    }

    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .loader(Arc::new(StaleLoader))
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    let mut slice = ConditionsSlice::new(manager.clone(), content(&[ALIGNMENT]));

    let result = slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap();
    assert_eq!(result.missing, 1);
    assert!(slice.get_key(ALIGNMENT).is_none());

    let mut found = Vec::new();
    assert!(manager
        .select(ALIGNMENT, &Iov::discrete(run, 150), &mut found)
        .unwrap());
}

#[test]
fn storage_failures_abort_the_request() {
    struct BrokenLoader;

    impl DataLoader for BrokenLoader {
        fn load(&self, _key: ConditionKey, _info: &LoadInfo, _iov: &Iov) -> Result<Loaded, LoaderError> {
            Err(LoaderError::Storage(anyhow::anyhow!("database unavailable")))
        }
    }

    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .loader(Arc::new(BrokenLoader))
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    let mut slice = ConditionsSlice::new(manager, content(&[ALIGNMENT]));

    match slice.prepare(&Iov::discrete(run, 5)) {
        Err(ConditionsError::Storage { key, .. }) => assert_eq!(key, ALIGNMENT),
        other => panic!("expected a storage error, got {:?}", other),
    }
}

#[test]
fn overlapping_validities_are_ambiguous() {
    let (manager, run) = manager();
    for range in [key(1, 10), key(5, 15)] {
        let pool = manager.register_iov(&run, range).unwrap();
        manager
            .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(range))
            .unwrap();
    }
    let mut slice = ConditionsSlice::new(manager, content(&[ALIGNMENT]));

    assert!(matches!(
        slice.prepare(&Iov::discrete(run.clone(), 7)),
        Err(ConditionsError::AmbiguousCondition { candidates: 2, .. })
    ));
    assert_eq!(slice.prepare(&Iov::discrete(run, 3)).unwrap().selected, 1);
}

#[test]
fn derived_conditions_follow_their_dependencies() {
    let loader = Arc::new(MemoryLoader::new());
    loader.insert(ConditionKey(1), key(1, 10), 1.0f64);
    loader.insert(ConditionKey(2), key(5, 20), 2.0f64);

    let mut engine = CallbackEngine::new();
    engine.register(ConditionKey(3), |key, deps, _| {
        let sum: f64 = deps.iter().filter_map(|d| d.value::<f64>()).sum();
        Ok(ConditionBuilder::new(key).with_value(sum))
    });
    engine.register(ConditionKey(4), |key, deps, ctx| {
        let base = deps[0]
            .value::<f64>()
            .ok_or(DerivationError::MissingDependency(deps[0].key()))?;
        let scale = ctx.user::<f64>().copied().unwrap_or(1.0);
        Ok(ConditionBuilder::new(key).with_value(base * scale))
    });
    engine.register(ConditionKey(5), |key, _, _| {
        Ok(ConditionBuilder::new(key).with_value(0.0f64))
    });

    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .loader(loader)
        .derivation(Arc::new(engine))
        .cleanup(None)
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();

    let mut declared = ConditionsContent::new();
    declared.insert_key(ConditionKey(1), "a");
    declared.insert_key(ConditionKey(2), "b");
    declared.add_dependency(ConditionKey(4), vec![ConditionKey(3)]);
    declared.add_dependency(ConditionKey(3), vec![ConditionKey(1), ConditionKey(2)]);
    declared.add_dependency(ConditionKey(5), vec![ConditionKey(99)]);
    let mut slice = ConditionsSlice::new(manager.clone(), Arc::new(declared));

    let iov = Iov::discrete(run.clone(), 7);
    let scale = 10.0f64;
    let result = manager.prepare(&iov, &mut slice, Some(&scale)).unwrap();
    assert_eq!(result.loaded, 2);
    assert_eq!(result.computed, 2);
    assert_eq!(result.missing, 1);
    assert_eq!(result.total(), 5);

    let sum = slice.get_key(ConditionKey(3)).unwrap();
    assert!(sum.is_derived());
    assert_eq!(sum.value::<f64>(), Some(&3.0));
    assert_eq!(sum.iov().key(), key(5, 10));
    assert_eq!(slice.get_key(ConditionKey(4)).unwrap().value::<f64>(), Some(&30.0));
    assert_eq!(slice.validity().unwrap().key(), key(5, 10));

    let again = slice.prepare(&Iov::discrete(run, 8)).unwrap();
    assert_eq!(again.selected, 4);
    assert_eq!(again.computed, 0);
    assert_eq!(again.missing, 1);
}

#[test]
fn repeated_prepare_for_the_same_iov_only_selects() {
    let loader = Arc::new(MemoryLoader::new());
    loader.insert(ConditionKey(1), key(1, 10), 4i32);
    let mut engine = CallbackEngine::new();
    engine.register(ConditionKey(2), |key, deps, _| {
        let base = deps[0]
            .value::<i32>()
            .ok_or(DerivationError::MissingDependency(deps[0].key()))?;
        Ok(ConditionBuilder::new(key).with_value(base * 2))
    });
    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .loader(loader.clone())
        .derivation(Arc::new(engine))
        .cleanup(None)
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();

    let mut declared = ConditionsContent::new();
    declared.insert_key(ConditionKey(1), "a");
    declared.add_dependency(ConditionKey(2), vec![ConditionKey(1)]);
    declared.insert_key(ConditionKey(3), "absent");
    let mut slice = ConditionsSlice::new(manager, Arc::new(declared));

    let iov = Iov::discrete(run, 4);
    let first = slice.prepare(&iov).unwrap();
    assert_eq!(
        first,
        PrepareResult {
            selected: 0,
            loaded: 1,
            computed: 1,
            missing: 1,
        }
    );

    let second = slice.prepare(&iov).unwrap();
    assert_eq!(
        second,
        PrepareResult {
            selected: 2,
            loaded: 0,
            computed: 0,
            missing: 1,
        }
    );
    assert_eq!(second.total(), first.total());
    assert_eq!(second.selected + second.missing, second.total());
    assert_eq!(loader.load_count(), 1);
    assert_eq!(slice.get_key(ConditionKey(2)).unwrap().value::<i32>(), Some(&8));
}

#[test]
fn compute_requires_a_bound_slice() {
    let (manager, run) = manager();
    let mut slice = ConditionsSlice::new(manager.clone(), content(&[]));
    assert!(matches!(
        manager.compute(&Iov::discrete(run, 1), &mut slice, None),
        Err(ConditionsError::UnboundSlice)
    ));
}

#[test]
fn listeners_observe_every_registration() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .listener(Arc::new(move |_: &Condition| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();

    manager
        .register_unlocked(&pool, ConditionBuilder::new(1u64).with_value(1))
        .unwrap();
    assert!(!manager
        .register_unlocked(&pool, ConditionBuilder::new(1u64).with_value(1))
        .unwrap());
    manager
        .queue_update(&Iov::discrete(run, 3), ConditionBuilder::new(2u64).with_value(2))
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    manager.push_updates();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn listeners_may_read_the_manager_while_updates_are_pushed() {
    let (manager, run) = manager();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let weak = Arc::downgrade(&manager);
    manager.add_listener(Arc::new(move |condition: &Condition| {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        let mut found = Vec::new();
        if manager
            .select(condition.key(), condition.iov(), &mut found)
            .unwrap_or(false)
        {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .register_unlocked(&pool, ConditionBuilder::new(1u64).with_value(1))
        .unwrap();
    manager
        .queue_update(
            &Iov::range(run.clone(), 11, 20).unwrap(),
            ConditionBuilder::new(2u64).with_value(2),
        )
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    let pushing = manager.clone();
    std::thread::spawn(move || {
        let _ = sender.send(pushing.push_updates());
    });
    let merged = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("push_updates did not return");
    assert_eq!(merged, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn adopted_cleanup_applies_to_following_requests() {
    let (manager, run) = manager();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(1))
        .unwrap();
    let mut slice = ConditionsSlice::new(manager.clone(), content(&[ALIGNMENT]));

    slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap();
    assert_eq!(manager.statistics().pools(), 1);

    manager.adopt_cleanup(Some(Arc::new(FullCleanup)));
    assert_eq!(slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap().selected, 1);
    assert_eq!(manager.statistics().pools(), 0);

    manager.adopt_cleanup(None);
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(2))
        .unwrap();
    assert_eq!(slice.prepare(&Iov::discrete(run, 5)).unwrap().selected, 1);
    assert_eq!(manager.statistics().pools(), 1);
}

#[test]
fn staged_updates_are_visible_before_they_are_pushed() {
    let (manager, run) = manager();
    let staged = manager
        .queue_update(
            &Iov::range(run.clone(), 1, 10).unwrap(),
            ConditionBuilder::new(ALIGNMENT).with_value("staged"),
        )
        .unwrap();
    assert!(!staged.is_active());
    assert_eq!(manager.statistics().staged, 1);

    let mut found = Vec::new();
    assert!(manager
        .select(ALIGNMENT, &Iov::discrete(run.clone(), 4), &mut found)
        .unwrap());
    assert_eq!(found.len(), 1);

    assert_eq!(manager.push_updates(), 1);
    assert_eq!(manager.push_updates(), 0);
    let statistics = manager.statistics();
    assert_eq!(statistics.staged, 0);
    assert_eq!(statistics.conditions(), 1);

    let mut found = Vec::new();
    manager
        .select(ALIGNMENT, &Iov::discrete(run.clone(), 4), &mut found)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].is_active());
    assert!(found[0].ptr_eq(&staged));
}

#[test]
fn queue_update_rejects_invalid_conditions() {
    let (manager, run) = manager();
    assert!(matches!(
        manager.queue_update(&Iov::discrete(run, 1), ConditionBuilder::new(ALIGNMENT)),
        Err(ConditionsError::InvalidCondition { .. })
    ));
}

#[test]
fn block_register_stops_at_the_first_invalid_condition() {
    let (manager, run) = manager();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    let batch = vec![
        ConditionBuilder::new(1u64).with_value(1),
        ConditionBuilder::new(2u64),
        ConditionBuilder::new(3u64).with_value(3),
    ];
    assert!(matches!(
        manager.block_register(&pool, batch),
        Err(ConditionsError::InvalidCondition { key: ConditionKey(2), .. })
    ));
    assert_eq!(pool.len(), 1);

    let batch = vec![
        ConditionBuilder::new(1u64).with_value(1),
        ConditionBuilder::new(3u64).with_value(3),
    ];
    assert_eq!(manager.block_register(&pool, batch).unwrap(), 1);
}

#[test]
fn select_range_reports_coverage() {
    let (manager, run) = manager();
    for (first, second) in [(1, 10), (11, 20)] {
        let pool = manager.register_iov(&run, key(first, second)).unwrap();
        manager
            .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(first))
            .unwrap();
    }

    let mut found = Vec::new();
    assert!(manager
        .select_range(ALIGNMENT, &Iov::range(run.clone(), 1, 20).unwrap(), &mut found)
        .unwrap());
    assert_eq!(found.len(), 2);

    let mut found = Vec::new();
    assert!(!manager
        .select_range(ALIGNMENT, &Iov::range(run.clone(), 5, 25).unwrap(), &mut found)
        .unwrap());
    assert_eq!(found.len(), 2);

    let mut found = Vec::new();
    assert!(manager
        .select_range(ALIGNMENT, &Iov::range(run, 12, 18).unwrap(), &mut found)
        .unwrap());
    assert_eq!(found.len(), 1);
}

#[test]
fn age_cleanup_drops_pools_that_are_not_used() {
    let (manager, run) = manager();
    for (first, second) in [(1, 10), (11, 20)] {
        let pool = manager.register_iov(&run, key(first, second)).unwrap();
        manager
            .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(first))
            .unwrap();
    }
    let policy = AgeCleanup::new(1);

    assert_eq!(manager.clean_with(&policy), (1, 0));
    let mut found = Vec::new();
    manager
        .select(ALIGNMENT, &Iov::discrete(run.clone(), 5), &mut found)
        .unwrap();

    assert_eq!(manager.clean_with(&policy), (1, 1));
    let statistics = manager.statistics();
    assert_eq!(statistics.pools(), 1);
    assert_eq!(statistics.conditions(), 1);
    let survivor = manager
        .with_iov_pool(&run, |pool| pool.get(&key(1, 10)).is_some())
        .unwrap();
    assert!(survivor);
}

#[test]
fn cleanup_runs_after_compute() {
    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .cleanup(Some(Arc::new(FullCleanup)))
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(1))
        .unwrap();

    let mut slice = ConditionsSlice::new(manager.clone(), content(&[ALIGNMENT]));
    let result = slice.prepare(&Iov::discrete(run, 5)).unwrap();
    assert_eq!(result.selected, 1);
    assert!(slice.get_key(ALIGNMENT).is_some());
    assert_eq!(manager.statistics().pools(), 0);
}

#[test]
fn window_cleanup_keeps_the_active_window() {
    let (manager, run) = manager();
    let event = manager.register_iov_type(1, "event").unwrap();
    for (first, second) in [(1, 10), (11, 20), (21, 30)] {
        manager.register_iov(&run, key(first, second)).unwrap();
        manager.register_iov(&event, key(first, second)).unwrap();
    }
    manager.clean_with(&WindowCleanup::new(0, key(12, 25)));

    assert_eq!(manager.with_iov_pool(&run, |pool| pool.len()).unwrap(), 2);
    assert_eq!(manager.with_iov_pool(&event, |pool| pool.len()).unwrap(), 3);
}

#[test]
fn clean_and_clear_empty_pools() {
    let (manager, run) = manager();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .block_register(
            &pool,
            vec![
                ConditionBuilder::new(1u64).with_value(1),
                ConditionBuilder::new(2u64).with_value(2),
            ],
        )
        .unwrap();

    assert_eq!(manager.clean(&run, 5).unwrap(), 0);
    assert_eq!(manager.clear(), (1, 2));
    assert!(pool.is_empty());
    assert_eq!(manager.statistics().pools(), 1);
}

#[test]
fn fill_content_declares_registered_conditions() {
    let (manager, run) = manager();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .block_register(
            &pool,
            vec![
                ConditionBuilder::new(1u64).with_value(1).with_address("db/1"),
                ConditionBuilder::new(2u64).with_value(2).derived(),
            ],
        )
        .unwrap();

    let mut declared = ConditionsContent::new();
    assert_eq!(manager.fill_content(&mut declared, &run).unwrap(), 1);
    match declared.get(ConditionKey(1)) {
        Some(ContentEntry::Load(info)) => assert_eq!(info.address, "db/1"),
        other => panic!("unexpected entry {:?}", other),
    }
    assert!(!declared.contains(ConditionKey(2)));
}

#[test]
fn slice_insert_registers_under_the_combined_validity() {
    let (manager, run) = manager();
    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    manager
        .register_unlocked(&pool, ConditionBuilder::new(ALIGNMENT).with_value(1))
        .unwrap();
    let mut slice = ConditionsSlice::new(manager.clone(), content(&[ALIGNMENT]));

    let detector = "/world/tracker";
    let item = ConditionKey::for_item(detector, 7);
    assert!(matches!(
        slice.insert(detector, 7, ConditionBuilder::new(item).with_value(7)),
        Err(ConditionsError::UnboundSlice)
    ));

    slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap();
    assert!(slice
        .insert(detector, 7, ConditionBuilder::new(item).with_value(7))
        .unwrap());
    assert_eq!(slice.get(detector, 7).unwrap().value::<i32>(), Some(&7));
    assert!(pool.contains(item));

    assert!(matches!(
        slice.insert(detector, 7, ConditionBuilder::new(item).with_value(8)),
        Err(ConditionsError::RegistrationFailed { .. })
    ));
}

#[test]
fn manage_honours_registration_flags() {
    let (manager, run) = manager();
    let mut slice = ConditionsSlice::new(manager.clone(), content(&[]));
    slice.prepare(&Iov::discrete(run.clone(), 5)).unwrap();

    assert!(slice
        .manage(None, ConditionBuilder::new(1u64).with_value(1), ManageFlags::REGISTER_POOL)
        .unwrap());
    assert!(slice.get_key(ConditionKey(1)).is_some());
    assert_eq!(manager.statistics().conditions(), 0);

    let pool = manager.register_iov(&run, key(1, 10)).unwrap();
    assert!(slice
        .manage(
            Some(&pool),
            ConditionBuilder::new(2u64).with_value(2),
            ManageFlags::REGISTER_MANAGER
        )
        .unwrap());
    assert!(pool.contains(ConditionKey(2)));
    assert!(slice.get_key(ConditionKey(2)).is_none());

    assert!(slice
        .manage(
            Some(&pool),
            ConditionBuilder::new(3u64).with_value(3),
            ManageFlags::REGISTER_FULL
        )
        .unwrap());
    assert!(slice.get_key(ConditionKey(3)).unwrap().is_active());

    assert!(matches!(
        slice.manage(None, ConditionBuilder::new(4u64), ManageFlags::REGISTER_FULL),
        Err(ConditionsError::InvalidCondition { .. })
    ));

    slice.reset();
    assert_eq!(slice.pool().len(), 0);
    assert!(slice.iov().is_none());
}

#[test]
fn concurrent_requests_share_loaded_conditions() {
    let loader = Arc::new(MemoryLoader::new());
    let keys: Vec<ConditionKey> = (0..50).map(ConditionKey).collect();
    for key in &keys {
        for block in 0..4 {
            let first = block * 10 + 1;
            loader.insert(*key, IovKey::new(first, first + 9).unwrap(), first);
        }
    }
    let manager = ConditionsManager::builder()
        .max_iov_types(1)
        .loader(loader)
        .cleanup(None)
        .build();
    let run = manager.register_iov_type(0, "run").unwrap();
    let declared = content(&keys);

    std::thread::scope(|scope| {
        for worker in 0..8i64 {
            let manager = manager.clone();
            let declared = declared.clone();
            let run = run.clone();
            scope.spawn(move || {
                let mut slice = ConditionsSlice::new(manager, declared);
                for step in 0..40i64 {
                    let point = (worker * 7 + step * 3) % 40 + 1;
                    let result = slice.prepare(&Iov::discrete(run.clone(), point)).unwrap();
                    assert_eq!(result.total(), 50);
                    assert_eq!(result.missing, 0);
                    let expected = (point - 1) / 10 * 10 + 1;
                    assert_eq!(
                        slice.get_key(ConditionKey(0)).unwrap().value::<i64>(),
                        Some(&expected)
                    );
                }
            });
        }
    });

    let statistics = manager.statistics();
    assert_eq!(statistics.pools(), 4);
    assert_eq!(statistics.conditions(), 200);
}
