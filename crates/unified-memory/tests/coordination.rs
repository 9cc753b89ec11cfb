use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, SubsecRound, Utc};
use unified_memory::memory_db::{LeaseMode, MemoryStore, StoreOptions};
use unified_memory::{CoordinatorConfig, InstanceCoordinator, MemoryError};

fn coordinator_on(path: &std::path::Path) -> InstanceCoordinator {
    let options = StoreOptions { embedding_dim: 4, pool_size: 2, ..Default::default() };
    let store = Arc::new(MemoryStore::open(path, &options).unwrap());
    InstanceCoordinator::new(store, CoordinatorConfig::default())
}

/// Each instance gets its own store on the shared file, like separate processes would.
#[test]
fn test_write_lease_race_across_stores_has_one_winner() {
    const INSTANCES: usize = 6;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let coordinators: Vec<InstanceCoordinator> = (0..INSTANCES).map(|_| coordinator_on(&path)).collect();
    for (i, coordinator) in coordinators.iter().enumerate() {
        coordinator.register(&format!("agent-{}", i), "coder", "/repo").unwrap();
    }

    let barrier = Arc::new(Barrier::new(INSTANCES));
    let results: Vec<(String, Result<_, MemoryError>)> = thread::scope(|scope| {
        let handles: Vec<_> = coordinators
            .iter()
            .enumerate()
            .map(|(i, coordinator)| {
                let barrier = barrier.clone();
                scope.spawn(move || {
                    let id = format!("agent-{}", i);
                    barrier.wait();
                    let result = coordinator.acquire_lease(&id, "file.py", LeaseMode::Write);
                    (id, result)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&String> = results.iter().filter(|(_, r)| r.is_ok()).map(|(id, _)| id).collect();
    assert_eq!(winners.len(), 1, "results: {:?}", results);
    let winner = winners[0].clone();

    for (id, result) in &results {
        match result {
            Ok(lease) => assert_eq!(&lease.holder_instance_id, id),
            Err(MemoryError::Denied { resource_key, held_by }) => {
                assert_eq!(resource_key, "file.py");
                assert_eq!(held_by, &winner);
            }
            Err(other) => panic!("unexpected error for {}: {}", id, other),
        }
    }

    let leases = coordinators[0].leases_for("file.py").unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].holder_instance_id, winner);
}

#[test]
fn test_readers_share_and_block_writer_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let a = coordinator_on(&path);
    let b = coordinator_on(&path);
    a.register("reader-1", "reviewer", "/repo").unwrap();
    b.register("reader-2", "reviewer", "/repo").unwrap();
    a.register("writer", "coder", "/repo").unwrap();

    a.acquire_lease("reader-1", "docs/api.md", LeaseMode::Read).unwrap();
    b.acquire_lease("reader-2", "docs/api.md", LeaseMode::Read).unwrap();
    let err = a.acquire_lease("writer", "docs/api.md", LeaseMode::Write).unwrap_err();
    assert!(matches!(err, MemoryError::Denied { .. }));

    assert!(a.release_lease("reader-1", "docs/api.md").unwrap());
    assert!(b.release_lease("reader-2", "docs/api.md").unwrap());
    assert!(a.acquire_lease("writer", "docs/api.md", LeaseMode::Write).is_ok());
}

#[test]
fn test_reclamation_frees_leases_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let coordinator = coordinator_on(&path);
    let timeout = coordinator.config().heartbeat_timeout;

    let t0 = Utc::now().trunc_subsecs(6) - Duration::hours(1);
    coordinator.register_at("ghost", "coder", "/repo", t0).unwrap();
    coordinator.acquire_lease_at("ghost", "src/main.rs", LeaseMode::Write, t0).unwrap();

    let later = t0 + timeout * 2;
    let first = coordinator.reclaim_stale_at(later).unwrap();
    assert_eq!(first.marked_stale, vec!["ghost".to_string()]);
    assert_eq!(first.reclaimed.len(), 1);
    assert_eq!(first.reclaimed[0].released_leases, vec!["src/main.rs".to_string()]);

    let second = coordinator.reclaim_stale_at(later + Duration::seconds(1)).unwrap();
    assert!(second.marked_stale.is_empty());
    assert!(second.reclaimed.is_empty());
    assert!(matches!(coordinator.session("ghost"), Err(MemoryError::NotFound(_))));

    coordinator.register("fresh", "coder", "/repo").unwrap();
    assert!(coordinator.acquire_lease("fresh", "src/main.rs", LeaseMode::Write).is_ok());
}

#[test]
fn test_handoff_moves_write_lease() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let planner = coordinator_on(&path);
    let coder = coordinator_on(&path);
    planner.register("planner", "planner", "/repo").unwrap();
    coder.register("coder", "coder", "/repo").unwrap();
    planner.acquire_lease("planner", "src/lib.rs", LeaseMode::Write).unwrap();

    let receipt = planner
        .handoff("planner", "coder", "session:planner", &["src/lib.rs".to_string()])
        .unwrap();
    assert_eq!(receipt.transferred, vec!["src/lib.rs".to_string()]);
    assert_eq!(receipt.edge.from_id, "session:planner");

    let err = planner.acquire_lease("planner", "src/lib.rs", LeaseMode::Write).unwrap_err();
    assert!(matches!(err, MemoryError::Denied { ref held_by, .. } if held_by == "coder"));

    let leases = coder.leases_for("src/lib.rs").unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].holder_instance_id, "coder");
    assert_eq!(leases[0].mode, LeaseMode::Write);
}
