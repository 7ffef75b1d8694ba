//! End-to-end flows across the fleet crates:
//! - Legacy state files → lifecycle operations → canonical documents
//! - Purchase with credit debit and persistence
//! - Delete renumbering and container id allocation
//! - CPU breach → monitor → lifecycle server → fleet stopped

use fleet_lifecycle::{CreateRequest, FleetError, LifecycleManager, Warning, command_channel};
use fleet_monitor::{AdmissionMonitor, CpuSampler, CycleOutcome, MonitorConfig, MonitorHandle, TriggerMode};
use fleet_proto::{Capability, LifecycleState, NOT_ASSIGNED, VpsStatus};
use fleet_tests::{FixedSampler, Fleet};
use std::sync::Arc;

const LEGACY_INVENTORY: &str = r#"{
    "1": {
        "container_name": "vps-1-1",
        "ram": "4GB",
        "cpu": "2",
        "status": "running",
        "created_at": "2023-05-01T10:00:00.123456",
        "ipv4": "10.0.0.2"
    },
    "2": {
        "first": { "container_id": "vps-2-1", "ram": 8, "cpu": 2, "shared_with": ["2", "3"] },
        "second": { "container_id": "vps-2-2", "ram": 4, "cpu": 1, "status": "stopped" }
    },
    "3": [],
    "4": "garbage"
}"#;

// ─── Test 1: Legacy state normalizes and round-trips through operations ───────

#[tokio::test]
async fn test_legacy_inventory_is_normalized_and_rewritten() {
    let fleet = Fleet::with_inventory(LEGACY_INVENTORY);

    {
        let store = fleet.store.read().await;
        let single = store.find("vps-1-1").expect("single record");
        assert_eq!(single.owner_id, "1");
        assert_eq!(single.ram, 4);
        assert_eq!(single.ipv6, NOT_ASSIGNED);

        assert_eq!(store.records_of("2").len(), 2);
        let shared = store.find("vps-2-1").expect("keyed record");
        assert!(!shared.shared_with.contains("2"), "owner is scrubbed from shared_with");
        assert!(store.records_of("3").is_empty());
        assert!(store.records_of("4").is_empty());
    }

    // a shared-access caller can start a stopped legacy VPS
    let started = fleet.manager.start(Capability::Shared, "vps-2-2").await.expect("start");
    assert_eq!(started.status, VpsStatus::Running);
    assert_eq!(fleet.runner.calls_matching("incus start vps-2-2"), 1);

    // the next write emits the canonical list shape
    let doc: serde_json::Value =
        serde_json::from_str(&fleet.document("vps_data")).expect("inventory json");
    assert!(doc["1"].is_array());
    assert_eq!(doc["2"][1]["status"], "running");
    assert_eq!(doc["1"][0]["container_id"], "vps-1-1");
    assert!(doc.get("4").is_none());

    let reloaded = fleet.reload();
    assert_eq!(reloaded.find("vps-2-2").expect("reloaded").status, VpsStatus::Running);
    assert_eq!(reloaded.shared_with("3").len(), 1);
}

// ─── Test 2: Purchase charges after creation and persists the balance ─────────

#[tokio::test]
async fn test_purchase_flow_persists_credits_and_plan() {
    let fleet = Fleet::new();
    fleet.store.write().await.add_credits("42", 200).expect("credit");

    let bought = fleet.manager.purchase("42", "standard", "intel", None, None).await.expect("buy");
    assert_eq!(bought.price, 192);
    assert_eq!(bought.balance, 8);
    assert_eq!(bought.created.vps_number, 1);

    let record = &bought.created.record;
    assert_eq!(record.plan.as_deref(), Some("Standard"));
    assert_eq!((record.ram, record.cpu), (12, 2));
    assert_eq!(record.ipv4, "10.20.0.7");
    assert_eq!(record.ipv6, "fd42::7");
    assert_eq!(fleet.runner.calls_matching("limits.memory=12288MB"), 1);

    let reloaded = fleet.reload();
    assert_eq!(reloaded.credits("42"), 8);
    assert_eq!(reloaded.records_of("42")[0].processor.as_deref(), Some("Intel"));

    let err = fleet.manager.purchase("42", "Starter", "Intel", None, None).await.unwrap_err();
    assert!(matches!(err, FleetError::InsufficientCredits { need: 42, have: 8 }));
    assert_eq!(fleet.runner.calls_matching("launch"), 1, "no launch without credits");
}

#[tokio::test]
async fn test_failed_launch_charges_nothing() {
    let fleet = Fleet::new();
    fleet.store.write().await.add_credits("42", 500).expect("credit");
    fleet.runner.fail("launch", "Error: storage pool full");

    let err = fleet.manager.purchase("42", "Pro", "AMD", None, None).await.unwrap_err();
    assert!(matches!(err, FleetError::Exec(_)));
    assert_eq!(fleet.reload().credits("42"), 500);
    assert!(fleet.reload().records_of("42").is_empty());
}

// ─── Test 3: Deleting renumbers the owner's list, ids are never reused live ───

#[tokio::test]
async fn test_delete_renumbers_and_allocates_fresh_ids() {
    let fleet = Fleet::new();
    let admin = Capability::Admin;
    for _ in 0..2 {
        fleet.manager.create(admin, CreateRequest::new("7", 2, 1)).await.expect("create");
    }

    fleet.manager.delete(admin, "vps-7-1").await.expect("delete");
    {
        let store = fleet.store.read().await;
        assert_eq!(store.resolve("7", 1).expect("renumbered").container_id, "vps-7-2");
        assert!(store.resolve("7", 2).is_none());
    }

    let third = fleet.manager.create(admin, CreateRequest::new("7", 2, 1)).await.expect("create");
    assert_eq!(third.record.container_id, "vps-7-3");
    assert_eq!(third.vps_number, 2);
    assert_eq!(fleet.manager.state_of("vps-7-1").await, LifecycleState::Deleted);
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ids() {
    let fleet = Fleet::new();
    let manager: Arc<LifecycleManager> = Arc::clone(&fleet.manager);

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager.create(Capability::SuperAdmin, CreateRequest::new("9", 1, 1)).await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("join").expect("create").record.container_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(fleet.reload().records_of("9").len(), 4);
}

// ─── Test 4: Static IP failure falls back to dynamic addresses ────────────────

#[tokio::test]
async fn test_static_ip_failure_keeps_dynamic_addresses() {
    let fleet = Fleet::new();
    fleet.runner.fail("ipv4.address", "Error: device not found");

    let request = CreateRequest::new("5", 4, 1).with_static_ip(Some("192.168.5.10".into()), None);
    let outcome = fleet.manager.create(Capability::Admin, request).await.expect("create");

    assert_eq!(outcome.record.ipv4, "10.20.0.7");
    assert!(matches!(outcome.warnings.as_slice(), [Warning::StaticIpFallback { .. }]));
    assert_eq!(fleet.reload().records_of("5").len(), 1);
}

// ─── Test 5: CPU breach stops the fleet through the command channel ───────────

#[tokio::test]
async fn test_cpu_breach_stops_fleet_once_in_edge_mode() {
    let fleet = Fleet::new();
    for owner in ["1", "2"] {
        fleet.manager.create(Capability::Admin, CreateRequest::new(owner, 2, 1)).await.expect("create");
    }

    let (handle, rx) = command_channel();
    let server = tokio::spawn(Arc::clone(&fleet.manager).serve(rx));

    let config = MonitorConfig { cpu_threshold: 80.0, trigger: TriggerMode::Edge, ..MonitorConfig::default() };
    let sampler = FixedSampler::new(&[Some(30.0), Some(85.5), Some(99.0), None, Some(10.0)]);
    let mut monitor =
        AdmissionMonitor::new(MonitorHandle::new(config), sampler as Arc<dyn CpuSampler>, handle);

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(monitor.run_cycle().await);
    }

    assert_eq!(outcomes[0], CycleOutcome::Quiet { usage: 30.0 });
    assert_eq!(outcomes[1], CycleOutcome::Tripped { usage: 85.5, stopped: 2 });
    assert_eq!(outcomes[2], CycleOutcome::Quiet { usage: 99.0 });
    assert_eq!(outcomes[3], CycleOutcome::SampleFailed);
    assert_eq!(fleet.runner.calls_matching("stop --all --force"), 1);

    let reloaded = fleet.reload();
    assert!(reloaded.inventory().values().flatten().all(|r| r.status == VpsStatus::Stopped));
    assert_eq!(monitor.handle().status().last_usage, Some(10.0));

    server.abort();
}
