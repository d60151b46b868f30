//! Replay determinism and release-target derivation properties.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;

use bytes::Bytes;
use keel_core::WorkspaceId;
use keel_engine::error::Result;
use keel_engine::events::RawEvent;
use keel_engine::model::{JobStatus, Rule};
use keel_engine::selector::Selector;
use keel_engine::workspace::{Workspace, WorkspaceDeps, WorkspaceRegistry};
use keel_test_utils::{EventFactory, fixtures, jobs, target_triples};
use proptest::prelude::*;
use tokio_test::block_on;

fn event_log() -> Vec<RawEvent> {
    let mut events = EventFactory::new("acme");
    let mut log = vec![
        events.system("sys1"),
        events.job_agent(&fixtures::job_agent("agent1")),
        events.environment(&fixtures::environment("prod", "sys1", Some("kind == 'server'"))),
        events.environment(&fixtures::environment("db", "sys1", Some("kind == 'db'"))),
        events.deployment(&fixtures::deployment("api", "sys1", Some("agent1"))),
        events.policy(&fixtures::environment_policy(
            "prod-approval",
            "id == 'prod'",
            vec![Rule::AnyApproval { min_approvals: 1 }],
        )),
    ];
    for i in 0..6 {
        let kind = if i % 2 == 0 { "server" } else { "db" };
        log.push(events.resource(&fixtures::resource(&format!("r{i}"), kind)));
    }
    log.push(events.version(&fixtures::version("v1", "api", 0)));
    log.push(events.approval(&fixtures::approval("v1", "prod", "alice")));
    log.push(events.tick());
    log.push(events.delete_resource("r5"));
    log
}

async fn replay(log: &[RawEvent]) -> Result<(Workspace, Bytes)> {
    let mut ws = Workspace::new(WorkspaceId::new("acme")?, WorkspaceDeps::in_memory());
    ws.load().await?;
    for event in log {
        ws.apply(event).await?;
    }
    let bytes = ws.snapshot().await?;
    Ok((ws, bytes))
}

#[tokio::test]
async fn replaying_the_same_log_yields_identical_snapshots() -> Result<()> {
    let mut log = event_log();
    let (first, a) = replay(&log).await?;

    // Mark one job finished so job updates are part of the log too.
    let job = jobs(first.stores()).into_iter().next().expect("a job was created");
    let mut events = EventFactory::new("acme");
    events.set_secs(5_000);
    log.push(events.job_status(&job.id, JobStatus::Successful));

    let (_, b) = replay(&log).await?;
    let (_, c) = replay(&log).await?;
    assert_ne!(a, b);
    assert_eq!(b, c);
    Ok(())
}

#[tokio::test]
async fn reload_from_snapshot_and_changelog_matches_live_state() -> Result<()> {
    let registry = WorkspaceRegistry::new(WorkspaceDeps::in_memory());
    let log = event_log();
    let (head, tail) = log.split_at(8);

    for event in head {
        registry.apply(event).await?;
    }
    registry.snapshot("acme").await?.expect("loaded");
    for event in tail {
        registry.apply(event).await?;
    }
    let live = {
        let handle = registry.get("acme")?.expect("loaded");
        let ws = handle.lock().await;
        keel_engine::persistence::Snapshot::capture("acme", ws.sequence(), ws.stores())?.encode()?
    };

    // Drop the workspace without a final snapshot; reload replays the tail.
    let fresh = WorkspaceRegistry::new(registry.deps().clone());
    let handle = fresh.get_or_create("acme").await?;
    let ws = handle.lock().await;
    let reloaded =
        keel_engine::persistence::Snapshot::capture("acme", ws.sequence(), ws.stores())?.encode()?;
    assert_eq!(live, reloaded);
    Ok(())
}

#[derive(Debug, Clone)]
struct ResourceSpec {
    id: String,
    kind: &'static str,
    team: &'static str,
}

fn arb_resources() -> impl Strategy<Value = Vec<ResourceSpec>> {
    prop::collection::vec(
        (
            0u8..12,
            prop::sample::select(vec!["server", "db", "queue"]),
            prop::sample::select(vec!["platform", "data"]),
        ),
        0..20,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(n, kind, team)| ResourceSpec {
                id: format!("r{n}"),
                kind,
                team,
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Targets always equal the brute-force derivation over the final
    /// resource set, whatever order the resources arrived in.
    #[test]
    fn targets_match_brute_force_derivation(resources in arb_resources()) {
        let mut events = EventFactory::new("acme");
        let mut db_only = fixtures::deployment("db-migrate", "sys1", None);
        db_only.resource_selector = Some(Selector::cel("kind == 'db'"));
        let mut log = vec![
            events.system("sys1"),
            events.environment(&fixtures::environment("servers", "sys1", Some("kind == 'server'"))),
            events.environment(&fixtures::environment("platform", "sys1", Some("metadata.team == 'platform'"))),
            events.deployment(&fixtures::deployment("api", "sys1", None)),
            events.deployment(&db_only),
        ];
        for spec in &resources {
            log.push(events.resource(&fixtures::resource_with_metadata(&spec.id, spec.kind, &[("team", spec.team)])));
        }

        let (ws, _) = block_on(replay(&log)).expect("replay succeeds");

        // Later upserts of the same id win.
        let mut last = std::collections::BTreeMap::new();
        for spec in &resources {
            last.insert(spec.id.clone(), spec.clone());
        }
        let mut expected = BTreeSet::new();
        for spec in last.values() {
            let envs = [("servers", spec.kind == "server"), ("platform", spec.team == "platform")];
            let deps = [("api", true), ("db-migrate", spec.kind == "db")];
            for (env, env_hit) in envs {
                for (dep, dep_hit) in deps {
                    if env_hit && dep_hit {
                        expected.insert((spec.id.clone(), env.to_string(), dep.to_string()));
                    }
                }
            }
        }
        let actual: BTreeSet<_> = target_triples(&ws.release_targets().unwrap()).into_iter().collect();
        prop_assert_eq!(actual, expected);
    }
}
