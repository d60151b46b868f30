//! Assertion helpers over workspace state.

use std::collections::{BTreeMap, BTreeSet};

use keel_engine::model::{Job, ReleaseTarget};
use keel_engine::store::Stores;

/// `(resource, environment, deployment)` ids of `targets`, sorted.
pub fn target_triples(targets: &[ReleaseTarget]) -> Vec<(String, String, String)> {
    let set: BTreeSet<_> = targets
        .iter()
        .map(|rt| {
            (
                rt.resource_id.clone(),
                rt.environment_id.clone(),
                rt.deployment_id.clone(),
            )
        })
        .collect();
    set.into_iter().collect()
}

/// Asserts that `targets` are exactly `expected` in any order.
///
/// # Panics
///
/// Panics if the sets differ.
pub fn assert_release_targets(targets: &[ReleaseTarget], expected: &[(&str, &str, &str)]) {
    let mut want: Vec<(String, String, String)> = expected
        .iter()
        .map(|(r, e, d)| ((*r).to_string(), (*e).to_string(), (*d).to_string()))
        .collect();
    want.sort();
    assert_eq!(target_triples(targets), want, "release targets differ");
}

/// Jobs of `stores` sorted by creation then id.
pub fn jobs(stores: &Stores) -> Vec<Job> {
    let mut jobs = stores.jobs.values().expect("jobs readable");
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    jobs
}

/// Asserts that no release target has more than one active job.
///
/// # Panics
///
/// Panics if two active jobs share a release target.
pub fn assert_single_active_job_per_target(stores: &Stores) {
    let mut active: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for job in jobs(stores).into_iter().filter(|j| j.status.is_active()) {
        let release = stores
            .releases
            .get(&job.release_id)
            .expect("releases readable")
            .expect("job release exists");
        active
            .entry(release.release_target.key())
            .or_default()
            .push(job.id);
    }
    for (target, ids) in active {
        assert!(ids.len() <= 1, "target {target} has active jobs {ids:?}");
    }
}
