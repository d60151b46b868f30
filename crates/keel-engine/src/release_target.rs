//! Release-target derivation.
//!
//! `(r, e, d)` is a release target iff some system links both `e` and `d`,
//! `r` matches the environment's resource selector (absent matches nothing)
//! and the deployment's resource selector (absent matches everything).
//!
//! Environment and deployment filtering run concurrently over the resource
//! set. Triples are then generated by one task per `(environment, deployment)`
//! pair, all feeding a single channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keel_core::parallel::{CancelFlag, ChunkOptions, chunked_map};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::model::{Deployment, Environment, ReleaseTarget, Resource, System};
use crate::selector::{Selector, matches_or};
use crate::store::Stores;

const CHANNEL_CAPACITY: usize = 1_024;

/// Which part of the target set a recomputation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeScope {
    /// Every pair and every resource.
    Full,
    /// Pairs touching any listed environment or deployment.
    Entities {
        /// Environments whose targets may have changed.
        environments: BTreeSet<String>,
        /// Deployments whose targets may have changed.
        deployments: BTreeSet<String>,
    },
    /// Every pair, restricted to the listed resources.
    Resources(BTreeSet<String>),
}

impl ComputeScope {
    /// Scope covering one environment.
    #[must_use]
    pub fn environment(id: impl Into<String>) -> Self {
        Self::Entities {
            environments: BTreeSet::from([id.into()]),
            deployments: BTreeSet::new(),
        }
    }

    /// Scope covering one deployment.
    #[must_use]
    pub fn deployment(id: impl Into<String>) -> Self {
        Self::Entities {
            environments: BTreeSet::new(),
            deployments: BTreeSet::from([id.into()]),
        }
    }

    /// Scope covering one resource.
    #[must_use]
    pub fn resource(id: impl Into<String>) -> Self {
        Self::Resources(BTreeSet::from([id.into()]))
    }

    fn includes_pair(&self, environment_id: &str, deployment_id: &str) -> bool {
        match self {
            Self::Full | Self::Resources(_) => true,
            Self::Entities {
                environments,
                deployments,
            } => environments.contains(environment_id) || deployments.contains(deployment_id),
        }
    }

    fn includes_resource(&self, resource_id: &str) -> bool {
        match self {
            Self::Resources(ids) => ids.contains(resource_id),
            _ => true,
        }
    }

    /// Returns true if `target` lies inside this scope.
    #[must_use]
    pub fn contains(&self, target: &ReleaseTarget) -> bool {
        self.includes_pair(&target.environment_id, &target.deployment_id)
            && self.includes_resource(&target.resource_id)
    }
}

/// Entities that feed derivation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInputs {
    /// Systems with their links.
    #[serde(default)]
    pub systems: Vec<System>,
    /// Environments.
    #[serde(default)]
    pub environments: Vec<Environment>,
    /// Deployments.
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    /// Resources.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl TargetInputs {
    /// Reads the current inputs out of a workspace's stores.
    ///
    /// # Errors
    ///
    /// Returns an error if a repository lock is poisoned.
    pub fn from_stores(stores: &Stores) -> Result<Self> {
        Ok(Self {
            systems: stores.systems.values()?,
            environments: stores.environments.values()?,
            deployments: stores.deployments.values()?,
            resources: stores.resources.values()?,
        })
    }
}

/// Targets that appeared and disappeared in one recomputation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseTargetDiff {
    /// New targets.
    pub added: Vec<ReleaseTarget>,
    /// Targets that no longer exist.
    pub removed: Vec<ReleaseTarget>,
}

impl ReleaseTargetDiff {
    /// Returns true when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type MatchSets = BTreeMap<String, Arc<BTreeSet<String>>>;

struct Plan {
    pairs: BTreeSet<(String, String)>,
    environments: Vec<(String, Option<Selector>)>,
    deployments: Vec<(String, Option<Selector>)>,
    resources: Vec<(String, Arc<Value>)>,
}

fn plan(inputs: &TargetInputs, scope: &ComputeScope) -> Result<Plan> {
    let environments: BTreeMap<&str, &Environment> = inputs
        .environments
        .iter()
        .map(|e| (e.id.as_str(), e))
        .collect();
    let deployments: BTreeMap<&str, &Deployment> = inputs
        .deployments
        .iter()
        .map(|d| (d.id.as_str(), d))
        .collect();

    let mut pairs = BTreeSet::new();
    for system in &inputs.systems {
        for env_id in &system.environment_ids {
            if !environments.contains_key(env_id.as_str()) {
                continue;
            }
            for dep_id in &system.deployment_ids {
                if deployments.contains_key(dep_id.as_str()) && scope.includes_pair(env_id, dep_id) {
                    pairs.insert((env_id.clone(), dep_id.clone()));
                }
            }
        }
    }

    let env_ids: BTreeSet<&str> = pairs.iter().map(|(e, _)| e.as_str()).collect();
    let dep_ids: BTreeSet<&str> = pairs.iter().map(|(_, d)| d.as_str()).collect();

    let mut resources = Vec::new();
    for r in &inputs.resources {
        if r.deleted_at.is_none() && scope.includes_resource(&r.id) {
            resources.push((r.id.clone(), Arc::new(serde_json::to_value(r)?)));
        }
    }

    Ok(Plan {
        environments: env_ids
            .into_iter()
            .filter_map(|id| environments.get(id))
            .map(|e| (e.id.clone(), e.resource_selector.clone()))
            .collect(),
        deployments: dep_ids
            .into_iter()
            .filter_map(|id| deployments.get(id))
            .map(|d| (d.id.clone(), d.resource_selector.clone()))
            .collect(),
        pairs,
        resources,
    })
}

/// Evaluates every selector against every resource, returning the matched
/// resource ids per selector owner.
async fn filter_resources(
    owners: Vec<(String, Option<Selector>)>,
    resources: Vec<(String, Arc<Value>)>,
    absent: bool,
    options: ChunkOptions,
    cancel: CancelFlag,
) -> Result<MatchSets> {
    if owners.is_empty() {
        return Ok(BTreeMap::new());
    }
    let owners = Arc::new(owners);
    let selectors = Arc::clone(&owners);
    let rows = chunked_map(resources, options, cancel, move |(id, value)| {
        let selectors = Arc::clone(&selectors);
        async move {
            let hits: Vec<bool> = selectors
                .iter()
                .map(|(_, sel)| matches_or(sel.as_ref(), "resource", &value, absent))
                .collect();
            Ok((id, hits))
        }
    })
    .await?;

    let mut sets: Vec<BTreeSet<String>> = vec![BTreeSet::new(); owners.len()];
    for (resource_id, hits) in rows {
        for (i, hit) in hits.into_iter().enumerate() {
            if hit {
                sets[i].insert(resource_id.clone());
            }
        }
    }
    Ok(owners
        .iter()
        .zip(sets)
        .map(|((owner, _), set)| (owner.clone(), Arc::new(set)))
        .collect())
}

/// Streams the targets of `inputs` restricted to `scope` into `tx`.
///
/// Returns once every pair task has finished. The first failing task
/// cancels the others.
///
/// # Errors
///
/// Returns the first task error, or `Cancelled` if `cancel` was raised or the
/// receiver went away.
pub async fn stream_release_targets(
    inputs: &TargetInputs,
    scope: &ComputeScope,
    options: ChunkOptions,
    cancel: CancelFlag,
    tx: mpsc::Sender<ReleaseTarget>,
) -> Result<()> {
    let plan = plan(inputs, scope)?;
    let (env_matches, dep_matches) = tokio::try_join!(
        filter_resources(
            plan.environments,
            plan.resources.clone(),
            false,
            options,
            cancel.clone()
        ),
        filter_resources(
            plan.deployments,
            plan.resources,
            true,
            options,
            cancel.clone()
        ),
    )?;

    let mut tasks = JoinSet::new();
    for (env_id, dep_id) in plan.pairs {
        let (Some(env_set), Some(dep_set)) = (env_matches.get(&env_id), dep_matches.get(&dep_id))
        else {
            continue;
        };
        let env_set = Arc::clone(env_set);
        let dep_set = Arc::clone(dep_set);
        let tx = tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            for resource_id in env_set.intersection(&dep_set) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let target = ReleaseTarget::new(resource_id.clone(), env_id.clone(), dep_id.clone());
                if tx.send(target).await.is_err() {
                    return Err(Error::Cancelled);
                }
            }
            Ok(())
        });
    }
    drop(tx);

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| Error::internal(format!("target task failed: {e}")))?;
        if let Err(e) = outcome {
            cancel.cancel();
            tasks.abort_all();
            return Err(e);
        }
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Computes the targets of `inputs` restricted to `scope`.
///
/// # Errors
///
/// See [`stream_release_targets`].
pub async fn compute_release_targets(
    inputs: &TargetInputs,
    scope: &ComputeScope,
    options: ChunkOptions,
    cancel: CancelFlag,
) -> Result<BTreeSet<ReleaseTarget>> {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let collect = async move {
        let mut out = BTreeSet::new();
        while let Some(target) = rx.recv().await {
            out.insert(target);
        }
        Ok::<_, Error>(out)
    };
    let ((), targets) = tokio::try_join!(
        stream_release_targets(inputs, scope, options, cancel, tx),
        collect
    )?;
    Ok(targets)
}

/// Recomputes `scope` against `stores` and applies the diff to the
/// release-target repository.
///
/// # Errors
///
/// Returns an error if computation fails or a repository lock is poisoned.
#[tracing::instrument(skip(stores, options, cancel), fields(scope = ?scope))]
pub async fn recompute(
    stores: &Stores,
    scope: &ComputeScope,
    options: ChunkOptions,
    cancel: CancelFlag,
) -> Result<ReleaseTargetDiff> {
    let inputs = TargetInputs::from_stores(stores)?;
    let next = compute_release_targets(&inputs, scope, options, cancel).await?;
    let previous: BTreeSet<ReleaseTarget> = stores
        .release_targets
        .values()?
        .into_iter()
        .filter(|t| scope.contains(t))
        .collect();

    let diff = ReleaseTargetDiff {
        added: next.difference(&previous).cloned().collect(),
        removed: previous.difference(&next).cloned().collect(),
    };
    for target in &diff.removed {
        stores.release_targets.remove(&target.key())?;
    }
    for target in &diff.added {
        stores.release_targets.upsert(target.clone())?;
    }
    if !diff.is_empty() {
        tracing::debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "release targets changed"
        );
    }
    Ok(diff)
}
