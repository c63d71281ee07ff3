//! Dry run: what a run would do, without doing it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use fleet_state::{ItemKey, RunState};

use super::{check_requires, gate, prepare, BundleStatus, Engine, Gate};
use crate::domain::bundle::BundleKind;
use crate::domain::committed::CommittedConfig;
use crate::executors::{dispatch_bundle, Bundle, BundleExecutor, ExecContext, Observation};

/// What would happen to one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum PlanAction {
    /// In sync, fingerprint already current
    Unchanged,
    /// In sync, fingerprint would be recorded
    Adopt,
    /// Drifted; would be applied
    Apply(String),
    /// Would not be attempted
    Skip(String),
    /// Could not be observed
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemPlan {
    pub key: String,
    #[serde(flatten)]
    pub action: PlanAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "snake_case")]
pub enum BundleDisposition {
    Execute,
    Skipped(String),
    Blocked(BundleKind),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundlePlan {
    pub bundle: BundleKind,
    #[serde(flatten)]
    pub disposition: BundleDisposition,
    pub items: Vec<ItemPlan>,
}

/// Result of [`Engine::plan_run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub commit_id: String,
    pub bundles: Vec<BundlePlan>,
    /// Unknown top-level keys of the document
    pub ignored: Vec<String>,
}

impl RunPlan {
    /// Number of items that would be applied.
    pub fn changes(&self) -> usize {
        self.bundles
            .iter()
            .flat_map(|b| &b.items)
            .filter(|i| matches!(i.action, PlanAction::Apply(_)))
            .count()
    }

    /// Whether a real run would report a failure.
    pub fn has_errors(&self) -> bool {
        self.bundles.iter().any(|b| {
            matches!(
                b.disposition,
                BundleDisposition::Invalid(_) | BundleDisposition::Blocked(_)
            ) || b
                .items
                .iter()
                .any(|i| matches!(i.action, PlanAction::Error(_)))
        })
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::Unchanged => f.write_str("unchanged"),
            PlanAction::Adopt => f.write_str("adopt"),
            PlanAction::Apply(reason) => write!(f, "apply ({reason})"),
            PlanAction::Skip(reason) => write!(f, "skip ({reason})"),
            PlanAction::Error(reason) => write!(f, "error ({reason})"),
        }
    }
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "commit {}", self.commit_id)?;
        for bundle in &self.bundles {
            match &bundle.disposition {
                BundleDisposition::Execute => writeln!(f, "{}", bundle.bundle)?,
                BundleDisposition::Skipped(reason) => {
                    writeln!(f, "{}: skipped ({reason})", bundle.bundle)?
                }
                BundleDisposition::Blocked(dep) => {
                    writeln!(f, "{}: blocked by {dep}", bundle.bundle)?
                }
                BundleDisposition::Invalid(reason) => {
                    writeln!(f, "{}: invalid ({reason})", bundle.bundle)?
                }
            }
            for item in &bundle.items {
                writeln!(f, "  {:<40} {}", item.key, item.action)?;
            }
        }
        for key in &self.ignored {
            writeln!(f, "{key}: ignored (unknown bundle type)")?;
        }
        write!(f, "{} change(s)", self.changes())
    }
}

impl Engine {
    /// Walk `config` the way [`Engine::execute_run`] would, observing but
    /// never applying. Bundle sessions are not opened, so no locks are
    /// taken and nothing is downloaded.
    pub async fn plan_run(&self, config: &CommittedConfig, previous: &RunState) -> RunPlan {
        let facts = self.facts().await;
        let prepared = prepare(config);
        let cancel = CancellationToken::new();
        let ctx = self.context(&cancel);

        // Dependents are gated on what the plan predicts for their
        // dependencies.
        let mut statuses: BTreeMap<BundleKind, BundleStatus> = BTreeMap::new();
        let mut bundles = Vec::new();

        for kind in &prepared.ordering.order {
            let Some(entry) = prepared.entries.get(kind) else {
                continue;
            };
            let cyclic = prepared.ordering.cyclic.contains(kind);
            let blocking = cyclic || entry.meta.blocking;
            let (plan, status) = match gate(entry, cyclic, &facts, &statuses) {
                Gate::Invalid(reason) => (
                    bundle_plan(*kind, BundleDisposition::Invalid(reason.clone()), Vec::new()),
                    BundleStatus::Invalid { reason, blocking },
                ),
                Gate::Skip(reason) => (
                    bundle_plan(*kind, BundleDisposition::Skipped(reason.clone()), Vec::new()),
                    BundleStatus::Skipped(reason),
                ),
                Gate::Blocked(dep) => (
                    bundle_plan(*kind, BundleDisposition::Blocked(dep), Vec::new()),
                    BundleStatus::Blocked(dep),
                ),
                Gate::Run(bundle) => {
                    dispatch_bundle!(&bundle.spec, exec => {
                        plan_bundle(exec, bundle, previous, &ctx).await
                    })
                }
            };
            statuses.insert(*kind, status);
            bundles.push(plan);
        }

        RunPlan {
            commit_id: config.commit_id.to_string(),
            bundles,
            ignored: config.ignored.clone(),
        }
    }
}

fn bundle_plan(bundle: BundleKind, disposition: BundleDisposition, items: Vec<ItemPlan>) -> BundlePlan {
    BundlePlan {
        bundle,
        disposition,
        items,
    }
}

async fn plan_bundle<E: BundleExecutor>(
    exec: &E,
    bundle: &Bundle,
    previous: &RunState,
    ctx: &ExecContext<'_>,
) -> (BundlePlan, BundleStatus) {
    let wire = bundle.kind.wire_name();
    let blocking = bundle.meta.blocking;
    let planned = match exec.plan() {
        Ok(planned) => planned,
        Err(err) => {
            let reason = err.to_string();
            return (
                bundle_plan(bundle.kind, BundleDisposition::Invalid(reason.clone()), Vec::new()),
                BundleStatus::Invalid { reason, blocking },
            );
        }
    };
    if let Err(reason) = check_requires(&planned) {
        return (
            bundle_plan(bundle.kind, BundleDisposition::Invalid(reason.clone()), Vec::new()),
            BundleStatus::Invalid { reason, blocking },
        );
    }

    let mut failing: HashSet<&str> = HashSet::new();
    let mut items = Vec::with_capacity(planned.len());
    for item in &planned {
        let action = if let Some(required) = item
            .requires
            .iter()
            .find(|r| failing.contains(r.as_str()))
        {
            PlanAction::Skip(format!("requires {required}"))
        } else {
            let recorded = previous.fingerprint(&ItemKey::new(wire, &item.key));
            match exec.observe(item, recorded, ctx).await {
                Ok(Observation::InSync) if recorded == Some(&item.fingerprint) => {
                    PlanAction::Unchanged
                }
                Ok(Observation::InSync) => PlanAction::Adopt,
                Ok(Observation::Drifted(reason)) => PlanAction::Apply(reason),
                Err(err) => PlanAction::Error(err.to_string()),
            }
        };
        if matches!(action, PlanAction::Skip(_) | PlanAction::Error(_)) {
            failing.insert(&item.key);
        }
        items.push(ItemPlan {
            key: item.key.clone(),
            action,
        });
    }

    let status = if failing.is_empty() {
        BundleStatus::Succeeded
    } else {
        BundleStatus::Failed { blocking }
    };
    (bundle_plan(bundle.kind, BundleDisposition::Execute, items), status)
}
