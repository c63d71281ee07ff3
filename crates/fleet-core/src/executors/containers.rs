//! Docker containers.
//!
//! The desired spec's fingerprint is stamped on the container as a label,
//! so a spec change is visible on the host itself and survives lost state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_host::{ContainerSpec, ContainerStatus, FINGERPRINT_LABEL};
use fleet_state::Fingerprint;

use crate::domain::digest::fingerprint_of;
use crate::domain::error::Result;
use crate::executors::{
    unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerItem {
    #[serde(flatten)]
    pub spec: ContainerSpec,
    /// Recreate a stopped container instead of starting it again
    #[serde(default)]
    pub force_recreate: bool,
}

impl ContainerItem {
    /// The spec handed to the host, carrying the fingerprint label.
    fn labelled(&self, fingerprint: &Fingerprint) -> ContainerSpec {
        let mut spec = self.spec.clone();
        spec.labels.extend(managed_labels(fingerprint));
        spec
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBundle {
    #[serde(default)]
    pub items: Vec<ContainerItem>,
}

enum Action {
    Create,
    Recreate(&'static str),
    Start,
}

fn decide(
    item: &ContainerItem,
    fingerprint: &Fingerprint,
    status: Option<&ContainerStatus>,
) -> Option<Action> {
    let Some(status) = status else {
        return Some(Action::Create);
    };
    let labelled = status.labels.get(FINGERPRINT_LABEL).map(String::as_str);
    if labelled != Some(fingerprint.as_str()) {
        return Some(Action::Recreate("spec changed"));
    }
    if status.image != item.spec.image {
        return Some(Action::Recreate("image changed"));
    }
    if !status.running {
        return Some(if item.force_recreate {
            Action::Recreate("stopped")
        } else {
            Action::Start
        });
    }
    None
}

#[async_trait]
impl BundleExecutor for ContainerBundle {
    type Item = ContainerItem;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        unique_keys(self.items.iter().map(|i| i.spec.name.as_str()))?;
        for item in &self.items {
            if item.spec.image.trim().is_empty() {
                return Err(format!("{}: image required", item.spec.name));
            }
            if item.spec.labels.contains_key(FINGERPRINT_LABEL) {
                return Err(format!(
                    "{}: label {FINGERPRINT_LABEL} is reserved",
                    item.spec.name
                ));
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<ContainerItem>>> {
        self.items
            .iter()
            .map(|item| {
                Ok(PlannedItem::new(
                    item.spec.name.clone(),
                    fingerprint_of(item)?,
                    item.clone(),
                ))
            })
            .collect()
    }

    async fn open(
        &self,
        _items: &[PlannedItem<ContainerItem>],
        _ctx: &ExecContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<ContainerItem>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let status = ctx.host.container_status(&planned.key).await?;
        Ok(
            match decide(&planned.item, &planned.fingerprint, status.as_ref()) {
                None => Observation::InSync,
                Some(Action::Create) => Observation::Drifted("container missing".into()),
                Some(Action::Recreate(why)) => Observation::Drifted(why.into()),
                Some(Action::Start) => Observation::Drifted("stopped".into()),
            },
        )
    }

    async fn apply(
        &self,
        planned: &PlannedItem<ContainerItem>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let name = &planned.key;
        let status = ctx.host.container_status(name).await?;
        let summary = match decide(&planned.item, &planned.fingerprint, status.as_ref()) {
            None => format!("{name} already running"),
            Some(Action::Start) => {
                ctx.host.start_container(name).await?;
                format!("started {name}")
            }
            Some(Action::Create) => {
                ctx.host
                    .run_container(&planned.item.labelled(&planned.fingerprint))
                    .await?;
                format!("created {name} from {}", planned.item.spec.image)
            }
            Some(Action::Recreate(why)) => {
                ctx.host.remove_container(name).await?;
                ctx.host
                    .run_container(&planned.item.labelled(&planned.fingerprint))
                    .await?;
                format!("recreated {name} ({why})")
            }
        };
        Ok(Applied::new(summary))
    }
}

/// Labels the agent owns on every container it creates.
pub fn managed_labels(fingerprint: &Fingerprint) -> BTreeMap<String, String> {
    BTreeMap::from([(
        FINGERPRINT_LABEL.to_string(),
        fingerprint.as_str().to_string(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::testing::{converge, Harness};
    use serde_json::json;

    fn bundle(items: serde_json::Value) -> ContainerBundle {
        serde_json::from_value(json!({ "items": items })).unwrap()
    }

    #[tokio::test]
    async fn creates_labelled_container_once() {
        let h = Harness::new();
        let b = bundle(json!([{"name": "web", "image": "nginx:1.25", "ports": ["80:80"]}]));
        assert_eq!(converge(&b, &h.ctx()).await.unwrap(), vec!["web"]);

        let status = h.ctx().host.container_status("web").await.unwrap().unwrap();
        let fingerprint = b.plan().unwrap()[0].fingerprint.clone();
        assert_eq!(status.labels, managed_labels(&fingerprint));
        assert!(converge(&b, &h.ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spec_change_recreates() {
        let h = Harness::new();
        let v1 = bundle(json!([{"name": "web", "image": "nginx:1.25"}]));
        let v2 = bundle(json!([{"name": "web", "image": "nginx:1.27"}]));
        converge(&v1, &h.ctx()).await.unwrap();
        converge(&v2, &h.ctx()).await.unwrap();
        assert_eq!(
            h.host.mutations(),
            vec!["run_container web", "remove_container web", "run_container web"]
        );
        let status = h.ctx().host.container_status("web").await.unwrap().unwrap();
        assert_eq!(status.image, "nginx:1.27");
    }

    #[tokio::test]
    async fn stopped_container_started_or_recreated() {
        let h = Harness::new();
        let plain = bundle(json!([{"name": "db", "image": "postgres:16"}]));
        converge(&plain, &h.ctx()).await.unwrap();
        h.host.stop_container_externally("db");
        converge(&plain, &h.ctx()).await.unwrap();
        assert_eq!(h.host.mutations().last().unwrap(), "start_container db");

        let h = Harness::new();
        let forced = bundle(json!([{"name": "db", "image": "postgres:16", "force_recreate": true}]));
        converge(&forced, &h.ctx()).await.unwrap();
        h.host.stop_container_externally("db");
        converge(&forced, &h.ctx()).await.unwrap();
        assert_eq!(
            h.host.mutations(),
            vec!["run_container db", "remove_container db", "run_container db"]
        );
    }

    #[test]
    fn reserved_label_rejected() {
        let b = bundle(json!([{
            "name": "web",
            "image": "nginx",
            "labels": {"io.fleet.fingerprint": "x"}
        }]));
        assert!(b.validate().is_err());
        assert!(bundle(json!([{"name": "web", "image": ""}])).validate().is_err());
    }
}
