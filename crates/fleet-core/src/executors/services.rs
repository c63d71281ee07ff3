//! Service supervision (`process_watch`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_host::{ServiceAction, ServiceStatus};
use fleet_state::Fingerprint;

use crate::domain::digest::canonical_fingerprint;
use crate::domain::error::Result;
use crate::executors::{
    unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
    #[serde(default)]
    pub state: ServiceState,
    /// Boot-time enablement; left alone when unset
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Bumping this restarts a running service
    #[serde(default)]
    pub config_revision: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// The part of an item that defines its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Desired {
    state: ServiceState,
    enabled: Option<bool>,
    config_revision: Option<String>,
}

impl ServiceItem {
    fn desired(&self) -> Desired {
        Desired {
            state: self.state,
            enabled: self.enabled,
            config_revision: self.config_revision.clone(),
        }
    }

    fn wants_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBundle {
    #[serde(default)]
    pub items: Vec<ServiceItem>,
}

fn revision_changed(item: &ServiceItem, previous: Option<&Fingerprint>) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    match serde_json::from_str::<Desired>(previous.as_str()) {
        Ok(prev) => prev.config_revision != item.config_revision,
        Err(_) => false,
    }
}

fn drift(item: &ServiceItem, status: &ServiceStatus) -> Option<String> {
    if !status.exists {
        return Some("unit not found".into());
    }
    if status.running != item.wants_running() {
        return Some(if status.running {
            "running, want stopped".into()
        } else {
            "stopped, want running".into()
        });
    }
    match item.enabled {
        Some(want) if want != status.enabled => Some(format!(
            "{}, want {}",
            if status.enabled { "enabled" } else { "disabled" },
            if want { "enabled" } else { "disabled" }
        )),
        _ => None,
    }
}

#[async_trait]
impl BundleExecutor for ServiceBundle {
    type Item = ServiceItem;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        unique_keys(self.items.iter().map(|i| i.name.as_str()))?;
        for item in &self.items {
            if item.name.contains(char::is_whitespace) || item.name.contains('/') {
                return Err(format!("invalid service name {:?}", item.name));
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<ServiceItem>>> {
        self.items
            .iter()
            .map(|item| {
                Ok(PlannedItem::new(
                    item.name.clone(),
                    canonical_fingerprint(&item.desired())?,
                    item.clone(),
                )
                .requiring(item.requires.clone()))
            })
            .collect()
    }

    async fn open(&self, _items: &[PlannedItem<ServiceItem>], _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<ServiceItem>,
        previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let item = &planned.item;
        let status = ctx.host.service_status(&item.name).await?;
        if let Some(reason) = drift(item, &status) {
            return Ok(Observation::Drifted(reason));
        }
        if item.wants_running() && revision_changed(item, previous) {
            return Ok(Observation::Drifted("config revision changed".into()));
        }
        Ok(Observation::InSync)
    }

    async fn apply(
        &self,
        planned: &PlannedItem<ServiceItem>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let item = &planned.item;
        let status = ctx.host.service_status(&item.name).await?;

        let mut actions = Vec::new();
        match (item.wants_running(), status.running) {
            (true, false) => actions.push(ServiceAction::Start),
            (false, true) => actions.push(ServiceAction::Stop),
            _ => {}
        }
        match item.enabled {
            Some(true) if !status.enabled => actions.push(ServiceAction::Enable),
            Some(false) if status.enabled => actions.push(ServiceAction::Disable),
            _ => {}
        }
        // running and already in state: only a revision bump gets us here
        if actions.is_empty() && item.wants_running() {
            actions.push(ServiceAction::Restart);
        }

        for action in &actions {
            ctx.host.set_service_state(&item.name, *action).await?;
        }
        let verbs: Vec<&str> = actions.iter().map(ServiceAction::verb).collect();
        Ok(Applied::new(format!("{}: {}", item.name, verbs.join(", "))))
    }
}
