//! Remote console access: the tunnel service is running and enabled when
//! allowed, stopped and disabled otherwise.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_host::ServiceAction;
use fleet_state::Fingerprint;

use crate::domain::error::Result;
use crate::executors::{Applied, BundleExecutor, ExecContext, Observation, PlannedItem};

fn default_service() -> String {
    "remote-console".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConsoleBundle {
    #[serde(default)]
    pub allow: bool,
    #[serde(default = "default_service")]
    pub service: String,
}

#[async_trait]
impl BundleExecutor for RemoteConsoleBundle {
    type Item = bool;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        if self.service.is_empty() || self.service.contains(char::is_whitespace) {
            return Err(format!("invalid service name {:?}", self.service));
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<bool>>> {
        let fingerprint = Fingerprint::from_raw(if self.allow { "allow" } else { "deny" });
        Ok(vec![PlannedItem::new(
            self.service.clone(),
            fingerprint,
            self.allow,
        )])
    }

    async fn open(&self, _items: &[PlannedItem<bool>], _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<bool>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let status = ctx.host.service_status(&self.service).await?;
        let allow = planned.item;
        Ok(match (allow, status.exists, status.running, status.enabled) {
            (true, false, _, _) => Observation::Drifted("console service not installed".into()),
            (true, true, true, true) | (false, false, _, _) | (false, true, false, false) => {
                Observation::InSync
            }
            (true, ..) => Observation::Drifted("console access disabled".into()),
            (false, ..) => Observation::Drifted("console access enabled".into()),
        })
    }

    async fn apply(
        &self,
        planned: &PlannedItem<bool>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let actions = if planned.item {
            [ServiceAction::Enable, ServiceAction::Start]
        } else {
            [ServiceAction::Stop, ServiceAction::Disable]
        };
        for action in actions {
            ctx.host.set_service_state(&self.service, action).await?;
        }
        Ok(Applied::new(if planned.item {
            "remote console allowed"
        } else {
            "remote console disabled"
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::testing::{converge, Harness};
    use serde_json::json;

    #[tokio::test]
    async fn allow_and_revoke() {
        let h = Harness::new();
        h.host.seed_service("remote-console", false, false);

        let allow: RemoteConsoleBundle = serde_json::from_value(json!({"allow": true})).unwrap();
        assert_eq!(converge(&allow, &h.ctx()).await.unwrap(), vec!["remote-console"]);
        let status = h.ctx().host.service_status("remote-console").await.unwrap();
        assert!(status.running && status.enabled);
        assert!(converge(&allow, &h.ctx()).await.unwrap().is_empty());

        let deny: RemoteConsoleBundle = serde_json::from_value(json!({"allow": false})).unwrap();
        converge(&deny, &h.ctx()).await.unwrap();
        let status = h.ctx().host.service_status("remote-console").await.unwrap();
        assert!(!status.running && !status.enabled);
    }

    #[tokio::test]
    async fn deny_without_service_is_in_sync() {
        let h = Harness::new();
        let deny: RemoteConsoleBundle = serde_json::from_value(json!({})).unwrap();
        assert!(converge(&deny, &h.ctx()).await.unwrap().is_empty());
        assert_eq!(deny.plan().unwrap()[0].fingerprint.as_str(), "deny");
    }
}
