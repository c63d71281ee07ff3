//! System settings: hostname, timezone and `sysctl.<key>` values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_state::Fingerprint;

use crate::domain::error::Result;
use crate::executors::{
    unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsBundle {
    #[serde(default)]
    pub items: Vec<SettingItem>,
}

fn supported(key: &str) -> bool {
    match key {
        "hostname" | "timezone" => true,
        _ => key.strip_prefix("sysctl.").is_some_and(|name| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "._-/".contains(c))
        }),
    }
}

#[async_trait]
impl BundleExecutor for SettingsBundle {
    type Item = SettingItem;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        unique_keys(self.items.iter().map(|i| i.key.as_str()))?;
        for item in &self.items {
            if !supported(&item.key) {
                return Err(format!("unsupported setting {:?}", item.key));
            }
            if item.value.contains('\n') {
                return Err(format!("{}: value must be a single line", item.key));
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<SettingItem>>> {
        Ok(self
            .items
            .iter()
            .map(|item| {
                PlannedItem::new(
                    item.key.clone(),
                    Fingerprint::from_raw(item.value.clone()),
                    item.clone(),
                )
            })
            .collect())
    }

    async fn open(&self, _items: &[PlannedItem<SettingItem>], _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<SettingItem>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let item = &planned.item;
        Ok(match ctx.host.get_setting(&item.key).await? {
            Some(current) if current.trim() == item.value => Observation::InSync,
            Some(current) => Observation::Drifted(format!("currently {:?}", current.trim())),
            None => Observation::Drifted("unset".into()),
        })
    }

    async fn apply(
        &self,
        planned: &PlannedItem<SettingItem>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let item = &planned.item;
        ctx.host.set_setting(&item.key, &item.value).await?;
        Ok(Applied::new(format!("{} = {}", item.key, item.value)))
    }
}
