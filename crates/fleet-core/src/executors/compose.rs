//! Compose projects.
//!
//! Each project's YAML is written to `<compose_dir>/<name>.yml` and brought
//! up from there, so the file on disk doubles as the observed spec.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_host::FilePerms;
use fleet_state::Fingerprint;

use crate::domain::digest::{fingerprint_of, sha256_hex};
use crate::domain::error::Result;
use crate::executors::{
    unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    #[default]
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeItem {
    pub name: String,
    /// Compose file content (YAML)
    pub compose: String,
    #[serde(default)]
    pub state: ProjectState,
    #[serde(default)]
    pub force_recreate: bool,
}

#[derive(Serialize)]
struct Desired<'a> {
    compose_digest: String,
    state: &'a ProjectState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeBundle {
    #[serde(default)]
    pub items: Vec<ComposeItem>,
}

fn compose_path(ctx: &ExecContext<'_>, project: &str) -> String {
    ctx.settings
        .compose_dir
        .join(format!("{project}.yml"))
        .to_string_lossy()
        .into_owned()
}

fn valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

async fn file_current(item: &ComposeItem, path: &str, ctx: &ExecContext<'_>) -> Result<bool> {
    Ok(ctx
        .host
        .read_file(path)
        .await?
        .is_some_and(|f| f.digest == sha256_hex(item.compose.as_bytes())))
}

#[async_trait]
impl BundleExecutor for ComposeBundle {
    type Item = ComposeItem;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        unique_keys(self.items.iter().map(|i| i.name.as_str()))?;
        for item in &self.items {
            if !valid_project_name(&item.name) {
                return Err(format!("invalid project name {:?}", item.name));
            }
            if item.state == ProjectState::Up && item.compose.trim().is_empty() {
                return Err(format!("{}: compose file is empty", item.name));
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<ComposeItem>>> {
        self.items
            .iter()
            .map(|item| {
                let desired = Desired {
                    compose_digest: sha256_hex(item.compose.as_bytes()),
                    state: &item.state,
                };
                Ok(PlannedItem::new(
                    item.name.clone(),
                    fingerprint_of(&desired)?,
                    item.clone(),
                ))
            })
            .collect()
    }

    async fn open(&self, _items: &[PlannedItem<ComposeItem>], _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<ComposeItem>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let item = &planned.item;
        let status = ctx.host.compose_status(&item.name).await?;
        Ok(match item.state {
            ProjectState::Down => match status {
                Some(_) => Observation::Drifted("project exists".into()),
                None => Observation::InSync,
            },
            ProjectState::Up => {
                if !file_current(item, &compose_path(ctx, &item.name), ctx).await? {
                    Observation::Drifted("compose file changed".into())
                } else if !status.is_some_and(|s| s.is_up()) {
                    Observation::Drifted("not all services running".into())
                } else {
                    Observation::InSync
                }
            }
        })
    }

    async fn apply(
        &self,
        planned: &PlannedItem<ComposeItem>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let item = &planned.item;
        let path = compose_path(ctx, &item.name);
        match item.state {
            ProjectState::Up => {
                let changed = !file_current(item, &path, ctx).await?;
                if changed {
                    ctx.host
                        .write_file(&path, item.compose.as_bytes(), &FilePerms::default())
                        .await?;
                }
                ctx.host
                    .compose_up(&item.name, &path, item.force_recreate && changed)
                    .await?;
                Ok(Applied::new(format!("{} up", item.name)))
            }
            ProjectState::Down => {
                ctx.host.compose_down(&item.name, &path).await?;
                Ok(Applied::new(format!("{} down", item.name)))
            }
        }
    }
}
