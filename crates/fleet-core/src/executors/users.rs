//! Local user accounts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_host::UserAccount;
use fleet_state::Fingerprint;

use crate::domain::digest::canonical_fingerprint;
use crate::domain::error::Result;
use crate::executors::{
    unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserItem {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    /// Supplementary groups; extra memberships on the host are left alone
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub state: AccountState,
}

impl UserItem {
    fn account(&self) -> UserAccount {
        let mut groups = self.groups.clone();
        groups.sort();
        groups.dedup();
        UserAccount {
            name: self.name.clone(),
            uid: self.uid,
            groups,
            shell: self.shell.clone(),
            home: self.home.clone(),
        }
    }

    fn differences(&self, current: &UserAccount) -> Vec<String> {
        let mut out = Vec::new();
        if self.uid.is_some() && self.uid != current.uid {
            out.push("uid".to_string());
        }
        let missing: Vec<&str> = self
            .groups
            .iter()
            .filter(|g| !current.groups.contains(g))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            out.push(format!("groups +{}", missing.join(",")));
        }
        if self.shell.is_some() && self.shell != current.shell {
            out.push("shell".to_string());
        }
        if self.home.is_some() && self.home != current.home {
            out.push("home".to_string());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBundle {
    #[serde(default)]
    pub items: Vec<UserItem>,
}

/// `[a-z_][a-z0-9_-]*`, at most 32 characters.
fn valid_user_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 32
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[async_trait]
impl BundleExecutor for UserBundle {
    type Item = UserItem;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        unique_keys(self.items.iter().map(|i| i.name.as_str()))?;
        for item in &self.items {
            if !valid_user_name(&item.name) {
                return Err(format!("invalid user name {:?}", item.name));
            }
            if item.name == "root" && item.state == AccountState::Absent {
                return Err("refusing to remove root".to_string());
            }
            if let Some(shell) = &item.shell {
                if !shell.starts_with('/') {
                    return Err(format!("{}: shell must be an absolute path", item.name));
                }
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<UserItem>>> {
        self.items
            .iter()
            .map(|item| {
                #[derive(Serialize)]
                struct Desired<'a> {
                    account: UserAccount,
                    state: &'a AccountState,
                }
                let fingerprint = canonical_fingerprint(&Desired {
                    account: item.account(),
                    state: &item.state,
                })?;
                Ok(PlannedItem::new(item.name.clone(), fingerprint, item.clone()))
            })
            .collect()
    }

    async fn open(&self, _items: &[PlannedItem<UserItem>], _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<UserItem>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let item = &planned.item;
        let current = ctx.host.user(&item.name).await?;
        Ok(match (item.state, current) {
            (AccountState::Absent, None) => Observation::InSync,
            (AccountState::Absent, Some(_)) => Observation::Drifted("account exists".into()),
            (AccountState::Present, None) => Observation::Drifted("account missing".into()),
            (AccountState::Present, Some(current)) => {
                let diff = item.differences(&current);
                if diff.is_empty() {
                    Observation::InSync
                } else {
                    Observation::Drifted(diff.join("; "))
                }
            }
        })
    }

    async fn apply(
        &self,
        planned: &PlannedItem<UserItem>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let item = &planned.item;
        match item.state {
            AccountState::Present => {
                ctx.host.ensure_user(&item.account()).await?;
                Ok(Applied::new(format!("account {} updated", item.name)))
            }
            AccountState::Absent => {
                ctx.host.remove_user(&item.name).await?;
                Ok(Applied::new(format!("account {} removed", item.name)))
            }
        }
    }
}
