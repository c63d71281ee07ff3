//! Firewall ruleset.
//!
//! The bundle is a single item: the full ordered rule list of the
//! agent-managed chain. Rules are rendered the way `iptables -S` prints
//! them so the observed chain compares line for line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_state::Fingerprint;

use crate::domain::digest::sha256_hex;
use crate::domain::error::Result;
use crate::executors::{Applied, BundleExecutor, ExecContext, Observation, PlannedItem};

/// Key of the bundle's only item.
pub const RULESET_KEY: &str = "ruleset";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Accept,
    Drop,
    Reject,
}

impl Verdict {
    fn target(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
            Verdict::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        }
    }

    fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default)]
    pub proto: Protocol,
    #[serde(default)]
    pub port: Option<u16>,
    /// Address or CIDR; bare addresses mean a single host
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub action: Verdict,
    #[serde(default)]
    pub comment: Option<String>,
}

impl FirewallRule {
    /// One rule line, without the `-A <chain>` prefix.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(source) = &self.source {
            parts.push("-s".into());
            parts.push(if source.contains('/') {
                source.clone()
            } else {
                format!("{source}/32")
            });
        }
        if self.proto != Protocol::All {
            parts.push(format!("-p {}", self.proto.name()));
        }
        if let Some(port) = self.port {
            parts.push(format!("-m {} --dport {port}", self.proto.name()));
        }
        if let Some(comment) = self.comment.as_deref().map(sanitize_comment) {
            if !comment.is_empty() {
                parts.push(format!("-m comment --comment {comment}"));
            }
        }
        parts.push(format!("-j {}", self.action.target()));
        parts.join(" ")
    }
}

/// Comments travel as a single shell word.
fn sanitize_comment(comment: &str) -> String {
    comment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.:".contains(c) {
                c
            } else {
                '_'
            }
        })
        .take(256)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallBundle {
    /// Verdict for traffic no rule matched
    #[serde(default)]
    pub default_policy: Verdict,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

impl FirewallBundle {
    /// The complete chain, default policy last.
    pub fn rendered(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.rules.iter().map(FirewallRule::render).collect();
        lines.push(format!("-j {}", self.default_policy.target()));
        lines
    }
}

fn valid_source(source: &str) -> bool {
    let (addr, prefix) = match source.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (source, None),
    };
    let Ok(addr) = addr.parse::<std::net::IpAddr>() else {
        return false;
    };
    let max = if addr.is_ipv4() { 32 } else { 128 };
    prefix.map_or(true, |p| p.parse::<u8>().is_ok_and(|p| p <= max))
}

#[async_trait]
impl BundleExecutor for FirewallBundle {
    type Item = Vec<String>;
    type Session = ();

    fn validate(&self) -> std::result::Result<(), String> {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.port.is_some() && !rule.proto.has_ports() {
                return Err(format!("rule {i}: port requires tcp or udp"));
            }
            if rule.port == Some(0) {
                return Err(format!("rule {i}: port 0"));
            }
            if let Some(source) = &rule.source {
                if !valid_source(source) {
                    return Err(format!("rule {i}: invalid source {source:?}"));
                }
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<Vec<String>>>> {
        let lines = self.rendered();
        let fingerprint = Fingerprint::from_raw(sha256_hex(lines.join("\n").as_bytes()));
        Ok(vec![PlannedItem::new(RULESET_KEY, fingerprint, lines)])
    }

    fn critical(&self) -> bool {
        true
    }

    async fn open(&self, _items: &[PlannedItem<Vec<String>>], _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<Vec<String>>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let current = ctx.host.firewall_ruleset().await?;
        if current == planned.item {
            Ok(Observation::InSync)
        } else {
            Ok(Observation::Drifted(format!(
                "{} rules on host, {} desired",
                current.len(),
                planned.item.len()
            )))
        }
    }

    async fn apply(
        &self,
        planned: &PlannedItem<Vec<String>>,
        _session: &mut (),
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        ctx.host.apply_firewall(&planned.item).await?;
        Ok(Applied::new(format!("applied {} firewall rules", planned.item.len()))
            .with_log(planned.item.join("\n")))
    }
}
