//! File distribution.
//!
//! Content is either inline or fetched by URL and verified against a
//! SHA-256 digest. URL downloads for drifted items are prefetched with a
//! bounded pool before items are applied in order.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_host::FilePerms;
use fleet_state::Fingerprint;

use crate::domain::digest::sha256_hex;
use crate::domain::error::{AgentError, Result};
use crate::executors::{
    parse_mode, unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};
use crate::retry;

fn default_mode() -> String {
    "0644".to_string()
}

fn default_root() -> String {
    "root".to_string()
}

/// Command run after the file is written, as an argv list or a shell line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PostCommand {
    Argv(Vec<String>),
    Shell(String),
}

impl PostCommand {
    pub fn argv(&self) -> Vec<String> {
        match self {
            PostCommand::Argv(argv) => argv.clone(),
            PostCommand::Shell(line) => vec!["/bin/sh".to_string(), "-c".to_string(), line.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    /// Absolute destination path (the idempotence key)
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// SHA-256 hex of the content; required with `url`
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_root")]
    pub owner: String,
    #[serde(default = "default_root")]
    pub group: String,
    #[serde(default)]
    pub post_command: Option<PostCommand>,
    #[serde(default)]
    pub requires: Vec<String>,
}

impl FileItem {
    /// Digest of the desired content.
    pub fn desired_digest(&self) -> String {
        match (&self.content, &self.digest) {
            (Some(content), _) => sha256_hex(content.as_bytes()),
            (None, Some(digest)) => digest.to_ascii_lowercase(),
            (None, None) => String::new(),
        }
    }

    fn perms(&self) -> Result<FilePerms> {
        Ok(FilePerms {
            mode: parse_mode(&self.mode).map_err(AgentError::execution)?,
            owner: self.owner.clone(),
            group: self.group.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBundle {
    #[serde(default)]
    pub items: Vec<FileItem>,
}

/// Downloads completed before items are applied, keyed by path.
pub type Prefetched = HashMap<String, std::result::Result<Vec<u8>, String>>;

async fn download_verified(item: &FileItem, ctx: &ExecContext<'_>) -> Result<Vec<u8>> {
    let url = item
        .url
        .as_deref()
        .ok_or_else(|| AgentError::execution("no url"))?;
    let bytes = retry::with_backoff(&ctx.settings.retry, ctx.cancel, "download", || {
        ctx.control.download(url)
    })
    .await?;
    let actual = sha256_hex(&bytes);
    let expected = item.desired_digest();
    if actual != expected {
        return Err(AgentError::Execution {
            message: format!("digest mismatch for {url}"),
            log: format!("expected {expected}\nactual   {actual}"),
        });
    }
    Ok(bytes)
}

/// Why the file on the host differs from `item`, if it does.
async fn content_drift(item: &FileItem, ctx: &ExecContext<'_>) -> Result<Option<String>> {
    let perms = item.perms()?;
    let Some(current) = ctx.host.read_file(&item.path).await? else {
        return Ok(Some("file missing".into()));
    };
    if current.digest != item.desired_digest() {
        return Ok(Some("content differs".into()));
    }
    if current.mode != perms.mode || current.owner != perms.owner || current.group != perms.group {
        return Ok(Some(format!(
            "permissions {:04o} {}:{} differ",
            current.mode, current.owner, current.group
        )));
    }
    Ok(None)
}

#[async_trait]
impl BundleExecutor for FileBundle {
    type Item = FileItem;
    type Session = Prefetched;

    fn validate(&self) -> std::result::Result<(), String> {
        unique_keys(self.items.iter().map(|i| i.path.as_str()))?;
        for item in &self.items {
            if !item.path.starts_with('/') {
                return Err(format!("{}: path must be absolute", item.path));
            }
            match (&item.content, &item.url) {
                (Some(_), Some(_)) => {
                    return Err(format!("{}: content and url are exclusive", item.path))
                }
                (None, None) => return Err(format!("{}: content or url required", item.path)),
                (None, Some(_)) if item.digest.is_none() => {
                    return Err(format!("{}: url requires digest", item.path))
                }
                _ => {}
            }
            if let (Some(content), Some(digest)) = (&item.content, &item.digest) {
                if !sha256_hex(content.as_bytes()).eq_ignore_ascii_case(digest) {
                    return Err(format!("{}: digest does not match content", item.path));
                }
            }
            if let Some(digest) = &item.digest {
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(format!("{}: digest must be SHA-256 hex", item.path));
                }
            }
            parse_mode(&item.mode).map_err(|e| format!("{}: {e}", item.path))?;
            if let Some(PostCommand::Argv(argv)) = &item.post_command {
                if argv.is_empty() {
                    return Err(format!("{}: empty post_command", item.path));
                }
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<FileItem>>> {
        self.items
            .iter()
            .map(|item| {
                let perms = item.perms()?;
                let fingerprint = Fingerprint::from_raw(format!(
                    "{}:{:04o}:{}:{}",
                    item.desired_digest(),
                    perms.mode,
                    perms.owner,
                    perms.group
                ));
                Ok(PlannedItem::new(item.path.clone(), fingerprint, item.clone())
                    .requiring(item.requires.clone()))
            })
            .collect()
    }

    async fn open(
        &self,
        items: &[PlannedItem<FileItem>],
        ctx: &ExecContext<'_>,
    ) -> Result<Prefetched> {
        let mut needed = Vec::new();
        for planned in items.iter().filter(|p| p.item.url.is_some()) {
            match content_drift(&planned.item, ctx).await {
                Ok(None) => {}
                Ok(Some(_)) => needed.push(&planned.item),
                // observe reports this against the item itself
                Err(err) => debug!(path = %planned.item.path, error = %err, "skipping prefetch"),
            }
        }
        if needed.is_empty() {
            return Ok(Prefetched::new());
        }
        debug!(count = needed.len(), "prefetching file downloads");

        let downloads: Vec<_> = needed
            .into_iter()
            .map(|item| async move {
                let result = download_verified(item, ctx).await.map_err(|e| {
                    let log = e.log();
                    if log.is_empty() {
                        e.to_string()
                    } else {
                        format!("{e}\n{log}")
                    }
                });
                (item.path.clone(), result)
            })
            .collect();
        // `buffered` keeps input order, so results line up with items
        let results: Vec<(String, std::result::Result<Vec<u8>, String>)> = stream::iter(downloads)
            .buffered(ctx.settings.download_concurrency.max(1))
            .collect()
            .await;
        Ok(results.into_iter().collect())
    }

    async fn observe(
        &self,
        planned: &PlannedItem<FileItem>,
        previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        if let Some(reason) = content_drift(&planned.item, ctx).await? {
            return Ok(Observation::Drifted(reason));
        }
        // A post_command only counts as done once the fingerprint is recorded.
        if planned.item.post_command.is_some() && previous != Some(&planned.fingerprint) {
            return Ok(Observation::Drifted("post_command pending".into()));
        }
        Ok(Observation::InSync)
    }

    async fn apply(
        &self,
        planned: &PlannedItem<FileItem>,
        prefetched: &mut Prefetched,
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let item = &planned.item;
        let content = match (&item.content, prefetched.remove(&item.path)) {
            (Some(content), _) => content.clone().into_bytes(),
            (None, Some(Ok(bytes))) => bytes,
            (None, Some(Err(reason))) => {
                return Err(AgentError::Execution {
                    message: format!("download for {} failed", item.path),
                    log: reason,
                })
            }
            (None, None) => download_verified(item, ctx).await?,
        };

        ctx.host
            .write_file(&item.path, &content, &item.perms()?)
            .await?;

        let mut applied = Applied::new(format!("wrote {} ({} bytes)", item.path, content.len()));
        if let Some(post) = &item.post_command {
            let output = ctx.host.run_command(&post.argv(), &[]).await?;
            applied = applied.with_log(output.combined());
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::testing::Harness;
    use serde_json::json;
    use std::time::Duration;

    fn bundle(items: serde_json::Value) -> FileBundle {
        serde_json::from_value(json!({ "items": items })).unwrap()
    }

    #[test]
    fn fingerprint_leads_with_content_digest() {
        let b = bundle(json!([{"path": "/etc/app.conf", "content": "port=80\n", "mode": "0600"}]));
        let planned = b.plan().unwrap();
        let digest = sha256_hex(b"port=80\n");
        assert_eq!(
            planned[0].fingerprint.as_str(),
            format!("{digest}:0600:root:root")
        );
        assert_eq!(planned[0].key, "/etc/app.conf");
    }

    #[test]
    fn validation_rules() {
        let digest = sha256_hex(b"x");
        assert!(bundle(json!([{"path": "/a", "content": "x"}])).validate().is_ok());
        assert!(bundle(json!([{"path": "/a", "url": "https://cdn/a", "digest": digest}]))
            .validate()
            .is_ok());
        for bad in [
            json!([{"path": "relative", "content": "x"}]),
            json!([{"path": "/a"}]),
            json!([{"path": "/a", "content": "x", "url": "https://cdn/a"}]),
            json!([{"path": "/a", "url": "https://cdn/a"}]),
            json!([{"path": "/a", "content": "x", "digest": sha256_hex(b"y")}]),
            json!([{"path": "/a", "content": "x", "mode": "999"}]),
            json!([{"path": "/a", "content": "x"}, {"path": "/a", "content": "y"}]),
            json!([{"path": "/a", "content": "x", "post_command": []}]),
        ] {
            assert!(bundle(bad.clone()).validate().is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn post_command_forms() {
        let argv: PostCommand = serde_json::from_value(json!(["systemctl", "reload", "nginx"])).unwrap();
        assert_eq!(argv.argv(), vec!["systemctl", "reload", "nginx"]);
        let shell: PostCommand = serde_json::from_value(json!("nginx -t && nginx -s reload")).unwrap();
        assert_eq!(shell.argv()[0], "/bin/sh");
    }

    fn url_item(path: &str, content: &[u8]) -> serde_json::Value {
        json!({
            "path": path,
            "url": format!("https://cdn.example{path}"),
            "digest": sha256_hex(content),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_is_bounded_and_lines_up_with_items() {
        let mut h = Harness::new();
        h.settings.download_concurrency = 2;
        h.control.set_download_delay(Duration::from_secs(1));
        let paths = ["/opt/a.bin", "/opt/b.bin", "/opt/c.bin", "/opt/d.bin", "/opt/e.bin"];
        let mut items = Vec::new();
        for path in paths {
            h.control
                .add_download(&format!("https://cdn.example{path}"), path.as_bytes());
            items.push(url_item(path, path.as_bytes()));
        }
        let b = bundle(json!(items));

        let planned = b.plan().unwrap();
        let prefetched = b.open(&planned, &h.ctx()).await.unwrap();

        assert_eq!(h.control.download_count(), 5);
        assert_eq!(h.control.peak_concurrent_downloads(), 2);
        for path in paths {
            assert_eq!(prefetched[path].as_deref(), Ok(path.as_bytes()));
        }
    }

    #[tokio::test]
    async fn in_sync_urls_are_not_downloaded() {
        let h = Harness::new();
        h.host.seed_file(
            "/opt/a.bin",
            b"payload",
            FilePerms {
                mode: 0o644,
                owner: "root".into(),
                group: "root".into(),
            },
        );
        let b = bundle(json!([url_item("/opt/a.bin", b"payload")]));

        let prefetched = b.open(&b.plan().unwrap(), &h.ctx()).await.unwrap();
        assert!(prefetched.is_empty());
        assert_eq!(h.control.download_count(), 0);
    }

    #[tokio::test]
    async fn digest_mismatch_fails_the_item() {
        let h = Harness::new();
        h.control.add_download("https://cdn.example/opt/a.bin", b"tampered");
        let b = bundle(json!([url_item("/opt/a.bin", b"payload")]));
        let planned = b.plan().unwrap();

        let mut session = b.open(&planned, &h.ctx()).await.unwrap();
        let err = b.apply(&planned[0], &mut session, &h.ctx()).await.unwrap_err();
        assert!(err.log().contains(&sha256_hex(b"payload")));
        assert!(h.host.file_content("/opt/a.bin").is_none());
    }

    #[tokio::test]
    async fn unreadable_path_does_not_fail_the_session() {
        let h = Harness::new();
        h.host.fail_target("read_file", "/opt/a.bin", "permission denied");
        let b = bundle(json!([url_item("/opt/a.bin", b"payload")]));
        let planned = b.plan().unwrap();

        let session = b.open(&planned, &h.ctx()).await.unwrap();
        assert!(session.is_empty());
        assert!(b.observe(&planned[0], None, &h.ctx()).await.is_err());
    }

    #[tokio::test]
    async fn post_command_stays_pending_until_recorded() {
        let h = Harness::new();
        let b = bundle(json!([
            {"path": "/etc/nginx.conf", "content": "x", "post_command": ["nginx", "-s", "reload"]}
        ]));
        let planned = b.plan().unwrap();
        let mut session = b.open(&planned, &h.ctx()).await.unwrap();
        b.apply(&planned[0], &mut session, &h.ctx()).await.unwrap();

        assert_eq!(
            b.observe(&planned[0], None, &h.ctx()).await.unwrap(),
            Observation::Drifted("post_command pending".into())
        );
        assert_eq!(
            b.observe(&planned[0], Some(&planned[0].fingerprint), &h.ctx())
                .await
                .unwrap(),
            Observation::InSync
        );
    }
}
