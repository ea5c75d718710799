//! Pulling the local working copy up to date from a peer device.

use async_trait::async_trait;
use common::{
    runtime::Runtime,
    types::{
        Binding,
        SyncedRepository,
    },
};
use errors::ErrorMetadata;
use url::Url;

use crate::ClusterSyncEngine;

/// One pull from a peer into the local working copy.
pub struct FetchRequest<'a> {
    pub repository: &'a SyncedRepository,
    /// SSH URI of the peer to pull from.
    pub source: Url,
}

/// Wire-level pull execution, supplied by the surrounding product. The
/// executor runs in the working copy directory, authenticates as the
/// device, and fetches all refs with prunes.
#[async_trait]
pub trait FetchExecutor: Send + Sync + 'static {
    async fn fetch(&self, request: FetchRequest<'_>) -> anyhow::Result<()>;
}

/// Fetch executor that shells out to `git fetch`.
pub struct GitFetchExecutor {
    /// Override for `GIT_SSH_COMMAND`, typically pointing at the device's
    /// own credentials.
    pub ssh_command: Option<String>,
}

#[async_trait]
impl FetchExecutor for GitFetchExecutor {
    async fn fetch(&self, request: FetchRequest<'_>) -> anyhow::Result<()> {
        let mut command = tokio::process::Command::new("git");
        command
            .arg("fetch")
            .arg("--prune")
            .arg(request.source.as_str())
            .arg("+refs/*:refs/*")
            .current_dir(&request.repository.working_copy);
        if let Some(ssh_command) = &self.ssh_command {
            command.env("GIT_SSH_COMMAND", ssh_command);
        }
        let output = command.output().await?;
        if !output.status.success() {
            anyhow::bail!(ErrorMetadata::transient(
                "FetchFailed",
                format!(
                    "git fetch from {} exited with {}: {}",
                    request.source,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim(),
                ),
            ));
        }
        Ok(())
    }
}

impl<RT: Runtime> ClusterSyncEngine<RT> {
    /// Pull from the first leader that works. All leaders hold the same
    /// version, so trying them in order is best-effort failover, and the
    /// last error is as good as any to surface when every one fails.
    pub(crate) async fn fetch_from(&self, leaders: Vec<Binding>) -> anyhow::Result<()> {
        let repository = &self.repository;
        if !repository.family.is_git() {
            anyhow::bail!(ErrorMetadata::unsupported(
                "UnsupportedVcs",
                format!(
                    "repository \"{}\" is not a git repository; intracluster fetches support \
                     only git",
                    repository.display_name
                ),
            ));
        }
        let fetchable: Vec<Binding> = leaders
            .into_iter()
            .filter(|binding| binding.protocol.is_ssh_family())
            .collect();
        if fetchable.is_empty() {
            anyhow::bail!(ErrorMetadata::leader_lost(
                "NoFetchableLeader",
                format!(
                    "unable to synchronize repository \"{}\": no up-to-date fetchable nodes \
                     are available",
                    repository.display_name
                ),
            ));
        }
        if !repository.working_copy.is_dir() {
            anyhow::bail!(ErrorMetadata::not_initialized(
                "WorkingCopyMissing",
                format!(
                    "working copy {} for repository \"{}\" does not exist on this device; \
                     materialize the working copy before synchronizing",
                    repository.working_copy.display(),
                    repository.display_name,
                ),
            ));
        }

        let mut last_error = None;
        for binding in fetchable {
            let source = fetch_uri(&binding, repository)?;
            tracing::info!("fetching \"{}\" from {source}", repository.display_name);
            let request = FetchRequest {
                repository,
                source,
            };
            match self.fetcher.fetch(request).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("fetch from {} failed: {e:#}", binding.host);
                    last_error = Some(e);
                },
            }
        }
        Err(last_error.expect("tried at least one fetchable leader"))
    }
}

fn fetch_uri(binding: &Binding, repository: &SyncedRepository) -> anyhow::Result<Url> {
    let uri = format!(
        "ssh://{}/{}",
        binding.host,
        repository.remote_path.trim_start_matches('/'),
    );
    Url::parse(&uri).map_err(|e| anyhow::anyhow!("invalid fetch uri {uri}: {e}"))
}

#[cfg(test)]
mod tests {
    use common::types::TransportProtocol;
    use url::Url;

    use super::{
        fetch_uri,
        FetchExecutor,
        FetchRequest,
        GitFetchExecutor,
    };
    use crate::testing::SyncFixture;

    #[test]
    fn test_fetch_uri_construction() {
        let binding = SyncFixture::ssh_binding("repo001.example.com");
        assert!(binding.protocol.is_ssh_family());
        assert!(!TransportProtocol::Http.is_ssh_family());

        let fixture = SyncFixture::new();
        let uri = fetch_uri(&binding, &fixture.repository).unwrap();
        assert_eq!(uri.as_str(), "ssh://repo001.example.com/source/widgets.git");
    }

    #[tokio::test]
    async fn test_git_fetch_from_dead_source_fails() {
        let fixture = SyncFixture::new();
        let executor = GitFetchExecutor { ssh_command: None };
        // The source doesn't exist; whether git is installed or not, the
        // pull must surface an error rather than succeed.
        let request = FetchRequest {
            repository: &fixture.repository,
            source: Url::parse("file:///nonexistent/source/widgets.git").unwrap(),
        };
        assert!(executor.fetch(request).await.is_err());
    }
}
