use std::path::Path;
use std::pin::pin;

use anyhow::Context;
use chrono::Utc;
#[allow(unused_imports)]
use futures::{select, FutureExt};
#[allow(unused_imports)]
use log::debug;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::errors::FetchError;
use crate::fsmanager::copy_dir_recursive;
use crate::git::Repo;
use crate::metadata::ContentMetadata;

// Repository coordinates the Content Fetcher needs to clone/pull a
// branch. Owned strings rather than borrows: this crosses await points and
// gets handed to a spawned scheduler task.
#[derive(Debug, Clone)]
pub struct FetchCoordinates {
    pub api_url: String,
    pub repository: String,
    pub branch: String,
    pub token: Option<String>,
}

// Race `fut` against cancellation, classifying whatever raw error it
// produces into a typed FetchError at this boundary. Called once per I/O
// step so cancellation is honored promptly rather than only between steps.
async fn run_cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<T, FetchError> {
    let fut = pin!(fut.fuse());
    select! {
        _ = cancel.cancelled().fuse() => Err(FetchError::Aborted),
        res = fut => res.map_err(|e| FetchError::classify(&e.to_string())),
    }
}

// GitHub clone URLs live on the plain host (github.com, or the GHE host
// without its "api." subdomain prefix); the configured API URL is what
// distinguishes github.com from a GitHub Enterprise instance.
fn clone_url(api_url: &str, repository: &str) -> anyhow::Result<String> {
    let api = url::Url::parse(api_url).with_context(|| format!("parsing githubApiUrl {api_url:?}"))?;
    let host = api.host_str().context("githubApiUrl has no host")?;
    let clone_host = if host == "api.github.com" {
        "github.com".to_owned()
    } else {
        host.strip_prefix("api.").unwrap_or(host).to_owned()
    };
    Ok(format!("https://{clone_host}/{repository}.git"))
}

// Inspect the remote HEAD of `branch` without touching the filesystem at
// all - used by the scheduler to decide whether a fetch is even necessary.
pub async fn get_latest_commit_sha(coords: &FetchCoordinates) -> Result<String, FetchError> {
    let url = clone_url(&coords.api_url, &coords.repository).map_err(FetchError::Other)?;
    Repo::remote_head_sha(Path::new("git"), &url, &coords.branch, coords.token.as_deref())
        .await
        .map_err(|e| FetchError::classify(&e.to_string()))
}

// Clone-or-pull `coords` into `target`, extract `root_subpath` as the new
// working root (using `staging` as scratch space), and return the resulting
// Content Metadata. `target` must already exist (possibly with a carried-over
// `.git/`, possibly empty) - see FsManager::prepare_temp_directory[_with_git].
pub async fn fetch(
    coords: &FetchCoordinates,
    root_subpath: &str,
    target: &Path,
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<ContentMetadata, FetchError> {
    let url = clone_url(&coords.api_url, &coords.repository).map_err(FetchError::Other)?;
    let repo = Repo::at(target);

    if !repo.has_git_dir() {
        // git clone accepts an existing *empty* destination directory, which
        // is exactly what FsManager::prepare_temp_directory[_with_git] hands
        // us, so there's nothing to remove first.
        run_cancellable(cancel, async {
            Repo::clone_branch(target, &url, &coords.branch, coords.token.as_deref()).await?;
            Ok(())
        })
        .await?;
    } else {
        run_cancellable(cancel, repo.pull_branch(&coords.branch, coords.token.as_deref())).await?;
    }

    let head = run_cancellable(cancel, repo.head_commit()).await?;
    let total_files = run_cancellable(cancel, repo.count_tracked_files(root_subpath)).await? as u64;

    if root_subpath != "." {
        extract_subpath(target, staging, root_subpath, cancel).await?;
    }

    debug!(
        "fetched {}@{} ({} files) into {:?}",
        coords.repository, head, total_files, target
    );

    Ok(ContentMetadata {
        commit_hash: head,
        directory_tree_sha: None,
        fetch_time: Utc::now(),
        branch: coords.branch.clone(),
        repository: coords.repository.clone(),
        total_files,
    })
}

// Copy target/<subpath> out to staging/, wipe everything in target except
// .git/, then move staging's children back next to .git/. On any failure
// staging is removed and the error propagated - the caller (the
// scheduler) treats the target directory as broken and leaves cleanup to
// FsManager on the next attempt.
async fn extract_subpath(
    target: &Path,
    staging: &Path,
    subpath: &str,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let result = extract_subpath_inner(target, staging, subpath, cancel).await;
    if result.is_err() {
        fs::remove_dir_all(staging).await.ok();
    }
    result
}

async fn extract_subpath_inner(
    target: &Path,
    staging: &Path,
    subpath: &str,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let source = target.join(subpath);
    if fs::metadata(&source).await.is_err() {
        return Err(FetchError::Other(anyhow::anyhow!(
            "subpath {subpath:?} not found under fetched content"
        )));
    }

    run_cancellable(cancel, async {
        fs::remove_dir_all(staging).await.ok();
        copy_dir_recursive(&source, staging)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    })
    .await?;

    run_cancellable(cancel, async {
        let mut entries = fs::read_dir(target).await.context("reading target dir")?;
        while let Some(entry) = entries.next_entry().await.context("reading target entry")? {
            if entry.file_name() == ".git" {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await.context("stat target entry")?.is_dir() {
                fs::remove_dir_all(&path).await.context("removing old content dir")?;
            } else {
                fs::remove_file(&path).await.context("removing old content file")?;
            }
        }
        Ok(())
    })
    .await?;

    run_cancellable(cancel, async {
        let mut entries = fs::read_dir(staging).await.context("reading staging dir")?;
        while let Some(entry) = entries.next_entry().await.context("reading staging entry")? {
            let dest = target.join(entry.file_name());
            fs::rename(entry.path(), &dest)
                .await
                .context("moving extracted content into place")?;
        }
        Ok(())
    })
    .await?;

    fs::remove_dir_all(staging).await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[test]
    fn clone_url_uses_github_com_for_the_public_api() {
        let url = clone_url("https://api.github.com", "owner/repo").unwrap();
        assert_that!(url, eq("https://github.com/owner/repo.git".to_owned()));
    }

    #[test]
    fn clone_url_strips_api_subdomain_for_ghe() {
        let url = clone_url("https://api.github.example.com", "owner/repo").unwrap();
        assert_that!(url, eq("https://github.example.com/owner/repo.git".to_owned()));
    }

    async fn init_repo(dir: &Path) {
        let repo = Repo::at(dir);
        repo_git(dir, ["init", "--initial-branch=main"]).await;
        fs::create_dir_all(dir.join("documents")).await.unwrap();
        fs::write(dir.join("documents/doc1.json"), "{}").await.unwrap();
        fs::write(dir.join("README.md"), "hi").await.unwrap();
        repo_git(dir, ["add", "."]).await;
        repo_git(dir, ["commit", "-m", "initial"]).await;
        let _ = repo;
    }

    async fn repo_git<I, S>(dir: &Path, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let status = tokio::process::Command::new("git")
            .current_dir(dir)
            .args(args)
            .status()
            .await
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn fetch_clones_and_extracts_subpath() {
        let origin_dir = tempfile::tempdir().unwrap();
        init_repo(origin_dir.path()).await;

        let target_parent = tempfile::tempdir().unwrap();
        let target = target_parent.path().join("target");
        let staging = target_parent.path().join("staging");

        // Can't clone over https in a hermetic test; clone from the local
        // path directly rather than through clone_url.
        Repo::clone_branch(&target, origin_dir.path().to_str().unwrap(), "main", None)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        extract_subpath(&target, &staging, "documents", &cancel)
            .await
            .unwrap();

        assert_that!(fs::metadata(target.join("doc1.json")).await, ok(anything()));
        assert_that!(fs::metadata(target.join("README.md")).await, err(anything()));
        assert_that!(fs::metadata(target.join(".git")).await, ok(anything()));
        assert_that!(fs::metadata(staging).await, err(anything()));
    }

    #[tokio::test]
    async fn extract_subpath_fails_when_subpath_missing() {
        let origin_dir = tempfile::tempdir().unwrap();
        init_repo(origin_dir.path()).await;

        let target_parent = tempfile::tempdir().unwrap();
        let target = target_parent.path().join("target");
        let staging = target_parent.path().join("staging");
        Repo::clone_branch(&target, origin_dir.path().to_str().unwrap(), "main", None)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let result = extract_subpath(&target, &staging, "does-not-exist", &cancel).await;
        assert_that!(result, err(anything()));
        assert_that!(fs::metadata(staging).await, err(anything()));
    }
}
