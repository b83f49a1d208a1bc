use std::path::{Path, PathBuf};

#[allow(unused_imports)]
use log::{debug, warn};
use tokio::fs;

use crate::errors::FsManagerError;
use crate::git::Repo;
use crate::metadata::ContentMetadata;
use crate::util::IoResultExt;

// FileSystem Manager: owns the three sibling directories under a data
// root and the atomic swap between them. Nothing outside this module is
// allowed to rename/remove `current/`, `temp/` or `staging/` - request
// handlers only ever read `current_dir()`.
#[derive(Debug, Clone)]
pub struct FsManager {
    data_root: PathBuf,
}

impl FsManager {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn current_dir(&self) -> PathBuf {
        self.data_root.join("current")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_root.join("temp")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    fn backup_dir(&self) -> PathBuf {
        self.data_root.join("backup")
    }

    fn metadata_path(&self) -> PathBuf {
        self.current_dir().join(".metadata.json")
    }

    async fn remove_dir_if_exists(path: &Path) -> Result<(), FsManagerError> {
        if fs::metadata(path).await.is_err() {
            return Ok(());
        }
        let owned = path.to_owned();
        tokio::task::spawn_blocking(move || remove_dir_all::remove_dir_all(&owned))
            .await
            .map_err(|e| FsManagerError::Other(anyhow::anyhow!("join error: {e}")))?
            .ignore(std::io::ErrorKind::NotFound)?;
        Ok(())
    }

    // Any leftover backup/ or staging/ from an interrupted previous run is
    // recoverable garbage, not a fatal error.
    pub async fn recover_startup_garbage(&self) -> Result<(), FsManagerError> {
        Self::remove_dir_if_exists(&self.backup_dir()).await?;
        Self::remove_dir_if_exists(&self.staging_dir()).await?;
        Ok(())
    }

    pub async fn prepare_temp_directory(&self) -> Result<(), FsManagerError> {
        Self::remove_dir_if_exists(&self.temp_dir()).await?;
        fs::create_dir_all(self.temp_dir()).await?;
        Ok(())
    }

    // Same as prepare_temp_directory, but carries current/.git/ over into
    // temp/ first so the fetcher can do an incremental `pull` instead of a
    // full clone.
    pub async fn prepare_temp_directory_with_git(&self) -> Result<(), FsManagerError> {
        self.prepare_temp_directory().await?;
        let current_git = self.current_dir().join(".git");
        if fs::metadata(&current_git).await.is_ok() {
            copy_dir_recursive(&current_git, &self.temp_dir().join(".git")).await?;
        }
        Ok(())
    }

    pub async fn cleanup_temp_directory(&self) -> Result<(), FsManagerError> {
        Self::remove_dir_if_exists(&self.temp_dir()).await?;
        Self::remove_dir_if_exists(&self.staging_dir()).await?;
        Ok(())
    }

    // Atomic rename exchange: current -> backup, temp -> current, delete
    // backup. If the second rename fails, the first is undone so current/
    // is never left missing.
    pub async fn swap_directories(&self) -> Result<(), FsManagerError> {
        let current = self.current_dir();
        let temp = self.temp_dir();
        let backup = self.backup_dir();

        Self::remove_dir_if_exists(&backup).await?;

        let had_current = fs::metadata(&current).await.is_ok();
        if had_current {
            fs::rename(&current, &backup).await?;
        }

        if let Err(e) = fs::rename(&temp, &current).await {
            if had_current {
                // Best-effort restore; if this also fails there is nothing
                // more we can do locally but current/ was never left
                // partially populated.
                fs::rename(&backup, &current).await.ok();
            }
            return Err(FsManagerError::Io(e));
        }

        if had_current {
            Self::remove_dir_if_exists(&backup).await?;
        }
        Ok(())
    }

    pub async fn save_metadata(&self, metadata: &ContentMetadata) -> Result<(), FsManagerError> {
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| FsManagerError::Other(anyhow::anyhow!("serializing metadata: {e}")))?;
        let tmp_path = self.current_dir().join(".metadata.json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, self.metadata_path()).await?;
        Ok(())
    }

    pub async fn get_metadata(&self) -> Result<Option<ContentMetadata>, FsManagerError> {
        let path = self.metadata_path();
        let contents = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsManagerError::Io(e)),
        };
        let metadata: ContentMetadata = serde_json::from_slice(&contents)
            .map_err(|e| FsManagerError::Corrupt(format!("malformed .metadata.json: {e}")))?;
        Ok(Some(metadata))
    }

    pub async fn get_current_version(&self) -> Result<Option<String>, FsManagerError> {
        Ok(self.get_metadata().await?.map(|m| m.commit_hash))
    }

    // If current/.git/HEAD resolves to a different commit than the sidecar
    // claims, the filesystem is considered corrupt and a re-clone must be
    // forced by the caller (the scheduler treats this the same as
    // "no existing content").
    pub async fn is_corrupt(&self) -> Result<bool, FsManagerError> {
        let metadata = match self.get_metadata().await? {
            Some(m) => m,
            None => return Ok(false),
        };
        let repo = Repo::at(self.current_dir());
        if !repo.has_git_dir() {
            return Ok(false);
        }
        match repo.head_commit().await {
            Ok(head) => Ok(head != metadata.commit_hash),
            Err(_) => Ok(true),
        }
    }
}

// fs::read_dir's entries aren't Send-friendly to walk with plain recursive
// async fns without boxing, so this drives the recursion with an explicit
// worklist instead.
pub(crate) async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), FsManagerError> {
    let mut worklist = vec![(src.to_owned(), dst.to_owned())];
    while let Some((src_dir, dst_dir)) = worklist.pop() {
        fs::create_dir_all(&dst_dir).await?;
        let mut entries = fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dst_path = dst_dir.join(entry.file_name());
            if file_type.is_dir() {
                worklist.push((entry.path(), dst_path));
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).await?;
                #[cfg(unix)]
                fs::symlink(&target, &dst_path).await?;
                #[cfg(not(unix))]
                fs::copy(entry.path(), &dst_path).await.map(|_| ())?;
            } else {
                fs::copy(entry.path(), &dst_path).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use googletest::prelude::*;

    use super::*;

    #[tokio::test]
    async fn prepare_temp_directory_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let fsm = FsManager::new(root.path());
        fsm.prepare_temp_directory().await.unwrap();
        let mut entries = fs::read_dir(fsm.temp_dir()).await.unwrap();
        assert_that!(entries.next_entry().await.unwrap(), none());
    }

    #[tokio::test]
    async fn swap_directories_replaces_current() {
        let root = tempfile::tempdir().unwrap();
        let fsm = FsManager::new(root.path());
        fs::create_dir_all(fsm.current_dir()).await.unwrap();
        fs::write(fsm.current_dir().join("old.txt"), "old")
            .await
            .unwrap();
        fs::create_dir_all(fsm.temp_dir()).await.unwrap();
        fs::write(fsm.temp_dir().join("new.txt"), "new")
            .await
            .unwrap();

        fsm.swap_directories().await.unwrap();

        assert_that!(fs::metadata(fsm.current_dir().join("new.txt")).await, ok(anything()));
        assert_that!(fs::metadata(fsm.current_dir().join("old.txt")).await, err(anything()));
        assert_that!(fs::metadata(fsm.backup_dir()).await, err(anything()));
    }

    #[tokio::test]
    async fn swap_directories_without_prior_current_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let fsm = FsManager::new(root.path());
        fs::create_dir_all(fsm.temp_dir()).await.unwrap();
        fs::write(fsm.temp_dir().join("new.txt"), "new")
            .await
            .unwrap();

        fsm.swap_directories().await.unwrap();
        assert_that!(fs::metadata(fsm.current_dir().join("new.txt")).await, ok(anything()));
    }

    #[tokio::test]
    async fn metadata_roundtrips_through_sidecar_file() {
        let root = tempfile::tempdir().unwrap();
        let fsm = FsManager::new(root.path());
        fs::create_dir_all(fsm.current_dir()).await.unwrap();

        let metadata = ContentMetadata {
            commit_hash: "a".repeat(40),
            directory_tree_sha: None,
            fetch_time: Utc::now(),
            branch: "main".to_owned(),
            repository: "owner/repo".to_owned(),
            total_files: 3,
        };
        fsm.save_metadata(&metadata).await.unwrap();
        let loaded = fsm.get_metadata().await.unwrap().unwrap();
        assert_that!(loaded, eq(metadata));
    }

    #[tokio::test]
    async fn get_current_version_is_none_when_no_metadata() {
        let root = tempfile::tempdir().unwrap();
        let fsm = FsManager::new(root.path());
        assert_that!(fsm.get_current_version().await.unwrap(), none());
    }

    #[tokio::test]
    async fn recover_startup_garbage_removes_leftovers() {
        let root = tempfile::tempdir().unwrap();
        let fsm = FsManager::new(root.path());
        fs::create_dir_all(fsm.backup_dir()).await.unwrap();
        fs::create_dir_all(fsm.staging_dir()).await.unwrap();

        fsm.recover_startup_garbage().await.unwrap();

        assert_that!(fs::metadata(fsm.backup_dir()).await, err(anything()));
        assert_that!(fs::metadata(fsm.staging_dir()).await, err(anything()));
    }
}
