use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::cache::Cache;
use crate::config::AuthMethod;
use crate::document::{self, FqnMap, OrdConfiguration};
use crate::errors::ServeError;
use crate::fsmanager::FsManager;
use crate::hash;

// Where the Document Service reads documents from, and how it derives
// the current fingerprint for that content. Local mode has no git commit to
// key off, so it re-hashes the tree on every call; remote mode derives the
// fingerprint from the atomically-written metadata sidecar instead, which is
// cheap and never races a swap (the sidecar is only ever replaced, never
// edited in place).
enum ContentLocation {
    Local {
        documents_dir: PathBuf,
    },
    Remote {
        fsmanager: Arc<FsManager>,
        documents_subdirectory: String,
    },
}

pub struct DocumentService {
    cache: Arc<Cache>,
    location: ContentLocation,
    base_url: String,
    auth_methods: Vec<AuthMethod>,
}

impl DocumentService {
    pub fn new_local(
        documents_dir: impl Into<PathBuf>,
        cache: Arc<Cache>,
        base_url: String,
        auth_methods: Vec<AuthMethod>,
    ) -> Self {
        Self {
            cache,
            location: ContentLocation::Local {
                documents_dir: documents_dir.into(),
            },
            base_url,
            auth_methods,
        }
    }

    pub fn new_remote(
        fsmanager: Arc<FsManager>,
        documents_subdirectory: String,
        cache: Arc<Cache>,
        base_url: String,
        auth_methods: Vec<AuthMethod>,
    ) -> Self {
        Self {
            cache,
            location: ContentLocation::Remote {
                fsmanager,
                documents_subdirectory,
            },
            base_url,
            auth_methods,
        }
    }

    async fn current(&self) -> Result<(PathBuf, String), ServeError> {
        match &self.location {
            ContentLocation::Local { documents_dir } => {
                let dir = documents_dir.clone();
                let fingerprint = tokio::task::spawn_blocking(move || hash::local_fingerprint(&dir))
                    .await
                    .map_err(|e| ServeError::Internal(anyhow::anyhow!("join error: {e}")))?
                    .map_err(ServeError::Internal)?;
                Ok((documents_dir.clone(), fingerprint))
            }
            ContentLocation::Remote {
                fsmanager,
                documents_subdirectory,
            } => {
                let metadata = fsmanager
                    .get_metadata()
                    .await
                    .map_err(|e| ServeError::Internal(anyhow::anyhow!(e)))?
                    .ok_or_else(|| ServeError::Config("no content fetched yet".to_owned()))?;
                let fingerprint = hash::remote_fingerprint(&metadata.commit_hash, documents_subdirectory);
                let docs_path = fsmanager.current_dir().join(documents_subdirectory);
                Ok((docs_path, fingerprint))
            }
        }
    }

    // The 7-hex-character prefix overlap check below is unusual and not
    // fully motivated by anything else in this module - kept exactly as
    // observed rather than "fixed", since two
    // fingerprints sharing a 7-character prefix are otherwise unrelated.
    async fn ensure_data_loaded(&self, docs_path: &Path, fingerprint: &str) -> Result<(), ServeError> {
        loop {
            if self.cache.get_cached_ord_config(fingerprint).is_some() {
                return Ok(());
            }
            if let Some(warming_fingerprint) = self.cache.current_warming_fingerprint() {
                if fingerprints_overlap(&warming_fingerprint, fingerprint) {
                    self.cache.wait_for_completion().await;
                    continue;
                }
            }
            self.cache
                .warm_cache(docs_path, fingerprint, &self.auth_methods, &self.base_url)
                .await
                .map_err(ServeError::Internal)?;
            return Ok(());
        }
    }

    pub async fn get_processed_document(&self, relative_path: &str) -> Result<Arc<Value>, ServeError> {
        let (docs_path, fingerprint) = self.current().await?;
        let cache_key = format!("{relative_path}.json");

        if let Some(doc) = self.cache.get_document_from_cache(&cache_key, &fingerprint) {
            return Ok(doc);
        }

        let full_path = docs_path.join(&cache_key);
        let raw = tokio::fs::read(&full_path)
            .await
            .map_err(|_| ServeError::NotFound(format!("document {relative_path}")))?;
        let processed = document::process_document(
            &raw,
            &cache_key,
            Some(&fingerprint),
            &self.base_url,
            &self.auth_methods,
        )
        .map_err(ServeError::Internal)?;

        self.cache
            .cache_document(&cache_key, &fingerprint, processed.value.clone());
        Ok(Arc::new(processed.value))
    }

    pub async fn get_ord_configuration(
        &self,
        perspective: Option<&str>,
    ) -> Result<OrdConfiguration, ServeError> {
        let (docs_path, fingerprint) = self.current().await?;
        self.ensure_data_loaded(&docs_path, &fingerprint).await?;
        let config = self
            .cache
            .get_cached_ord_config(&fingerprint)
            .ok_or_else(|| ServeError::Internal(anyhow::anyhow!("ord configuration missing after warm")))?;

        match perspective {
            None => Ok((*config).clone()),
            Some(p) => Ok(OrdConfiguration {
                base_url: config.base_url.clone(),
                documents: config
                    .documents
                    .iter()
                    .filter(|d| d.perspective.as_deref() == Some(p))
                    .cloned()
                    .collect(),
            }),
        }
    }

    pub async fn get_fqn_map(&self) -> Result<Arc<FqnMap>, ServeError> {
        let (docs_path, fingerprint) = self.current().await?;
        self.ensure_data_loaded(&docs_path, &fingerprint).await?;
        self.cache
            .get_cached_fqn_map(&fingerprint)
            .ok_or_else(|| ServeError::Internal(anyhow::anyhow!("fqn map missing after warm")))
    }

    pub async fn get_file_content(&self, relative_path: &str) -> Result<Vec<u8>, ServeError> {
        let (docs_path, _fingerprint) = self.current().await?;
        let full_path = docs_path.join(relative_path);
        tokio::fs::read(&full_path)
            .await
            .map_err(|_| ServeError::NotFound(format!("file {relative_path}")))
    }
}

fn fingerprints_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    const PREFIX_LEN: usize = 7;
    a.get(..PREFIX_LEN)
        .zip(b.get(..PREFIX_LEN))
        .is_some_and(|(pa, pb)| pa == pb)
}
