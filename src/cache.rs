use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_condvar_fair::Condvar;
#[allow(unused_imports)]
use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::AuthMethod;
use crate::document::{self, FqnMap, OrdConfiguration};

#[derive(Default)]
struct CacheInner {
    doc_by_path: HashMap<String, HashMap<String, Arc<Value>>>,
    paths_of: HashMap<String, Vec<String>>,
    config_of: HashMap<String, Arc<OrdConfiguration>>,
    fqn_of: HashMap<String, Arc<FqnMap>>,
    last_known_hash_for_dir: HashMap<PathBuf, String>,
}

impl CacheInner {
    fn invalidate(&mut self, fingerprint: &str) {
        self.doc_by_path.remove(fingerprint);
        self.paths_of.remove(fingerprint);
        self.config_of.remove(fingerprint);
        self.fqn_of.remove(fingerprint);
        self.last_known_hash_for_dir.retain(|_, h| h != fingerprint);
    }
}

struct CurrentWarming {
    fingerprint: String,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct WarmingState {
    current: Option<CurrentWarming>,
    next_generation: u64,
}

// Hash-keyed, directory-versioned cache of processed ORD documents and the
// configuration/FQN map derived from them. Every map is keyed by
// content fingerprint so a stale and a fresh generation can coexist for the
// brief window while the fresh one is still warming.
pub struct Cache {
    inner: Mutex<CacheInner>,
    warming: Mutex<WarmingState>,
    warming_condvar: Condvar,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            warming: Mutex::new(WarmingState::default()),
            warming_condvar: Condvar::new(),
        }
    }

    // Records `fingerprint` as the last-seen hash for `dir`. Returns true the
    // first time a *different* hash is seen for a directory already tracked,
    // at which point the stale generation's entries are dropped - callers
    // use this to decide whether a rewarm is needed.
    pub fn has_directory_hash_changed(&self, dir: &Path, fingerprint: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.last_known_hash_for_dir.get(dir).cloned() {
            None => {
                inner
                    .last_known_hash_for_dir
                    .insert(dir.to_owned(), fingerprint.to_owned());
                false
            }
            Some(known) if known == fingerprint => false,
            Some(known) => {
                inner.invalidate(&known);
                inner
                    .last_known_hash_for_dir
                    .insert(dir.to_owned(), fingerprint.to_owned());
                true
            }
        }
    }

    pub fn cache_document(&self, path: &str, fingerprint: &str, doc: Value) {
        let mut inner = self.inner.lock();
        inner
            .doc_by_path
            .entry(fingerprint.to_owned())
            .or_default()
            .insert(path.to_owned(), Arc::new(doc));
        let paths = inner.paths_of.entry(fingerprint.to_owned()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_owned());
        }
    }

    pub fn get_document_from_cache(&self, path: &str, fingerprint: &str) -> Option<Arc<Value>> {
        self.inner
            .lock()
            .doc_by_path
            .get(fingerprint)?
            .get(path)
            .cloned()
    }

    pub fn set_cached_ord_config(&self, fingerprint: &str, config: OrdConfiguration) {
        self.inner
            .lock()
            .config_of
            .insert(fingerprint.to_owned(), Arc::new(config));
    }

    pub fn get_cached_ord_config(&self, fingerprint: &str) -> Option<Arc<OrdConfiguration>> {
        self.inner.lock().config_of.get(fingerprint).cloned()
    }

    pub fn set_cached_fqn_map(&self, fingerprint: &str, map: FqnMap) {
        self.inner
            .lock()
            .fqn_of
            .insert(fingerprint.to_owned(), Arc::new(map));
    }

    pub fn get_cached_fqn_map(&self, fingerprint: &str) -> Option<Arc<FqnMap>> {
        self.inner.lock().fqn_of.get(fingerprint).cloned()
    }

    pub fn set_cached_directory_document_paths(&self, fingerprint: &str, paths: Vec<String>) {
        self.inner
            .lock()
            .paths_of
            .insert(fingerprint.to_owned(), paths);
    }

    pub fn get_cached_directory_document_paths(&self, fingerprint: &str) -> Option<Vec<String>> {
        self.inner.lock().paths_of.get(fingerprint).cloned()
    }

    pub fn invalidate_cache_for_directory(&self, fingerprint: &str) {
        self.inner.lock().invalidate(fingerprint);
    }

    pub fn clear_cache(&self) {
        *self.inner.lock() = CacheInner::default();
    }

    pub fn is_warming(&self) -> bool {
        self.warming.lock().current.is_some()
    }

    pub fn current_warming_fingerprint(&self) -> Option<String> {
        self.warming
            .lock()
            .current
            .as_ref()
            .map(|c| c.fingerprint.clone())
    }

    // Monotonically increasing count of warm cycles started so far, for the
    // status snapshot - not used for any cache-correctness decision.
    pub fn generation(&self) -> u64 {
        self.warming.lock().next_generation
    }

    // Blocks until the in-progress warming round terminates, whether by
    // finishing or by being superseded by a newer one. Either way the caller
    // is expected to re-enter its own cache lookup afterwards rather than
    // assume its particular fingerprint is now warm.
    pub async fn wait_for_completion(&self) {
        let mut guard = self.warming.lock();
        let seen_generation = match &guard.current {
            Some(c) => c.generation,
            None => return,
        };
        loop {
            let same_round = matches!(&guard.current, Some(c) if c.generation == seen_generation);
            if !same_round {
                return;
            }
            guard = self.warming_condvar.wait(guard).await;
        }
    }

    // Idempotent per fingerprint: if `fingerprint` is already cached or
    // already the in-progress warming round, this returns (after waiting for
    // the in-progress round, in the latter case) without doing the work
    // twice. If a *different* fingerprint is warming, that round is
    // cancelled and superseded - its waiters are released by the generation
    // bump below and re-check the cache themselves.
    pub async fn warm_cache(
        &self,
        docs_path: &Path,
        fingerprint: &str,
        auth_methods: &[AuthMethod],
        base_url: &str,
    ) -> anyhow::Result<()> {
        if self.inner.lock().config_of.contains_key(fingerprint) {
            return Ok(());
        }

        let (generation, cancel) = {
            let mut warming = self.warming.lock();
            if let Some(cur) = &warming.current {
                if cur.fingerprint == fingerprint {
                    let generation = cur.generation;
                    drop(warming);
                    self.wait_for_completion().await;
                    let _ = generation;
                    return Ok(());
                }
                cur.cancel.cancel();
            }
            let generation = warming.next_generation;
            warming.next_generation += 1;
            let cancel = CancellationToken::new();
            warming.current = Some(CurrentWarming {
                fingerprint: fingerprint.to_owned(),
                generation,
                cancel: cancel.clone(),
            });
            self.warming_condvar.notify_all();
            (generation, cancel)
        };

        let result = self
            .run_warming(docs_path, fingerprint, auth_methods, base_url, &cancel)
            .await;

        {
            let mut warming = self.warming.lock();
            if matches!(&warming.current, Some(c) if c.generation == generation) {
                warming.current = None;
            }
            self.warming_condvar.notify_all();
        }
        result
    }

    async fn run_warming(
        &self,
        docs_path: &Path,
        fingerprint: &str,
        auth_methods: &[AuthMethod],
        base_url: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let relative_paths = collect_relative_json_paths(docs_path)
            .await
            .context("listing ORD documents")?;

        let mut docs = Vec::with_capacity(relative_paths.len());
        let mut config_docs = Vec::with_capacity(relative_paths.len());
        let mut fqn_map: FqnMap = HashMap::new();

        for (i, relative_path) in relative_paths.iter().enumerate() {
            if cancel.is_cancelled() {
                anyhow::bail!("cache warming for {fingerprint} cancelled");
            }
            let full_path = docs_path.join(relative_path);
            let raw = tokio::fs::read(&full_path)
                .await
                .with_context(|| format!("reading {full_path:?}"))?;
            let processed = document::process_document(
                &raw,
                relative_path,
                Some(fingerprint),
                base_url,
                auth_methods,
            )
            .with_context(|| format!("processing {relative_path}"))?;

            for (ord_id, entry) in processed.fqn_contributions {
                fqn_map.entry(ord_id).or_default().push(entry);
            }
            config_docs.push(document::config_entry(relative_path, &processed, auth_methods));
            docs.push((relative_path.clone(), processed.value));

            if (i + 1) % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let config = OrdConfiguration {
            base_url: base_url.to_owned(),
            documents: config_docs,
        };

        // docByPath is published first; configOf/pathsOf/fqnOf are published
        // together right after, while still holding the same lock - a reader
        // that sees the config also sees every document it references.
        let mut inner = self.inner.lock();
        for (path, value) in docs {
            inner
                .doc_by_path
                .entry(fingerprint.to_owned())
                .or_default()
                .insert(path.clone(), Arc::new(value));
            let path_list = inner.paths_of.entry(fingerprint.to_owned()).or_default();
            if !path_list.iter().any(|p| p == &path) {
                path_list.push(path);
            }
        }
        inner.config_of.insert(fingerprint.to_owned(), Arc::new(config));
        inner.fqn_of.insert(fingerprint.to_owned(), Arc::new(fqn_map));
        Ok(())
    }
}

async fn collect_relative_json_paths(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut worklist = vec![PathBuf::new()];
    while let Some(rel_dir) = worklist.pop() {
        let abs_dir = root.join(&rel_dir);
        let mut entries = tokio::fs::read_dir(&abs_dir)
            .await
            .with_context(|| format!("reading {abs_dir:?}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let rel_path = rel_dir.join(entry.file_name());
            if file_type.is_dir() {
                worklist.push(rel_path);
            } else if rel_path.extension().is_some_and(|e| e == "json") {
                out.push(rel_path.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out.sort();
    Ok(out)
}
