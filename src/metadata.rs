use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Written atomically alongside the working tree after a successful swap,
// read at startup for skip-unchanged decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(rename = "commitHash")]
    pub commit_hash: String,
    #[serde(rename = "directoryTreeSha", skip_serializing_if = "Option::is_none")]
    pub directory_tree_sha: Option<String>,
    #[serde(rename = "fetchTime")]
    pub fetch_time: DateTime<Utc>,
    pub branch: String,
    pub repository: String,
    #[serde(rename = "totalFiles")]
    pub total_files: u64,
}
