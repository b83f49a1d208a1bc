use std::collections::HashMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AuthMethod;
use crate::util::short_hex;

const DEFAULT_PERSPECTIVE: &str = "system-instance";
const SERVER_PATH: &str = "/ord/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStrategy {
    #[serde(rename = "type")]
    pub kind: String,
}

// Fixed mapping from the server's configured authentication methods to ORD
// accessStrategies, per the configuration surface's auth-method table.
pub fn access_strategies_for(auth_methods: &[AuthMethod]) -> Vec<AccessStrategy> {
    auth_methods
        .iter()
        .map(|m| AccessStrategy {
            kind: m.access_strategy_type().to_owned(),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FqnEntry {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
}

pub type FqnMap = HashMap<String, Vec<FqnEntry>>;

#[derive(Debug, Clone, Serialize)]
pub struct OrdConfigDocument {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perspective: Option<String>,
    #[serde(rename = "accessStrategies")]
    pub access_strategies: Vec<AccessStrategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrdConfiguration {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    pub documents: Vec<OrdConfigDocument>,
}

// `/ord/v1/documents/<relative path without the .json extension>` -
// the request path is decoded and has no extension; it's implicit.
pub fn document_url(relative_path: &str) -> String {
    let without_ext = relative_path.strip_suffix(".json").unwrap_or(relative_path);
    format!("{SERVER_PATH}/documents/{without_ext}")
}

pub struct ProcessedDocument {
    pub value: Value,
    pub perspective: String,
    pub fqn_contributions: Vec<(String, FqnEntry)>,
}

// Document processing: deterministic and pure given its inputs.
// `fingerprint` is None only when called from local mode before any content
// has ever been fingerprinted (there the synthesized version falls back to
// "unknown" per `short_hex`).
pub fn process_document(
    raw: &[u8],
    relative_path: &str,
    fingerprint: Option<&str>,
    base_url: &str,
    auth_methods: &[AuthMethod],
) -> anyhow::Result<ProcessedDocument> {
    let mut doc: Value = serde_json::from_slice(raw).context("parsing ORD document JSON")?;
    let obj = doc
        .as_object_mut()
        .context("ORD document root is not a JSON object")?;

    if let Some(instance) = obj
        .get_mut("describedSystemInstance")
        .and_then(Value::as_object_mut)
    {
        instance.insert("baseUrl".to_owned(), Value::String(base_url.to_owned()));
    }

    let perspective = obj
        .get("perspective")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PERSPECTIVE)
        .to_owned();

    if perspective == "system-version" && !obj.contains_key("describedSystemVersion") {
        let version = format!("1.0.0-{}", short_hex(fingerprint));
        obj.insert(
            "describedSystemVersion".to_owned(),
            serde_json::json!({ "version": version }),
        );
    }

    let access_strategy_values: Vec<Value> = access_strategies_for(auth_methods)
        .into_iter()
        .map(|s| serde_json::to_value(s).expect("AccessStrategy always serializes"))
        .collect();

    let file_name = relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_owned();
    let mut fqn_contributions = Vec::new();

    for resource_kind in ["apiResources", "eventResources"] {
        let Some(resources) = obj.get_mut(resource_kind).and_then(Value::as_array_mut) else {
            continue;
        };
        for resource in resources {
            let Some(resource_obj) = resource.as_object_mut() else {
                continue;
            };
            let ord_id = resource_obj
                .get("ordId")
                .and_then(Value::as_str)
                .map(str::to_owned);
            if let Some(ord_id) = &ord_id {
                fqn_contributions.push((
                    ord_id.clone(),
                    FqnEntry {
                        file_name: file_name.clone(),
                        file_path: relative_path.to_owned(),
                    },
                ));
            }

            let Some(defs) = resource_obj
                .get_mut("resourceDefinitions")
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            for def in defs {
                let Some(def_obj) = def.as_object_mut() else {
                    continue;
                };
                if let Some(url) = def_obj.get("url").and_then(Value::as_str).map(str::to_owned) {
                    let rewritten =
                        rewrite_resource_definition_url(&url, ord_id.as_deref().unwrap_or(""));
                    def_obj.insert("url".to_owned(), Value::String(rewritten));
                }
                def_obj.insert(
                    "accessStrategies".to_owned(),
                    Value::Array(access_strategy_values.clone()),
                );
            }
        }
    }

    Ok(ProcessedDocument {
        value: doc,
        perspective,
        fqn_contributions,
    })
}

// Remote resourceDefinition URLs carry the resource's ordId as a path
// segment, percent-encoded when the template was rendered; that segment is
// unescaped for readability. Relative URLs have no host of their own, so
// they're resolved against "/" and prefixed with this server's ORD path.
fn rewrite_resource_definition_url(url: &str, ord_id: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        if ord_id.is_empty() {
            return url.to_owned();
        }
        let encoded = urlencoding::encode(ord_id);
        url.replace(encoded.as_ref(), ord_id)
    } else {
        let relative = url.trim_start_matches('/');
        format!("{SERVER_PATH}/{relative}")
    }
}

// The config entry's accessStrategies are always the server's configured
// ones (the same mapping substituted into every resourceDefinition in the
// document) - not read back off the document, which would be empty for any
// document with no api/event resources at all.
pub fn config_entry(
    relative_path: &str,
    processed: &ProcessedDocument,
    auth_methods: &[AuthMethod],
) -> OrdConfigDocument {
    OrdConfigDocument {
        url: document_url(relative_path),
        perspective: Some(processed.perspective.clone()),
        access_strategies: access_strategies_for(auth_methods),
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    fn auth_open() -> Vec<AuthMethod> {
        vec![AuthMethod::Open]
    }

    #[test]
    fn overrides_base_url_and_defaults_perspective() {
        let raw = br#"{"describedSystemInstance": {"baseUrl": "https://old.example"}}"#;
        let processed =
            process_document(raw, "doc.json", Some("abc123"), "https://new.example", &auth_open())
                .unwrap();
        assert_that!(processed.perspective, eq("system-instance".to_owned()));
        assert_that!(
            processed.value["describedSystemInstance"]["baseUrl"],
            eq(&Value::String("https://new.example".to_owned()))
        );
    }

    #[test]
    fn injects_synthesized_version_for_system_version_perspective() {
        let raw = br#"{"perspective": "system-version"}"#;
        let processed =
            process_document(raw, "doc.json", Some("deadbeefcafe"), "https://x", &auth_open())
                .unwrap();
        assert_that!(
            processed.value["describedSystemVersion"]["version"],
            eq(&Value::String("1.0.0-deadbeef".to_owned()))
        );
    }

    #[test]
    fn injects_unknown_version_when_fingerprint_missing() {
        let raw = br#"{"perspective": "system-version"}"#;
        let processed = process_document(raw, "doc.json", None, "https://x", &auth_open()).unwrap();
        assert_that!(
            processed.value["describedSystemVersion"]["version"],
            eq(&Value::String("1.0.0-unknown".to_owned()))
        );
    }

    #[test]
    fn leaves_existing_described_system_version_untouched() {
        let raw = br#"{"perspective": "system-version", "describedSystemVersion": {"version": "9.9.9"}}"#;
        let processed =
            process_document(raw, "doc.json", Some("abc123"), "https://x", &auth_open()).unwrap();
        assert_that!(
            processed.value["describedSystemVersion"]["version"],
            eq(&Value::String("9.9.9".to_owned()))
        );
    }

    #[test]
    fn rewrites_relative_resource_definition_urls_and_access_strategies() {
        let raw = br#"{
            "apiResources": [{
                "ordId": "com.example:apiResource:orders:v1",
                "resourceDefinitions": [{"url": "/orders.json", "accessStrategies": [{"type": "basic"}]}]
            }]
        }"#;
        let processed =
            process_document(raw, "documents/orders.json", Some("abc"), "https://x", &auth_open())
                .unwrap();
        let def = &processed.value["apiResources"][0]["resourceDefinitions"][0];
        assert_that!(def["url"], eq(&Value::String("/ord/v1/orders.json".to_owned())));
        assert_that!(
            def["accessStrategies"],
            eq(&serde_json::json!([{"type": "open"}]))
        );
    }

    #[test]
    fn unescapes_ord_id_in_remote_resource_definition_urls() {
        let ord_id = "com.example:apiResource:orders:v1";
        let encoded = urlencoding::encode(ord_id);
        let raw = format!(
            r#"{{"apiResources": [{{"ordId": "{ord_id}", "resourceDefinitions": [{{"url": "https://cdn.example/specs/{encoded}.json"}}]}}]}}"#
        );
        let processed =
            process_document(raw.as_bytes(), "doc.json", Some("abc"), "https://x", &auth_open())
                .unwrap();
        let url = processed.value["apiResources"][0]["resourceDefinitions"][0]["url"]
            .as_str()
            .unwrap()
            .to_owned();
        assert_that!(url, eq(format!("https://cdn.example/specs/{ord_id}.json")));
    }

    #[test]
    fn collects_fqn_contributions() {
        let raw = br#"{
            "apiResources": [{"ordId": "ns:api:a:v1", "resourceDefinitions": []}],
            "eventResources": [{"ordId": "ns:event:b:v1", "resourceDefinitions": []}]
        }"#;
        let processed =
            process_document(raw, "sub/doc.json", Some("abc"), "https://x", &auth_open()).unwrap();
        let ids: Vec<&str> = processed
            .fqn_contributions
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();
        assert_that!(ids, unordered_elements_are![eq("ns:api:a:v1"), eq("ns:event:b:v1")]);
        let (_, entry) = &processed.fqn_contributions[0];
        assert_that!(entry.file_name, eq("doc.json".to_owned()));
        assert_that!(entry.file_path, eq("sub/doc.json".to_owned()));
    }

    #[test]
    fn document_url_strips_json_extension() {
        assert_that!(
            document_url("sub/doc.json"),
            eq("/ord/v1/documents/sub/doc".to_owned())
        );
    }
}
