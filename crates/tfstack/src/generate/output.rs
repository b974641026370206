//! outputs of generated artifacts
//!
//! Every referenced path becomes one output whose name carries the path itself
//! (`dependency.vpc.outputs.id` -> `tfstack_ZGVwZW5kZW5jeS52cGMub3V0cHV0cy5pZA`), so the flat
//! `output -json` result folds straight back into a [ValueTree].
use crate::tree::{TreeError, ValueTree};
use crate::value::{Value, ValueError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use indexmap::IndexMap;
use serde::Deserialize;

const PREFIX: &str = "tfstack_";

/// Output name for a dotted key
pub fn encode_name(key: &str) -> String {
    format!("{PREFIX}{}", URL_SAFE_NO_PAD.encode(key))
}

/// Dotted key of an output name, `None` for outputs not generated here
pub fn decode_name(name: &str) -> Option<Result<String, OutputError>> {
    let encoded = name.strip_prefix(PREFIX)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| OutputError::Name(name.to_string()));
    Some(decoded)
}

/// One entry of `output -json`
#[derive(Debug, Deserialize)]
pub struct OutputEntry {
    #[serde(default)]
    pub sensitive: bool,
    #[serde(rename = "type")]
    pub ty: serde_json::Value,
    pub value: serde_json::Value,
}

/// Parse `output -json` into a tree keyed by the decoded names
pub fn parse_outputs(json: &str) -> Result<ValueTree, OutputError> {
    // no outputs at all prints nothing on some versions
    if json.trim().is_empty() {
        return Ok(ValueTree::new());
    }

    let entries: IndexMap<String, OutputEntry> = serde_json::from_str(json)?;
    let mut tree = ValueTree::new();

    for (name, entry) in entries {
        let Some(key) = decode_name(&name) else {
            tracing::debug!(%name, "skipping foreign output");
            continue;
        };
        let key = key?;

        let value = Value::from_typed_json(&entry.ty, entry.value)
            .map_err(|source| OutputError::Value { key: key.clone(), source })?;
        tracing::trace!(%key, sensitive = entry.sensitive, "parsed output");
        tree.insert(&key, value)?;
    }

    Ok(tree)
}

#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("unable to parse provisioner output")]
    Json(#[from] serde_json::Error),
    #[error("output `{0}` has an invalid encoded name")]
    Name(String),
    #[error("output for `{key}` has an unexpected value")]
    Value {
        key: String,
        #[source]
        source: ValueError,
    },
    #[error(transparent)]
    Tree(#[from] TreeError),
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn names() {
        let name = encode_name("dependency.vpc.outputs.id");
        assert!(name.starts_with("tfstack_"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        assert_eq!(
            decode_name(&name).unwrap().unwrap(),
            "dependency.vpc.outputs.id"
        );

        assert!(decode_name("vpc_id").is_none());
        assert!(matches!(
            decode_name("tfstack_%%%"),
            Some(Err(OutputError::Name(_)))
        ));
    }

    #[test]
    fn folds_outputs() {
        let json = serde_json::json!({
            encode_name("dependency.vpc.outputs.id"): {
                "sensitive": false,
                "type": "string",
                "value": "vpc-123"
            },
            encode_name("dependency.vpc.outputs.subnets"): {
                "sensitive": false,
                "type": ["list", "string"],
                "value": ["a", "b"]
            },
            encode_name("data.azurerm_client_config.current.tenant_id"): {
                "sensitive": true,
                "type": "string",
                "value": "tenant"
            },
            "unrelated": {
                "sensitive": false,
                "type": "number",
                "value": 1
            }
        });

        let tree = parse_outputs(&json.to_string()).unwrap();
        let flat = tree.flatten();

        let mut keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "data.azurerm_client_config.current.tenant_id",
                "dependency.vpc.outputs.id",
                "dependency.vpc.outputs.subnets",
            ]
        );
        assert_eq!(
            flat["dependency.vpc.outputs.subnets"],
            Value::from(vec!["a", "b"])
        );
    }

    #[test]
    fn empty_output() {
        assert!(parse_outputs("").unwrap().is_empty());
        assert!(parse_outputs("{}").unwrap().is_empty());
    }

    #[test]
    fn type_mismatch() {
        let json = serde_json::json!({
            encode_name("dependency.a.outputs.x"): { "type": "bool", "value": "yes" }
        });
        assert!(matches!(
            parse_outputs(&json.to_string()),
            Err(OutputError::Value { .. })
        ));
    }
}
