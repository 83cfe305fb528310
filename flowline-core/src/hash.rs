//! Content hash of a node's resolved definition
//!
//! Two tasks with the same `run_hash` would produce the same outputs, so a
//! prior successful output can be reused instead of re-executing.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::domain::pipeline::NodeSpec;

/// Compute the `run_hash` of a node given the hashes of the nodes it reads from.
///
/// `upstream_hashes` must be keyed by node id; the input order of the node
/// does not matter.
pub fn run_hash<'a, I>(spec: &NodeSpec, upstream_hashes: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut inputs: Vec<Value> = spec
        .inputs
        .iter()
        .map(|input| json!([input.name, input.from_node, input.output]))
        .collect();
    inputs.sort_by_key(canonical_json);

    let mut upstream: Vec<(&str, &str)> = upstream_hashes.into_iter().collect();
    upstream.sort();
    upstream.dedup();

    let document = json!({
        "image": spec.image,
        "resources": spec.resources,
        "params": spec.params,
        "inputs": inputs,
        "upstream": upstream,
    });

    let digest = Sha256::digest(canonical_json(&document).as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Canonical JSON: sorted keys, no whitespace.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}
