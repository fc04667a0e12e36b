//! Secret value masking for diffs and error messages.

use kapply_core::Object;
use serde_json::Value as Json;

/// Token written over live secret values.
pub const EXISTING_MASK: &str = "*****";
/// Token written over desired secret values. Differs from [`EXISTING_MASK`]
/// so a rendered diff shows which side each masked line came from.
pub const DESIRED_MASK: &str = "******";

const SECRET_SECTIONS: [&str; 2] = ["data", "stringData"];

/// Copy of `object` with every `data`/`stringData` value replaced by `token`.
/// Non-secret objects are returned unchanged.
pub fn mask_secret(object: &Object, token: &str) -> Object {
    let mut out = object.clone();
    if !object.is_secret() {
        return out;
    }
    for section in SECRET_SECTIONS {
        if let Some(Json::Object(map)) = out.as_value_mut().get_mut(section) {
            for v in map.values_mut() {
                *v = Json::String(token.to_string());
            }
        }
    }
    out
}

/// `detail` with any secret value of `object` replaced by [`DESIRED_MASK`].
pub fn redact(detail: &str, object: &Object) -> String {
    if !object.is_secret() {
        return detail.to_string();
    }
    let mut values: Vec<String> = SECRET_SECTIONS
        .iter()
        .filter_map(|s| object.field(s).and_then(|v| v.as_object()))
        .flat_map(|m| m.values())
        .filter_map(|v| match v {
            Json::String(s) if !s.is_empty() => Some(s.clone()),
            Json::Null => None,
            other => Some(other.to_string()),
        })
        .collect();
    // longest first so a value that contains another is masked whole
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    values.into_iter().fold(detail.to_string(), |acc, v| acc.replace(&v, DESIRED_MASK))
}
