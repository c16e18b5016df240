//! IAM infrastructure.
use std::sync::OnceLock;

use snafu::prelude::*;

use super::{
    error::{JsonSnafu, ValidationSnafu},
    AwsProvider, Result,
};

mod policy;
mod role;

pub use policy::{Policy, PolicyOutput};
pub use role::{PolicyArn, Role, RoleOutput};

const NOT_FOUND: &[&str] = &["NoSuchEntity"];

fn client(provider: &AwsProvider) -> aws_sdk_iam::Client {
    aws_sdk_iam::Client::new(provider.sdk())
}

/// IAM returns policy documents URL-encoded.
fn decode_document(encoded: &str) -> Result<serde_json::Value> {
    let decoded = urlencoding::decode(encoded).map_err(|e| {
        ValidationSnafu {
            field: "policy_document",
            reason: e.to_string(),
        }
        .build()
    })?;
    serde_json::from_str(&decoded).context(JsonSnafu {
        what: "policy document",
    })
}

fn encode_document(document: &serde_json::Value) -> Result<String> {
    serde_json::to_string(document).context(JsonSnafu {
        what: "policy document",
    })
}

/// The marker for the next page of an IAM list API.
fn next_marker(is_truncated: bool, marker: Option<&str>) -> Option<String> {
    if is_truncated {
        marker.map(str::to_owned)
    } else {
        None
    }
}

fn name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // UNWRAP: safe because this is a valid, constant regular expression
        regex::Regex::new(r"^[\w+=,.@-]+$").unwrap()
    })
}

fn validate_name(field: &'static str, name: &str, max: usize) -> Result<()> {
    ensure!(
        (1..=max).contains(&name.len()) && name_pattern().is_match(name),
        ValidationSnafu {
            field,
            reason: format!("'{name}' must be 1-{max} characters of alphanumerics and +=,.@_-"),
        }
    );
    Ok(())
}

fn validate_path(path: Option<&str>) -> Result<()> {
    if let Some(path) = path {
        ensure!(
            path.len() <= 512 && path.starts_with('/') && path.ends_with('/'),
            ValidationSnafu {
                field: "path",
                reason: format!("'{path}' must begin and end with '/'"),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn documents_are_url_decoded() {
        let encoded = "%7B%22Version%22%3A%222012-10-17%22%2C%22Statement%22%3A%5B%5D%7D";
        assert_eq!(
            serde_json::json!({"Version": "2012-10-17", "Statement": []}),
            decode_document(encoded).unwrap()
        );
        assert!(decode_document("%7Bnot json").is_err());
    }

    #[test]
    fn markers_only_follow_truncated_pages() {
        assert_eq!(Some("m".to_owned()), next_marker(true, Some("m")));
        assert_eq!(None, next_marker(false, Some("m")));
        assert_eq!(None, next_marker(true, None));
    }

    #[test]
    fn names_and_paths() {
        assert!(validate_name("name", "lambda-exec+role@svc", 64).is_ok());
        assert!(validate_name("name", "has space", 64).is_err());
        assert!(validate_name("name", &"r".repeat(65), 64).is_err());
        assert!(validate_path(Some("/service-role/")).is_ok());
        assert!(validate_path(Some("service-role")).is_err());
        assert!(validate_path(None).is_ok());
    }
}
