//! Errors raised by AWS resources.
//!
//! Every failure is one of three kinds as far as the engine is concerned:
//! the remote object is missing ([`Error::is_not_found`]), it changed under
//! us ([`Error::is_conflict`]), or something else went wrong.
use std::time::Duration;

use aws_smithy_types::error::{display::DisplayErrorContext, metadata::ProvideErrorMetadata};
use snafu::prelude::*;

/// Boxed error from an AWS SDK call.
pub type SdkSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{what} not found: {message}"))]
    NotFound { what: String, message: String },

    #[snafu(display("{operation} returned an empty result"))]
    EmptyResult { operation: String },

    #[snafu(display("{operation} returned {count} results, expected exactly one"))]
    TooManyResults { operation: String, count: usize },

    #[snafu(display("{what} has changed since last refresh: {message}"))]
    Conflict { what: String, message: String },

    #[snafu(display("{operation} failed with {code}: {message}"))]
    Api {
        operation: &'static str,
        code: String,
        message: String,
        source: SdkSource,
    },

    #[snafu(display("{operation} response is missing '{field}'"))]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    #[snafu(display("timed out after {timeout:?} waiting for {what}"))]
    Timeout { what: String, timeout: Duration },

    #[snafu(display("{what} is {status}: {message}"))]
    Failed {
        what: String,
        status: String,
        message: String,
    },

    #[snafu(display("invalid id '{id}': expected {expected}"))]
    InvalidId { id: String, expected: &'static str },

    #[snafu(display("invalid {field}: {reason}"))]
    Validation { field: &'static str, reason: String },

    #[snafu(display("could not resolve {what}: {source}"))]
    Unresolved {
        what: &'static str,
        source: Box<crate::Error>,
    },

    #[snafu(display("could not convert {what} to or from JSON: {source}"))]
    Json {
        what: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("could not read provider config {path:?}: {source}"))]
    ConfigRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not parse provider config: {source}"))]
    ConfigParse { source: toml::de::Error },
}

impl Error {
    /// Whether the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::EmptyResult { .. })
    }

    /// Whether the remote object was modified concurrently.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// The AWS error code of a failed API call.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether this is a failed API call with one of the given codes.
    pub fn has_code(&self, codes: &[&str]) -> bool {
        self.code().is_some_and(|code| codes.contains(&code))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classifies an SDK error raised by `operation`.
///
/// Error codes in `not_found_codes` become [`Error::NotFound`], everything
/// else is surfaced as [`Error::Api`].
pub(crate) fn classify<E>(operation: &'static str, not_found_codes: &[&str], error: E) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = error.code().unwrap_or("Unknown").to_owned();
    let message = error
        .message()
        .map(str::to_owned)
        .unwrap_or_else(|| DisplayErrorContext(&error).to_string());
    if not_found_codes.contains(&code.as_str()) {
        log::debug!("{operation}: {code} classified as not found");
        return Error::NotFound {
            what: operation.to_owned(),
            message,
        };
    }
    Error::Api {
        operation,
        code,
        message,
        source: Box::new(error),
    }
}

/// Returns a closure for `map_err` that classifies errors from `operation`.
pub(crate) fn api<E>(operation: &'static str) -> impl FnOnce(E) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    move |error| classify(operation, &[], error)
}

/// Like [`api`], with codes that mean the remote object is gone.
pub(crate) fn api_or_missing<E>(
    operation: &'static str,
    not_found_codes: &'static [&'static str],
) -> impl FnOnce(E) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    move |error| classify(operation, not_found_codes, error)
}

/// Treats a not-found error as success, for deletes.
pub(crate) fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            log::debug!("ignoring: {e}");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use aws_smithy_types::error::ErrorMetadata;

    /// An SDK-shaped error for exercising classification without AWS.
    #[derive(Debug)]
    pub struct FakeSdkError(pub ErrorMetadata);

    impl FakeSdkError {
        pub fn new(code: &str, message: &str) -> Self {
            FakeSdkError(ErrorMetadata::builder().code(code).message(message).build())
        }
    }

    impl std::fmt::Display for FakeSdkError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "service error")
        }
    }

    impl std::error::Error for FakeSdkError {}

    impl ProvideErrorMetadata for FakeSdkError {
        fn meta(&self) -> &ErrorMetadata {
            &self.0
        }
    }

    /// An [`Error::Api`] with the given code.
    pub fn api_error(operation: &'static str, code: &str) -> Error {
        classify(operation, &[], FakeSdkError::new(code, "test"))
    }

    #[test]
    fn not_found_codes_classify_as_not_found() {
        let error = classify(
            "GetWebACL",
            &["WAFNonexistentItemException"],
            FakeSdkError::new("WAFNonexistentItemException", "gone"),
        );
        assert!(error.is_not_found());
        assert!(!error.is_conflict());
        assert_eq!("GetWebACL not found: gone", error.to_string());
    }

    #[test]
    fn other_codes_are_surfaced_verbatim() {
        let error = api_error("UpdateWebACL", "AccessDeniedException");
        assert!(!error.is_not_found());
        assert_eq!(Some("AccessDeniedException"), error.code());
        assert!(error.has_code(&["ThrottlingException", "AccessDeniedException"]));
        assert_eq!(
            "UpdateWebACL failed with AccessDeniedException: test",
            error.to_string()
        );
    }

    #[test]
    fn deletes_ignore_missing_objects() {
        assert!(ignore_missing(EmptyResultSnafu { operation: "x" }.fail()).is_ok());
        assert!(ignore_missing(Err(api_error("DeleteRole", "Throttling"))).is_err());
    }
}
