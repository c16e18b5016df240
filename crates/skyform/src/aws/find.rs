//! Finder helpers.
//!
//! AWS list and describe APIs return pages of items. Resources that look
//! up a single object through them drain every page and then insist on
//! exactly one match, so that "no such object" surfaces as a not-found
//! error the engine knows how to handle.
use std::{collections::BTreeMap, future::Future};

use snafu::prelude::*;

use super::{
    error::{EmptyResultSnafu, NotFoundSnafu, TooManyResultsSnafu},
    Result, Tags,
};
use crate::{self as sky, HasDependencies};

/// Drains a token-paginated API.
///
/// `fetch` is called with `None` first and then with each returned token
/// until the API stops returning one.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>)>>,
{
    let mut items = vec![];
    let mut token = None;
    let mut pages = 0usize;
    loop {
        let (page, next) = fetch(token).await?;
        pages += 1;
        items.extend(page);
        match next {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => break,
        }
    }
    log::trace!("collected {} items over {pages} pages", items.len());
    Ok(items)
}

/// Returns the only item of `items`.
///
/// ## Errors
/// No items is a not-found error; more than one is [`super::Error::TooManyResults`].
pub fn assert_single_value<T>(operation: &str, items: Vec<T>) -> Result<T> {
    let count = items.len();
    let mut items = items.into_iter();
    match (items.next(), count) {
        (Some(item), 1) => Ok(item),
        (None, _) => EmptyResultSnafu { operation }.fail(),
        _ => TooManyResultsSnafu { operation, count }.fail(),
    }
}

/// Fails with not-found when `state` is one of `deleted_states`.
///
/// Several EC2 objects linger in describe results for a while after they
/// are deleted.
pub fn ensure_not_deleted(what: &str, state: Option<&str>, deleted_states: &[&str]) -> Result<()> {
    if let Some(state) = state {
        ensure!(
            !deleted_states.contains(&state),
            NotFoundSnafu {
                what,
                message: format!("state is {state}"),
            }
        );
    }
    Ok(())
}

/// Fails with not-found when a lookup by id returned a different object.
///
/// Eventually consistent APIs may do that right after a create.
pub fn ensure_id_matches(what: &str, requested: &str, returned: Option<&str>) -> Result<()> {
    ensure!(
        returned == Some(requested),
        NotFoundSnafu {
            what,
            message: format!(
                "requested {requested}, got {}",
                returned.unwrap_or("nothing")
            ),
        }
    );
    Ok(())
}

/// A raw `{name, values}` EC2 filter.
#[derive(Clone, Debug, Default, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct CustomFilter {
    pub name: String,
    pub values: Vec<String>,
}

impl CustomFilter {
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        CustomFilter {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

fn ec2_filter(name: impl Into<String>, values: Vec<String>) -> aws_sdk_ec2::types::Filter {
    aws_sdk_ec2::types::Filter::builder()
        .name(name)
        .set_values(Some(values))
        .build()
}

/// One single-valued filter per attribute, skipping empty values.
pub fn attribute_filters(attributes: &BTreeMap<&str, String>) -> Vec<aws_sdk_ec2::types::Filter> {
    attributes
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| ec2_filter(*name, vec![value.clone()]))
        .collect()
}

/// One `tag:KEY` filter per tag.
pub fn tag_filters(tags: &Tags) -> Vec<aws_sdk_ec2::types::Filter> {
    tags.iter()
        .map(|(key, value)| ec2_filter(format!("tag:{key}"), vec![value.clone()]))
        .collect()
}

pub fn custom_filters(filters: &[CustomFilter]) -> Vec<aws_sdk_ec2::types::Filter> {
    filters
        .iter()
        .map(|f| ec2_filter(f.name.clone(), f.values.clone()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn collect_pages_follows_tokens() {
        let pages = vec![
            (vec![1, 2], Some("a".to_owned())),
            (vec![3], Some("b".to_owned())),
            (vec![], Some(String::new())),
        ];
        let mut seen_tokens = vec![];
        let items = collect_pages(|token| {
            seen_tokens.push(token);
            let page = pages[seen_tokens.len() - 1].clone();
            async move { Ok(page) }
        })
        .await
        .unwrap();
        assert_eq!(vec![1, 2, 3], items);
        assert_eq!(
            vec![None, Some("a".to_owned()), Some("b".to_owned())],
            seen_tokens
        );
    }

    #[tokio::test]
    async fn collect_pages_stops_on_error() {
        let result: Result<Vec<u8>> = collect_pages(|_| async {
            Err(crate::aws::Error::Timeout {
                what: "page".into(),
                timeout: std::time::Duration::from_secs(1),
            })
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn single_value_semantics() {
        assert_eq!(7, assert_single_value("Describe", vec![7]).unwrap());

        let none = assert_single_value::<u8>("Describe", vec![]).unwrap_err();
        assert!(none.is_not_found(), "{none}");

        let many = assert_single_value("Describe", vec![1, 2]).unwrap_err();
        assert!(!many.is_not_found());
        assert_eq!(
            "Describe returned 2 results, expected exactly one",
            many.to_string()
        );
    }

    #[test]
    fn deleted_state_and_id_mismatch_are_not_found() {
        assert!(ensure_not_deleted("gw", Some("available"), &["deleted"]).is_ok());
        assert!(ensure_not_deleted("gw", None, &["deleted"]).is_ok());
        assert!(ensure_not_deleted("gw", Some("deleted"), &["deleted"])
            .unwrap_err()
            .is_not_found());

        assert!(ensure_id_matches("gw", "cgw-1", Some("cgw-1")).is_ok());
        assert!(ensure_id_matches("gw", "cgw-1", Some("cgw-2"))
            .unwrap_err()
            .is_not_found());
        assert!(ensure_id_matches("gw", "cgw-1", None)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn filters() {
        let attributes = BTreeMap::from([
            ("resource-type", "vpn".to_owned()),
            ("transit-gateway-id", String::new()),
        ]);
        let filters = attribute_filters(&attributes);
        assert_eq!(1, filters.len());
        assert_eq!(Some("resource-type"), filters[0].name());
        assert_eq!(&["vpn".to_owned()], filters[0].values());

        let filters = tag_filters(&Tags::new().with("Name", "edge"));
        assert_eq!(Some("tag:Name"), filters[0].name());

        let filters = custom_filters(&[CustomFilter::new("state", ["available", "pending"])]);
        assert_eq!(2, filters[0].values().len());
    }
}
