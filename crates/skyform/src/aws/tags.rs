//! Resource tags.
//!
//! Resources carry the tags declared on them; the tags actually applied on
//! AWS are those overlaid on the provider's default tags. Observed tags are
//! filtered of AWS-reserved keys and of any keys the provider is configured
//! to ignore before they are compared or stored.
use std::collections::{BTreeMap, BTreeSet};

use crate::HasDependencies;

/// Tag keys with this prefix are reserved by AWS and can't be managed.
pub const AWS_RESERVED_PREFIX: &str = "aws:";

/// An ordered set of tags.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

impl HasDependencies for Tags {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Tags(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns these tags overlaid on `defaults`.
    ///
    /// On key collision the value in `self` wins.
    pub fn merge_defaults(&self, defaults: &Tags) -> Tags {
        let mut merged = defaults.0.clone();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Tags(merged)
    }

    /// Returns these tags without the ones identical to a default tag.
    pub fn remove_defaults(&self, defaults: &Tags) -> Tags {
        Tags(
            self.0
                .iter()
                .filter(|(k, v)| defaults.get(k) != Some(v.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Returns these tags without AWS-reserved and ignored keys.
    pub fn ignore(&self, ignore: &IgnoreTags) -> Tags {
        Tags(
            self.0
                .iter()
                .filter(|(k, _)| !k.starts_with(AWS_RESERVED_PREFIX) && !ignore.matches(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Computes the calls needed to turn `self` into `desired`.
    pub fn diff(&self, desired: &Tags) -> TagsDiff {
        let to_set = desired
            .0
            .iter()
            .filter(|(k, v)| self.get(k) != Some(v.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let to_remove = self
            .0
            .keys()
            .filter(|k| !desired.0.contains_key(*k))
            .cloned()
            .collect();
        TagsDiff { to_set, to_remove }
    }
}

/// The result of [`Tags::diff`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagsDiff {
    /// Tags that are new or whose value changed.
    pub to_set: Tags,
    /// Keys that are no longer wanted.
    pub to_remove: Vec<String>,
}

impl TagsDiff {
    pub fn is_empty(&self) -> bool {
        self.to_set.is_empty() && self.to_remove.is_empty()
    }
}

/// Tag keys the provider never manages, eg keys set by an external
/// cost-allocation tool.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IgnoreTags {
    pub keys: BTreeSet<String>,
    pub key_prefixes: Vec<String>,
}

impl IgnoreTags {
    pub fn matches(&self, key: &str) -> bool {
        self.keys.contains(key) || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

/// Conversions between [`Tags`] and each service's SDK tag type.
macro_rules! sdk_tags {
    ($fn_from:ident, $fn_into:ident, $ty:ty) => {
        impl Tags {
            #[allow(dead_code)]
            pub(crate) fn $fn_from<'a>(tags: impl IntoIterator<Item = &'a $ty>) -> Tags {
                tags.into_iter()
                    .map(|tag| (tag.key().to_owned(), tag.value().to_owned()))
                    .collect()
            }
        }

        impl Tags {
            #[allow(dead_code)]
            pub(crate) fn $fn_into(&self) -> crate::aws::Result<Vec<$ty>> {
                self.iter()
                    .map(|(k, v)| {
                        <$ty>::builder()
                            .key(k)
                            .value(v)
                            .build()
                            .map_err(|e| crate::aws::Error::Validation {
                                field: "tags",
                                reason: e.to_string(),
                            })
                    })
                    .collect()
            }
        }
    };
}

sdk_tags!(from_iam, to_iam, aws_sdk_iam::types::Tag);
sdk_tags!(from_wafv2, to_wafv2, aws_sdk_wafv2::types::Tag);
sdk_tags!(from_transfer, to_transfer, aws_sdk_transfer::types::Tag);

impl Tags {
    pub(crate) fn from_acm<'a>(tags: impl IntoIterator<Item = &'a aws_sdk_acm::types::Tag>) -> Tags {
        tags.into_iter()
            .map(|tag| (tag.key().to_owned(), tag.value().unwrap_or_default().to_owned()))
            .collect()
    }

    pub(crate) fn to_acm(&self) -> crate::aws::Result<Vec<aws_sdk_acm::types::Tag>> {
        self.iter()
            .map(|(k, v)| {
                aws_sdk_acm::types::Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| crate::aws::Error::Validation {
                        field: "tags",
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    pub(crate) fn from_ec2<'a>(tags: impl IntoIterator<Item = &'a aws_sdk_ec2::types::Tag>) -> Tags {
        tags.into_iter()
            .filter_map(|tag| Some((tag.key()?.to_owned(), tag.value().unwrap_or_default().to_owned())))
            .collect()
    }

    pub(crate) fn to_ec2(&self) -> Vec<aws_sdk_ec2::types::Tag> {
        self.iter()
            .map(|(k, v)| aws_sdk_ec2::types::Tag::builder().key(k).value(v).build())
            .collect()
    }

    pub(crate) fn from_dms<'a>(
        tags: impl IntoIterator<Item = &'a aws_sdk_databasemigration::types::Tag>,
    ) -> Tags {
        tags.into_iter()
            .filter_map(|tag| Some((tag.key()?.to_owned(), tag.value().unwrap_or_default().to_owned())))
            .collect()
    }

    pub(crate) fn from_map(map: &std::collections::HashMap<String, String>) -> Tags {
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub(crate) fn to_map(&self) -> std::collections::HashMap<String, String> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
