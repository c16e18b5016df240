//! IAM customer managed policies.
use aws_sdk_iam::types::PolicyScopeType;
use snafu::prelude::*;

use super::{
    client, decode_document, encode_document, next_marker, validate_name, validate_path, NOT_FOUND,
};
use crate::{
    self as sky,
    aws::{
        error::{self, EmptyResultSnafu, MissingFieldSnafu, ValidationSnafu},
        find, AwsProvider, Error, Result, Tags,
    },
    HasDependencies,
};

/// IAM keeps at most this many versions of a policy.
const MAX_VERSIONS: usize = 5;

/// A stored version of a policy document.
#[derive(Clone, Debug, PartialEq)]
struct Version {
    id: String,
    is_default: bool,
    /// Seconds since the epoch.
    created: i64,
}

impl Version {
    fn from_sdk(version: &aws_sdk_iam::types::PolicyVersion) -> Option<Self> {
        Some(Version {
            id: version.version_id()?.to_owned(),
            is_default: version.is_default_version(),
            created: version.create_date().map(|date| date.secs()).unwrap_or_default(),
        })
    }
}

/// Picks the version to delete before a new one can be created, if the
/// policy is at its version limit.
fn version_to_prune(versions: &[Version]) -> Option<&str> {
    if versions.len() < MAX_VERSIONS {
        return None;
    }
    versions
        .iter()
        .filter(|version| !version.is_default)
        .min_by_key(|version| version.created)
        .map(|version| version.id.as_str())
}

/// AWS policy resource
#[derive(Debug, Clone, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Policy {
    pub name: String,
    pub path: Option<String>,
    pub description: Option<String>,
    pub document: serde_json::Value,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolicyOutput {
    pub arn: String,
    pub policy_id: String,
    pub default_version_id: String,
    /// The document of the default version.
    pub document: serde_json::Value,
    pub tags_all: Tags,
}

impl Policy {
    async fn versions(client: &aws_sdk_iam::Client, arn: &str) -> Result<Vec<Version>> {
        let versions = find::collect_pages(move |marker| {
            let request = client
                .list_policy_versions()
                .policy_arn(arn)
                .set_marker(marker);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(error::api_or_missing("ListPolicyVersions", NOT_FOUND))?;
                Ok((
                    output.versions().to_vec(),
                    next_marker(output.is_truncated(), output.marker()),
                ))
            }
        })
        .await?;
        Ok(versions.iter().filter_map(Version::from_sdk).collect())
    }

    async fn delete_version(client: &aws_sdk_iam::Client, arn: &str, version_id: &str) -> Result<()> {
        log::debug!("deleting version {version_id} of policy {arn}");
        let result = client
            .delete_policy_version()
            .policy_arn(arn)
            .version_id(version_id)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DeletePolicyVersion", NOT_FOUND));
        error::ignore_missing(result)
    }

    async fn read_arn(
        provider: &AwsProvider,
        client: &aws_sdk_iam::Client,
        arn: &str,
    ) -> Result<PolicyOutput> {
        let output = client
            .get_policy()
            .policy_arn(arn)
            .send()
            .await
            .map_err(error::api_or_missing("GetPolicy", NOT_FOUND))?;
        let policy = output.policy().context(EmptyResultSnafu {
            operation: "GetPolicy",
        })?;
        let default_version_id = policy.default_version_id().context(MissingFieldSnafu {
            operation: "GetPolicy",
            field: "DefaultVersionId",
        })?;
        let version = client
            .get_policy_version()
            .policy_arn(arn)
            .version_id(default_version_id)
            .send()
            .await
            .map_err(error::api_or_missing("GetPolicyVersion", NOT_FOUND))?;
        let document = version
            .policy_version()
            .and_then(|version| version.document())
            .context(MissingFieldSnafu {
                operation: "GetPolicyVersion",
                field: "PolicyVersion.Document",
            })?;
        Ok(PolicyOutput {
            arn: policy.arn().unwrap_or(arn).to_owned(),
            policy_id: policy.policy_id().unwrap_or_default().to_owned(),
            default_version_id: default_version_id.to_owned(),
            document: decode_document(document)?,
            tags_all: provider.observed_tags(Tags::from_iam(policy.tags())),
        })
    }

    /// Reads an existing customer managed policy by ARN.
    pub async fn import(provider: &AwsProvider, arn: &str) -> Result<(Self, PolicyOutput)> {
        let client = client(provider);
        let output = client
            .get_policy()
            .policy_arn(arn)
            .send()
            .await
            .map_err(error::api_or_missing("GetPolicy", NOT_FOUND))?;
        let policy = output.policy().context(EmptyResultSnafu {
            operation: "GetPolicy",
        })?;
        let remote = Self::read_arn(provider, &client, arn).await?;
        let local = Policy {
            name: policy.policy_name().unwrap_or_default().to_owned(),
            path: policy.path().filter(|path| *path != "/").map(str::to_owned),
            description: policy.description().map(str::to_owned),
            document: remote.document.clone(),
            tags: remote.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, remote))
    }
}

impl sky::Resource for Policy {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = PolicyOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = client(provider);
        let tags = provider.tags_all(&self.tags).to_iam()?;
        let output = client
            .create_policy()
            .policy_name(&self.name)
            .set_path(self.path.clone())
            .set_description(self.description.clone())
            .policy_document(encode_document(&self.document)?)
            .set_tags((!tags.is_empty()).then_some(tags))
            .send()
            .await
            .map_err(error::api("CreatePolicy"))?;
        let arn = output
            .policy()
            .and_then(|policy| policy.arn())
            .context(MissingFieldSnafu {
                operation: "CreatePolicy",
                field: "Policy.Arn",
            })?;
        log::info!("...created policy {}", self.name);
        Self::read_arn(provider, &client, arn).await
    }

    /// Finds the customer managed policy with this name and path.
    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let policies = find::collect_pages(move |marker| {
            let request = client
                .list_policies()
                .scope(PolicyScopeType::Local)
                .set_path_prefix(self.path.clone())
                .set_marker(marker);
            async move {
                let output = request.send().await.map_err(error::api("ListPolicies"))?;
                Ok((
                    output.policies().to_vec(),
                    next_marker(output.is_truncated(), output.marker()),
                ))
            }
        })
        .await?;
        let matching = policies
            .into_iter()
            .filter(|policy| policy.policy_name() == Some(self.name.as_str()))
            .collect();
        let policy = find::assert_single_value("ListPolicies", matching)?;
        let arn = policy.arn().context(MissingFieldSnafu {
            operation: "ListPolicies",
            field: "Arn",
        })?;
        Self::read_arn(provider, client, arn).await
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        Self::read_arn(provider, &client(provider), &previous_remote.arn).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = &client(provider);
        let arn = previous_remote.arn.as_str();

        if self.document != previous_remote.document {
            let versions = Self::versions(client, arn).await?;
            if let Some(oldest) = version_to_prune(&versions) {
                log::info!("policy {} is at {MAX_VERSIONS} versions, pruning {oldest}", self.name);
                Self::delete_version(client, arn, oldest).await?;
            }
            let out = client
                .create_policy_version()
                .policy_arn(arn)
                .policy_document(encode_document(&self.document)?)
                .set_as_default(true)
                .send()
                .await
                .map_err(error::api_or_missing("CreatePolicyVersion", NOT_FOUND))?;
            log::info!(
                "policy {} is now at version {}",
                self.name,
                out.policy_version()
                    .and_then(|version| version.version_id())
                    .unwrap_or("?")
            );
        }

        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            client
                .untag_policy()
                .policy_arn(arn)
                .set_tag_keys(Some(tags.to_remove.clone()))
                .send()
                .await
                .map_err(error::api("UntagPolicy"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .tag_policy()
                .policy_arn(arn)
                .set_tags(Some(tags.to_set.to_iam()?))
                .send()
                .await
                .map_err(error::api("TagPolicy"))?;
        }

        Self::read_arn(provider, client, arn).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        let client = &client(provider);
        let arn = previous_remote.arn.as_str();

        // Only a policy without non-default versions can be deleted.
        let versions = match Self::versions(client, arn).await {
            Err(e) if e.is_not_found() => return Ok(()),
            result => result?,
        };
        for version in versions.iter().filter(|version| !version.is_default) {
            Self::delete_version(client, arn, &version.id).await?;
        }

        log::info!("deleting policy {arn}");
        let result = client
            .delete_policy()
            .policy_arn(arn)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DeletePolicy", NOT_FOUND));
        error::ignore_missing(result)
    }

    fn validate(&self) -> Result<()> {
        validate_name("name", &self.name, 128)?;
        validate_path(self.path.as_deref())?;
        ensure!(
            self.document.is_object(),
            ValidationSnafu {
                field: "document",
                reason: "must be a JSON object",
            }
        );
        if let Some(description) = &self.description {
            ensure!(
                description.chars().count() <= 1000,
                ValidationSnafu {
                    field: "description",
                    reason: "must be at most 1000 characters",
                }
            );
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.name != previous.name
            || self.path != previous.path
            || self.description != previous.description
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}
