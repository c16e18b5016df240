//! IAM roles.
use std::{collections::BTreeSet, time::Duration};

use snafu::prelude::*;

use super::{
    client, decode_document, encode_document, next_marker, validate_name, validate_path, NOT_FOUND,
};
use crate::{
    self as sky,
    aws::{
        error::{self, EmptyResultSnafu, UnresolvedSnafu, ValidationSnafu},
        find,
        retry::{retry_when, RetryPolicy},
        AwsProvider, Error, Result, Tags,
    },
    HasDependencies, Remote,
};

const DEFAULT_MAX_SESSION_DURATION: i32 = 3600;

// A principal created moments ago may not be visible to IAM yet.
const PROPAGATION_TIMEOUT: RetryPolicy = RetryPolicy::new(Duration::from_secs(2 * 60));

fn is_invalid_principal(error: &Error) -> bool {
    matches!(
        error,
        Error::Api { code, message, .. }
            if code == "MalformedPolicyDocument" && message.contains("Invalid principal")
    )
}

/// The ARN of a managed policy to attach to a role.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub enum PolicyArn {
    /// A fixed ARN, eg an AWS managed policy.
    Arn(String),
    /// The ARN of a policy managed in this store.
    Managed(Remote<String>),
}

impl PolicyArn {
    /// An AWS managed policy, eg `service-role/AWSLambdaBasicExecutionRole`.
    pub fn aws(name: &str) -> Self {
        PolicyArn::Arn(format!("arn:aws:iam::aws:policy/{name}"))
    }

    fn resolve(&self) -> Result<String> {
        match self {
            PolicyArn::Arn(arn) => Ok(arn.clone()),
            PolicyArn::Managed(remote) => remote.get().map_err(Box::new).context(UnresolvedSnafu {
                what: "attached policy ARN",
            }),
        }
    }
}

impl From<Remote<String>> for PolicyArn {
    fn from(remote: Remote<String>) -> Self {
        PolicyArn::Managed(remote)
    }
}

/// AWS role resources.
#[derive(Debug, Clone, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Role {
    pub name: String,
    pub path: Option<String>,
    /// The trust policy.
    pub assume_role_policy: serde_json::Value,
    pub description: Option<String>,
    /// In seconds, 1 to 12 hours.
    pub max_session_duration: Option<i32>,
    pub attached_policy_arns: Vec<PolicyArn>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoleOutput {
    pub arn: String,
    pub unique_id: String,
    pub path: String,
    pub assume_role_policy: serde_json::Value,
    pub description: Option<String>,
    pub max_session_duration: i32,
    pub attached_policy_arns: BTreeSet<String>,
    pub tags_all: Tags,
}

/// Computes which policies to detach and which to attach.
fn attachment_changes<'a>(
    current: &'a BTreeSet<String>,
    desired: &'a BTreeSet<String>,
) -> (Vec<&'a String>, Vec<&'a String>) {
    (
        current.difference(desired).collect(),
        desired.difference(current).collect(),
    )
}

impl Role {
    fn desired_policy_arns(&self) -> Result<BTreeSet<String>> {
        self.attached_policy_arns.iter().map(PolicyArn::resolve).collect()
    }

    async fn attached(client: &aws_sdk_iam::Client, role_name: &str) -> Result<BTreeSet<String>> {
        let policies = find::collect_pages(move |marker| {
            let request = client
                .list_attached_role_policies()
                .role_name(role_name)
                .set_marker(marker);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(error::api_or_missing("ListAttachedRolePolicies", NOT_FOUND))?;
                Ok((
                    output.attached_policies().to_vec(),
                    next_marker(output.is_truncated(), output.marker()),
                ))
            }
        })
        .await?;
        Ok(policies
            .iter()
            .filter_map(|policy| policy.policy_arn().map(str::to_owned))
            .collect())
    }

    async fn read_name(
        provider: &AwsProvider,
        client: &aws_sdk_iam::Client,
        role_name: &str,
    ) -> Result<RoleOutput> {
        let output = client
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(error::api_or_missing("GetRole", NOT_FOUND))?;
        let role = output.role().context(EmptyResultSnafu {
            operation: "GetRole",
        })?;
        let assume_role_policy = match role.assume_role_policy_document() {
            Some(document) => decode_document(document)?,
            None => serde_json::Value::Null,
        };
        Ok(RoleOutput {
            arn: role.arn().to_owned(),
            unique_id: role.role_id().to_owned(),
            path: role.path().to_owned(),
            assume_role_policy,
            description: role.description().map(str::to_owned),
            max_session_duration: role
                .max_session_duration()
                .unwrap_or(DEFAULT_MAX_SESSION_DURATION),
            attached_policy_arns: Self::attached(client, role_name).await?,
            tags_all: provider.observed_tags(Tags::from_iam(role.tags())),
        })
    }

    async fn attach(client: &aws_sdk_iam::Client, role_name: &str, policy_arn: &str) -> Result<()> {
        log::info!("attaching policy {policy_arn} to role {role_name}");
        client
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(error::api("AttachRolePolicy"))?;
        Ok(())
    }

    async fn detach(client: &aws_sdk_iam::Client, role_name: &str, policy_arn: &str) -> Result<()> {
        log::info!("detaching policy {policy_arn} from role {role_name}");
        let result = client
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DetachRolePolicy", NOT_FOUND));
        error::ignore_missing(result)
    }

    /// Reads an existing role by name.
    ///
    /// Attached policies are returned as fixed ARNs. Replace them with
    /// [`PolicyArn::Managed`] values for policies managed in the same store.
    pub async fn import(provider: &AwsProvider, role_name: &str) -> Result<(Self, RoleOutput)> {
        let output = Self::read_name(provider, &client(provider), role_name).await?;
        let local = Role {
            name: role_name.to_owned(),
            path: Some(output.path.clone()).filter(|path| path != "/"),
            assume_role_policy: output.assume_role_policy.clone(),
            description: output.description.clone(),
            max_session_duration: Some(output.max_session_duration)
                .filter(|duration| *duration != DEFAULT_MAX_SESSION_DURATION),
            attached_policy_arns: output
                .attached_policy_arns
                .iter()
                .cloned()
                .map(PolicyArn::Arn)
                .collect(),
            tags: output.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, output))
    }
}

impl sky::Resource for Role {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = RoleOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let document = encode_document(&self.assume_role_policy)?;
        let tags = provider.tags_all(&self.tags).to_iam()?;
        retry_when(
            "IAM role creation",
            PROPAGATION_TIMEOUT,
            is_invalid_principal,
            move || {
                let request = client
                    .create_role()
                    .role_name(&self.name)
                    .set_path(self.path.clone())
                    .assume_role_policy_document(&document)
                    .set_description(self.description.clone())
                    .set_max_session_duration(self.max_session_duration)
                    .set_tags((!tags.is_empty()).then(|| tags.clone()));
                async move { request.send().await.map_err(error::api("CreateRole")) }
            },
        )
        .await?;
        log::info!("...created role {}", self.name);

        for policy_arn in self.desired_policy_arns()? {
            Self::attach(client, &self.name, &policy_arn).await?;
        }
        Self::read_name(provider, client, &self.name).await
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        Self::read_name(provider, &client(provider), &self.name).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = &client(provider);
        let name = self.name.as_str();

        if self.assume_role_policy != previous_remote.assume_role_policy {
            log::info!("updating trust policy of role {name}");
            let document = encode_document(&self.assume_role_policy)?;
            retry_when(
                "IAM role trust policy update",
                PROPAGATION_TIMEOUT,
                is_invalid_principal,
                move || {
                    let request = client
                        .update_assume_role_policy()
                        .role_name(name)
                        .policy_document(&document);
                    async move {
                        request
                            .send()
                            .await
                            .map_err(error::api("UpdateAssumeRolePolicy"))
                    }
                },
            )
            .await?;
        }

        let max_session_duration = self
            .max_session_duration
            .unwrap_or(DEFAULT_MAX_SESSION_DURATION);
        if self.description != previous_remote.description
            || max_session_duration != previous_remote.max_session_duration
        {
            client
                .update_role()
                .role_name(name)
                .description(self.description.clone().unwrap_or_default())
                .max_session_duration(max_session_duration)
                .send()
                .await
                .map_err(error::api("UpdateRole"))?;
        }

        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            client
                .untag_role()
                .role_name(name)
                .set_tag_keys(Some(tags.to_remove.clone()))
                .send()
                .await
                .map_err(error::api("UntagRole"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .tag_role()
                .role_name(name)
                .set_tags(Some(tags.to_set.to_iam()?))
                .send()
                .await
                .map_err(error::api("TagRole"))?;
        }

        let desired = self.desired_policy_arns()?;
        let (to_detach, to_attach) =
            attachment_changes(&previous_remote.attached_policy_arns, &desired);
        for policy_arn in to_detach {
            Self::detach(client, name, policy_arn).await?;
        }
        for policy_arn in to_attach {
            Self::attach(client, name, policy_arn).await?;
        }

        Self::read_name(provider, client, name).await
    }

    async fn delete(&self, provider: &Self::Provider, _previous_remote: &Self::Output) -> Result<()> {
        let client = &client(provider);
        let name = self.name.as_str();

        // A role can't be deleted while policies are attached to it.
        let attached = match Self::attached(client, name).await {
            Err(e) if e.is_not_found() => return Ok(()),
            result => result?,
        };
        for policy_arn in &attached {
            Self::detach(client, name, policy_arn).await?;
        }
        let inline = find::collect_pages(move |marker| {
            let request = client.list_role_policies().role_name(name).set_marker(marker);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(error::api_or_missing("ListRolePolicies", NOT_FOUND))?;
                Ok((
                    output.policy_names().to_vec(),
                    next_marker(output.is_truncated(), output.marker()),
                ))
            }
        })
        .await?;
        for policy_name in inline {
            log::info!("deleting inline policy {policy_name} of role {name}");
            let result = client
                .delete_role_policy()
                .role_name(name)
                .policy_name(&policy_name)
                .send()
                .await
                .map(|_| ())
                .map_err(error::api_or_missing("DeleteRolePolicy", NOT_FOUND));
            error::ignore_missing(result)?;
        }

        log::info!("deleting role {name}");
        let result = client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DeleteRole", NOT_FOUND));
        error::ignore_missing(result)
    }

    fn validate(&self) -> Result<()> {
        validate_name("name", &self.name, 64)?;
        validate_path(self.path.as_deref())?;
        ensure!(
            self.assume_role_policy.is_object(),
            ValidationSnafu {
                field: "assume_role_policy",
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
        if let Some(duration) = self.max_session_duration {
            ensure!(
                (3600..=43200).contains(&duration),
                ValidationSnafu {
                    field: "max_session_duration",
                    reason: format!("{duration} is not between 3600 and 43200 seconds"),
                }
            );
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.name != previous.name || self.path != previous.path
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{aws::error::test::FakeSdkError, Resource};
    use pretty_assertions::assert_eq;

    fn role() -> Role {
        Role {
            name: "lambda-exec".into(),
            path: None,
            assume_role_policy: serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": {"Service": "lambda.amazonaws.com"},
                    "Action": "sts:AssumeRole"
                }]
            }),
            description: None,
            max_session_duration: None,
            attached_policy_arns: vec![PolicyArn::aws("service-role/AWSLambdaBasicExecutionRole")],
            tags: Tags::new(),
        }
    }

    #[test]
    fn attachments_are_diffed() {
        let current: BTreeSet<String> = ["a", "b"].into_iter().map(String::from).collect();
        let desired: BTreeSet<String> = ["b", "c"].into_iter().map(String::from).collect();
        let (detach, attach) = attachment_changes(&current, &desired);
        assert_eq!(vec!["a"], detach);
        assert_eq!(vec!["c"], attach);
    }

    #[test]
    fn fixed_policy_arns_resolve() {
        assert_eq!(
            BTreeSet::from([
                "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole".to_owned()
            ]),
            role().desired_policy_arns().unwrap()
        );
    }

    #[test]
    fn propagation_errors_are_retried() {
        let invalid_principal = error::classify(
            "CreateRole",
            &[],
            FakeSdkError::new("MalformedPolicyDocument", "Invalid principal in policy"),
        );
        assert!(is_invalid_principal(&invalid_principal));
        let malformed = error::classify(
            "CreateRole",
            &[],
            FakeSdkError::new("MalformedPolicyDocument", "Syntax errors in policy"),
        );
        assert!(!is_invalid_principal(&malformed));
    }

    #[test]
    fn validation() {
        assert!(role().validate().is_ok());

        let mut bad = role();
        bad.max_session_duration = Some(60);
        assert!(bad.validate().is_err());

        let mut bad = role();
        bad.assume_role_policy = serde_json::json!("allow everything");
        assert!(bad.validate().is_err());

        let mut bad = role();
        bad.path = Some("no-slashes".into());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn name_and_path_force_replacement() {
        let mut renamed = role();
        renamed.name = "lambda-exec-2".into();
        assert!(renamed.requires_replacement(&role()));

        let mut described = role();
        described.description = Some("runs lambdas".into());
        assert!(!described.requires_replacement(&role()));
    }
}
