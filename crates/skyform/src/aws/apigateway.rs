//! API Gateway (REST API) VPC links.
use std::time::Duration;

use aws_sdk_apigateway::types::{Op, PatchOperation, VpcLinkStatus};
use snafu::prelude::*;

use super::{
    error::{self, FailedSnafu, MissingFieldSnafu, ValidationSnafu},
    find,
    retry::{wait_until, RetryPolicy, Status},
    AwsProvider, Error, Result, Tags,
};
use crate::{self as sky, HasDependencies};

const NOT_FOUND: &[&str] = &["NotFoundException"];

// Provisioning the network load balancer endpoint takes a few minutes.
const AVAILABLE_TIMEOUT: RetryPolicy = RetryPolicy::new(Duration::from_secs(20 * 60))
    .with_delays(Duration::from_secs(5), Duration::from_secs(30));
const DELETED_TIMEOUT: RetryPolicy = RetryPolicy::new(Duration::from_secs(20 * 60))
    .with_delays(Duration::from_secs(5), Duration::from_secs(30));

fn partition(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

/// The ARN API Gateway tags a VPC link by.
fn vpc_link_arn(region: &str, id: &str) -> String {
    format!(
        "arn:{}:apigateway:{region}::/vpclinks/{id}",
        partition(region)
    )
}

fn replace(path: &str, value: Option<&str>) -> PatchOperation {
    PatchOperation::builder()
        .op(Op::Replace)
        .path(path)
        .set_value(value.map(str::to_owned))
        .build()
}

/// A VPC link that lets REST APIs reach private network load balancers.
#[derive(Debug, Clone, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct VpcLink {
    pub name: String,
    pub description: Option<String>,
    /// Network load balancer ARNs. Exactly one is supported by AWS.
    pub target_arns: Vec<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VpcLinkOutput {
    pub id: String,
    pub arn: String,
    pub name: String,
    pub description: Option<String>,
    pub target_arns: Vec<String>,
    pub tags_all: Tags,
}

impl VpcLink {
    fn client(provider: &AwsProvider) -> aws_sdk_apigateway::Client {
        aws_sdk_apigateway::Client::new(provider.sdk())
    }

    /// The patch operations that bring `observed` in line with `self`.
    fn patch_operations(&self, observed: &VpcLinkOutput) -> Vec<PatchOperation> {
        let mut operations = vec![];
        if self.name != observed.name {
            operations.push(replace("/name", Some(&self.name)));
        }
        if self.description != observed.description {
            operations.push(replace("/description", self.description.as_deref()));
        }
        operations
    }

    async fn get(
        client: &aws_sdk_apigateway::Client,
        id: &str,
    ) -> Result<aws_sdk_apigateway::operation::get_vpc_link::GetVpcLinkOutput> {
        client
            .get_vpc_link()
            .vpc_link_id(id)
            .send()
            .await
            .map_err(error::api_or_missing("GetVpcLink", NOT_FOUND))
    }

    async fn read_id(
        provider: &AwsProvider,
        client: &aws_sdk_apigateway::Client,
        id: &str,
    ) -> Result<VpcLinkOutput> {
        let output = Self::get(client, id).await?;
        let region = provider.sdk().region().map(|r| r.as_ref()).unwrap_or("us-east-1");
        Ok(VpcLinkOutput {
            id: output.id().unwrap_or(id).to_owned(),
            arn: vpc_link_arn(region, id),
            name: output.name().unwrap_or_default().to_owned(),
            description: output.description().map(str::to_owned),
            target_arns: output.target_arns().to_vec(),
            tags_all: provider
                .observed_tags(output.tags().map(Tags::from_map).unwrap_or_default()),
        })
    }

    async fn wait_available(client: &aws_sdk_apigateway::Client, id: &str) -> Result<()> {
        wait_until("API Gateway VPC link", AVAILABLE_TIMEOUT, || async move {
            let output = Self::get(client, id).await?;
            match output.status() {
                Some(VpcLinkStatus::Available) => Ok(Status::Ready(())),
                Some(VpcLinkStatus::Failed) => FailedSnafu {
                    what: format!("API Gateway VPC link {id}"),
                    status: "FAILED",
                    message: output.status_message().unwrap_or_default(),
                }
                .fail(),
                status => Ok(Status::Pending(
                    status.map(|s| s.as_str()).unwrap_or("unknown").to_owned(),
                )),
            }
        })
        .await
    }

    async fn wait_deleted(client: &aws_sdk_apigateway::Client, id: &str) -> Result<()> {
        wait_until("API Gateway VPC link deletion", DELETED_TIMEOUT, || async move {
            match Self::get(client, id).await {
                Err(e) if e.is_not_found() => Ok(Status::Ready(())),
                Err(e) => Err(e),
                Ok(output) => Ok(Status::Pending(
                    output
                        .status()
                        .map(|s| s.as_str())
                        .unwrap_or("unknown")
                        .to_owned(),
                )),
            }
        })
        .await
    }

    /// Reads an existing VPC link by id.
    pub async fn import(provider: &AwsProvider, id: &str) -> Result<(Self, VpcLinkOutput)> {
        let output = Self::read_id(provider, &Self::client(provider), id).await?;
        let local = VpcLink {
            name: output.name.clone(),
            description: output.description.clone(),
            target_arns: output.target_arns.clone(),
            tags: output.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, output))
    }
}

impl sky::Resource for VpcLink {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = VpcLinkOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = Self::client(provider);
        let tags = provider.tags_all(&self.tags);
        let output = client
            .create_vpc_link()
            .name(&self.name)
            .set_description(self.description.clone())
            .set_target_arns(Some(self.target_arns.clone()))
            .set_tags((!tags.is_empty()).then(|| tags.to_map()))
            .send()
            .await
            .map_err(error::api("CreateVpcLink"))?;
        let id = output.id().context(MissingFieldSnafu {
            operation: "CreateVpcLink",
            field: "Id",
        })?;
        log::info!("created API Gateway VPC link {id}, waiting for it to become available");
        Self::wait_available(&client, id).await?;
        Self::read_id(provider, &client, id).await
    }

    /// Finds the VPC link with this name.
    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &Self::client(provider);
        let links = find::collect_pages(move |position| {
            let request = client.get_vpc_links().limit(500).set_position(position);
            async move {
                let output = request.send().await.map_err(error::api("GetVpcLinks"))?;
                Ok((output.items().to_vec(), output.position().map(str::to_owned)))
            }
        })
        .await?;
        let matching = links
            .into_iter()
            .filter(|link| link.name() == Some(self.name.as_str()))
            .collect();
        let link = find::assert_single_value("GetVpcLinks", matching)?;
        let id = link.id().context(MissingFieldSnafu {
            operation: "GetVpcLinks",
            field: "Id",
        })?;
        Self::read_id(provider, client, id).await
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        Self::read_id(provider, &Self::client(provider), &previous_remote.id).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = Self::client(provider);
        let id = previous_remote.id.as_str();

        let operations = self.patch_operations(previous_remote);
        if !operations.is_empty() {
            client
                .update_vpc_link()
                .vpc_link_id(id)
                .set_patch_operations(Some(operations))
                .send()
                .await
                .map_err(error::api_or_missing("UpdateVpcLink", NOT_FOUND))?;
            Self::wait_available(&client, id).await?;
        }

        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            client
                .untag_resource()
                .resource_arn(&previous_remote.arn)
                .set_tag_keys(Some(tags.to_remove.clone()))
                .send()
                .await
                .map_err(error::api("UntagResource"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .tag_resource()
                .resource_arn(&previous_remote.arn)
                .set_tags(Some(tags.to_set.to_map()))
                .send()
                .await
                .map_err(error::api("TagResource"))?;
        }

        Self::read_id(provider, &client, id).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        let client = Self::client(provider);
        let id = previous_remote.id.as_str();
        log::info!("deleting API Gateway VPC link {id}");
        let result = client
            .delete_vpc_link()
            .vpc_link_id(id)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DeleteVpcLink", NOT_FOUND));
        error::ignore_missing(result)?;
        Self::wait_deleted(&client, id).await
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.name.is_empty(),
            ValidationSnafu {
                field: "name",
                reason: "must not be empty",
            }
        );
        ensure!(
            self.target_arns.len() == 1,
            ValidationSnafu {
                field: "target_arns",
                reason: format!("expected exactly one target, got {}", self.target_arns.len()),
            }
        );
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.target_arns != previous.target_arns
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}
