//! AWS certificate manager infrastructure.
use std::{collections::HashSet, time::Duration};

use aws_sdk_acm::types::CertificateDetail;
use snafu::prelude::*;

use super::{
    error::{self, EmptyResultSnafu, MissingFieldSnafu, ValidationSnafu},
    find,
    retry::{retry_when, wait_until, RetryPolicy, Status},
    AwsProvider, Error, Result, Tags,
};
use crate::{self as sky, HasDependencies};

const NOT_FOUND: &[&str] = &["ResourceNotFoundException"];
const IN_USE: &[&str] = &["ResourceInUseException"];

const VALIDATION_RECORDS_TIMEOUT: RetryPolicy = RetryPolicy::new(Duration::from_secs(5 * 60))
    .with_delays(Duration::from_secs(2), Duration::from_secs(10));
// Deleting fails while a load balancer or distribution still uses the
// certificate, which can take a while to detach.
const DELETE_TIMEOUT: RetryPolicy = RetryPolicy::new(Duration::from_secs(10 * 60));

#[derive(Debug, Default, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ValidationMethod {
    #[default]
    Dns,
    Email,
}

impl HasDependencies for ValidationMethod {}

impl From<ValidationMethod> for aws_sdk_acm::types::ValidationMethod {
    fn from(value: ValidationMethod) -> Self {
        match value {
            ValidationMethod::Dns => aws_sdk_acm::types::ValidationMethod::Dns,
            ValidationMethod::Email => aws_sdk_acm::types::ValidationMethod::Email,
        }
    }
}

impl TryFrom<&aws_sdk_acm::types::ValidationMethod> for ValidationMethod {
    type Error = Error;

    fn try_from(value: &aws_sdk_acm::types::ValidationMethod) -> Result<Self, Self::Error> {
        match value {
            aws_sdk_acm::types::ValidationMethod::Dns => Ok(ValidationMethod::Dns),
            aws_sdk_acm::types::ValidationMethod::Email => Ok(ValidationMethod::Email),
            m => ValidationSnafu {
                field: "validation_method",
                reason: format!("unsupported validation method {}", m.as_str()),
            }
            .fail(),
        }
    }
}

/// A DNS record that proves control of a domain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationRecord {
    pub name: String,
    pub record_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidationOption {
    pub domain_name: String,
    pub validation_domain: Option<String>,
    pub validation_status: Option<String>,
    pub resource_record: Option<ValidationRecord>,
}

impl ValidationOption {
    fn from_sdk(option: &aws_sdk_acm::types::DomainValidation) -> Self {
        ValidationOption {
            domain_name: option.domain_name().to_owned(),
            validation_domain: option.validation_domain().map(str::to_owned),
            validation_status: option.validation_status().map(|s| s.as_str().to_owned()),
            resource_record: option.resource_record().map(|r| ValidationRecord {
                name: r.name().to_owned(),
                record_type: r.r#type().as_str().to_owned(),
                value: r.value().to_owned(),
            }),
        }
    }
}

/// AWS certificate.
#[derive(Debug, Default, Clone, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Certificate {
    // Fully qualified domain name.
    //
    // May contain wildcards like "*.example.com".
    pub domain_name: String,
    pub validation_method: ValidationMethod,
    pub subject_alternative_names: Vec<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CertificateOutput {
    pub arn: String,
    pub status: Option<String>,
    pub domain_validation_options: Vec<ValidationOption>,
    pub tags_all: Tags,
}

impl CertificateOutput {
    /// The records to create to validate the certificate, one per record
    /// name.
    ///
    /// A wildcard and its apex domain share a record, so there can be
    /// fewer records than domains.
    pub fn validation_records(&self) -> Vec<&ValidationRecord> {
        let mut seen = HashSet::new();
        self.domain_validation_options
            .iter()
            .filter_map(|option| option.resource_record.as_ref())
            .filter(|record| seen.insert(record.name.as_str()))
            .collect()
    }
}

impl Certificate {
    fn client(provider: &AwsProvider) -> aws_sdk_acm::Client {
        aws_sdk_acm::Client::new(provider.sdk())
    }

    async fn describe(client: &aws_sdk_acm::Client, arn: &str) -> Result<CertificateDetail> {
        let output = client
            .describe_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(error::api_or_missing("DescribeCertificate", NOT_FOUND))?;
        output.certificate().cloned().context(EmptyResultSnafu {
            operation: "DescribeCertificate",
        })
    }

    async fn read_arn(
        provider: &AwsProvider,
        client: &aws_sdk_acm::Client,
        arn: &str,
    ) -> Result<CertificateOutput> {
        let detail = Self::describe(client, arn).await?;
        let tags = client
            .list_tags_for_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(error::api_or_missing("ListTagsForCertificate", NOT_FOUND))?;
        Ok(CertificateOutput {
            arn: detail.certificate_arn().unwrap_or(arn).to_owned(),
            status: detail.status().map(|s| s.as_str().to_owned()),
            domain_validation_options: detail
                .domain_validation_options()
                .iter()
                .map(ValidationOption::from_sdk)
                .collect(),
            tags_all: provider.observed_tags(Tags::from_acm(tags.tags())),
        })
    }

    /// The names ACM publishes one validation option for.
    fn distinct_names(&self) -> HashSet<&str> {
        std::iter::once(&self.domain_name)
            .chain(&self.subject_alternative_names)
            .map(String::as_str)
            .collect()
    }

    /// Returns the certificate's validation options, waiting for ACM to
    /// publish the DNS records when DNS validation was requested.
    pub async fn get_validation_options(
        &self,
        provider: &AwsProvider,
        arn: &str,
    ) -> Result<Vec<ValidationOption>> {
        let client = &Self::client(provider);
        let expected = self.distinct_names().len();
        let dns = self.validation_method == ValidationMethod::Dns;
        wait_until("ACM certificate validation records", VALIDATION_RECORDS_TIMEOUT, || async move {
            let detail = Self::describe(client, arn).await?;
            let options = detail
                .domain_validation_options()
                .iter()
                .map(ValidationOption::from_sdk)
                .collect::<Vec<_>>();
            let ready = options.len() >= expected
                && (!dns || options.iter().all(|o| o.resource_record.is_some()));
            Ok(if ready {
                Status::Ready(options)
            } else {
                Status::Pending(format!("{} of {expected} validation options", options.len()))
            })
        })
        .await
    }

    /// Reads an existing certificate by ARN.
    pub async fn import(provider: &AwsProvider, arn: &str) -> Result<(Self, CertificateOutput)> {
        let client = Self::client(provider);
        let detail = Self::describe(&client, arn).await?;
        let domain_name = detail
            .domain_name()
            .context(MissingFieldSnafu {
                operation: "DescribeCertificate",
                field: "DomainName",
            })?
            .to_owned();
        let validation_method = detail
            .domain_validation_options()
            .first()
            .and_then(|option| option.validation_method())
            .map(ValidationMethod::try_from)
            .transpose()?
            .unwrap_or_default();
        let output = Self::read_arn(provider, &client, arn).await?;
        let local = Certificate {
            subject_alternative_names: detail
                .subject_alternative_names()
                .iter()
                .filter(|name| **name != domain_name)
                .cloned()
                .collect(),
            domain_name,
            validation_method,
            tags: output.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, output))
    }
}

impl sky::Resource for Certificate {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = CertificateOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = Self::client(provider);
        let subject_alt_names = if self.subject_alternative_names.is_empty() {
            None
        } else {
            Some(self.subject_alternative_names.clone())
        };
        let tags = provider.tags_all(&self.tags).to_acm()?;
        let out = client
            .request_certificate()
            .domain_name(&self.domain_name)
            .validation_method(self.validation_method.into())
            .set_subject_alternative_names(subject_alt_names)
            .set_tags((!tags.is_empty()).then_some(tags))
            .send()
            .await
            .map_err(error::api("RequestCertificate"))?;
        let arn = out.certificate_arn().context(MissingFieldSnafu {
            operation: "RequestCertificate",
            field: "CertificateArn",
        })?;
        log::info!("requested ACM certificate {arn} for {}", self.domain_name);
        self.get_validation_options(provider, arn).await?;
        Self::read_arn(provider, &client, arn).await
    }

    /// Finds the certificate for this domain name.
    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &Self::client(provider);
        let summaries = find::collect_pages(move |token| {
            let request = client.list_certificates().set_next_token(token);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(error::api("ListCertificates"))?;
                Ok((
                    output.certificate_summary_list().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        let matching = summaries
            .into_iter()
            .filter(|summary| summary.domain_name() == Some(self.domain_name.as_str()))
            .collect();
        let summary = find::assert_single_value("ListCertificates", matching)?;
        let arn = summary.certificate_arn().context(MissingFieldSnafu {
            operation: "ListCertificates",
            field: "CertificateArn",
        })?;
        Self::read_arn(provider, client, arn).await
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        Self::read_arn(provider, &Self::client(provider), &previous_remote.arn).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = Self::client(provider);
        let arn = &previous_remote.arn;
        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            let keys = tags
                .to_remove
                .iter()
                .map(|key| {
                    aws_sdk_acm::types::Tag::builder()
                        .key(key)
                        .build()
                        .map_err(|e| Error::Validation {
                            field: "tags",
                            reason: e.to_string(),
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            client
                .remove_tags_from_certificate()
                .certificate_arn(arn)
                .set_tags(Some(keys))
                .send()
                .await
                .map_err(error::api("RemoveTagsFromCertificate"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .add_tags_to_certificate()
                .certificate_arn(arn)
                .set_tags(Some(tags.to_set.to_acm()?))
                .send()
                .await
                .map_err(error::api("AddTagsToCertificate"))?;
        }
        Self::read_arn(provider, &client, arn).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        let client = &Self::client(provider);
        let arn = previous_remote.arn.as_str();
        log::info!("deleting ACM certificate {arn}");
        let result = retry_when(
            "ACM certificate deletion",
            DELETE_TIMEOUT,
            |e| e.has_code(IN_USE),
            move || {
                let request = client.delete_certificate().certificate_arn(arn);
                async move {
                    request
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(error::api_or_missing("DeleteCertificate", NOT_FOUND))
                }
            },
        )
        .await;
        error::ignore_missing(result)
    }

    fn validate(&self) -> Result<()> {
        for name in std::iter::once(&self.domain_name).chain(&self.subject_alternative_names) {
            ensure!(
                (1..=253).contains(&name.len()) && !name.ends_with('.'),
                ValidationSnafu {
                    field: "domain_name",
                    reason: format!("'{name}' is not a fully qualified domain name"),
                }
            );
        }
        ensure!(
            !self.subject_alternative_names.contains(&self.domain_name),
            ValidationSnafu {
                field: "subject_alternative_names",
                reason: format!("'{}' is already the domain name", self.domain_name),
            }
        );
        let mut names = HashSet::new();
        for name in &self.subject_alternative_names {
            ensure!(
                names.insert(name.as_str()),
                ValidationSnafu {
                    field: "subject_alternative_names",
                    reason: format!("duplicate name '{name}'"),
                }
            );
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.domain_name != previous.domain_name
            || self.validation_method != previous.validation_method
            || self.subject_alternative_names != previous.subject_alternative_names
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}
