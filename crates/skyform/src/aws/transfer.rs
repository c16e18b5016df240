//! AWS Transfer Family certificates.
use aws_sdk_transfer::types::CertificateUsageType;
use aws_smithy_types::date_time::Format;
use snafu::prelude::*;

use super::{
    error::{self, EmptyResultSnafu, ValidationSnafu},
    AwsProvider, Error, Result, Tags,
};
use crate::{self as sky, utils::Sensitive, HasDependencies};

const NOT_FOUND: &[&str] = &["ResourceNotFoundException"];

const CERTIFICATE_MAX: usize = 16_384;
const CHAIN_MAX: usize = 2_097_152;
const PRIVATE_KEY_MAX: usize = 16_384;
const DESCRIPTION_MAX: usize = 200;

/// What a certificate is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateUsage {
    Signing,
    Encryption,
    Tls,
}

impl HasDependencies for CertificateUsage {}

impl CertificateUsage {
    fn to_sdk(self) -> CertificateUsageType {
        match self {
            CertificateUsage::Signing => CertificateUsageType::Signing,
            CertificateUsage::Encryption => CertificateUsageType::Encryption,
            CertificateUsage::Tls => CertificateUsageType::Tls,
        }
    }

    fn from_sdk(usage: &CertificateUsageType) -> Result<Self> {
        match usage {
            CertificateUsageType::Signing => Ok(CertificateUsage::Signing),
            CertificateUsageType::Encryption => Ok(CertificateUsage::Encryption),
            CertificateUsageType::Tls => Ok(CertificateUsage::Tls),
            other => ValidationSnafu {
                field: "usage",
                reason: format!("unsupported certificate usage '{}'", other.as_str()),
            }
            .fail(),
        }
    }
}

/// A certificate imported into AWS Transfer Family, for AS2 signing and
/// encryption or for TLS.
///
/// The PEM bodies are [`Sensitive`]: they are written to the store but
/// only their fingerprints are ever logged.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Certificate {
    pub certificate: Sensitive<String>,
    pub certificate_chain: Option<Sensitive<String>>,
    pub private_key: Option<Sensitive<String>>,
    pub usage: CertificateUsage,
    pub description: Option<String>,
    pub tags: Tags,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CertificateOutput {
    pub certificate_id: String,
    pub arn: String,
    pub usage: CertificateUsage,
    pub description: Option<String>,
    pub active_date: Option<String>,
    pub inactive_date: Option<String>,
    pub tags_all: Tags,
}

fn format_date(date: Option<&aws_smithy_types::DateTime>) -> Option<String> {
    date.and_then(|date| date.fmt(Format::DateTime).ok())
}

impl Certificate {
    fn client(provider: &AwsProvider) -> aws_sdk_transfer::Client {
        aws_sdk_transfer::Client::new(provider.sdk())
    }

    async fn describe(
        client: &aws_sdk_transfer::Client,
        certificate_id: &str,
    ) -> Result<aws_sdk_transfer::types::DescribedCertificate> {
        let output = client
            .describe_certificate()
            .certificate_id(certificate_id)
            .send()
            .await
            .map_err(error::api_or_missing("DescribeCertificate", NOT_FOUND))?;
        output.certificate().cloned().context(EmptyResultSnafu {
            operation: "DescribeCertificate",
        })
    }

    async fn read_id(
        provider: &AwsProvider,
        client: &aws_sdk_transfer::Client,
        certificate_id: &str,
    ) -> Result<CertificateOutput> {
        let described = Self::describe(client, certificate_id).await?;
        let usage = described.usage().context(error::MissingFieldSnafu {
            operation: "DescribeCertificate",
            field: "Usage",
        })?;
        Ok(CertificateOutput {
            certificate_id: described
                .certificate_id()
                .unwrap_or(certificate_id)
                .to_owned(),
            arn: described.arn().to_owned(),
            usage: CertificateUsage::from_sdk(usage)?,
            description: described.description().map(str::to_owned),
            active_date: format_date(described.active_date()),
            inactive_date: format_date(described.inactive_date()),
            tags_all: provider.observed_tags(Tags::from_transfer(described.tags())),
        })
    }

    /// Reads an imported certificate by id.
    ///
    /// AWS never returns the private key, so the returned definition has
    /// none. Supply it before the next update if the key must be tracked.
    pub async fn import(
        provider: &AwsProvider,
        certificate_id: &str,
    ) -> Result<(Self, CertificateOutput)> {
        let client = Self::client(provider);
        let described = Self::describe(&client, certificate_id).await?;
        let output = Self::read_id(provider, &client, certificate_id).await?;
        let local = Certificate {
            certificate: described.certificate().unwrap_or_default().into(),
            certificate_chain: described.certificate_chain().map(Sensitive::from),
            private_key: None,
            usage: output.usage,
            description: output.description.clone(),
            tags: output.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, output))
    }
}

fn ensure_len(field: &'static str, value: &str, range: std::ops::RangeInclusive<usize>) -> Result<()> {
    ensure!(
        range.contains(&value.chars().count()),
        ValidationSnafu {
            field,
            reason: format!("must be {}-{} characters", range.start(), range.end()),
        }
    );
    Ok(())
}

impl sky::Resource for Certificate {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = CertificateOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = Self::client(provider);
        let tags = provider.tags_all(&self.tags).to_transfer()?;
        let output = client
            .import_certificate()
            .certificate(self.certificate.expose())
            .set_certificate_chain(self.certificate_chain.as_ref().map(|c| c.expose().clone()))
            .set_private_key(self.private_key.as_ref().map(|k| k.expose().clone()))
            .usage(self.usage.to_sdk())
            .set_description(self.description.clone())
            .set_tags((!tags.is_empty()).then_some(tags))
            .send()
            .await
            .map_err(error::api("ImportCertificate"))?;
        let certificate_id = output.certificate_id();
        log::info!("imported Transfer certificate {certificate_id}");
        Self::read_id(provider, &client, certificate_id).await
    }

    /// Certificates have no natural key, only the id AWS assigns.
    async fn read(&self, _provider: &Self::Provider) -> Result<Self::Output> {
        ValidationSnafu {
            field: "certificate_id",
            reason: "Transfer certificates can only be looked up by id, use `Certificate::import`",
        }
        .fail()
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = Self::client(provider);
        Self::read_id(provider, &client, &previous_remote.certificate_id).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = Self::client(provider);
        let id = &previous_remote.certificate_id;

        if self.description != previous_remote.description {
            client
                .update_certificate()
                .certificate_id(id)
                .description(self.description.clone().unwrap_or_default())
                .send()
                .await
                .map_err(error::api_or_missing("UpdateCertificate", NOT_FOUND))?;
        }

        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            client
                .untag_resource()
                .arn(&previous_remote.arn)
                .set_tag_keys(Some(tags.to_remove.clone()))
                .send()
                .await
                .map_err(error::api("UntagResource"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .tag_resource()
                .arn(&previous_remote.arn)
                .set_tags(Some(tags.to_set.to_transfer()?))
                .send()
                .await
                .map_err(error::api("TagResource"))?;
        }

        Self::read_id(provider, &client, id).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::info!(
            "deleting Transfer certificate {}",
            previous_remote.certificate_id
        );
        let result = Self::client(provider)
            .delete_certificate()
            .certificate_id(&previous_remote.certificate_id)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DeleteCertificate", NOT_FOUND));
        error::ignore_missing(result)
    }

    fn validate(&self) -> Result<()> {
        ensure_len("certificate", self.certificate.expose(), 1..=CERTIFICATE_MAX)?;
        if let Some(chain) = &self.certificate_chain {
            ensure_len("certificate_chain", chain.expose(), 1..=CHAIN_MAX)?;
        }
        if let Some(key) = &self.private_key {
            ensure_len("private_key", key.expose(), 1..=PRIVATE_KEY_MAX)?;
        }
        if let Some(description) = &self.description {
            ensure_len("description", description, 1..=DESCRIPTION_MAX)?;
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.certificate != previous.certificate
            || self.certificate_chain != previous.certificate_chain
            || self.private_key != previous.private_key
            || self.usage != previous.usage
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}
