//! Skyform for AWS.
//!
//! Every resource here uses [`AwsProvider`] as its provider and
//! [`Error`] as its error type, so "the object is gone" is understood the
//! same way by every resource.
use aws_config::{BehaviorVersion, Region};
pub use aws_config::SdkConfig;
use snafu::prelude::*;

pub mod acm;
pub mod apigateway;
pub mod devicefarm;
pub mod dms;
pub mod ec2;
pub mod error;
pub mod find;
pub mod iam;
pub mod lakeformation;
pub mod retry;
pub mod tags;
pub mod transfer;
pub mod wafv2;

pub use error::{Error, Result};
pub use tags::{IgnoreTags, Tags};

/// Provider-level settings, usually read from a TOML file.
///
/// ```toml
/// region = "us-east-1"
/// profile = "infra"
///
/// [default_tags]
/// managed-by = "skyform"
///
/// [ignore_tags]
/// keys = ["cost-center"]
/// key_prefixes = ["kubernetes.io/"]
/// ```
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    /// Tags applied to every taggable resource.
    pub default_tags: Tags,
    pub ignore_tags: IgnoreTags,
}

impl ProviderConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context(error::ConfigParseSnafu)
    }

    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("reading provider config from {path:?}");
        let contents = std::fs::read_to_string(path).context(error::ConfigReadSnafu { path })?;
        Self::from_toml_str(&contents)
    }
}

/// The AWS platform provider.
///
/// Wraps the `SdkConfig` each resource builds its service client from,
/// along with the provider-wide tag settings.
pub struct AwsProvider {
    sdk: SdkConfig,
    default_tags: Tags,
    ignore_tags: IgnoreTags,
}

impl AsRef<SdkConfig> for AwsProvider {
    fn as_ref(&self) -> &SdkConfig {
        &self.sdk
    }
}

impl AwsProvider {
    pub fn new(sdk: SdkConfig) -> Self {
        AwsProvider {
            sdk,
            default_tags: Tags::default(),
            ignore_tags: IgnoreTags::default(),
        }
    }

    /// Loads credentials and region the usual AWS way, then applies the
    /// overrides and tag settings in `config`.
    pub async fn from_config(config: &ProviderConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        let sdk = loader.load().await;
        log::info!(
            "using AWS region {}",
            sdk.region().map(|r| r.as_ref()).unwrap_or("<unset>")
        );
        AwsProvider::new(sdk)
            .with_default_tags(config.default_tags.clone())
            .with_ignore_tags(config.ignore_tags.clone())
    }

    pub fn with_default_tags(mut self, tags: Tags) -> Self {
        self.default_tags = tags;
        self
    }

    pub fn with_ignore_tags(mut self, ignore: IgnoreTags) -> Self {
        self.ignore_tags = ignore;
        self
    }

    pub fn sdk(&self) -> &SdkConfig {
        &self.sdk
    }

    pub fn default_tags(&self) -> &Tags {
        &self.default_tags
    }

    /// The tags to apply for a resource declaring `tags`.
    pub fn tags_all(&self, tags: &Tags) -> Tags {
        tags.merge_defaults(&self.default_tags)
    }

    /// Filters tags read back from AWS down to the ones we manage.
    pub fn observed_tags(&self, tags: Tags) -> Tags {
        tags.ignore(&self.ignore_tags)
    }
}

/// Registers every AWS resource type for orphan auto-deletion.
pub fn register_all(store: &mut crate::Store<AwsProvider>) {
    store
        .register::<acm::Certificate>()
        .register::<apigateway::VpcLink>()
        .register::<devicefarm::Upload>()
        .register::<ec2::CustomerGateway>()
        .register::<ec2::TransitGatewayVpnAttachment>()
        .register::<ec2::TransitGatewayConnect>()
        .register::<ec2::TransitGatewayMulticastDomain>()
        .register::<dms::ReplicationInstance>()
        .register::<lakeformation::DataLakeSettings>()
        .register::<iam::Role>()
        .register::<iam::Policy>()
        .register::<transfer::Certificate>()
        .register::<wafv2::WebAcl>();
}
