//! DMS replication instance lookups.
use snafu::prelude::*;

use super::{
    error::{self, MissingFieldSnafu, ValidationSnafu},
    find, AwsProvider, Error, Result, Tags,
};
use crate::{self as sky, HasDependencies};

const NOT_FOUND: &[&str] = &["ResourceNotFoundFault"];

fn client(provider: &AwsProvider) -> aws_sdk_databasemigration::Client {
    aws_sdk_databasemigration::Client::new(provider.sdk())
}

/// Looks up a replication instance by its identifier.
#[derive(Debug, Clone, Default, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct ReplicationInstance {
    pub replication_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationInstanceOutput {
    pub replication_instance_id: String,
    pub replication_instance_arn: String,
    pub replication_instance_class: Option<String>,
    /// Storage in GiB.
    pub allocated_storage: Option<i32>,
    pub auto_minor_version_upgrade: bool,
    pub availability_zone: Option<String>,
    pub engine_version: Option<String>,
    pub kms_key_arn: Option<String>,
    pub multi_az: bool,
    pub network_type: Option<String>,
    pub preferred_maintenance_window: Option<String>,
    pub publicly_accessible: bool,
    pub replication_instance_private_ips: Vec<String>,
    pub replication_instance_public_ips: Vec<String>,
    pub replication_subnet_group_id: Option<String>,
    pub vpc_security_group_ids: Vec<String>,
    pub tags: Tags,
}

impl ReplicationInstanceOutput {
    fn from_sdk(
        instance: &aws_sdk_databasemigration::types::ReplicationInstance,
        tags: Tags,
    ) -> Result<Self> {
        let field = |field| MissingFieldSnafu {
            operation: "DescribeReplicationInstances",
            field,
        };
        let id = instance
            .replication_instance_identifier()
            .context(field("ReplicationInstanceIdentifier"))?;
        let arn = instance
            .replication_instance_arn()
            .context(field("ReplicationInstanceArn"))?;
        let auto_minor_version_upgrade: Option<bool> = instance.auto_minor_version_upgrade().into();
        let multi_az: Option<bool> = instance.multi_az().into();
        let publicly_accessible: Option<bool> = instance.publicly_accessible().into();
        let mut vpc_security_group_ids = instance
            .vpc_security_groups()
            .iter()
            .filter_map(|group| group.vpc_security_group_id())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        vpc_security_group_ids.sort();
        Ok(ReplicationInstanceOutput {
            replication_instance_id: id.to_owned(),
            replication_instance_arn: arn.to_owned(),
            replication_instance_class: instance.replication_instance_class().map(str::to_owned),
            allocated_storage: instance.allocated_storage().into(),
            auto_minor_version_upgrade: auto_minor_version_upgrade.unwrap_or_default(),
            availability_zone: instance.availability_zone().map(str::to_owned),
            engine_version: instance.engine_version().map(str::to_owned),
            kms_key_arn: instance.kms_key_id().map(str::to_owned),
            multi_az: multi_az.unwrap_or_default(),
            network_type: instance.network_type().map(str::to_owned),
            preferred_maintenance_window: instance
                .preferred_maintenance_window()
                .map(str::to_owned),
            publicly_accessible: publicly_accessible.unwrap_or_default(),
            replication_instance_private_ips: instance
                .replication_instance_private_ip_addresses()
                .to_vec(),
            replication_instance_public_ips: instance
                .replication_instance_public_ip_addresses()
                .to_vec(),
            replication_subnet_group_id: instance
                .replication_subnet_group()
                .and_then(|group| group.replication_subnet_group_identifier())
                .map(str::to_owned),
            vpc_security_group_ids,
            tags,
        })
    }
}

impl ReplicationInstance {
    fn id_filter(&self) -> Result<aws_sdk_databasemigration::types::Filter> {
        aws_sdk_databasemigration::types::Filter::builder()
            .name("replication-instance-id")
            .values(&self.replication_instance_id)
            .build()
            .map_err(|e| Error::Validation {
                field: "replication_instance_id",
                reason: e.to_string(),
            })
    }
}

impl sky::Resource for ReplicationInstance {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = ReplicationInstanceOutput;

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let filter = self.id_filter()?;
        let instances = find::collect_pages(move |marker| {
            let request = client
                .describe_replication_instances()
                .filters(filter.clone())
                .set_marker(marker);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(error::api_or_missing("DescribeReplicationInstances", NOT_FOUND))?;
                Ok((
                    output.replication_instances().to_vec(),
                    output.marker().map(str::to_owned),
                ))
            }
        })
        .await?;
        let instance = find::assert_single_value("DescribeReplicationInstances", instances)?;
        let arn = instance
            .replication_instance_arn()
            .context(MissingFieldSnafu {
                operation: "DescribeReplicationInstances",
                field: "ReplicationInstanceArn",
            })?;
        let tags = client
            .list_tags_for_resource()
            .resource_arn(arn)
            .send()
            .await
            .map_err(error::api_or_missing("ListTagsForResource", NOT_FOUND))?;
        let tags = provider
            .observed_tags(Tags::from_dms(tags.tag_list()))
            .remove_defaults(provider.default_tags());
        ReplicationInstanceOutput::from_sdk(&instance, tags)
    }

    async fn delete(&self, _provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::debug!(
            "forgetting DMS replication instance {}",
            previous_remote.replication_instance_id
        );
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.replication_instance_id.is_empty(),
            ValidationSnafu {
                field: "replication_instance_id",
                reason: "cannot be empty",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Resource;
    use aws_sdk_databasemigration::types as sdk;
    use pretty_assertions::assert_eq;

    #[test]
    fn replication_instance_output() {
        let instance = sdk::ReplicationInstance::builder()
            .replication_instance_identifier("migrator")
            .replication_instance_arn("arn:aws:dms:us-west-2:123456789012:rep:MIGRATOR")
            .replication_instance_class("dms.t3.micro")
            .allocated_storage(50)
            .multi_az(true)
            .publicly_accessible(false)
            .replication_instance_private_ip_addresses("10.0.0.7")
            .replication_subnet_group(
                sdk::ReplicationSubnetGroup::builder()
                    .replication_subnet_group_identifier("private")
                    .build(),
            )
            .vpc_security_groups(
                sdk::VpcSecurityGroupMembership::builder()
                    .vpc_security_group_id("sg-b")
                    .build(),
            )
            .vpc_security_groups(
                sdk::VpcSecurityGroupMembership::builder()
                    .vpc_security_group_id("sg-a")
                    .build(),
            )
            .build();
        let output =
            ReplicationInstanceOutput::from_sdk(&instance, Tags::new().with("team", "data")).unwrap();
        assert_eq!("migrator", output.replication_instance_id);
        assert_eq!(Some(50), output.allocated_storage);
        assert!(output.multi_az);
        assert!(!output.publicly_accessible);
        assert_eq!(vec!["10.0.0.7".to_owned()], output.replication_instance_private_ips);
        assert!(output.replication_instance_public_ips.is_empty());
        assert_eq!(Some("private".to_owned()), output.replication_subnet_group_id);
        assert_eq!(
            vec!["sg-a".to_owned(), "sg-b".to_owned()],
            output.vpc_security_group_ids
        );
        assert_eq!(Some("data"), output.tags.get("team"));
    }

    #[test]
    fn replication_instance_without_arn_is_rejected() {
        let instance = sdk::ReplicationInstance::builder()
            .replication_instance_identifier("migrator")
            .build();
        let error = ReplicationInstanceOutput::from_sdk(&instance, Tags::new()).unwrap_err();
        assert!(error.to_string().contains("ReplicationInstanceArn"), "{error}");
    }

    #[test]
    fn lookup_by_id() {
        let lookup = ReplicationInstance {
            replication_instance_id: "migrator".into(),
        };
        assert!(lookup.validate().is_ok());
        let filter = lookup.id_filter().unwrap();
        assert_eq!("replication-instance-id", filter.name());
        assert_eq!(&["migrator".to_owned()], filter.values());

        assert!(ReplicationInstance::default().validate().is_err());
    }
}
