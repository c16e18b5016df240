//! Lake Formation data lake settings lookups.
use std::collections::BTreeMap;

use aws_sdk_lakeformation::types as sdk;
use snafu::prelude::*;

use super::{
    error::{self, MissingFieldSnafu, ValidationSnafu},
    AwsProvider, Error, Result,
};
use crate::{self as sky, HasDependencies};

const NOT_FOUND: &[&str] = &["EntityNotFoundException"];

const CROSS_ACCOUNT_VERSION: &str = "CROSS_ACCOUNT_VERSION";

fn principals(principals: &[sdk::DataLakePrincipal]) -> Vec<String> {
    let mut ids = principals
        .iter()
        .filter_map(|p| p.data_lake_principal_identifier())
        .map(str::to_owned)
        .collect::<Vec<_>>();
    ids.sort();
    ids
}

/// The permissions granted by default on new databases or tables.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DefaultPermissions {
    pub principal: Option<String>,
    pub permissions: Vec<String>,
}

impl DefaultPermissions {
    fn from_sdk(grants: &[sdk::PrincipalPermissions]) -> Vec<Self> {
        grants
            .iter()
            .map(|grant| {
                let mut permissions = grant
                    .permissions()
                    .iter()
                    .map(|p| p.as_str().to_owned())
                    .collect::<Vec<_>>();
                permissions.sort();
                DefaultPermissions {
                    principal: grant
                        .principal()
                        .and_then(|p| p.data_lake_principal_identifier())
                        .map(str::to_owned),
                    permissions,
                }
            })
            .collect()
    }
}

/// Reads the data lake settings of a catalog, the account's own by default.
#[derive(Debug, Clone, Default, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct DataLakeSettings {
    pub catalog_id: Option<String>,
    /// Parameters to report. AWS fills in defaults for parameters that were
    /// never set, so a configured value is reported when AWS has none.
    /// Only `CROSS_ACCOUNT_VERSION` is supported.
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DataLakeSettingsOutput {
    pub catalog_id: Option<String>,
    pub admins: Vec<String>,
    pub read_only_admins: Vec<String>,
    pub allow_external_data_filtering: bool,
    pub authorized_session_tag_value_list: Vec<String>,
    pub create_database_default_permissions: Vec<DefaultPermissions>,
    pub create_table_default_permissions: Vec<DefaultPermissions>,
    pub external_data_filtering_allow_list: Vec<String>,
    pub trusted_resource_owners: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

impl DataLakeSettings {
    fn client(provider: &AwsProvider) -> aws_sdk_lakeformation::Client {
        aws_sdk_lakeformation::Client::new(provider.sdk())
    }

    fn output(&self, settings: &sdk::DataLakeSettings) -> DataLakeSettingsOutput {
        let observed = settings.parameters();
        let parameters = self
            .parameters
            .iter()
            .map(|(key, configured)| {
                let value = observed
                    .and_then(|observed| observed.get(key))
                    .unwrap_or(configured);
                (key.clone(), value.clone())
            })
            .collect();
        let allow_external_data_filtering: Option<bool> =
            settings.allow_external_data_filtering().into();
        DataLakeSettingsOutput {
            catalog_id: self.catalog_id.clone(),
            admins: principals(settings.data_lake_admins()),
            read_only_admins: principals(settings.read_only_admins()),
            allow_external_data_filtering: allow_external_data_filtering.unwrap_or_default(),
            authorized_session_tag_value_list: settings.authorized_session_tag_value_list().to_vec(),
            create_database_default_permissions: DefaultPermissions::from_sdk(
                settings.create_database_default_permissions(),
            ),
            create_table_default_permissions: DefaultPermissions::from_sdk(
                settings.create_table_default_permissions(),
            ),
            external_data_filtering_allow_list: principals(
                settings.external_data_filtering_allow_list(),
            ),
            trusted_resource_owners: settings.trusted_resource_owners().to_vec(),
            parameters,
        }
    }
}

impl sky::Resource for DataLakeSettings {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = DataLakeSettingsOutput;

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let output = Self::client(provider)
            .get_data_lake_settings()
            .set_catalog_id(self.catalog_id.clone())
            .send()
            .await
            .map_err(error::api_or_missing("GetDataLakeSettings", NOT_FOUND))?;
        let settings = output.data_lake_settings().context(MissingFieldSnafu {
            operation: "GetDataLakeSettings",
            field: "DataLakeSettings",
        })?;
        Ok(self.output(settings))
    }

    async fn delete(&self, _provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::debug!(
            "forgetting Lake Formation data lake settings of {}",
            previous_remote.catalog_id.as_deref().unwrap_or("this account")
        );
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (key, value) in &self.parameters {
            ensure!(
                key == CROSS_ACCOUNT_VERSION,
                ValidationSnafu {
                    field: "parameters",
                    reason: format!("unsupported parameter '{key}'"),
                }
            );
            ensure!(
                (1..=4).contains(&value.len()),
                ValidationSnafu {
                    field: "parameters",
                    reason: format!("'{key}' must be 1 to 4 characters"),
                }
            );
        }
        Ok(())
    }
}
