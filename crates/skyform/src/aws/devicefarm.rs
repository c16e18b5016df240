//! Device Farm uploads.
use aws_sdk_devicefarm::types::UploadType;
use snafu::prelude::*;

use super::{
    error::{self, InvalidIdSnafu, MissingFieldSnafu, ValidationSnafu},
    find, AwsProvider, Error, Result,
};
use crate::{self as sky, HasDependencies};

const NOT_FOUND: &[&str] = &["NotFoundException"];

/// Returns the ARN of the project an upload ARN belongs to.
///
/// `arn:aws:devicefarm:us-west-2:123456789012:upload:PROJECT/UPLOAD`
/// belongs to `arn:aws:devicefarm:us-west-2:123456789012:project:PROJECT`.
pub fn decode_project_arn(upload_arn: &str) -> Result<String> {
    let invalid = || InvalidIdSnafu {
        id: upload_arn,
        expected: "a Device Farm upload ARN",
    };
    let parts = upload_arn.splitn(6, ':').collect::<Vec<_>>();
    let ["arn", partition, "devicefarm", region, account, resource] = parts.as_slice() else {
        return invalid().fail();
    };
    let project_id = resource
        .strip_prefix("upload:")
        .and_then(|rest| rest.split_once('/'))
        .map(|(project, _)| project)
        .filter(|project| !project.is_empty())
        .context(invalid())?;
    Ok(format!(
        "arn:{partition}:devicefarm:{region}:{account}:project:{project_id}"
    ))
}

/// A file uploaded to a Device Farm project, eg an app package or a test
/// package.
///
/// Creating an upload only reserves it; the file itself is `PUT` to the
/// presigned [`UploadOutput::url`].
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Upload {
    pub project_arn: String,
    pub name: String,
    /// The upload type, eg `ANDROID_APP` or `APPIUM_NODE_TEST_SPEC`.
    pub r#type: String,
    /// Once set, UpdateUpload can change but not clear it.
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct UploadOutput {
    pub arn: String,
    pub project_arn: String,
    pub name: String,
    pub content_type: Option<String>,
    pub category: Option<String>,
    pub metadata: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
}

/// `url` is presigned and differs on every read, so it isn't compared.
impl PartialEq for UploadOutput {
    fn eq(&self, other: &Self) -> bool {
        self.arn == other.arn
            && self.project_arn == other.project_arn
            && self.name == other.name
            && self.content_type == other.content_type
            && self.category == other.category
            && self.metadata == other.metadata
            && self.status == other.status
    }
}

impl UploadOutput {
    fn from_sdk(upload: &aws_sdk_devicefarm::types::Upload, operation: &'static str) -> Result<Self> {
        let arn = upload.arn().context(MissingFieldSnafu {
            operation,
            field: "Upload.Arn",
        })?;
        Ok(UploadOutput {
            arn: arn.to_owned(),
            project_arn: decode_project_arn(arn)?,
            name: upload.name().unwrap_or_default().to_owned(),
            content_type: upload.content_type().map(str::to_owned),
            category: upload.category().map(|c| c.as_str().to_owned()),
            metadata: upload.metadata().map(str::to_owned),
            status: upload.status().map(|s| s.as_str().to_owned()),
            url: upload.url().map(str::to_owned),
        })
    }
}

impl Upload {
    /// The name and content type to send in UpdateUpload, if they changed.
    fn changes(&self, previous: &UploadOutput) -> (Option<String>, Option<String>) {
        let name = (self.name != previous.name).then(|| self.name.clone());
        let content_type = self
            .content_type
            .clone()
            .filter(|content_type| previous.content_type.as_ref() != Some(content_type));
        (name, content_type)
    }

    fn client(provider: &AwsProvider) -> aws_sdk_devicefarm::Client {
        aws_sdk_devicefarm::Client::new(provider.sdk())
    }

    async fn get(client: &aws_sdk_devicefarm::Client, arn: &str) -> Result<UploadOutput> {
        let output = client
            .get_upload()
            .arn(arn)
            .send()
            .await
            .map_err(error::api_or_missing("GetUpload", NOT_FOUND))?;
        let upload = output.upload().context(error::EmptyResultSnafu {
            operation: "GetUpload",
        })?;
        UploadOutput::from_sdk(upload, "GetUpload")
    }
}

impl sky::Resource for Upload {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = UploadOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = Self::client(provider);
        let output = client
            .create_upload()
            .project_arn(&self.project_arn)
            .name(&self.name)
            .r#type(UploadType::from(self.r#type.as_str()))
            .set_content_type(self.content_type.clone())
            .send()
            .await
            .map_err(error::api("CreateUpload"))?;
        let upload = output.upload().context(MissingFieldSnafu {
            operation: "CreateUpload",
            field: "Upload",
        })?;
        let created = UploadOutput::from_sdk(upload, "CreateUpload")?;
        log::debug!("created Device Farm upload {}", created.arn);
        Self::get(&client, &created.arn).await
    }

    /// Finds the upload by project, name and type.
    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &Self::client(provider);
        let uploads = find::collect_pages(move |token| {
            let request = client
                .list_uploads()
                .arn(&self.project_arn)
                .r#type(UploadType::from(self.r#type.as_str()))
                .set_next_token(token);
            async move {
                let output = request.send().await.map_err(error::api("ListUploads"))?;
                Ok((
                    output.uploads().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        let matching = uploads
            .into_iter()
            .filter(|upload| upload.name() == Some(self.name.as_str()))
            .collect();
        let upload = find::assert_single_value("ListUploads", matching)?;
        UploadOutput::from_sdk(&upload, "ListUploads")
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        Self::get(&Self::client(provider), &previous_remote.arn).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = Self::client(provider);
        if self.content_type.is_none() && previous_remote.content_type.is_some() {
            log::warn!(
                "Device Farm upload {} keeps its content type, it can't be cleared",
                previous_remote.arn
            );
        }
        let (name, content_type) = self.changes(previous_remote);
        if name.is_some() || content_type.is_some() {
            client
                .update_upload()
                .arn(&previous_remote.arn)
                .set_name(name)
                .set_content_type(content_type)
                .send()
                .await
                .map_err(error::api("UpdateUpload"))?;
        }
        Self::get(&client, &previous_remote.arn).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::debug!("deleting Device Farm upload {}", previous_remote.arn);
        let result = Self::client(provider)
            .delete_upload()
            .arn(&previous_remote.arn)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing("DeleteUpload", NOT_FOUND));
        error::ignore_missing(result)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=256).contains(&self.name.chars().count()),
            ValidationSnafu {
                field: "name",
                reason: "must be 1-256 characters",
            }
        );
        if let Some(content_type) = &self.content_type {
            ensure!(
                content_type.chars().count() <= 64,
                ValidationSnafu {
                    field: "content_type",
                    reason: "must be at most 64 characters",
                }
            );
        }
        ensure!(
            UploadType::values().contains(&self.r#type.as_str()),
            ValidationSnafu {
                field: "type",
                reason: format!("unknown upload type '{}'", self.r#type),
            }
        );
        ensure!(
            self.project_arn.starts_with("arn:") && self.project_arn.contains(":project:"),
            ValidationSnafu {
                field: "project_arn",
                reason: format!("'{}' is not a project ARN", self.project_arn),
            }
        );
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.project_arn != previous.project_arn || self.r#type != previous.r#type
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}
