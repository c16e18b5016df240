//! # Skyform
//!
//! Skyform is an Infrastructure as Code (IaC) provider for AWS written in
//! Rust. Each supported AWS resource type declares its configurable
//! attributes as a plain Rust struct (the _local definition_) and its
//! computed attributes as an associated output type (the _remote_ value).
//! CRUD callbacks translate between the two and the AWS APIs.
//!
//! Resources are declared on a [`Store`], which compares every declaration
//! with the state recorded on disk during the previous apply and schedules
//! the resulting actions as a Directed Acyclic Graph, so that a resource is
//! only acted on after the resources it depends on.
//!
//! ## Concepts
//!
//! - **Local State**: the desired state of the resource as defined in your
//!   Rust code.
//! - **Remote State**: the state of the resource as it exists on the
//!   platform, as last observed by skyform.
//! - **Drift**: a difference between the recorded remote state and the
//!   remote state as it actually is. With [`Store::with_refresh`] enabled,
//!   unchanged resources are read back from the platform and drift is
//!   reconciled by pushing the local definition again, or by recreating
//!   the resource if it was deleted out of band.
//!
//! The AWS resources live in [`aws`].
//!
//! ## Error Handling
//!
//! Skyform exposes an error enum [`Error`], which encompasses all possible
//! errors that may occur while planning and applying. Errors raised by
//! resources themselves are carried in the `Create`, `Import`, `Update`,
//! `Refresh` and `Destroy` variants.

use std::{future::Future, ops::Deref, pin::Pin};

use dagga::{Node, Schedule};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;

pub use skyform_derive::HasDependencies;

pub mod aws;
mod has_dependencies_impl;
pub mod remote;
#[cfg(test)]
mod test;
pub mod utils;

pub use remote::{Migrated, Remote};
use remote::{RemoteVar, Remotes};

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
pub enum Error {
    #[snafu(display("{source}:\n{}",
                source.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Sky { source: anyhow::Error },

    #[snafu(display("Could not read store file '{path:?}': {source}"))]
    StoreFileRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not delete store file '{path:?}': {source}"))]
    StoreFileDelete {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize stored '{name}': {source}"))]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not deserialize stored '{name}': {source}"))]
    Deserialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not build schedule: {msg}"))]
    Schedule { msg: String },

    #[snafu(display("Could not create file {path:?}: {source}"))]
    CreateFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write file {path:?}: {source}"))]
    WriteFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Remote value of {ty:?} is unresolved. Depends on {depends_on}"))]
    RemoteUnresolved {
        ty: &'static str,
        depends_on: String,
    },

    #[snafu(display("Could not find a resource by the name '{name}'"))]
    MissingResource { name: String },

    #[snafu(display("Invalid definition of '{name}': {error}"))]
    Validate {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' read and import: {error}"))]
    Import {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' update: {error}"))]
    Update {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' refresh: {error}"))]
    Refresh {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Missing previous remote value '{name}'"))]
    Load { name: String },

    #[snafu(display(
        "Loading '{id}' would clobber an existing value in the store file, \
        and these values are not the same"
    ))]
    Clobber { id: String },

    #[snafu(display("Could not downcast"))]
    Downcast,

    #[snafu(display("Missing store file for '{id}'"))]
    MissingStoreFile { id: String },

    #[snafu(display("Could not scan store directory '{path:?}': {source}"))]
    ScanStoreDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        Error::Sky { source }
    }
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// IaC resources.
///
/// Represents a resource created on a platform (ie AWS).
///
/// The implementing type is the schema's configurable half, `Output` is
/// the computed half.
#[allow(unreachable_code)]
pub trait Resource:
    core::fmt::Debug
    + Clone
    + PartialEq
    + HasDependencies
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
    /// Type of the platform/resource provider.
    ///
    /// For example [`aws::AwsProvider`] in the case of amazon web services.
    type Provider;

    /// Errors that may occur interacting with the provider.
    type Error: UserError;

    /// The remote type of this resource, which we can used to fill in
    /// [`Remote`] values in other resources.
    type Output: core::fmt::Debug
        + Clone
        + PartialEq
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static;

    /// Creates a new resource on the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// It allows you to define only the methods you need, for example a
    /// read-only lookup only implements [`Resource::read`].
    fn create(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::create is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Reads the current state of the resource from the platform.
    ///
    /// This is used to import pre-existing resources and to run read-only
    /// lookups.
    fn read(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::read is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Reads the current state of a resource this store created before.
    ///
    /// Used to detect drift. Resources that are identified by a value the
    /// platform assigned (an id or ARN in `previous_remote`) override this;
    /// the default looks the resource up with [`Resource::read`].
    fn refresh(
        &self,
        provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        self.read(provider)
    }

    /// Updates an existing resource on the platform.
    ///
    /// `previous_remote` is the last known remote state. During drift
    /// reconciliation it is the freshly observed state and `previous_local`
    /// is the current definition itself, so implementations should compare
    /// against the observed values in `previous_remote` where they can.
    fn update(
        &self,
        _provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::update is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Deletes a resource from the platform.
    ///
    /// Errors for which [`Resource::is_missing`] returns `true` are treated
    /// as a successful deletion.
    fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        unimplemented!(
            "Resource::delete is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Checks the configurable values before anything is scheduled.
    fn validate(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Returns `true` when the change from `previous` can't be applied in
    /// place, and the resource must be deleted and created again.
    fn requires_replacement(&self, _previous: &Self) -> bool {
        false
    }

    /// Returns `true` when `error` means the remote object does not exist.
    fn is_missing(_error: &Self::Error) -> bool {
        false
    }
}

#[derive(Clone, Default, Debug)]
pub struct Dependencies {
    /// Specifies a dependency on a `Resource`.
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.join(", "))
    }
}

impl Dependencies {
    pub fn merge(self, other: Self) -> Self {
        let mut inner = self.inner;
        for dep in other.inner {
            if !inner.contains(&dep) {
                inner.push(dep);
            }
        }
        Dependencies { inner }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Tracks dependencies between resources.
///
/// This trait can be derived, and has a default implementation that
/// reports zero dependencies.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

/// `Create`, `Read`, `Load`, `Refresh` and `Update` result in a resource
/// being added to the graph.
///
/// `Destroy` moves the resource out of the graph.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    Load,
    Create,
    Read,
    Refresh,
    Update,
    Destroy,
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Load => "load",
            Action::Create => "create",
            Action::Read => "read",
            Action::Refresh => "refresh",
            Action::Update => "update",
            Action::Destroy => "destroy",
        })
    }
}

impl Action {
    /// Whether downstream resources may see a different remote value
    /// after this action runs.
    fn is_stale(&self) -> bool {
        !matches!(self, Action::Load | Action::Refresh)
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct InertStoreResource {
    name: String,
    local: serde_json::Value,
    remote: serde_json::Value,
    /// The Rust type name of the resource (via `std::any::type_name::<T>()`).
    /// Used for orphan detection and auto-deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_name: Option<String>,
    /// The resource IDs this resource depends on.
    /// Used for ordering orphan deletions correctly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependencies: Option<Vec<String>>,
}

impl InertStoreResource {
    async fn save(
        &self,
        resource_id: &str,
        store_path: impl AsRef<std::path::Path>,
    ) -> Result<(), Error> {
        let path = store_file_path(resource_id, &store_path);
        log::info!("storing {resource_id} to {path:?}");

        let contents = serde_json::to_string_pretty(self).context(SerializeSnafu {
            name: format!("storing {}", resource_id),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(&parent)
                .await
                .context(CreateFileSnafu { path: parent })?;
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .context(CreateFileSnafu { path: path.clone() })?;
        file.write_all(contents.as_bytes())
            .await
            .context(WriteFileSnafu { path: path.clone() })?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct StoreResource<L, R> {
    /// Name of the resource from the user's perspective
    name: String,
    /// Local definition in _code_
    local_definition: L,
    action: Action,
    remote_var: RemoteVar<R>,
}

impl<L, R> Deref for StoreResource<L, R> {
    type Target = L;

    fn deref(&self) -> &Self::Target {
        &self.local_definition
    }
}

impl<L, R> AsRef<L> for StoreResource<L, R> {
    fn as_ref(&self) -> &L {
        &self.local_definition
    }
}

impl<T> StoreResource<T, T::Output>
where
    T: Resource,
    T::Output: Clone,
{
    /// Map a remote value to use in local definitions.
    pub fn remote<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: impl Fn(&T::Output) -> X + 'static,
    ) -> Remote<X> {
        Remote::new(self, f)
    }

    /// Return the action that would be applied to this resource.
    ///
    /// This is useful if you need to trigger invalidations or anything else based on
    /// whether a resource is created, updated, deleted, etc.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The resource's id in the store.
    pub fn id(&self) -> &str {
        &self.name
    }
}

/// The path to an individual resource store file.
fn store_file_path(name: &str, store_path: impl AsRef<std::path::Path>) -> std::path::PathBuf {
    store_path.as_ref().join(format!("{name}.json"))
}

/// Extract `depends_on` resource IDs from a serialized local definition.
///
/// Walks the JSON tree looking for `{"depends_on": "..."}` patterns,
/// which is how [`Remote`] serializes.
fn extract_depends_on_from_json(value: &serde_json::Value) -> Vec<String> {
    let mut deps = Vec::new();
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(dep)) = map.get("depends_on") {
                deps.push(dep.clone());
            }
            for v in map.values() {
                deps.extend(extract_depends_on_from_json(v));
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr {
                deps.extend(extract_depends_on_from_json(v));
            }
        }
        _ => {}
    }
    deps
}

/// Indents every line of `value`'s pretty diff against `other`.
fn indented_diff<T: core::fmt::Debug + PartialEq>(value: &T, other: &T) -> String {
    let cmp = pretty_assertions::Comparison::new(value, other);
    format!("{cmp}")
        .lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

type StoreNodeRunFn<Provider> = Box<
    dyn FnOnce(
        // Resource platform provider
        &'_ Provider,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + '_>>,
>;

/// Deletes a resource, treating "already gone" as success.
async fn delete_tolerating_missing<T: Resource>(
    resource_id: &str,
    local: &T,
    provider: &T::Provider,
    remote: &T::Output,
) -> Result<()> {
    match local.delete(provider, remote).await {
        Ok(()) => Ok(()),
        Err(error) if T::is_missing(&error) => {
            log::warn!("  '{resource_id}' was already deleted: {error}");
            Ok(())
        }
        Err(error) => Err(Error::Destroy {
            name: resource_id.to_owned(),
            error: Box::new(error),
        }),
    }
}

struct RunAction<'a, Provider, T: Resource<Provider = Provider>> {
    provider: &'a Provider,
    store_path: std::path::PathBuf,
    /// Name of the resource being acted on, not the node name.
    resource_id: String,
    action: Action,
    local_definition_code: T,
    local_definition_store: Option<T>,
    remote_var: RemoteVar<T::Output>,
}

impl<Provider, T: Resource<Provider = Provider>> RunAction<'_, Provider, T> {
    async fn run(self) -> Result<()>
    where
        T: Resource,
    {
        let Self {
            provider,
            store_path,
            resource_id,
            action,
            local_definition_code,
            local_definition_store,
            remote_var,
        } = self;
        log::info!("{action} '{resource_id}':");

        async fn save<T: Resource>(
            resource_id: &str,
            local_definition_code: T,
            remote_var: &RemoteVar<T::Output>,
            store_path: impl AsRef<std::path::Path>,
        ) -> Result<(), Error> {
            let deps: Vec<String> = local_definition_code.dependencies().into_iter().collect();
            let inert_resource = InertStoreResource {
                name: resource_id.to_owned(),
                local: serde_json::to_value(&local_definition_code).context(SerializeSnafu {
                    name: format!("store {resource_id}"),
                })?,
                remote: serde_json::to_value(
                    remote_var.get().context(LoadSnafu { name: resource_id })?,
                )
                .context(SerializeSnafu {
                    name: format!("store {resource_id} remote"),
                })?,
                type_name: Some(std::any::type_name::<T>().to_owned()),
                dependencies: if deps.is_empty() { None } else { Some(deps) },
            };
            inert_resource.save(resource_id, store_path).await?;
            Ok(())
        }

        let create = |local: &T| {
            let resource_id = resource_id.clone();
            let local = local.clone();
            async move {
                local
                    .create(provider)
                    .await
                    .map_err(|error| Error::Create {
                        name: resource_id,
                        error: Box::new(error),
                    })
            }
        };

        match action {
            Action::Load => {
                save(&resource_id, local_definition_code, &remote_var, store_path).await?;
            }
            Action::Create => {
                let value = create(&local_definition_code).await?;
                remote_var.set(Some(value));
                save(&resource_id, local_definition_code, &remote_var, store_path).await?;
            }
            Action::Read => {
                let value = local_definition_code
                    .read(provider)
                    .await
                    .map_err(|error| Error::Import {
                        name: resource_id.to_owned(),
                        error: Box::new(error),
                    })?;
                remote_var.set(Some(value));
                save(&resource_id, local_definition_code, &remote_var, store_path).await?;
            }
            Action::Refresh => {
                let previous_remote = remote_var.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                match local_definition_code
                    .refresh(provider, &previous_remote)
                    .await
                {
                    Ok(observed) if observed == previous_remote => {
                        log::debug!("  no drift detected");
                    }
                    Ok(observed) => {
                        log::warn!(
                            "'{resource_id}' has drifted from its recorded state:\n{}",
                            indented_diff(&previous_remote, &observed)
                        );
                        let output = local_definition_code
                            .update(provider, &local_definition_code, &observed)
                            .await
                            .map_err(|error| Error::Refresh {
                                name: resource_id.clone(),
                                error: Box::new(error),
                            })?;
                        remote_var.set(Some(output));
                    }
                    Err(error) if T::is_missing(&error) => {
                        log::warn!(
                            "'{resource_id}' no longer exists on the platform, recreating it"
                        );
                        let output = create(&local_definition_code).await?;
                        remote_var.set(Some(output));
                    }
                    Err(error) => {
                        return Err(Error::Refresh {
                            name: resource_id,
                            error: Box::new(error),
                        });
                    }
                }
                save(&resource_id, local_definition_code, &remote_var, store_path).await?;
            }
            Action::Update => {
                let previous_local = local_definition_store.context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                let previous_remote = remote_var.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                if previous_local == local_definition_code {
                    log::warn!(
                        "Skipping '{resource_id}' update as the local value has not changed.\n\
                        If you require an update, consider adding a sentinel value."
                    );
                } else if local_definition_code.requires_replacement(&previous_local) {
                    log::info!(
                        "replacing '{resource_id}':\n{}",
                        indented_diff(&previous_local, &local_definition_code)
                    );
                    delete_tolerating_missing(
                        &resource_id,
                        &previous_local,
                        provider,
                        &previous_remote,
                    )
                    .await?;
                    let output = create(&local_definition_code).await?;
                    remote_var.set(Some(output));
                    save(&resource_id, local_definition_code, &remote_var, store_path).await?;
                } else {
                    log::info!(
                        "updating '{resource_id}':\n{}",
                        indented_diff(&previous_local, &local_definition_code)
                    );
                    let output = local_definition_code
                        .update(provider, &previous_local, &previous_remote)
                        .await
                        .map_err(|error| Error::Update {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    remote_var.set(Some(output));
                    save(&resource_id, local_definition_code, &remote_var, store_path).await?;
                }
            }
            Action::Destroy => {
                log::debug!("running destroy action on {resource_id}");
                // In the destroy case there is no code-local definition, but there is always
                // a store definition, so we pass the store definition as the code definition.
                let previous_remote = remote_var.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                delete_tolerating_missing(
                    &resource_id,
                    &local_definition_code,
                    provider,
                    &previous_remote,
                )
                .await?;

                log::info!("  {resource_id} is destroyed");
                let path = store_file_path(&resource_id, &store_path);
                log::info!("  removing {resource_id} store file {path:?}");
                tokio::fs::remove_file(&path)
                    .await
                    .context(StoreFileDeleteSnafu { path })?;
                remote_var.set(None);
            }
        }

        log::info!("  success!");
        Ok(())
    }
}

pub struct DestroyResource<T: Resource> {
    local: T,
    remote: T::Output,
}

impl<T: Resource> Deref for DestroyResource<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.local
    }
}

impl<T: Resource> DestroyResource<T> {
    /// Map a remote value of a resource scheduled to be destroyed into a
    /// permanent field of another resource.
    pub fn migrate<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: fn(&T::Output) -> X,
    ) -> Migrated<X> {
        Migrated(f(&self.remote))
    }
}

struct StoreNode<Provider> {
    name: String,
    run: StoreNodeRunFn<Provider>,
}

/// How a node relates to the resource it acts on.
#[derive(Clone, Copy, Debug)]
enum Edge {
    /// The node introduces the resource.
    Result(usize),
    /// The node consumes the resource.
    Move(usize),
}

/// A printable copy of a node, kept for [`Store::get_schedule_string`].
#[derive(Clone, Debug)]
struct NodeSummary {
    name: String,
    reads: Vec<usize>,
    edge: Edge,
}

struct PreviouslyStored<T: Resource> {
    action: Action,
    resource: Option<(T, T::Output)>,
}

/// A type-erased delete function for a specific resource type.
///
/// Constructed automatically when a resource type is first used (via
/// [`Store::resource`], [`Store::import`], [`Store::load`], or
/// [`Store::destroy`]), or manually via [`Store::register`]. Produces a
/// [`StoreNodeRunFn`] that reads the store file, deserializes it into the
/// concrete type, calls `T::delete()`, and removes the file.
struct ResourceDeleter<Provider> {
    make_run_fn: Box<
        dyn Fn(
            std::path::PathBuf, // store_path
            String,             // resource_id
        ) -> StoreNodeRunFn<Provider>,
    >,
}

/// A single planned action for a resource.
#[derive(Clone, Debug)]
pub struct PlannedAction {
    /// The resource ID.
    pub id: String,
    /// The action to be taken.
    pub action: Action,
    /// The Rust type name, if known.
    pub type_name: Option<String>,
    /// Whether this is an auto-detected orphan.
    pub is_orphan: bool,
}

/// A plan of actions produced by [`Store::plan`].
///
/// Inspect the plan before passing it to [`Store::apply`] to execute.
pub struct Plan<Provider> {
    /// The planned actions, in schedule order.
    pub actions: Vec<PlannedAction>,
    /// Resources that appear orphaned but could not be auto-deleted
    /// (unregistered type or missing `type_name` in store file).
    pub warnings: Vec<String>,
    /// Internal: the built schedule.
    schedule: Schedule<Node<StoreNode<Provider>, usize>>,
}

impl<Provider> Plan<Provider> {
    /// Whether applying this plan would change anything on the platform.
    pub fn has_changes(&self) -> bool {
        self.actions
            .iter()
            .any(|a| !matches!(a.action, Action::Load))
    }
}

impl<Provider> core::fmt::Display for Plan<Provider> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            f.write_str("No changes.\n")?;
            return Ok(());
        }
        for action in &self.actions {
            let orphan_marker = if action.is_orphan { " (orphan)" } else { "" };
            let ty = action.type_name.as_deref().unwrap_or("unknown");
            writeln!(
                f,
                "  {} '{}' [{}]{}",
                action.action, action.id, ty, orphan_marker
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "  WARNING: {warning}")?;
        }
        Ok(())
    }
}

pub struct Store<T> {
    path: std::path::PathBuf,
    provider: T,
    refresh: bool,
    remotes: Remotes,
    graph: dagga::Dag<StoreNode<T>, usize>,
    summaries: Vec<NodeSummary>,
    deleters: std::collections::HashMap<String, ResourceDeleter<T>>,
}

impl<P: 'static> Store<P> {
    fn read_from_store<T: Resource<Provider = P>>(
        path: impl AsRef<std::path::Path>,
        id: &str,
    ) -> Result<(T, T::Output)> {
        let path = store_file_path(id, path.as_ref());
        snafu::ensure!(path.exists(), MissingStoreFileSnafu { id: id.to_owned() });

        log::debug!("{path:?} exists, reading '{id}' from it");
        let contents = std::fs::read_to_string(&path).context(StoreFileReadSnafu {
            path: path.to_path_buf(),
        })?;
        log::trace!(
            "contents:\n{}",
            contents
                .lines()
                .map(|line| format!("  {line}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let inert_store_rez: InertStoreResource =
            serde_json::from_str(&contents).context(DeserializeSnafu {
                name: id.to_owned(),
            })?;
        log::trace!("as {}", std::any::type_name::<T>());
        let stored_definition: T =
            serde_json::from_value(inert_store_rez.local).context(DeserializeSnafu {
                name: id.to_owned(),
            })?;

        log::trace!("  reading remote output JSON value");
        let remote_value: T::Output =
            serde_json::from_value(inert_store_rez.remote).context(DeserializeSnafu {
                name: format!("remote {id}"),
            })?;
        Ok((stored_definition, remote_value))
    }

    pub fn new(path: impl AsRef<std::path::Path>, provider: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            provider,
            refresh: false,
            remotes: Default::default(),
            graph: dagga::Dag::default(),
            summaries: Default::default(),
            deleters: Default::default(),
        }
    }

    /// Read unchanged resources back from the platform during apply,
    /// reconciling any drift.
    ///
    /// Must be set before resources are declared.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Ensure a resource type is registered for orphan auto-deletion.
    fn ensure_registered<T>(&mut self)
    where
        T: Resource<Provider = P>,
    {
        let type_name = std::any::type_name::<T>();
        if self.deleters.contains_key(type_name) {
            return;
        }
        self.deleters.insert(
            type_name.to_owned(),
            ResourceDeleter {
                make_run_fn: Box::new(|store_path, resource_id| {
                    Box::new(move |provider: &P| {
                        Box::pin(async move {
                            let (local, remote): (T, T::Output) =
                                Self::read_from_store(&store_path, &resource_id)?;
                            log::info!("destroy '{resource_id}' (orphan auto-delete):");
                            delete_tolerating_missing(&resource_id, &local, provider, &remote)
                                .await?;
                            let path = store_file_path(&resource_id, &store_path);
                            log::info!("  removing {resource_id} store file {path:?}");
                            tokio::fs::remove_file(&path)
                                .await
                                .context(StoreFileDeleteSnafu { path })?;
                            log::info!("  {resource_id} destroyed");
                            Ok(())
                        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                    })
                }),
            },
        );
    }

    /// Register a resource type for automatic orphan detection and deletion.
    ///
    /// Resource types are registered automatically whenever they are used
    /// via [`Store::resource`], [`Store::import`], [`Store::data`],
    /// [`Store::load`] or [`Store::destroy`]. You only need to call this
    /// for types that are **not** declared in the current run but may still
    /// have orphaned store files from a previous apply.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: Resource<Provider = P>,
    {
        self.ensure_registered::<T>();
        self
    }

    fn read_file<T>(&self, id: &str) -> Result<(T, T::Output), Error>
    where
        T: Resource<Provider = P>,
    {
        Self::read_from_store(&self.path, id)
    }

    /// Resolves the graph keys of the given dependencies.
    fn dependency_keys(&self, id: &str, deps: Dependencies) -> Result<Vec<usize>> {
        let mut reads = vec![];
        for dep in deps {
            let var = self.remotes.get(&dep).context(MissingResourceSnafu {
                name: format!("{dep} (required by {id})"),
            })?;
            reads.push(var.key);
        }
        Ok(reads)
    }

    fn add_node(&mut self, name: String, run: StoreNodeRunFn<P>, reads: Vec<usize>, edge: Edge) {
        log::debug!("adding node {name} with {edge:?}");
        self.summaries.push(NodeSummary {
            name: name.clone(),
            reads: reads.clone(),
            edge,
        });
        let node = dagga::Node::new(StoreNode {
            name: name.clone(),
            run,
        })
        .with_name(name)
        .with_reads(reads);
        let node = match edge {
            Edge::Result(rez) => node.with_result(rez),
            Edge::Move(rez) => node.with_move(rez),
        };
        self.graph.add_node(node);
    }

    fn run_action_fn<T>(
        &self,
        id: &str,
        action: Action,
        local_definition_code: T,
        local_definition_store: Option<T>,
        remote_var: RemoteVar<T::Output>,
    ) -> StoreNodeRunFn<P>
    where
        T: Resource<Provider = P>,
    {
        let resource_id = id.to_owned();
        let store_path = self.path.clone();
        Box::new(move |provider: &P| {
            Box::pin(
                RunAction {
                    provider,
                    store_path,
                    resource_id,
                    action,
                    local_definition_code,
                    local_definition_store,
                    remote_var,
                }
                .run(),
            )
        })
    }

    fn validate<T>(id: &str, local_definition: &T) -> Result<()>
    where
        T: Resource<Provider = P>,
    {
        local_definition.validate().map_err(|error| {
            log::error!("'{id}' is invalid: {error}");
            Error::Validate {
                name: id.to_owned(),
                error: Box::new(error),
            }
        })
    }

    fn define_resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        action: Action,
        stored_definition: Option<T>,
        output: Option<T::Output>,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.ensure_registered::<T>();
        let id = id.as_ref();
        let (remote_var, rez, _ty) = self.remotes.dequeue_var::<T::Output>(id, action)?;
        remote_var.set(output);

        let reads = self.dependency_keys(id, local_definition.dependencies())?;
        let run = self.run_action_fn(
            id,
            action,
            local_definition.clone(),
            stored_definition,
            remote_var.clone(),
        );
        let edge = match action {
            Action::Create | Action::Read | Action::Load | Action::Refresh | Action::Update => {
                Edge::Result(rez)
            }
            Action::Destroy => Edge::Move(rez),
        };
        self.add_node(format!("{action} {id}"), run, reads, edge);

        Ok(StoreResource {
            name: id.to_owned(),
            local_definition,
            action,
            remote_var,
        })
    }

    /// Read the stored previous definition and determine the action.
    fn determine_action_from_previously_stored<T>(
        &self,
        local_definition: &T,
        id: &str,
    ) -> Result<PreviouslyStored<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        match self.read_file(id) {
            Ok((stored_definition, output)) => {
                // This has already been created and stored, so this is either a simple load,
                // or an update.
                log::debug!("  {output:?}");
                let action = if *local_definition != stored_definition {
                    log::debug!("  local resource has changed, so this remote is now stale");
                    Action::Update
                } else {
                    // Check if any upstream dependencies are "stale" (updated or deleted),
                    // which would cause this resource to possibly require an update.
                    let mut may_need_update = false;
                    for dep in local_definition.dependencies() {
                        let var = self.remotes.get(&dep).context(LoadSnafu { name: dep })?;
                        if var.action.is_stale() {
                            may_need_update = true;
                            break;
                        }
                    }
                    if may_need_update {
                        Action::Update
                    } else if self.refresh {
                        Action::Refresh
                    } else {
                        Action::Load
                    }
                };

                Ok(PreviouslyStored {
                    action,
                    resource: Some((stored_definition, output)),
                })
            }
            Err(Error::MissingStoreFile { id }) => {
                log::debug!("store file '{id}' does not exist, creating a new resource",);
                Ok(PreviouslyStored {
                    action: Action::Create,
                    resource: None,
                })
            }
            Err(e) => {
                log::error!("could not define resource '{id}': {e}");
                Err(e)
            }
        }
    }

    /// Defines a resource.
    ///
    /// Depending on the result of comparing `local_definition` to the one on
    /// file (if it exists), the resource is either:
    /// - created on the platform
    /// - updated (or replaced) on the platform
    /// - refreshed from the platform, when [`Store::with_refresh`] is set
    /// - loaded from its file
    ///
    /// and the result is stored to a file.
    ///
    /// To import an existing resource from a platform, use [`Store::import`].
    pub fn resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        Self::validate(id, &local_definition)?;
        let PreviouslyStored { action, resource } =
            self.determine_action_from_previously_stored(&local_definition, id)?;
        let (local, remote) = resource
            .map(|(local, remote)| (Some(local), Some(remote)))
            .unwrap_or_default();
        self.define_resource(id, local_definition, action, local, remote)
    }

    /// Defines a pre-existing resource, importing it from the platform.
    ///
    /// This only needs to be used once in your infrastructure command.
    /// After the resource is imported and stored to a file it is recommended
    /// you make a code change to use [`Store::resource`].
    pub fn import<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        Self::validate(id, &local_definition)?;
        self.define_resource(id, local_definition, Action::Read, None, None)
    }

    /// Defines a read-only lookup of something that exists on the platform.
    ///
    /// Unlike [`Store::import`] this is meant to stay in your infrastructure
    /// command: the lookup runs on every apply, so its remote values always
    /// reflect the platform. Destroying a lookup only removes its store file.
    pub fn data<T>(
        &mut self,
        id: impl AsRef<str>,
        query: T,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        Self::validate(id, &query)?;
        log::debug!("looking up '{id}'");
        self.define_resource(id, query, Action::Read, None, None)
    }

    /// Defines a pre-existing resource, directly writing it to file, without
    /// querying the platform.
    ///
    /// ## Errors
    /// Errs if `force_overwrite` is `false` _and_ a stored resource already
    /// exists. This is done to prevent accidental clobbering.
    pub fn load<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        remote_definition: T::Output,
        force_overwrite: bool,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        if let Ok((stored_definition, output)) = self.read_file(id) {
            if local_definition != stored_definition || remote_definition != output {
                if force_overwrite {
                    log::warn!("loading '{id}' is clobbering an existing value, but `force_overwrite` is `true`");
                } else {
                    let err = ClobberSnafu { id: id.to_owned() }.build();
                    log::error!("{err}");
                    return Err(err);
                }
            }
        }
        self.define_resource(
            id,
            local_definition,
            Action::Load,
            None,
            Some(remote_definition),
        )
    }

    /// Destroys a resource.
    pub fn destroy<T>(&mut self, id: impl AsRef<str>) -> Result<DestroyResource<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.ensure_registered::<T>();
        let id = id.as_ref();
        let (local, remote) = self.read_file::<T>(id)?;
        let (remote_var, rez, _ty) = self.remotes.dequeue_var::<T::Output>(id, Action::Destroy)?;
        remote_var.set(Some(remote.clone()));

        // Destruction requires a load to introduce the resource (for the DAG)
        let reads = self.dependency_keys(id, local.dependencies())?;
        let load = self.run_action_fn(id, Action::Load, local.clone(), None, remote_var.clone());
        self.add_node(format!("load {id}"), load, reads, Edge::Result(rez));

        let destroy = self.run_action_fn(id, Action::Destroy, local.clone(), None, remote_var);
        self.add_node(format!("destroy {id}"), destroy, vec![], Edge::Move(rez));

        Ok(DestroyResource { local, remote })
    }

    /// Acknowledge an orphaned resource and prepare it for migration.
    ///
    /// Use this when removing a resource that other resources still depend
    /// on. The returned [`DestroyResource`] provides
    /// [`DestroyResource::migrate`] for extracting values into
    /// [`Migrated`] fields on other resources.
    pub fn pending_destroy<T>(&mut self, id: impl AsRef<str>) -> Result<DestroyResource<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.destroy(id)
    }

    /// Forget every declared resource while keeping the registered types.
    ///
    /// Planning afterwards schedules every stored resource of a registered
    /// type for deletion.
    pub fn clear_resources(&mut self) {
        log::debug!("clearing {} declared resources", self.summaries.len());
        self.remotes = Remotes::default();
        self.graph = dagga::Dag::default();
        self.summaries.clear();
    }

    pub fn get_schedule_string(&self) -> Result<String, Error> {
        let mut dag: dagga::Dag<(), usize> = dagga::Dag::default();
        for summary in self.summaries.iter() {
            let node = dagga::Node::new(())
                .with_name(summary.name.clone())
                .with_reads(summary.reads.clone());
            dag.add_node(match summary.edge {
                Edge::Result(rez) => node.with_result(rez),
                Edge::Move(rez) => node.with_move(rez),
            });
        }
        struct Proxy {
            inner: Schedule<Node<(), usize>>,
        }

        impl core::fmt::Display for Proxy {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.inner.batches.is_empty() {
                    f.write_str("--- No changes.\n")?;
                }
                for (i, batch) in self.inner.batches.iter().enumerate() {
                    let i = i + 1;
                    f.write_str("--- step ")?;
                    f.write_fmt(format_args!("{i}\n"))?;
                    for node in batch.iter() {
                        f.write_str("  ")?;
                        f.write_str(node.name())?;
                        f.write_str("\n")?;
                    }
                    f.write_str("---\n")?;
                }
                Ok(())
            }
        }

        let proxy = Proxy {
            inner: dag
                .build_schedule()
                .map_err(|e| Error::Schedule { msg: e.to_string() })?,
        };
        Ok(proxy.to_string())
    }

    /// Scan the store directory and build an execution plan.
    ///
    /// Compares declared resources (from [`Store::resource`],
    /// [`Store::destroy`], etc.) against store files on disk. Resources
    /// found on disk but not declared are flagged as orphans.
    ///
    /// Orphans whose types are registered are automatically scheduled for
    /// deletion. Unregistered orphans produce warnings.
    pub fn plan(&mut self) -> Result<Plan<P>> {
        let mut actions = Vec::new();
        let mut warnings = Vec::new();

        let declared_ids = self.remotes.declared_ids();

        for (id, var) in self.remotes.iter() {
            actions.push(PlannedAction {
                id: id.clone(),
                action: var.action,
                type_name: Some(var.ty.to_owned()),
                is_orphan: false,
            });
        }

        // Scan the store directory for .json files to detect orphans
        let store_dir = self.path.clone();
        if store_dir.exists() {
            let entries = std::fs::read_dir(&store_dir).context(ScanStoreDirSnafu {
                path: store_dir.clone(),
            })?;

            let mut paths = vec![];
            for entry in entries {
                let entry = entry.context(ScanStoreDirSnafu {
                    path: store_dir.clone(),
                })?;
                paths.push(entry.path());
            }
            paths.sort();

            for path in paths {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let file_stem = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(s) => s.to_owned(),
                    None => continue,
                };

                if declared_ids.contains(&file_stem) {
                    continue;
                }

                let contents =
                    std::fs::read_to_string(&path).context(StoreFileReadSnafu { path: &path })?;
                let inert: InertStoreResource =
                    serde_json::from_str(&contents).context(DeserializeSnafu {
                        name: file_stem.clone(),
                    })?;

                let type_name = inert.type_name.clone();
                let run_fn = type_name
                    .as_ref()
                    .and_then(|tn| self.deleters.get(tn))
                    .map(|deleter| (deleter.make_run_fn)(self.path.clone(), file_stem.clone()));

                if let Some(run_fn) = run_fn {
                    log::info!(
                        "orphan detected: '{file_stem}' (type: {}), scheduling auto-delete",
                        type_name.as_deref().unwrap_or("unknown")
                    );

                    // Register orphan in remotes so the DAG can track it
                    let (remote_var, rez, _ty) = self
                        .remotes
                        .dequeue_var::<serde_json::Value>(&file_stem, Action::Destroy)?;
                    remote_var.set(Some(inert.remote.clone()));

                    // Use the explicit dependencies field if available,
                    // otherwise fall back to parsing depends_on from JSON.
                    let stored_deps = inert
                        .dependencies
                        .clone()
                        .unwrap_or_else(|| extract_depends_on_from_json(&inert.local));
                    let dep_keys: Vec<usize> = stored_deps
                        .iter()
                        .filter_map(|dep| self.remotes.get(dep).map(|v| v.key))
                        .collect();

                    let load_run: StoreNodeRunFn<P> = Box::new({
                        let resource_id = file_stem.clone();
                        move |_provider: &P| {
                            Box::pin(async move {
                                log::debug!("loading orphan '{resource_id}' for deletion");
                                Ok(())
                            })
                                as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                        }
                    });
                    self.add_node(
                        format!("load {file_stem}"),
                        load_run,
                        dep_keys,
                        Edge::Result(rez),
                    );
                    self.add_node(
                        format!("destroy {file_stem}"),
                        run_fn,
                        vec![],
                        Edge::Move(rez),
                    );

                    actions.push(PlannedAction {
                        id: file_stem,
                        action: Action::Destroy,
                        type_name,
                        is_orphan: true,
                    });
                    continue;
                }

                // Can't auto-delete: the resource type wasn't used in this run
                // and wasn't manually registered, so we don't have a deleter.
                let msg = match &type_name {
                    Some(tn) => format!(
                        "Orphaned resource '{file_stem}' (type: {tn}) found in the store \
                        directory but its type is not known to this run. Call \
                        `store.register::<{tn}>()` to enable automatic deletion, or use \
                        `store.destroy::<{tn}>(\"{file_stem}\")` to delete it explicitly."
                    ),
                    None => format!(
                        "Orphaned resource '{file_stem}' found in the store directory but \
                        its store file has no type_name. Use \
                        `store.destroy(\"{file_stem}\")` to delete it explicitly."
                    ),
                };
                log::warn!("{msg}");
                warnings.push(msg);
            }
        }

        let graph = std::mem::take(&mut self.graph);
        self.summaries.clear();
        let schedule = graph
            .build_schedule()
            .map_err(|e| Error::Schedule { msg: e.to_string() })?;

        // Reorder actions to match the schedule's execution order.
        // Node names are "{action} {id}" (e.g. "create role"). The first
        // occurrence of an id in schedule order is its canonical position.
        let mut ordered_actions = Vec::with_capacity(actions.len());
        let mut seen = std::collections::HashSet::new();
        for batch in &schedule.batches {
            for node in batch {
                let id = node
                    .name()
                    .split_once(' ')
                    .map(|(_, id)| id)
                    .unwrap_or(node.name());
                if seen.insert(id.to_owned()) {
                    if let Some(pos) = actions.iter().position(|a| a.id == id) {
                        ordered_actions.push(actions.remove(pos));
                    }
                }
            }
        }
        ordered_actions.extend(actions);

        Ok(Plan {
            actions: ordered_actions,
            warnings,
            schedule,
        })
    }

    /// Execute a plan previously built by [`Store::plan`].
    pub async fn apply(&mut self, plan: Plan<P>) -> Result<()> {
        for (i, batch) in plan.schedule.batches.into_iter().enumerate() {
            for (j, node) in batch.into_iter().enumerate() {
                log::debug!("applying node {j}, batch {i}");
                let store_node = node.into_inner();
                log::trace!("  {}", store_node.name);
                (store_node.run)(&self.provider).await?;
            }
        }
        Ok(())
    }
}
