//! Remote values.
//!
//! Remote values are computed attributes, known only after a resource has
//! been created on (or read from) AWS. They let one resource's definition
//! refer to another resource's outputs, eg a web ACL's ARN or a role's
//! ARN, and they carry the dependency edge the store schedules by.

use std::{
    any::Any,
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard},
};

use snafu::OptionExt;

use crate::HasDependencies;

use super::{
    Action, Dependencies, DowncastSnafu, Error, RemoteUnresolvedSnafu, Resource, StoreResource,
};

type VarFn<X> = Arc<dyn Fn(&Arc<dyn Any>) -> Result<X, Error>>;

#[derive(Clone)]
enum RemoteInner<X> {
    /// Deserialized from a store file, holding the value as it was when the
    /// file was written.
    Stored {
        depends_on: String,
        last_known_value: Option<X>,
    },
    /// Mapped from a live resource declared in this run.
    Live {
        depends_on: String,
        map: VarFn<X>,
        // RemoteVar<T::Output>
        var: Arc<dyn Any>,
    },
}

impl<X> RemoteInner<X> {
    fn depends_on(&self) -> &str {
        match self {
            RemoteInner::Stored { depends_on, .. } => depends_on,
            RemoteInner::Live { depends_on, .. } => depends_on,
        }
    }
}

/// A computed attribute of another resource.
#[derive(Clone)]
pub struct Remote<X> {
    inner: RemoteInner<X>,
}

impl<X: Clone + core::fmt::Debug + 'static> std::fmt::Debug for Remote<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("depends_on", &self.inner.depends_on())
            .field("value", &self.get().ok())
            .finish()
    }
}

/// Two remotes are equal when both are resolved to equal values.
///
/// An unresolved remote is never equal to anything, which makes resources
/// depending on a not-yet-created resource compare as changed.
impl<X: Clone + core::fmt::Debug + PartialEq + 'static> PartialEq for Remote<X> {
    fn eq(&self, other: &Self) -> bool {
        match (self.get(), other.get()) {
            (Ok(here), Ok(there)) => here == there,
            _ => false,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RemoteProxy<T> {
    depends_on: String,
    last_known_value: Option<T>,
}

impl<X: serde::Serialize + Clone + core::fmt::Debug + 'static> serde::Serialize for Remote<X> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        RemoteProxy {
            last_known_value: self.get().ok(),
            depends_on: self.inner.depends_on().to_owned(),
        }
        .serialize(serializer)
    }
}

impl<'de, X: serde::Deserialize<'de>> serde::Deserialize<'de> for Remote<X> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let RemoteProxy {
            depends_on,
            last_known_value,
        } = RemoteProxy::<X>::deserialize(deserializer)?;

        Ok(Remote {
            inner: RemoteInner::Stored {
                depends_on,
                last_known_value,
            },
        })
    }
}

impl<X: Clone + core::fmt::Debug + 'static> Remote<X> {
    pub(crate) fn new<T: Resource>(
        resource: &StoreResource<T, T::Output>,
        map: impl Fn(&T::Output) -> X + 'static,
    ) -> Self {
        log::trace!(
            "creating mapping of a remote resource '{}'",
            resource.remote_var.depends_on
        );
        let depends_on = resource.remote_var.depends_on.clone();
        Self {
            inner: RemoteInner::Live {
                map: Arc::new({
                    let depends_on = depends_on.clone();
                    move |any: &Arc<dyn Any>| {
                        let remote_var = any
                            .downcast_ref::<RemoteVar<T::Output>>()
                            .context(DowncastSnafu)?;
                        let t_output = remote_var.get().context(RemoteUnresolvedSnafu {
                            ty: core::any::type_name::<X>(),
                            depends_on: depends_on.clone(),
                        })?;
                        Ok(map(&t_output))
                    }
                }),
                depends_on,
                var: Arc::new(resource.remote_var.clone()),
            },
        }
    }

    /// The id of the resource this value is computed by.
    pub fn depends_on(&self) -> &str {
        self.inner.depends_on()
    }

    /// Resolves the value.
    ///
    /// ## Errors
    /// Errs with [`Error::RemoteUnresolved`] if the resource this value
    /// depends on hasn't been created or read yet.
    pub fn get(&self) -> Result<X, Error> {
        match &self.inner {
            RemoteInner::Stored {
                depends_on,
                last_known_value,
            } => {
                log::trace!("remote var returning last known value: {last_known_value:?}");
                last_known_value.clone().context(RemoteUnresolvedSnafu {
                    ty: core::any::type_name::<X>(),
                    depends_on: depends_on.clone(),
                })
            }
            RemoteInner::Live { map, var, .. } => map(var),
        }
    }

    pub fn map<Y>(&self, f: impl Fn(X) -> Y + 'static) -> Remote<Y> {
        match &self.inner {
            RemoteInner::Stored {
                depends_on,
                last_known_value,
            } => Remote {
                inner: RemoteInner::Stored {
                    depends_on: depends_on.clone(),
                    last_known_value: last_known_value.clone().map(f),
                },
            },
            RemoteInner::Live {
                depends_on,
                map,
                var,
            } => Remote {
                inner: RemoteInner::Live {
                    depends_on: depends_on.clone(),
                    var: var.clone(),
                    map: Arc::new({
                        let map = map.clone();
                        move |any: &Arc<dyn Any>| {
                            let x = map(any)?;
                            Ok(f(x))
                        }
                    }),
                },
            },
        }
    }
}

impl<X> HasDependencies for Remote<X> {
    fn dependencies(&self) -> Dependencies {
        Dependencies {
            inner: vec![self.inner.depends_on().to_owned()],
        }
    }
}

/// The shared slot a resource's output is written to when its action runs.
#[derive(Debug)]
pub(crate) struct RemoteVar<T> {
    depends_on: String,
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for RemoteVar<T> {
    fn clone(&self) -> Self {
        Self {
            depends_on: self.depends_on.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> RemoteVar<T> {
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panic while holding the lock can't leave an `Option` half written.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    pub fn set(&self, value: Option<T>) {
        *self.lock() = value;
    }
}

pub(crate) struct Var {
    pub(crate) key: usize,
    pub(crate) ty: &'static str,
    pub(crate) action: Action,
    pub(crate) remote: Box<dyn core::any::Any>,
}

#[derive(Default)]
pub(crate) struct Remotes {
    /// Map of resource name to key + RemoteVar<T>
    vars: HashMap<String, Var>,
}

impl Remotes {
    /// Returns a new `RemoteVar<T>` and its resource key.
    ///
    /// ## Errors
    /// Errs if a var by the given name exists but is of a different type than the type
    /// requested.
    pub fn dequeue_var<T: Any>(
        &mut self,
        id: &str,
        action: Action,
    ) -> Result<(RemoteVar<T>, usize, &'static str), Error> {
        log::trace!(
            "requested remote var '{id}' of type {}",
            core::any::type_name::<T>()
        );
        let next_k = self.vars.len();
        let var = self.vars.entry(id.to_owned()).or_insert_with(|| {
            log::trace!("   but one doesn't exist, so we're creating a new entry '{next_k}'");
            Var {
                key: next_k,
                ty: std::any::type_name::<T>(),
                action,
                remote: Box::new(RemoteVar::<T> {
                    depends_on: id.to_owned(),
                    inner: Default::default(),
                }),
            }
        });
        let remote: &RemoteVar<T> = var.remote.downcast_ref().context(DowncastSnafu)?;
        Ok((remote.clone(), var.key, var.ty))
    }

    /// Returns the var of the resource with the given name.
    pub fn get(&self, id: &str) -> Option<&Var> {
        self.vars.get(id)
    }

    /// Returns the set of all declared resource IDs.
    pub fn declared_ids(&self) -> std::collections::HashSet<String> {
        self.vars.keys().cloned().collect()
    }

    /// Iterate over all declared resources, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Var)> {
        let mut vars = self.vars.iter().collect::<Vec<_>>();
        vars.sort_by_key(|(_, var)| var.key);
        vars.into_iter()
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum MigratedProxy<T> {
    Remote(RemoteProxy<T>),
    Local(T),
}

/// A value taken from a resource that is being destroyed.
///
/// Stored as a plain value, so it carries no dependency.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(try_from = "MigratedProxy<T>")]
pub struct Migrated<T>(pub(crate) T);

impl<T> Deref for Migrated<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> HasDependencies for Migrated<T> {}

impl<T> TryFrom<MigratedProxy<T>> for Migrated<T> {
    type Error = &'static str;

    fn try_from(value: MigratedProxy<T>) -> Result<Self, Self::Error> {
        log::trace!("read a migrated {}", std::any::type_name::<T>());
        match value {
            MigratedProxy::Remote(RemoteProxy {
                depends_on: _,
                last_known_value,
            }) => {
                log::trace!("  from a previous remote");
                last_known_value.map(Migrated).ok_or("Missing last known value")
            }
            MigratedProxy::Local(t) => Ok(Migrated(t)),
        }
    }
}

impl<T: serde::Serialize> serde::Serialize for Migrated<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrated_serializes_as_its_value() {
        let migrated = Migrated("arn:aws:iam::123456789012:role/app".to_owned());
        let s = serde_json::to_string(&migrated).unwrap();
        assert_eq!("\"arn:aws:iam::123456789012:role/app\"", &s);
    }

    #[test]
    fn migrated_reads_a_stored_remote() {
        let s = serde_json::json!({
          "depends_on": "app-role",
          "last_known_value": "arn:aws:iam::123456789012:role/app"
        });
        let migrated: Migrated<String> = serde_json::from_value(s).unwrap();
        assert_eq!("arn:aws:iam::123456789012:role/app", migrated.as_str());
        assert!(migrated.dependencies().is_empty());
    }

    #[test]
    fn migrated_rejects_an_unresolved_remote() {
        let s = serde_json::json!({
          "depends_on": "app-role",
          "last_known_value": null
        });
        assert!(serde_json::from_value::<Migrated<String>>(s).is_err());
    }

    #[test]
    fn stored_remote_round_trips_through_json() {
        let s = serde_json::json!({
          "depends_on": "waf",
          "last_known_value": "arn:aws:wafv2:us-east-1:123456789012:regional/webacl/a/b"
        });
        let remote: Remote<String> = serde_json::from_value(s.clone()).unwrap();
        assert_eq!("waf", remote.depends_on());
        assert_eq!(
            vec!["waf".to_owned()],
            remote.dependencies().into_iter().collect::<Vec<_>>()
        );
        assert_eq!(s, serde_json::to_value(&remote).unwrap());

        let len = remote.map(|arn| arn.len());
        assert_eq!(56, len.get().unwrap());
    }

    #[test]
    fn unresolved_remotes_are_never_equal() {
        let unresolved: Remote<u32> = serde_json::from_value(serde_json::json!({
            "depends_on": "a",
            "last_known_value": null
        }))
        .unwrap();
        assert!(unresolved.get().is_err());
        assert_ne!(unresolved, unresolved.clone());
    }
}
