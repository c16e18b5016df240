//! Implementations of HasDependencies for primitives and containers.
//!
//! Plain values never depend on other resources; containers depend on
//! whatever their elements depend on.

use crate::{self as sky, HasDependencies};

macro_rules! no_dependencies {
    ($($type: ty),* $(,)?) => {
        $(impl HasDependencies for $type {})*
    };
}

no_dependencies!(
    String,
    u8,
    i8,
    u16,
    i16,
    u32,
    i32,
    u64,
    i64,
    u128,
    i128,
    usize,
    f32,
    f64,
    bool,
    serde_json::Value,
    std::path::PathBuf,
);

skyform_derive::impl_has_dependencies_tuples!((A,));
skyform_derive::impl_has_dependencies_tuples!((A, B));
skyform_derive::impl_has_dependencies_tuples!((A, B, C));
skyform_derive::impl_has_dependencies_tuples!((A, B, C, D));
skyform_derive::impl_has_dependencies_tuples!((A, B, C, D, E));
skyform_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F));

fn merge_all<'a, T: HasDependencies + 'a>(
    items: impl IntoIterator<Item = &'a T>,
) -> sky::Dependencies {
    items
        .into_iter()
        .fold(sky::Dependencies::default(), |acc, item| {
            acc.merge(item.dependencies())
        })
}

impl<T: HasDependencies> HasDependencies for Vec<T> {
    fn dependencies(&self) -> sky::Dependencies {
        merge_all(self)
    }
}

impl<T: HasDependencies> HasDependencies for Box<T> {
    fn dependencies(&self) -> sky::Dependencies {
        self.as_ref().dependencies()
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::HashMap<K, V> {
    fn dependencies(&self) -> sky::Dependencies {
        merge_all(self.values())
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::BTreeMap<K, V> {
    fn dependencies(&self) -> sky::Dependencies {
        merge_all(self.values())
    }
}

impl<V: HasDependencies> HasDependencies for std::collections::BTreeSet<V> {
    fn dependencies(&self) -> sky::Dependencies {
        merge_all(self)
    }
}

impl<V: HasDependencies> HasDependencies for Option<V> {
    fn dependencies(&self) -> sky::Dependencies {
        merge_all(self)
    }
}
