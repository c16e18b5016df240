use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use pretty_assertions::assert_eq;

use crate::{self as sky, *};

/// An in-memory platform holding buckets by id.
#[derive(Clone, Default)]
struct Cloud {
    inner: Arc<CloudInner>,
}

#[derive(Default)]
struct CloudInner {
    buckets: Mutex<BTreeMap<String, BucketOutput>>,
    next_id: AtomicUsize,
    unavailable: AtomicBool,
}

#[derive(Debug, snafu::Snafu)]
enum CloudError {
    #[snafu(display("bucket '{id}' does not exist"))]
    NotFound { id: String },

    #[snafu(display("the cloud is unavailable"))]
    Unavailable,

    #[snafu(display("{field} {reason}"))]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl Cloud {
    fn check(&self) -> Result<(), CloudError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(CloudError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn insert(&self, name: &str, size: u32) -> BucketOutput {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let output = BucketOutput {
            id: format!("bkt-{n:04}"),
            name: name.to_owned(),
            size,
        };
        self.put(output.clone());
        output
    }

    fn put(&self, output: BucketOutput) {
        self.inner
            .buckets
            .lock()
            .unwrap()
            .insert(output.id.clone(), output);
    }

    fn get(&self, id: &str) -> Result<BucketOutput, CloudError> {
        self.check()?;
        self.inner
            .buckets
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound { id: id.to_owned() })
    }

    fn find(&self, name: &str) -> Result<BucketOutput, CloudError> {
        self.check()?;
        self.inner
            .buckets
            .lock()
            .unwrap()
            .values()
            .find(|bucket| bucket.name == name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound { id: name.to_owned() })
    }

    fn remove(&self, id: &str) -> Result<(), CloudError> {
        self.check()?;
        self.inner
            .buckets
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound { id: id.to_owned() })
    }

    fn buckets(&self) -> Vec<BucketOutput> {
        self.inner.buckets.lock().unwrap().values().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct Bucket {
    name: String,
    size: u32,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct BucketOutput {
    id: String,
    name: String,
    size: u32,
}

impl Resource for Bucket {
    type Provider = Cloud;
    type Error = CloudError;
    type Output = BucketOutput;

    async fn create(&self, cloud: &Self::Provider) -> Result<Self::Output, Self::Error> {
        cloud.check()?;
        Ok(cloud.insert(&self.name, self.size))
    }

    async fn read(&self, cloud: &Self::Provider) -> Result<Self::Output, Self::Error> {
        cloud.find(&self.name)
    }

    async fn refresh(
        &self,
        cloud: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        cloud.get(&previous_remote.id)
    }

    async fn update(
        &self,
        cloud: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        let mut output = cloud.get(&previous_remote.id)?;
        output.size = self.size;
        cloud.put(output.clone());
        Ok(output)
    }

    async fn delete(
        &self,
        cloud: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        cloud.remove(&previous_remote.id)
    }

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.is_empty() {
            return Err(CloudError::Invalid {
                field: "name",
                reason: "cannot be empty",
            });
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.name != previous.name
    }

    fn is_missing(error: &Self::Error) -> bool {
        matches!(error, CloudError::NotFound { .. })
    }
}

/// A read-only lookup of a bucket by name.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct BucketLookup {
    name: String,
}

impl Resource for BucketLookup {
    type Provider = Cloud;
    type Error = CloudError;
    type Output = BucketOutput;

    async fn read(&self, cloud: &Self::Provider) -> Result<Self::Output, Self::Error> {
        cloud.find(&self.name)
    }

    async fn delete(
        &self,
        _cloud: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct Service {
    bucket_id: Remote<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct ServiceOutput {
    endpoint: String,
}

impl Resource for Service {
    type Provider = Cloud;
    type Error = Error;
    type Output = ServiceOutput;

    async fn create(&self, _cloud: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let bucket_id = self.bucket_id.get()?;
        Ok(ServiceOutput {
            endpoint: format!("https://{bucket_id}.cloud.test"),
        })
    }

    async fn read(&self, cloud: &Self::Provider) -> Result<Self::Output, Self::Error> {
        self.create(cloud).await
    }

    async fn update(
        &self,
        cloud: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        self.create(cloud).await
    }

    async fn delete(
        &self,
        _cloud: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn test_output_path(name: &str) -> PathBuf {
    let path = PathBuf::from(std::env!("CARGO_MANIFEST_DIR"))
        .join("test_output")
        .join(name);
    if path.exists() {
        std::fs::remove_dir_all(&path).unwrap();
    }
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn stored_remote(path: &std::path::Path, id: &str) -> serde_json::Value {
    let contents = std::fs::read_to_string(path.join(format!("{id}.json"))).unwrap();
    let stored: serde_json::Value = serde_json::from_str(&contents).unwrap();
    stored["remote"].clone()
}

/// Plans and applies, returning the planned actions.
async fn apply(store: &mut Store<Cloud>) -> Vec<PlannedAction> {
    log::info!("schedule:\n{}", store.get_schedule_string().unwrap());
    let plan = store.plan().unwrap();
    log::info!("plan:\n{plan}");
    let actions = plan.actions.clone();
    store.apply(plan).await.unwrap();
    actions
}

fn declare(
    store: &mut Store<Cloud>,
    bucket: Bucket,
) -> (
    StoreResource<Bucket, BucketOutput>,
    StoreResource<Service, ServiceOutput>,
) {
    let bucket = store.resource("bucket", bucket).unwrap();
    let service = store
        .resource(
            "service",
            Service {
                bucket_id: bucket.remote(|b| b.id.clone()),
            },
        )
        .unwrap();
    (bucket, service)
}

fn logs(size: u32) -> Bucket {
    Bucket {
        name: "logs".to_owned(),
        size,
    }
}

#[tokio::test]
async fn create_then_load() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("create_then_load");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    let (bucket, service) = declare(&mut store, logs(1));
    assert_eq!(Action::Create, bucket.action());
    assert_eq!(Action::Create, service.action());
    let schedule = store.get_schedule_string().unwrap();
    assert!(schedule.contains("--- step 1\n  create bucket"), "{schedule}");
    assert!(schedule.contains("--- step 2\n  create service"), "{schedule}");
    apply(&mut store).await;

    let buckets = cloud.buckets();
    assert_eq!(1, buckets.len());
    assert_eq!(
        serde_json::json!({"endpoint": format!("https://{}.cloud.test", buckets[0].id)}),
        stored_remote(&path, "service")
    );

    let mut store = Store::new(&path, cloud.clone());
    let (bucket, service) = declare(&mut store, logs(1));
    assert_eq!(Action::Load, bucket.action());
    assert_eq!(Action::Load, service.action());
    let plan = store.plan().unwrap();
    assert!(!plan.has_changes());
    assert!(plan.to_string().contains("load 'bucket'"), "{plan}");
    store.apply(plan).await.unwrap();
    assert_eq!(buckets, cloud.buckets());
}

#[tokio::test]
async fn update_in_place() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("update_in_place");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    declare(&mut store, logs(1));
    apply(&mut store).await;
    let created = cloud.buckets();

    let mut store = Store::new(&path, cloud.clone());
    let (bucket, service) = declare(&mut store, logs(2));
    assert_eq!(Action::Update, bucket.action());
    assert_eq!(
        Action::Update,
        service.action(),
        "`service` should update in response to `bucket` updating"
    );
    apply(&mut store).await;

    let updated = cloud.buckets();
    assert_eq!(1, updated.len());
    assert_eq!(created[0].id, updated[0].id);
    assert_eq!(2, updated[0].size);
    assert_eq!(serde_json::json!(2), stored_remote(&path, "bucket")["size"]);
}

#[tokio::test]
async fn replacement_recreates_and_updates_dependents() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("replacement");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    declare(&mut store, logs(1));
    apply(&mut store).await;
    let old_id = cloud.buckets()[0].id.clone();

    let mut store = Store::new(&path, cloud.clone());
    let (bucket, _service) = declare(
        &mut store,
        Bucket {
            name: "archive".to_owned(),
            size: 1,
        },
    );
    assert_eq!(Action::Update, bucket.action());
    apply(&mut store).await;

    let buckets = cloud.buckets();
    assert_eq!(1, buckets.len(), "the old bucket should be deleted");
    assert_ne!(old_id, buckets[0].id);
    assert_eq!("archive", buckets[0].name);
    assert_eq!(
        serde_json::json!({"endpoint": format!("https://{}.cloud.test", buckets[0].id)}),
        stored_remote(&path, "service")
    );
}

#[tokio::test]
async fn invalid_definitions_are_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("invalid");
    let mut store = Store::new(&path, Cloud::default());
    let result = store.resource(
        "bucket",
        Bucket {
            name: String::new(),
            size: 1,
        },
    );
    match result {
        Err(Error::Validate { name, error }) => {
            assert_eq!("bucket", name);
            assert_eq!("name cannot be empty", error.to_string());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(store.plan().unwrap().actions.is_empty());
}

#[tokio::test]
async fn refresh_without_drift() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("refresh_no_drift");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket", logs(1)).unwrap();
    apply(&mut store).await;
    let before = cloud.buckets();

    let mut store = Store::new(&path, cloud.clone()).with_refresh(true);
    let bucket = store.resource("bucket", logs(1)).unwrap();
    assert_eq!(Action::Refresh, bucket.action());
    apply(&mut store).await;
    assert_eq!(before, cloud.buckets());
}

#[tokio::test]
async fn refresh_reconciles_drift() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("refresh_drift");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket", logs(1)).unwrap();
    apply(&mut store).await;

    let mut tampered = cloud.buckets().remove(0);
    tampered.size = 9;
    cloud.put(tampered.clone());

    // Without refresh the drift goes unnoticed.
    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket", logs(1)).unwrap();
    apply(&mut store).await;
    assert_eq!(9, cloud.buckets()[0].size);

    let mut store = Store::new(&path, cloud.clone()).with_refresh(true);
    store.resource("bucket", logs(1)).unwrap();
    apply(&mut store).await;
    let buckets = cloud.buckets();
    assert_eq!(1, buckets.len());
    assert_eq!(tampered.id, buckets[0].id);
    assert_eq!(1, buckets[0].size);
    assert_eq!(serde_json::json!(1), stored_remote(&path, "bucket")["size"]);
}

#[tokio::test]
async fn refresh_recreates_missing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("refresh_missing");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    declare(&mut store, logs(1));
    apply(&mut store).await;
    let old_id = cloud.buckets()[0].id.clone();
    cloud.remove(&old_id).unwrap();

    let mut store = Store::new(&path, cloud.clone()).with_refresh(true);
    let (bucket, service) = declare(&mut store, logs(1));
    assert_eq!(Action::Refresh, bucket.action());
    assert_eq!(Action::Refresh, service.action());
    apply(&mut store).await;

    let buckets = cloud.buckets();
    assert_eq!(1, buckets.len());
    assert_ne!(old_id, buckets[0].id);
    assert_eq!(
        serde_json::json!(buckets[0].id),
        stored_remote(&path, "bucket")["id"]
    );
    assert_eq!(
        serde_json::json!({"endpoint": format!("https://{}.cloud.test", buckets[0].id)}),
        stored_remote(&path, "service")
    );
}

#[tokio::test]
async fn refresh_surfaces_other_errors() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("refresh_error");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket", logs(1)).unwrap();
    apply(&mut store).await;

    cloud.inner.unavailable.store(true, Ordering::SeqCst);
    let mut store = Store::new(&path, cloud.clone()).with_refresh(true);
    store.resource("bucket", logs(1)).unwrap();
    let plan = store.plan().unwrap();
    match store.apply(plan).await {
        Err(Error::Refresh { name, .. }) => assert_eq!("bucket", name),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn destroy_tolerates_missing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("destroy_missing");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket", logs(1)).unwrap();
    apply(&mut store).await;
    let id = cloud.buckets()[0].id.clone();
    cloud.remove(&id).unwrap();

    let mut store = Store::new(&path, cloud.clone());
    let doomed = store.destroy::<Bucket>("bucket").unwrap();
    assert_eq!("logs", doomed.name);
    let actions = apply(&mut store).await;
    assert_eq!(Action::Destroy, actions[0].action);
    assert!(!path.join("bucket.json").exists());
}

#[tokio::test]
async fn lookups_read_every_run() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("lookups");
    let cloud = Cloud::default();
    let existing = cloud.insert("shared", 3);
    let query = || BucketLookup {
        name: "shared".to_owned(),
    };

    let mut store = Store::new(&path, cloud.clone());
    let shared = store.data("shared", query()).unwrap();
    assert_eq!(Action::Read, shared.action());
    apply(&mut store).await;
    assert_eq!(serde_json::json!(3), stored_remote(&path, "shared")["size"]);

    cloud.put(BucketOutput {
        size: 4,
        ..existing.clone()
    });
    let mut store = Store::new(&path, cloud.clone());
    let shared = store.data("shared", query()).unwrap();
    assert_eq!(Action::Read, shared.action());
    apply(&mut store).await;
    assert_eq!(serde_json::json!(4), stored_remote(&path, "shared")["size"]);

    // Dropping the lookup only removes its store file.
    let mut store = Store::new(&path, cloud.clone());
    store.register::<BucketLookup>();
    let actions = apply(&mut store).await;
    assert!(actions[0].is_orphan);
    assert!(!path.join("shared.json").exists());
    assert_eq!(1, cloud.buckets().len());

    let mut store = Store::new(&path, cloud.clone());
    store
        .data(
            "missing",
            BucketLookup {
                name: "nope".to_owned(),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    assert!(matches!(
        store.apply(plan).await,
        Err(Error::Import { .. })
    ));
}

#[tokio::test]
async fn import_then_manage() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("import");
    let cloud = Cloud::default();
    let existing = cloud.insert("logs", 1);

    let mut store = Store::new(&path, cloud.clone());
    let bucket = store.import("bucket", logs(1)).unwrap();
    assert_eq!(Action::Read, bucket.action());
    apply(&mut store).await;
    assert_eq!(
        serde_json::to_value(&existing).unwrap(),
        stored_remote(&path, "bucket")
    );

    let mut store = Store::new(&path, cloud.clone());
    let bucket = store.resource("bucket", logs(1)).unwrap();
    assert_eq!(Action::Load, bucket.action());
}

#[tokio::test]
async fn load_refuses_to_clobber() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("clobber");
    let cloud = Cloud::default();
    let output = BucketOutput {
        id: "bkt-external".to_owned(),
        name: "logs".to_owned(),
        size: 1,
    };

    let mut store = Store::new(&path, cloud.clone());
    store
        .load("bucket", logs(1), output.clone(), false)
        .unwrap();
    apply(&mut store).await;
    assert!(path.join("bucket.json").exists());
    assert!(cloud.buckets().is_empty(), "loading never touches the cloud");

    let mut store = Store::new(&path, cloud.clone());
    store
        .load("bucket", logs(1), output.clone(), false)
        .unwrap();

    let changed = BucketOutput {
        size: 2,
        ..output.clone()
    };
    let mut store = Store::new(&path, cloud.clone());
    assert!(matches!(
        store.load("bucket", logs(1), changed.clone(), false),
        Err(Error::Clobber { .. })
    ));

    let mut store = Store::new(&path, cloud.clone());
    store.load("bucket", logs(1), changed, true).unwrap();
    apply(&mut store).await;
    assert_eq!(serde_json::json!(2), stored_remote(&path, "bucket")["size"]);
}

/// In order to delete a bucket which has downstream dependencies, those
/// dependents must first stop depending on it. Here the service migrates
/// its `Remote` to a `Migrated` value read from the doomed bucket.
#[tokio::test]
async fn destroy_with_migration() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("migration");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    declare(&mut store, logs(1));
    apply(&mut store).await;
    let bucket_id = cloud.buckets()[0].id.clone();

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
    struct PinnedService {
        bucket_id: Migrated<String>,
    }

    impl Resource for PinnedService {
        type Provider = Cloud;
        type Error = Error;
        type Output = ServiceOutput;

        async fn create(&self, _cloud: &Self::Provider) -> Result<Self::Output, Self::Error> {
            Ok(ServiceOutput {
                endpoint: format!("https://{}.cloud.test", *self.bucket_id),
            })
        }

        async fn update(
            &self,
            cloud: &Self::Provider,
            _previous_local: &Self,
            _previous_remote: &Self::Output,
        ) -> Result<Self::Output, Self::Error> {
            self.create(cloud).await
        }

        async fn delete(
            &self,
            _cloud: &Self::Provider,
            _previous_remote: &Self::Output,
        ) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    let mut store = Store::new(&path, cloud.clone());
    let doomed = store.destroy::<Bucket>("bucket").unwrap();
    let service = store
        .resource(
            "service",
            PinnedService {
                bucket_id: doomed.migrate(|bucket| bucket.id.clone()),
            },
        )
        .unwrap();
    assert_eq!(Action::Load, service.action());
    apply(&mut store).await;

    assert!(cloud.buckets().is_empty());
    assert!(!path.join("bucket.json").exists());
    assert_eq!(
        serde_json::json!({"endpoint": format!("https://{bucket_id}.cloud.test")}),
        stored_remote(&path, "service")
    );
}

/// Resource types are registered for orphan auto-deletion when used via
/// [`Store::resource`], without any explicit [`Store::register`] call.
#[tokio::test]
async fn auto_register_orphan_delete() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("auto_reg");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket-a", logs(1)).unwrap();
    store
        .resource(
            "bucket-b",
            Bucket {
                name: "beta".to_owned(),
                size: 1,
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    assert!(plan.warnings.is_empty(), "no warnings on first apply");
    store.apply(plan).await.unwrap();
    assert!(path.join("bucket-a.json").exists());
    assert!(path.join("bucket-b.json").exists());
    assert_eq!(2, cloud.buckets().len());

    let mut store = Store::new(&path, cloud.clone());
    store.resource("bucket-a", logs(1)).unwrap();
    let plan = store.plan().unwrap();
    assert!(
        plan.warnings.is_empty(),
        "no warnings expected: {:#?}",
        plan.warnings
    );
    let orphan = plan
        .actions
        .iter()
        .find(|a| a.id == "bucket-b")
        .expect("bucket-b should appear in the plan");
    assert_eq!(orphan.action, Action::Destroy);
    assert!(orphan.is_orphan);
    assert!(plan.to_string().contains("(orphan)"));
    store.apply(plan).await.unwrap();

    assert!(!path.join("bucket-b.json").exists());
    assert!(path.join("bucket-a.json").exists());
    let buckets = cloud.buckets();
    assert_eq!(1, buckets.len());
    assert_eq!("logs", buckets[0].name);
}

/// Orphans of a type that is neither used in the current run nor
/// registered produce a warning suggesting `store.register()`.
#[tokio::test]
async fn unknown_orphan_warning() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("unknown_orphan");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    store.resource("my-bucket", logs(1)).unwrap();
    apply(&mut store).await;
    assert!(path.join("my-bucket.json").exists());

    let mut store = Store::new(&path, cloud.clone());
    let plan = store.plan().unwrap();
    assert_eq!(plan.warnings.len(), 1, "expected exactly one warning");
    assert!(
        plan.warnings[0].contains("my-bucket"),
        "warning should mention the orphan id"
    );
    assert!(
        plan.warnings[0].contains("register"),
        "warning should suggest register()"
    );
    assert!(!plan.has_changes());
    store.apply(plan).await.unwrap();

    assert!(path.join("my-bucket.json").exists());
    assert_eq!(1, cloud.buckets().len());
}

/// [`Store::clear_resources`] forgets declared resources but keeps the
/// type registry, which is how everything gets destroyed.
#[tokio::test]
async fn clear_and_destroy_all() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = test_output_path("clear_destroy");
    let cloud = Cloud::default();

    let mut store = Store::new(&path, cloud.clone());
    declare(&mut store, logs(1));
    apply(&mut store).await;
    assert!(path.join("bucket.json").exists());
    assert!(path.join("service.json").exists());

    store.clear_resources();
    let plan = store.plan().unwrap();
    assert!(
        plan.warnings.is_empty(),
        "no warnings: {:#?}",
        plan.warnings
    );
    assert_eq!(
        plan.actions.len(),
        2,
        "expected 2 destroy actions, got: {:#?}",
        plan.actions,
    );
    for action in &plan.actions {
        assert_eq!(action.action, Action::Destroy);
        assert!(action.is_orphan);
    }
    store.apply(plan).await.unwrap();

    assert!(!path.join("bucket.json").exists());
    assert!(!path.join("service.json").exists());
    assert!(cloud.buckets().is_empty());
}
