use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image_registry_client::error::handlers::HttpErrorHandler;
use image_registry_client::registry::{
    Descriptor, FixedRetry, Image, ImageIndex, Manifest, Platform, RegistryProtocol, Retrier,
};
use image_registry_client::{
    ClientConfig, Reference, RegistryClient, RegistryError, Repository, Result,
};
use reqwest::StatusCode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// In-memory registry recording every protocol call
#[derive(Default)]
struct FakeRegistry {
    manifests: Mutex<HashMap<(String, String), Manifest>>,
    tags: Mutex<HashMap<(String, String), String>>,
    blobs: Mutex<HashMap<(String, String), Bytes>>,
    calls: Mutex<Vec<String>>,
    put_manifest_failures: AtomicU32,
}

impl FakeRegistry {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn fail_next_manifest_puts(&self, n: u32) {
        self.put_manifest_failures.store(n, Ordering::SeqCst);
    }

    fn resolve(&self, reference: &Reference) -> Option<String> {
        let repo = reference.repository().to_string();
        match reference {
            Reference::Digest(d) => Some(d.digest().to_string()),
            Reference::Tag(t) => self.tags.lock().unwrap().get(&(repo, t.tag().to_string())).cloned(),
        }
    }

    fn lookup(&self, reference: &Reference, operation: &str) -> Result<Manifest> {
        let repo = reference.repository().to_string();
        self.resolve(reference)
            .and_then(|digest| self.manifests.lock().unwrap().get(&(repo, digest)).cloned())
            .ok_or_else(|| {
                HttpErrorHandler::handle_registry_error(
                    StatusCode::NOT_FOUND,
                    r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
                    operation,
                    &reference.to_string(),
                )
            })
    }

    fn has_blob(&self, repository: &Repository, digest: &str) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .contains_key(&(repository.to_string(), digest.to_string()))
    }

    fn seed_manifest(&self, reference: &str, manifest: &Manifest) {
        let reference = Reference::parse(reference, &Default::default()).unwrap();
        let repo = reference.repository().to_string();
        self.manifests
            .lock()
            .unwrap()
            .insert((repo.clone(), manifest.digest()), manifest.clone());
        if let Reference::Tag(t) = &reference {
            self.tags
                .lock()
                .unwrap()
                .insert((repo, t.tag().to_string()), manifest.digest());
        }
    }

    fn seed_blob(&self, repository: &str, data: &Bytes) {
        let repository = Repository::parse(repository, &Default::default()).unwrap();
        self.blobs.lock().unwrap().insert(
            (repository.to_string(), image_registry_client::registry::protocol::sha256_digest(data)),
            data.clone(),
        );
    }
}

#[async_trait]
impl RegistryProtocol for FakeRegistry {
    async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor> {
        self.record(format!("head_manifest {}", reference));
        self.lookup(reference, "HEAD manifest").map(|m| m.descriptor())
    }

    async fn get_manifest(&self, reference: &Reference) -> Result<Manifest> {
        self.record(format!("get_manifest {}", reference));
        self.lookup(reference, "GET manifest")
    }

    async fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        self.record(format!("put_manifest {}", reference));
        let remaining = self.put_manifest_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.put_manifest_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HttpErrorHandler::handle_registry_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "",
                "PUT manifest",
                &reference.to_string(),
            ));
        }

        let repo = reference.repository().to_string();
        self.manifests
            .lock()
            .unwrap()
            .insert((repo.clone(), manifest.digest()), manifest.clone());
        if let Reference::Tag(t) = reference {
            self.tags
                .lock()
                .unwrap()
                .insert((repo, t.tag().to_string()), manifest.digest());
        }
        Ok(())
    }

    async fn blob_exists(&self, repository: &Repository, digest: &str) -> Result<bool> {
        self.record(format!("blob_exists {}@{}", repository, digest));
        Ok(self.has_blob(repository, digest))
    }

    async fn get_blob(&self, repository: &Repository, digest: &str) -> Result<Bytes> {
        self.record(format!("get_blob {}@{}", repository, digest));
        self.blobs
            .lock()
            .unwrap()
            .get(&(repository.to_string(), digest.to_string()))
            .cloned()
            .ok_or_else(|| {
                HttpErrorHandler::handle_registry_error(StatusCode::NOT_FOUND, "", "GET blob", digest)
            })
    }

    async fn put_blob(&self, repository: &Repository, digest: &str, data: Bytes) -> Result<()> {
        self.record(format!("put_blob {}@{}", repository, digest));
        self.blobs
            .lock()
            .unwrap()
            .insert((repository.to_string(), digest.to_string()), data);
        Ok(())
    }

    async fn mount_blob(&self, repository: &Repository, from: &Repository, digest: &str) -> Result<bool> {
        self.record(format!("mount_blob {}@{} from {}", repository, digest, from));
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.get(&(from.to_string(), digest.to_string())).cloned() {
            Some(data) => {
                blobs.insert((repository.to_string(), digest.to_string()), data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>> {
        self.record(format!("list_tags {}", repository));
        let repo = repository.to_string();
        let mut tags: Vec<String> = self
            .tags
            .lock()
            .unwrap()
            .keys()
            .filter(|(r, _)| *r == repo)
            .map(|(_, t)| t.clone())
            .collect();
        tags.sort();
        Ok(tags)
    }
}

fn client_with(fake: &Arc<FakeRegistry>, config: ClientConfig) -> RegistryClient {
    RegistryClient::builder(config)
        .with_protocol(fake.clone())
        .build()
        .unwrap()
}

fn client(fake: &Arc<FakeRegistry>) -> RegistryClient {
    client_with(fake, ClientConfig::default())
}

fn sample_image(tag: &str) -> Image {
    Image::from_blobs(
        Bytes::from(format!("{{\"architecture\":\"amd64\",\"tag\":\"{}\"}}", tag)),
        vec![Bytes::from(format!("layer-{}", tag))],
    )
    .unwrap()
}

#[tokio::test]
async fn write_image_pushes_blobs_before_manifest() {
    let fake = Arc::new(FakeRegistry::default());
    let image = sample_image("v1");

    client(&fake).write_image("ghcr.io/org/app:v1", &image).await.unwrap();

    let calls = fake.calls();
    assert_eq!(fake.count("put_blob"), 2);
    let manifest_at = calls.iter().position(|c| c.starts_with("put_manifest")).unwrap();
    assert!(calls[..manifest_at].iter().filter(|c| c.starts_with("put_blob")).count() == 2);
    assert_eq!(calls.last().unwrap(), "put_manifest ghcr.io/org/app:v1");

    let descriptor = client(&fake).get_descriptor("ghcr.io/org/app:v1").await.unwrap();
    assert_eq!(descriptor.digest, image.digest());
}

#[tokio::test]
async fn existing_blobs_are_not_uploaded_again() {
    let fake = Arc::new(FakeRegistry::default());
    let image = sample_image("v1");
    for desc in image.blob_descriptors() {
        fake.seed_blob("ghcr.io/org/app", image.blob(&desc.digest).unwrap());
    }

    client(&fake).write_image("ghcr.io/org/app:v1", &image).await.unwrap();

    assert_eq!(fake.count("put_blob"), 0);
    assert_eq!(fake.count("put_manifest"), 1);
}

#[tokio::test(start_paused = true)]
async fn write_image_recovers_from_transient_failures() {
    let fake = Arc::new(FakeRegistry::default());
    fake.fail_next_manifest_puts(2);
    let started = Instant::now();

    client(&fake)
        .write_image("ghcr.io/org/app:v1", &sample_image("v1"))
        .await
        .unwrap();

    assert_eq!(fake.count("put_manifest"), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn write_image_failure_is_labelled_and_keeps_last_error() {
    let fake = Arc::new(FakeRegistry::default());
    fake.fail_next_manifest_puts(u32::MAX);
    let started = Instant::now();

    let err = client(&fake)
        .write_image("ghcr.io/org/app:v1", &sample_image("v1"))
        .await
        .unwrap_err();

    assert_eq!(fake.count("put_manifest"), 5);
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(err.to_string().starts_with("Writing image: Retried 5 times: PUT manifest"));
    assert_eq!(err.status(), Some(503));
    match err {
        RegistryError::Operation { operation, source } => {
            assert_eq!(operation, "Writing image");
            assert!(matches!(*source, RegistryError::RetryExhausted { attempts: 5, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn write_tag_never_tags_an_unresolved_source() {
    let fake = Arc::new(FakeRegistry::default());
    let missing = format!("ghcr.io/org/app@sha256:{}", "a".repeat(64));

    let err = client(&fake)
        .write_tag("ghcr.io/org/app:stable", &missing)
        .await
        .unwrap_err();

    assert_eq!(fake.count("get_manifest"), 5);
    assert_eq!(fake.count("put_manifest"), 0);
    let message = err.to_string();
    assert!(message.starts_with("Writing image tag: Retried 5 times: "), "{message}");
    assert!(message.contains("MANIFEST_UNKNOWN"));
}

#[tokio::test]
async fn write_tag_points_tag_at_source_manifest() {
    let fake = Arc::new(FakeRegistry::default());
    let image = sample_image("v1");
    fake.seed_manifest("ghcr.io/org/app:v1", image.manifest());
    let source = format!("ghcr.io/org/app@{}", image.digest());

    let client = client(&fake);
    client.write_tag("ghcr.io/org/app:stable", &source).await.unwrap();

    let descriptor = client.get_descriptor("ghcr.io/org/app:stable").await.unwrap();
    assert_eq!(descriptor.digest, image.digest());
    assert_eq!(
        client.list_tags("ghcr.io/org/app").await.unwrap(),
        vec!["stable".to_string(), "v1".to_string()]
    );
}

#[tokio::test]
async fn reads_are_not_retried_or_labelled() {
    let fake = Arc::new(FakeRegistry::default());
    let client = client(&fake);

    let err = client.get_descriptor("ghcr.io/org/app:missing").await.unwrap_err();
    assert_eq!(fake.count("head_manifest"), 1);
    assert!(matches!(err, RegistryError::Protocol { status: Some(404), .. }));

    assert!(client.get_image("ghcr.io/org/app:missing").await.is_err());
    assert!(client.get_index("ghcr.io/org/app:missing").await.is_err());
    assert_eq!(fake.count("get_manifest"), 2);
}

#[tokio::test]
async fn plain_http_references_are_rejected_before_any_call() {
    let fake = Arc::new(FakeRegistry::default());
    let client = client(&fake);
    let image = sample_image("v1");
    let index = ImageIndex::from_images(vec![image.clone()]).unwrap();
    let digest = format!("http://localhost:5000/app@{}", image.digest());

    let results = vec![
        client.get_descriptor("http://localhost:5000/app:v1").await.map(|_| ()),
        client.get_image("http://localhost:5000/app:v1").await.map(|_| ()),
        client.get_index("http://localhost:5000/app:v1").await.map(|_| ()),
        client.write_image("http://localhost:5000/app:v1", &image).await,
        client.write_index("http://localhost:5000/app:v1", &index).await,
        client.write_tag("http://localhost:5000/app:v2", &digest).await,
        client.list_tags("http://localhost:5000/app").await.map(|_| ()),
    ];

    for result in results {
        assert!(matches!(result, Err(RegistryError::Reference { .. })));
    }
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn insecure_config_accepts_plain_http() {
    let fake = Arc::new(FakeRegistry::default());
    let client = client_with(&fake, ClientConfig::new().with_insecure(true));

    client
        .write_image("http://localhost:5000/app:v1", &sample_image("v1"))
        .await
        .unwrap();
    assert_eq!(fake.count("put_manifest localhost:5000/app:v1"), 1);
}

#[tokio::test]
async fn write_index_pushes_local_children_first() {
    let fake = Arc::new(FakeRegistry::default());
    let amd64 = sample_image("amd64");
    let arm64 = sample_image("arm64");
    let index = ImageIndex::from_images(vec![amd64.clone(), arm64.clone()]).unwrap();

    client(&fake).write_index("ghcr.io/org/app:v1", &index).await.unwrap();

    let calls = fake.calls();
    let child_puts: Vec<_> = calls
        .iter()
        .filter(|c| c.starts_with("put_manifest ghcr.io/org/app@"))
        .collect();
    assert_eq!(child_puts.len(), 2);
    assert_eq!(calls.last().unwrap(), "put_manifest ghcr.io/org/app:v1");
    assert_eq!(fake.count("put_blob"), 4);
}

#[tokio::test]
async fn write_index_copies_children_from_origin_by_mounting() {
    let fake = Arc::new(FakeRegistry::default());
    let image = sample_image("amd64");
    for desc in image.blob_descriptors() {
        fake.seed_blob("ghcr.io/org/source", image.blob(&desc.digest).unwrap());
    }
    fake.seed_manifest(&format!("ghcr.io/org/source@{}", image.digest()), image.manifest());
    let index = ImageIndex::from_images(vec![image.clone()]).unwrap();
    fake.seed_manifest("ghcr.io/org/source:v1", index.manifest());

    let client = client(&fake);
    let fetched = client.get_index("ghcr.io/org/source:v1").await.unwrap();
    assert!(fetched.image(&image.digest()).is_none());
    client.write_index("ghcr.io/org/target:v1", &fetched).await.unwrap();

    assert_eq!(fake.count("mount_blob ghcr.io/org/target@"), 2);
    assert_eq!(fake.count("put_blob"), 0);
    assert_eq!(
        fake.count(&format!("put_manifest ghcr.io/org/target@{}", image.digest())),
        1
    );
    let descriptor = client.get_descriptor("ghcr.io/org/target:v1").await.unwrap();
    assert_eq!(descriptor.digest, index.digest());
}

#[tokio::test]
async fn cross_registry_copy_streams_blobs_through() {
    let fake = Arc::new(FakeRegistry::default());
    let image = sample_image("v1");
    for desc in image.blob_descriptors() {
        fake.seed_blob("ghcr.io/org/app", image.blob(&desc.digest).unwrap());
    }
    fake.seed_manifest("ghcr.io/org/app:v1", image.manifest());

    let client = client(&fake);
    let fetched = client.get_image("ghcr.io/org/app:v1").await.unwrap();
    client.write_image("quay.io/mirror/app:v1", &fetched).await.unwrap();

    assert_eq!(fake.count("mount_blob"), 0);
    assert_eq!(fake.count("get_blob ghcr.io/org/app@"), 2);
    assert_eq!(fake.count("put_blob quay.io/mirror/app@"), 2);
}

#[tokio::test]
async fn image_without_content_or_origin_fails_to_push() {
    let fake = Arc::new(FakeRegistry::default());
    let image = sample_image("v1");
    let bare = Image::from_manifest(image.manifest().clone()).unwrap();

    let client = RegistryClient::builder(ClientConfig::default())
        .with_protocol(fake.clone())
        .with_retrier(Retrier::new(FixedRetry::new(1, Duration::ZERO)))
        .build()
        .unwrap();
    let err = client.write_image("ghcr.io/org/app:v1", &bare).await.unwrap_err();

    assert!(err.to_string().contains("neither held locally nor available"));
    assert_eq!(fake.count("put_manifest"), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_writes_report_the_label() {
    let fake = Arc::new(FakeRegistry::default());
    let token = CancellationToken::new();
    token.cancel();

    let client = RegistryClient::builder(ClientConfig::default())
        .with_protocol(fake.clone())
        .with_retrier(Retrier::default().with_cancellation(token))
        .build()
        .unwrap();
    let err = client
        .write_image("ghcr.io/org/app:v1", &sample_image("v1"))
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("Writing image: Cancelled"));
    assert!(fake.calls().is_empty());
}

fn platform_image(os: &str, arch: &str) -> Image {
    Image::from_blobs(
        Bytes::from(format!(r#"{{"os":"{os}","architecture":"{arch}"}}"#)),
        vec![Bytes::from(format!("layer-{os}-{arch}"))],
    )
    .unwrap()
}

fn seed_multi_arch(fake: &FakeRegistry) -> (Image, Image) {
    let amd64 = platform_image("linux", "amd64");
    let arm64 = platform_image("linux", "arm64");
    for image in [&amd64, &arm64] {
        fake.seed_manifest(&format!("docker.io/library/alpine@{}", image.digest()), image.manifest());
    }
    let index = ImageIndex::from_images(vec![arm64.clone(), amd64.clone()]).unwrap();
    fake.seed_manifest("alpine:latest", index.manifest());
    (amd64, arm64)
}

#[tokio::test]
async fn get_image_resolves_an_index_to_the_default_platform() {
    let fake = Arc::new(FakeRegistry::default());
    let (amd64, _) = seed_multi_arch(&fake);

    let image = client(&fake).get_image("alpine:latest").await.unwrap();

    assert_eq!(image.digest(), amd64.digest());
    assert_eq!(image.origin().unwrap().to_string(), "index.docker.io/library/alpine");
    assert_eq!(
        fake.calls(),
        vec![
            "get_manifest index.docker.io/library/alpine:latest".to_string(),
            format!("get_manifest index.docker.io/library/alpine@{}", amd64.digest()),
        ]
    );
}

#[tokio::test]
async fn get_image_honours_the_configured_platform() {
    let fake = Arc::new(FakeRegistry::default());
    let (_, arm64) = seed_multi_arch(&fake);
    let client = client_with(&fake, ClientConfig::new().with_platform(Platform::new("linux", "arm64")));

    let image = client.get_image("alpine:latest").await.unwrap();
    assert_eq!(image.digest(), arm64.digest());

    let windows = client_with(&fake, ClientConfig::new().with_platform(Platform::new("windows", "amd64")));
    let err = windows.get_image("alpine:latest").await.unwrap_err();
    assert!(err.to_string().contains("no manifest for platform windows/amd64"), "{err}");
}

#[test]
fn protocol_override_still_loads_ca_files() {
    let fake = Arc::new(FakeRegistry::default());
    let config = ClientConfig::new().with_ca_cert_path("/does/not/exist.pem");

    let result = RegistryClient::builder(config).with_protocol(fake).build();
    assert!(matches!(result, Err(RegistryError::ReadCertificates { .. })));
}
