//! Registration and login orchestration.
//!
//! Every call reads the full identity set fresh from the store; descriptors
//! are never cached between calls. Two concurrent registrations of the same
//! face can both pass the duplicate check before either is saved.

use crate::engine::{EngineError, EngineHandle};
use facelogin_core::{
    codec, EuclideanMatcher, GalleryEntry, MatchDecision, Matcher, Thresholds, DESCRIPTOR_LEN,
};
use facelogin_store::{Identity, IdentityStore, NewIdentity, StoreError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("face recognition not available: {0}")]
    UnavailablePipeline(String),
    #[error("please select an image file")]
    EmptyImage,
    #[error("username already exists: {0}")]
    UsernameTaken(String),
    #[error("this face is already registered with another account ({username})")]
    DuplicateFace {
        id: i64,
        username: String,
        distance: f64,
    },
    #[error("identity not found")]
    NotFound,
    #[error("face processing timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UsernameTaken(name) => ServiceError::UsernameTaken(name),
            StoreError::NotFound(_) => ServiceError::NotFound,
            other => ServiceError::Store(other),
        }
    }
}

/// Successful face login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginMatch {
    pub identity: Identity,
    pub distance: f64,
}

/// Snapshot reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub pipeline_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_error: Option<String>,
    pub descriptor_len: usize,
    pub registered: u64,
    pub thresholds: Thresholds,
}

/// Why a stored descriptor cannot take part in matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    Missing,
    Malformed { reason: String },
    WrongLength { len: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityFinding {
    pub id: i64,
    pub username: String,
    pub issue: IntegrityIssue,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub findings: Vec<IntegrityFinding>,
}

/// Lookup key for [`AuthService::find`].
#[derive(Debug, Clone)]
pub enum Lookup {
    Id(i64),
    Username(String),
    Email(String),
}

pub struct AuthService<S> {
    store: S,
    engine: EngineHandle,
    matcher: EuclideanMatcher,
    thresholds: Thresholds,
    timeout: Duration,
}

impl<S: IdentityStore> AuthService<S> {
    pub fn new(store: S, engine: EngineHandle, thresholds: Thresholds, timeout: Duration) -> Self {
        if !thresholds.is_ordered() {
            tracing::warn!(
                registration = thresholds.registration,
                login = thresholds.login,
                "registration threshold is not stricter than login threshold"
            );
        }
        Self {
            store,
            engine,
            matcher: EuclideanMatcher,
            thresholds,
            timeout,
        }
    }

    /// Register a new identity from a face image.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        image: Vec<u8>,
    ) -> Result<Identity, ServiceError> {
        tracing::info!(username, "registration requested");
        self.ensure_available()?;
        if image.is_empty() {
            return Err(ServiceError::EmptyImage);
        }

        if self.store.find_by_username(username).await?.is_some() {
            return Err(ServiceError::UsernameTaken(username.to_string()));
        }

        let capture = self.capture(image).await?;
        let gallery = self.gallery().await?;

        let decision =
            self.matcher
                .check_duplicate(&capture.descriptor, &gallery, self.thresholds.registration);
        if let MatchDecision::DuplicateRejected(conflict) = decision {
            return Err(ServiceError::DuplicateFace {
                id: conflict.id,
                username: conflict.label,
                distance: conflict.distance,
            });
        }

        let identity = self
            .store
            .save(NewIdentity {
                username: username.to_string(),
                email: email.to_string(),
                face_encoding: Some(codec::encode(&capture.descriptor)),
                face_image_path: capture
                    .crop_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            })
            .await?;

        tracing::info!(id = identity.id, username = %identity.username, "registration succeeded");
        Ok(identity)
    }

    /// Identify the registered user in a face image, if any.
    pub async fn login(&self, image: Vec<u8>) -> Result<Option<LoginMatch>, ServiceError> {
        tracing::info!("login requested");
        self.ensure_available()?;
        if image.is_empty() {
            return Err(ServiceError::EmptyImage);
        }

        let capture = self.capture(image).await?;
        let gallery = self.gallery().await?;

        let candidate =
            match self
                .matcher
                .best_match(&capture.descriptor, &gallery, self.thresholds.login)
            {
                MatchDecision::BestMatch(candidate) => candidate,
                _ => {
                    tracing::info!(entries = gallery.len(), "login failed: no matching user");
                    return Ok(None);
                }
            };

        // The record may have been removed between the sweep and this read.
        let Some(identity) = self.store.find_by_id(candidate.id).await? else {
            tracing::warn!(id = candidate.id, "matched identity vanished from store");
            return Ok(None);
        };

        tracing::info!(
            id = identity.id,
            username = %identity.username,
            distance = candidate.distance,
            "login succeeded"
        );
        Ok(Some(LoginMatch {
            identity,
            distance: candidate.distance,
        }))
    }

    pub async fn status(&self) -> Result<SystemStatus, ServiceError> {
        Ok(SystemStatus {
            version: env!("CARGO_PKG_VERSION"),
            pipeline_available: self.engine.is_available(),
            pipeline_error: self.engine.unavailable_reason().map(str::to_string),
            descriptor_len: DESCRIPTOR_LEN,
            registered: self.store.count().await?,
            thresholds: self.thresholds,
        })
    }

    pub async fn find(&self, lookup: Lookup) -> Result<Vec<Identity>, ServiceError> {
        let found = match lookup {
            Lookup::Id(id) => self.store.find_by_id(id).await?.into_iter().collect(),
            Lookup::Username(name) => self.store.find_by_username(&name).await?.into_iter().collect(),
            Lookup::Email(email) => self.store.find_by_email(&email).await?,
        };
        Ok(found)
    }

    /// Attach a notification chat handle to an identity.
    pub async fn link_chat(&self, id: i64, chat_id: &str) -> Result<Identity, ServiceError> {
        let identity = self.store.set_notify_chat_id(id, chat_id).await?;
        tracing::info!(id, username = %identity.username, "notification chat linked");
        Ok(identity)
    }

    /// Report every stored identity whose descriptor cannot be matched.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, ServiceError> {
        let identities = self.store.find_all().await?;
        let findings = identities
            .iter()
            .filter_map(|identity| {
                let issue = match identity.face_encoding.as_deref() {
                    None => IntegrityIssue::Missing,
                    Some(text) => match codec::decode(text) {
                        Err(e) => IntegrityIssue::Malformed {
                            reason: e.to_string(),
                        },
                        Ok(d) if d.is_empty() => IntegrityIssue::Missing,
                        Ok(d) if d.len() != DESCRIPTOR_LEN => {
                            IntegrityIssue::WrongLength { len: d.len() }
                        }
                        Ok(_) => return None,
                    },
                };
                Some(IntegrityFinding {
                    id: identity.id,
                    username: identity.username.clone(),
                    issue,
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            checked = identities.len(),
            issues = findings.len(),
            "integrity check finished"
        );
        Ok(IntegrityReport {
            checked: identities.len(),
            findings,
        })
    }

    fn ensure_available(&self) -> Result<(), ServiceError> {
        match self.engine.unavailable_reason() {
            Some(reason) => Err(ServiceError::UnavailablePipeline(reason.to_string())),
            None => Ok(()),
        }
    }

    async fn capture(&self, image: Vec<u8>) -> Result<facelogin_core::FaceCapture, ServiceError> {
        let capture = tokio::time::timeout(self.timeout, self.engine.capture(image))
            .await
            .map_err(|_| ServiceError::Timeout(self.timeout))??;
        tracing::debug!(len = capture.descriptor.len(), "descriptor extracted");
        Ok(capture)
    }

    /// Current registered faces, decoded for matching.
    async fn gallery(&self) -> Result<Vec<GalleryEntry>, ServiceError> {
        let identities = self.store.find_all().await?;
        Ok(identities
            .into_iter()
            .map(|identity| GalleryEntry {
                id: identity.id,
                descriptor: identity
                    .face_encoding
                    .as_deref()
                    .and_then(codec::decode_lenient),
                label: identity.username,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use facelogin_core::detector::FaceBounds;
    use facelogin_core::{FaceLocator, FacePipeline};
    use facelogin_store::SqliteStore;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    struct WholeImage;

    impl FaceLocator for WholeImage {
        fn locate(&self, _gray: &[u8], width: u32, height: u32) -> Vec<FaceBounds> {
            vec![FaceBounds { x: 0, y: 0, width, height, score: 1.0 }]
        }
    }

    struct NoFaces;

    impl FaceLocator for NoFaces {
        fn locate(&self, _gray: &[u8], _width: u32, _height: u32) -> Vec<FaceBounds> {
            Vec::new()
        }
    }

    struct Slow(Duration);

    impl FaceLocator for Slow {
        fn locate(&self, _gray: &[u8], width: u32, height: u32) -> Vec<FaceBounds> {
            std::thread::sleep(self.0);
            vec![FaceBounds { x: 0, y: 0, width, height, score: 1.0 }]
        }
    }

    fn png(f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let img = GrayImage::from_fn(64, 64, |x, y| Luma([f(x, y)]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn uniform(level: u8) -> Vec<u8> {
        png(move |_, _| level)
    }

    fn split() -> Vec<u8> {
        png(|x, _| if x < 32 { 0 } else { 255 })
    }

    async fn service_with(locator: Box<dyn FaceLocator>) -> AuthService<SqliteStore> {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let engine = spawn_engine(FacePipeline::new(locator, None)).unwrap();
        AuthService::new(store, engine, Thresholds::default(), Duration::from_secs(10))
    }

    async fn service() -> AuthService<SqliteStore> {
        service_with(Box::new(WholeImage)).await
    }

    #[tokio::test]
    async fn test_register_stores_descriptor() {
        let svc = service().await;
        let alice = svc.register("alice", "a@example.com", uniform(128)).await.unwrap();
        assert_eq!(alice.username, "alice");

        let stored = codec::decode(alice.face_encoding.as_deref().unwrap()).unwrap();
        assert_eq!(stored.len(), DESCRIPTOR_LEN);
        assert!((stored.norm() - 1.0).abs() < 1e-5);
        assert_eq!(svc.status().await.unwrap().registered, 1);
    }

    #[tokio::test]
    async fn test_register_same_face_twice_is_duplicate() {
        let svc = service().await;
        let alice = svc.register("alice", "a@example.com", split()).await.unwrap();
        let err = svc.register("bob", "b@example.com", split()).await.unwrap_err();
        match err {
            ServiceError::DuplicateFace { id, username, distance } => {
                assert_eq!(id, alice.id);
                assert_eq!(username, "alice");
                assert!(distance < 1e-5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(svc.status().await.unwrap().registered, 1);
    }

    #[tokio::test]
    async fn test_register_distinct_faces() {
        let svc = service().await;
        svc.register("alice", "a@example.com", uniform(128)).await.unwrap();
        svc.register("bob", "b@example.com", split()).await.unwrap();
        assert_eq!(svc.status().await.unwrap().registered, 2);
    }

    #[tokio::test]
    async fn test_register_username_taken() {
        let svc = service().await;
        svc.register("alice", "a@example.com", uniform(128)).await.unwrap();
        let err = svc.register("alice", "x@example.com", split()).await.unwrap_err();
        assert!(matches!(err, ServiceError::UsernameTaken(name) if name == "alice"));
    }

    #[tokio::test]
    async fn test_register_empty_image() {
        let svc = service().await;
        let err = svc.register("alice", "a@example.com", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::EmptyImage));
    }

    #[tokio::test]
    async fn test_register_without_face_fails() {
        let svc = service_with(Box::new(NoFaces)).await;
        let err = svc.register("alice", "a@example.com", uniform(10)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Engine(EngineError::Pipeline(facelogin_core::PipelineError::NoFaceRegion))
        ));
        assert_eq!(svc.status().await.unwrap().registered, 0);
    }

    #[tokio::test]
    async fn test_slow_capture_times_out() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let slow = Box::new(Slow(Duration::from_millis(300)));
        let engine = spawn_engine(FacePipeline::new(slow, None)).unwrap();
        let svc = AuthService::new(store, engine, Thresholds::default(), Duration::from_millis(50));

        let err = svc.register("alice", "a@example.com", uniform(128)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(svc.status().await.unwrap().registered, 0);
    }

    #[tokio::test]
    async fn test_dead_engine_rejects_requests() {
        struct Panicking;

        impl FaceLocator for Panicking {
            fn locate(&self, _gray: &[u8], _width: u32, _height: u32) -> Vec<FaceBounds> {
                panic!("detector failure");
            }
        }

        let svc = service_with(Box::new(Panicking)).await;
        let err = svc.login(uniform(128)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Engine(EngineError::ChannelClosed)));

        for _ in 0..100 {
            if !svc.status().await.unwrap().pipeline_available {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = svc.status().await.unwrap();
        assert!(!status.pipeline_available);
        assert_eq!(status.pipeline_error.as_deref(), Some("engine thread exited"));
        let err = svc.login(uniform(128)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnavailablePipeline(_)));
    }

    #[tokio::test]
    async fn test_login_empty_store_no_match() {
        let svc = service().await;
        assert!(svc.login(uniform(128)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_picks_registered_identity() {
        let svc = service().await;
        svc.register("alice", "a@example.com", uniform(128)).await.unwrap();
        let bob = svc.register("bob", "b@example.com", split()).await.unwrap();

        let found = svc.login(split()).await.unwrap().expect("match");
        assert_eq!(found.identity.id, bob.id);
        assert!(found.distance < 1e-5);

        // Uniform images differ only in scale, which normalization removes.
        let found = svc.login(uniform(200)).await.unwrap().expect("match");
        assert_eq!(found.identity.username, "alice");
    }

    #[tokio::test]
    async fn test_login_skips_records_without_descriptor() {
        let svc = service().await;
        svc.store
            .save(NewIdentity {
                username: "legacy".into(),
                email: "l@example.com".into(),
                face_encoding: Some("[not,a,descriptor]".into()),
                face_image_path: None,
            })
            .await
            .unwrap();
        let alice = svc.register("alice", "a@example.com", split()).await.unwrap();

        let found = svc.login(split()).await.unwrap().expect("match");
        assert_eq!(found.identity.id, alice.id);
    }

    #[tokio::test]
    async fn test_unavailable_pipeline_rejects_everything() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let engine = spawn_engine(FacePipeline::unavailable("model missing")).unwrap();
        let svc = AuthService::new(store, engine, Thresholds::default(), Duration::from_secs(1));

        let err = svc.register("alice", "a@example.com", uniform(1)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnavailablePipeline(_)));
        let err = svc.login(uniform(1)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnavailablePipeline(_)));

        let status = svc.status().await.unwrap();
        assert!(!status.pipeline_available);
        assert_eq!(status.pipeline_error.as_deref(), Some("model missing"));
    }

    #[tokio::test]
    async fn test_find_and_link_chat() {
        let svc = service().await;
        let alice = svc.register("alice", "a@example.com", uniform(128)).await.unwrap();

        assert_eq!(svc.find(Lookup::Id(alice.id)).await.unwrap().len(), 1);
        assert_eq!(svc.find(Lookup::Username("alice".into())).await.unwrap()[0].id, alice.id);
        assert_eq!(svc.find(Lookup::Email("a@example.com".into())).await.unwrap().len(), 1);
        assert!(svc.find(Lookup::Username("bob".into())).await.unwrap().is_empty());

        let linked = svc.link_chat(alice.id, "987").await.unwrap();
        assert_eq!(linked.notify_chat_id.as_deref(), Some("987"));
        assert!(matches!(svc.link_chat(alice.id + 1, "1").await, Err(ServiceError::NotFound)));
    }

    #[tokio::test]
    async fn test_check_integrity() {
        let svc = service().await;
        svc.register("alice", "a@example.com", uniform(128)).await.unwrap();
        for (name, encoding) in [
            ("none", None),
            ("bad", Some("[0.1,zz]")),
            ("short", Some("[1.0,0.0]")),
        ] {
            svc.store
                .save(NewIdentity {
                    username: name.into(),
                    email: "x@example.com".into(),
                    face_encoding: encoding.map(Into::into),
                    face_image_path: None,
                })
                .await
                .unwrap();
        }

        let report = svc.check_integrity().await.unwrap();
        assert_eq!(report.checked, 4);
        let issues: Vec<_> = report
            .findings
            .iter()
            .map(|f| (f.username.as_str(), f.issue.clone()))
            .collect();
        assert_eq!(issues[0], ("none", IntegrityIssue::Missing));
        assert!(matches!(issues[1], ("bad", IntegrityIssue::Malformed { .. })));
        assert_eq!(issues[2], ("short", IntegrityIssue::WrongLength { len: 2 }));
    }
}
