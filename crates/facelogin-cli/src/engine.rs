use facelogin_core::{FaceCapture, FacePipeline, PipelineError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the service to the engine thread.
enum EngineRequest {
    Capture {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<FaceCapture, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    unavailable: Option<String>,
}

impl EngineHandle {
    /// Whether the face pipeline initialized and the engine thread is alive.
    pub fn is_available(&self) -> bool {
        self.unavailable_reason().is_none()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        if self.unavailable.is_some() {
            return self.unavailable.as_deref();
        }
        if self.tx.is_closed() {
            return Some("engine thread exited");
        }
        None
    }

    /// Detect the largest face in `image` and extract its descriptor.
    pub async fn capture(&self, image: Vec<u8>) -> Result<FaceCapture, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread that owns the face pipeline.
///
/// Detection and extraction are CPU-bound; keeping them off the async
/// runtime lets store queries proceed while an image is processed.
pub fn spawn_engine(pipeline: FacePipeline) -> Result<EngineHandle, EngineError> {
    let unavailable = pipeline.unavailable_reason().map(str::to_string);
    if let Some(reason) = &unavailable {
        tracing::warn!(reason = %reason, "engine starting without a face pipeline");
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facelogin-engine".into())
        .spawn(move || {
            tracing::debug!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Capture { image, reply } => {
                        let result = pipeline.capture(&image);
                        if let Err(e) = &result {
                            tracing::debug!(error = %e, "capture failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::debug!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, unavailable })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelogin_core::detector::FaceBounds;
    use facelogin_core::{FaceLocator, DESCRIPTOR_LEN};
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;
    use std::time::Duration;

    struct WholeImage;

    impl FaceLocator for WholeImage {
        fn locate(&self, _gray: &[u8], width: u32, height: u32) -> Vec<FaceBounds> {
            vec![FaceBounds { x: 0, y: 0, width, height, score: 1.0 }]
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(width, height, |x, _| Luma([(x * 4) as u8]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_capture_round_trip() {
        let engine = spawn_engine(FacePipeline::new(Box::new(WholeImage), None)).unwrap();
        assert!(engine.is_available());
        let capture = engine.capture(png(48, 48)).await.unwrap();
        assert_eq!(capture.descriptor.len(), DESCRIPTOR_LEN);
    }

    #[tokio::test]
    async fn test_unavailable_pipeline_reported() {
        let engine = spawn_engine(FacePipeline::unavailable("no model")).unwrap();
        assert!(!engine.is_available());
        assert_eq!(engine.unavailable_reason(), Some("no model"));
        let err = engine.capture(png(8, 8)).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::Unavailable(_))));
    }

    struct Panicking;

    impl FaceLocator for Panicking {
        fn locate(&self, _gray: &[u8], _width: u32, _height: u32) -> Vec<FaceBounds> {
            panic!("detector failure");
        }
    }

    #[tokio::test]
    async fn test_dead_engine_reported_unavailable() {
        let engine = spawn_engine(FacePipeline::new(Box::new(Panicking), None)).unwrap();
        assert!(engine.is_available());

        let err = engine.capture(png(8, 8)).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelClosed));

        // The receiver is dropped while the thread unwinds.
        for _ in 0..100 {
            if !engine.is_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_available());
        assert_eq!(engine.unavailable_reason(), Some("engine thread exited"));
        assert!(matches!(
            engine.capture(png(8, 8)).await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_decode_failure_propagates() {
        let engine = spawn_engine(FacePipeline::new(Box::new(WholeImage), None)).unwrap();
        let err = engine.capture(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::DecodeFailure(_))));
    }
}
