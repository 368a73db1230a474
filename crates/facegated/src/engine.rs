use facegate_core::{Embedding, EncodingExtractor, ExtractionError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, ExtractionError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    dimension: usize,
}

impl EngineHandle {
    /// Turn an image into an embedding on the engine thread.
    ///
    /// Extraction failures come back unchanged and are never retried.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Dimension of the vectors the extractor produces.
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// Inference needs exclusive access to the model session, so all requests
/// are serialised through a bounded channel.
pub fn spawn_engine(mut extractor: Box<dyn EncodingExtractor>) -> Result<EngineHandle, EngineError> {
    let dimension = extractor.dimension();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let result = extractor.extract(&image);
                        if let Err(err) = &result {
                            tracing::debug!(error = %err, bytes = image.len(), "extraction failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, dimension })
}
