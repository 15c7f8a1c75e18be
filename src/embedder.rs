//! Deep-feature embedding of image crops.
//!
//! A crop is resized to 224x224, normalized with ImageNet statistics, and
//! pushed through a pretrained backbone (classification head removed) to a
//! fixed-dimensional descriptor. The output dimension is a deployment-wide
//! constant (1280 for the mobile-class backbone, 2048 for the residual one).
//!
//! The tract model is not shared across threads; all inference runs on one
//! dedicated worker thread fed by two queues. Interactive requests are
//! drained before background ones, so a long analysis run cannot starve an
//! interactive caller.

use anyhow::{Context, Result};
use image::{RgbImage, imageops};
use std::path::Path;
use std::thread;
use tracing::{debug, error, info};

pub const INPUT_SIZE: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Result of embedding one crop. Failed crops keep their slot (order is
/// preserved) with a zero vector and the error recorded.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub error: Option<String>,
}

impl EmbeddingResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Seam for the embedding backbone; the production implementation is
/// `OnnxEmbedder`.
pub trait Embedder: Send {
    fn dim(&self) -> usize;

    /// Embed a single crop. Implementations must be deterministic: the same
    /// input always produces the same vector.
    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>>;

    /// Embed a batch, order preserved, one result per input. Inputs are
    /// never silently dropped: a crop that cannot be embedded yields a zero
    /// vector with its error flagged.
    fn embed_batch(&self, crops: &[RgbImage]) -> Vec<EmbeddingResult> {
        crops
            .iter()
            .map(|crop| {
                if crop.width() == 0 || crop.height() == 0 {
                    return EmbeddingResult {
                        vector: vec![0.0; self.dim()],
                        error: Some("zero-area crop".to_string()),
                    };
                }
                match self.embed(crop) {
                    Ok(vector) => EmbeddingResult {
                        vector,
                        error: None,
                    },
                    Err(e) => EmbeddingResult {
                        vector: vec![0.0; self.dim()],
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect()
    }
}

/// Cosine similarity in [-1, 1]. Zero-norm inputs (failed crops) yield 0,
/// which downstream classification treats as "not the same vehicle".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Fixed preprocessing: 224x224 resize, RGB channel order, ImageNet
/// mean/std normalization, NCHW layout.
pub fn preprocess(crop: &RgbImage) -> tract_onnx::prelude::Tensor {
    use tract_onnx::prelude::*;

    let resized = imageops::resize(
        crop,
        INPUT_SIZE,
        INPUT_SIZE,
        imageops::FilterType::Triangle,
    );
    let mut input =
        tract_ndarray::Array4::<f32>::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel.0[c]) / 255.0;
            input[[0, c, y as usize, x as usize]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    Tensor::from(input)
}

/// Pretrained backbone behind tract. Loaded once at startup; a missing or
/// unreadable model file is fatal.
pub struct OnnxEmbedder {
    model: tract_onnx::prelude::TypedRunnableModel<tract_onnx::prelude::TypedModel>,
    dim: usize,
}

impl OnnxEmbedder {
    pub fn load(path: &Path, dim: usize) -> Result<Self> {
        use tract_onnx::prelude::*;

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to read embedder model {}", path.display()))?
            .with_input_fact(
                0,
                f32::fact([1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize]).into(),
            )?
            .into_optimized()?
            .into_runnable()?;

        info!(model = %path.display(), dim, "loaded embedding backbone");
        Ok(Self { model, dim })
    }
}

impl Embedder for OnnxEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        use tract_onnx::prelude::*;

        let input = preprocess(crop);
        let outputs = self.model.run(tvec!(input.into()))?;
        let view = outputs[0].to_array_view::<f32>()?;
        let mut vector: Vec<f32> = view.iter().copied().collect();
        if vector.len() != self.dim {
            anyhow::bail!(
                "backbone produced {} values, expected {}",
                vector.len(),
                self.dim
            );
        }

        // L2-normalize so cosine comparison reduces to a dot product.
        let norm = vector.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value = (f64::from(*value) / norm) as f32;
            }
        }
        Ok(vector)
    }
}

/// Request priority. Interactive work preempts queued background batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Interactive,
    Background,
}

struct EmbedRequest {
    crops: Vec<RgbImage>,
    reply: tokio::sync::oneshot::Sender<Vec<EmbeddingResult>>,
}

/// Handle to the single inference worker thread. Cheap to clone; dropping
/// every handle shuts the worker down.
#[derive(Clone)]
pub struct EmbeddingWorker {
    interactive_tx: flume::Sender<EmbedRequest>,
    background_tx: flume::Sender<EmbedRequest>,
    dim: usize,
}

impl EmbeddingWorker {
    /// Move the embedder onto a dedicated thread and return the handle.
    pub fn spawn(embedder: Box<dyn Embedder>) -> Self {
        let (interactive_tx, interactive_rx) = flume::unbounded::<EmbedRequest>();
        let (background_tx, background_rx) = flume::unbounded::<EmbedRequest>();
        let dim = embedder.dim();

        thread::Builder::new()
            .name("embedding-worker".to_string())
            .spawn(move || worker_loop(embedder, interactive_rx, background_rx))
            .expect("failed to spawn embedding worker thread");

        Self {
            interactive_tx,
            background_tx,
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed a batch on the worker thread, preserving input order.
    pub async fn embed_batch(
        &self,
        priority: Priority,
        crops: Vec<RgbImage>,
    ) -> Result<Vec<EmbeddingResult>> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let request = EmbedRequest {
            crops,
            reply: reply_tx,
        };
        let queue = match priority {
            Priority::Interactive => &self.interactive_tx,
            Priority::Background => &self.background_tx,
        };
        queue
            .send_async(request)
            .await
            .map_err(|_| anyhow::anyhow!("embedding worker has shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("embedding worker dropped the request"))
    }
}

fn worker_loop(
    embedder: Box<dyn Embedder>,
    interactive_rx: flume::Receiver<EmbedRequest>,
    background_rx: flume::Receiver<EmbedRequest>,
) {
    debug!("embedding worker started");
    loop {
        // Interactive queue drains first.
        let request = match interactive_rx.try_recv() {
            Ok(request) => Some(request),
            Err(flume::TryRecvError::Empty) | Err(flume::TryRecvError::Disconnected) => None,
        };

        let request = match request {
            Some(request) => request,
            None => {
                let selected = flume::Selector::new()
                    .recv(&interactive_rx, |r| r.ok())
                    .recv(&background_rx, |r| r.ok())
                    .wait();
                match selected {
                    Some(request) => request,
                    None => {
                        if interactive_rx.is_disconnected() && background_rx.is_disconnected() {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        let start = std::time::Instant::now();
        let batch = embedder.embed_batch(&request.crops);
        metrics::histogram!("embedder.batch_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        if request.reply.send(batch).is_err() {
            error!("embedding caller went away before receiving results");
        }
    }
    debug!("embedding worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic toy embedder: 8-dim channel statistics.
    struct StatsEmbedder;

    impl Embedder for StatsEmbedder {
        fn dim(&self) -> usize {
            8
        }

        fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
            let n = (crop.width() * crop.height()) as f32;
            let mut sums = [0f32; 3];
            for pixel in crop.pixels() {
                for c in 0..3 {
                    sums[c] += f32::from(pixel.0[c]);
                }
            }
            let mut v = vec![
                sums[0] / n,
                sums[1] / n,
                sums[2] / n,
                n.sqrt(),
                1.0,
                0.0,
                0.0,
                0.0,
            ];
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            for x in &mut v {
                *x /= norm;
            }
            Ok(v)
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3f32, -0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_opposed_vectors_is_negative_one() {
        let a = vec![1.0f32, 0.0];
        let b = vec![-1.0f32, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        let a = vec![0.0f32; 4];
        let b = vec![1.0f32; 4];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_of_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn batch_preserves_order_and_flags_zero_area() {
        let embedder = StatsEmbedder;
        let good = RgbImage::from_pixel(10, 10, image::Rgb([200, 10, 10]));
        let empty = RgbImage::new(0, 0);
        let other = RgbImage::from_pixel(10, 10, image::Rgb([10, 200, 10]));

        let results = embedder.embed_batch(&[good.clone(), empty, other.clone()]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
        assert!(results[2].is_ok());
        assert!(results[1].vector.iter().all(|&v| v == 0.0));
        assert_eq!(results[1].vector.len(), 8);
        assert_ne!(results[0].vector, results[2].vector);
    }

    #[test]
    fn embedding_is_deterministic() {
        let embedder = StatsEmbedder;
        let crop = RgbImage::from_pixel(16, 16, image::Rgb([77, 120, 33]));
        assert_eq!(
            embedder.embed(&crop).unwrap(),
            embedder.embed(&crop).unwrap()
        );
    }

    #[tokio::test]
    async fn worker_serves_batches_and_keeps_order() {
        let worker = EmbeddingWorker::spawn(Box::new(StatsEmbedder));
        let crops = vec![
            RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 0])),
            RgbImage::from_pixel(8, 8, image::Rgb([0, 255, 0])),
        ];
        let results = worker
            .embed_batch(Priority::Background, crops.clone())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let direct = StatsEmbedder.embed_batch(&crops);
        assert_eq!(results[0].vector, direct[0].vector);
        assert_eq!(results[1].vector, direct[1].vector);

        // Interactive path works on the same worker.
        let interactive = worker
            .embed_batch(Priority::Interactive, vec![crops[0].clone()])
            .await
            .unwrap();
        assert_eq!(interactive[0].vector, direct[0].vector);
    }
}
