mod config;

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use category_clustering_dirs::CacheDir;
use futures::StreamExt;
use murmur3::murmur3_x86_128;
use serde::Deserialize;
use tokenizers::tokenizer::Tokenizer;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

pub use config::{EmbedderConfig, Pooling};

#[derive(thiserror::Error, Debug)]
pub enum EmbedderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Int parse error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Header value error: {0}")]
    HeaderValue(#[from] reqwest::header::ToStrError),
    #[error("Invalid embedder configuration: {0}")]
    InvalidConfig(String),
    #[error("Embedding task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Other error: {0}")]
    Other(String),
    #[error("{0}")]
    Dir(#[from] category_clustering_dirs::DirError),
}

// Tokenizer error mapping
impl From<Box<dyn std::error::Error + Send + Sync>> for EmbedderError {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Tokenizer(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EmbedderError>;

/// Files a model directory must provide.
const MODEL_FILES: [&str; 3] = ["config.json", "model.safetensors", "tokenizer.json"];

/// The one field of `config.json` needed to validate the token budget.
#[derive(Deserialize)]
struct PositionLimit {
    max_position_embeddings: usize,
}

type Memo = HashMap<u128, Vec<f32>>;

/// Wrapper around a BERT encoder producing one pooled vector per document.
///
/// Vectors are memoized in memory by text hash for the lifetime of the
/// embedder, so repeated documents are only run through the model once.
#[derive(Clone)]
pub struct BertEmbedder {
    device: Device,
    model: Arc<BertModel>,
    tokenizer: Arc<Tokenizer>,
    config: EmbedderConfig,
    memo: Arc<Mutex<Memo>>,
}

impl BertEmbedder {
    fn create_device(force_cpu: bool) -> Result<Device> {
        if force_cpu {
            return Ok(Device::Cpu);
        }

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            Ok(Device::new_metal(0)?)
        }

        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            Ok(Device::cuda_if_available(0)?)
        }
    }

    #[tracing::instrument(
        name = "Downloading embedding model from Hugging Face",
        level = "info",
        skip(config)
    )]
    pub async fn new_from_pretrained<S: AsRef<str> + std::fmt::Debug>(
        model_name: S,
        config: EmbedderConfig,
    ) -> Result<Self> {
        let model_dir = CacheDir
            .ensure_model_dir_async(model_name.as_ref())
            .await?;

        let base_url = format!(
            "https://huggingface.co/{}/resolve/main/",
            model_name.as_ref()
        );

        let client = reqwest::ClientBuilder::new()
            .user_agent("category-clustering-embedder/0.1.0")
            .redirect(reqwest::redirect::Policy::limited(10))
            .referer(true)
            .retry(reqwest::retry::for_host("huggingface.co").max_retries_per_request(3))
            .build()?;

        for file in MODEL_FILES {
            let file_path = model_dir.join(file);
            if file_path.exists() {
                debug!("Using cached {}", file_path.display());
                continue;
            }
            let part_path = model_dir.join(format!("{file}.part"));
            let mut open_file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&part_path)
                .await?;
            let url = format!("{}{}", base_url, file);
            let resp = client.get(&url).send().await?.error_for_status()?;

            let header_span = info_span!("Downloading model file", file = %file);
            header_span.pb_set_message("Downloading...");
            header_span.pb_set_finish_message("Download complete");

            if let Some(content_length) = resp.headers().get(reqwest::header::CONTENT_LENGTH) {
                let file_size: u64 = content_length.to_str()?.parse()?;
                debug!("Expected file size: {} bytes", file_size);
                header_span.pb_set_style(&progress_style(
                    ProgressStyle::default_bar(),
                    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                ));
                header_span.pb_set_length(file_size);
            } else {
                warn!("Content-Length header not found.");
                header_span.pb_set_style(&progress_style(
                    ProgressStyle::default_spinner(),
                    "{msg} {spinner}",
                ));
            }
            let _enter = header_span.enter();

            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                open_file.write_all(&chunk).await?;
                header_span.pb_inc(chunk.len() as u64);
            }
            open_file.flush().await?;
            open_file.sync_all().await?;
            open_file.shutdown().await?;
            tokio::fs::rename(&part_path, &file_path).await?;
        }

        Self::new_from_dir(model_dir, config)
    }

    #[tracing::instrument(
        name = "Loading embedding model from directory",
        level = "info",
        skip(model_dir, config)
    )]
    pub fn new_from_dir<P: AsRef<Path>>(model_dir: P, config: EmbedderConfig) -> Result<Self> {
        let model_dir = model_dir.as_ref();

        let config_bytes = std::fs::read(model_dir.join("config.json"))?;
        let bert_config: BertConfig = serde_json::from_slice(&config_bytes)?;
        let limit: PositionLimit = serde_json::from_slice(&config_bytes)?;
        config.validate(limit.max_position_embeddings)?;

        let mut tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))?;
        configure_tokenizer(&mut tokenizer, &config)?;

        let device = Self::create_device(config.force_cpu)?;
        info!("Embedding on {:?}", device);

        let weights_data = std::fs::read(model_dir.join("model.safetensors"))?;
        let vb = VarBuilder::from_slice_safetensors(&weights_data, DType::F32, &device)?;

        let model = BertModel::load(vb, &bert_config)?;

        Ok(Self {
            device,
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            config,
            memo: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    /// Run one batch of texts through the encoder, bypassing the memo.
    pub fn embed_batch_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let encodings = self.tokenizer.encode_batch(texts.to_vec(), true)?;

        let batch_size = encodings.len();
        let seq_len = encodings[0].len();
        let mut ids = Vec::with_capacity(batch_size * seq_len);
        let mut type_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attn_mask = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            type_ids.extend_from_slice(encoding.get_type_ids());
            attn_mask.extend_from_slice(encoding.get_attention_mask());
        }

        let input_ids = Tensor::from_vec(ids, (batch_size, seq_len), &self.device)?;
        let token_type_ids = Tensor::from_vec(type_ids, (batch_size, seq_len), &self.device)?;
        let attention_mask = Tensor::from_vec(attn_mask, (batch_size, seq_len), &self.device)?;

        let outputs = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let pooled = pool(&outputs, &attention_mask, self.config.pooling)?;
        Ok(pooled.to_vec2::<f32>()?)
    }

    /// Embed every text in order, reusing memoized vectors for repeated texts.
    pub fn embed_texts_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_memoized(&self.memo, texts, self.config.batch_size, |batch| {
            self.embed_batch_blocking(batch)
        })
    }

    pub async fn embed_texts<'a>(&'a self, texts: &'a [String]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.clone();
        let texts: Vec<String> = texts.to_vec();
        tokio::task::spawn_blocking(move || embedder.embed_texts_blocking(&texts)).await?
    }
}

/// Look up each text in `memo`, run only the unseen distinct texts through
/// `encode` in chunks of `batch_size`, and return one vector per input text.
fn embed_memoized<F>(
    memo: &Mutex<Memo>,
    texts: &[String],
    batch_size: usize,
    mut encode: F,
) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(&[String]) -> Result<Vec<Vec<f32>>>,
{
    let keys = texts
        .iter()
        .map(|t| text_key(t))
        .collect::<Result<Vec<u128>>>()?;

    let pending: Vec<(u128, String)> = {
        let memo = lock_memo(memo)?;
        let mut seen = HashSet::new();
        keys.iter()
            .zip(texts)
            .filter(|(key, _)| !memo.contains_key(*key) && seen.insert(**key))
            .map(|(key, text)| (*key, text.clone()))
            .collect()
    };
    debug!(
        "{} of {} documents need encoding",
        pending.len(),
        texts.len()
    );

    let header_span = info_span!("Embedding documents");
    header_span.pb_set_message("Embedding...");
    header_span.pb_set_finish_message("Embedding complete");
    header_span.pb_set_length(pending.len() as u64);
    header_span.pb_set_style(&progress_style(
        ProgressStyle::default_bar(),
        "{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
    ));
    let header_span_enter = header_span.enter();

    for chunk in pending.chunks(batch_size.max(1)) {
        let batch: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
        let vectors = encode(&batch)?;
        if vectors.len() != batch.len() {
            return Err(EmbedderError::Other(format!(
                "encoder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }
        let mut memo = lock_memo(memo)?;
        for ((key, _), vector) in chunk.iter().zip(vectors) {
            memo.insert(*key, vector);
        }
        header_span.pb_inc(chunk.len() as u64);
    }
    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    let memo = lock_memo(memo)?;
    keys.iter()
        .map(|key| {
            memo.get(key)
                .cloned()
                .ok_or_else(|| EmbedderError::Other(format!("no embedding for key {key}")))
        })
        .collect()
}

fn lock_memo(memo: &Mutex<Memo>) -> Result<MutexGuard<'_, Memo>> {
    memo.lock()
        .map_err(|e| EmbedderError::Other(format!("embedding memo poisoned: {e}")))
}

/// Apply the token budget and padding policy on top of whatever `tokenizer.json` ships with.
fn configure_tokenizer(tokenizer: &mut Tokenizer, config: &EmbedderConfig) -> Result<()> {
    tokenizer.with_truncation(Some(TruncationParams {
        max_length: config.max_length,
        ..Default::default()
    }))?;

    let pad_token = tokenizer
        .get_padding()
        .map(|p| p.pad_token.clone())
        .unwrap_or_else(|| "[PAD]".to_string());
    let pad_id = tokenizer.token_to_id(&pad_token).unwrap_or(0);
    let strategy = if config.pad_to_max_length {
        PaddingStrategy::Fixed(config.max_length)
    } else {
        PaddingStrategy::BatchLongest
    };
    tokenizer.with_padding(Some(PaddingParams {
        strategy,
        pad_id,
        pad_token,
        ..Default::default()
    }));
    Ok(())
}

/// Reduce `(batch, seq, hidden)` states to `(batch, hidden)`.
pub fn pool(hidden: &Tensor, attention_mask: &Tensor, pooling: Pooling) -> Result<Tensor> {
    match pooling {
        Pooling::Mean => Ok(hidden.mean(1)?),
        Pooling::MaskedMean => {
            let mask = attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?; // (batch, seq, 1)
            let summed = hidden.broadcast_mul(&mask)?.sum(1)?; // (batch, hidden)
            let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?; // (batch, 1)
            Ok(summed.broadcast_div(&counts)?)
        }
    }
}

fn text_key(text: &str) -> Result<u128> {
    Ok(murmur3_x86_128(&mut Cursor::new(text), 0)?)
}

fn progress_style(base: ProgressStyle, template: &str) -> ProgressStyle {
    base.clone().template(template).unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Whitespace-split word-level vocabulary with `[PAD]` at id 0.
    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": { "[PAD]": 0, "[UNK]": 1, "a": 2, "b": 3, "c": 4, "d": 5, "e": 6 },
            "unk_token": "[UNK]"
        }
    }"#;

    fn word_level_tokenizer(config: &EmbedderConfig) -> Tokenizer {
        let mut tokenizer = Tokenizer::from_str(WORD_LEVEL).unwrap();
        configure_tokenizer(&mut tokenizer, config).unwrap();
        tokenizer
    }

    fn first_byte(batch: &[String]) -> Vec<Vec<f32>> {
        batch.iter().map(|t| vec![t.as_bytes()[0] as f32]).collect()
    }

    fn owned(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    fn hidden_states() -> (Tensor, Tensor) {
        let hidden = Tensor::new(
            &[[[1f32, 2.0], [3.0, 4.0], [100.0, 100.0]]],
            &Device::Cpu,
        )
        .unwrap(); // (1, 3, 2)
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap(); // (1, 3)
        (hidden, mask)
    }

    #[test]
    fn mean_pooling_includes_padding_positions() {
        let (hidden, mask) = hidden_states();
        let pooled = pool(&hidden, &mask, Pooling::Mean)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(pooled.len(), 1);
        assert!((pooled[0][0] - 104.0 / 3.0).abs() < 1e-4);
        assert!((pooled[0][1] - 106.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn masked_mean_pooling_skips_padding_positions() {
        let (hidden, mask) = hidden_states();
        let pooled = pool(&hidden, &mask, Pooling::MaskedMean)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!((pooled[0][0] - 2.0).abs() < 1e-6);
        assert!((pooled[0][1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn masked_mean_pooling_is_per_row() {
        let hidden = Tensor::new(
            &[[[2f32, 2.0], [4.0, 4.0]], [[1.0, 3.0], [9.0, 9.0]]],
            &Device::Cpu,
        )
        .unwrap(); // (2, 2, 2)
        let mask = Tensor::new(&[[1u32, 1], [1, 0]], &Device::Cpu).unwrap();
        let pooled = pool(&hidden, &mask, Pooling::MaskedMean)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(pooled, vec![vec![3.0, 3.0], vec![1.0, 3.0]]);
    }

    #[test]
    fn text_keys_are_stable_and_distinct() {
        let a = text_key("graph neural networks").unwrap();
        let b = text_key("graph neural networks").unwrap();
        let c = text_key("graph neural network").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tokenizer_truncates_and_pads_to_max_length() {
        let config = EmbedderConfig {
            max_length: 3,
            ..Default::default()
        };
        let tokenizer = word_level_tokenizer(&config);

        let encodings = tokenizer.encode_batch(vec!["a b c d e", "a"], true).unwrap();

        assert_eq!(encodings[0].get_ids(), &[2, 3, 4]);
        assert_eq!(encodings[1].get_ids(), &[2, 0, 0]);
        assert_eq!(encodings[1].get_attention_mask(), &[1, 0, 0]);
    }

    #[test]
    fn unpadded_batches_pad_to_their_longest_text() {
        let config = EmbedderConfig {
            max_length: 4,
            pad_to_max_length: false,
            pooling: Pooling::MaskedMean,
            ..Default::default()
        };
        let tokenizer = word_level_tokenizer(&config);

        let pair = tokenizer.encode_batch(vec!["a", "b c"], true).unwrap();
        assert_eq!(pair[0].get_ids(), &[2, 0]);
        assert_eq!(pair[1].get_ids(), &[3, 4]);

        let alone = tokenizer.encode_batch(vec!["a"], true).unwrap();
        assert_eq!(alone[0].get_ids(), &[2]);

        let long = tokenizer.encode_batch(vec!["a b c d e"], true).unwrap();
        assert_eq!(long[0].get_ids(), &[2, 3, 4, 5]);
    }

    #[test]
    fn repeated_texts_are_encoded_once_and_returned_in_order() {
        let memo = Mutex::new(Memo::new());
        let mut encoded: Vec<String> = Vec::new();

        let vectors = embed_memoized(&memo, &owned(&["x", "y", "x"]), 8, |batch| {
            encoded.extend(batch.iter().cloned());
            Ok(first_byte(batch))
        })
        .unwrap();

        assert_eq!(encoded, vec!["x", "y"]);
        assert_eq!(vectors, vec![vec![120.0], vec![121.0], vec![120.0]]);
    }

    #[test]
    fn memo_carries_over_between_calls() {
        let memo = Mutex::new(Memo::new());
        embed_memoized(&memo, &owned(&["x", "y"]), 8, |batch| Ok(first_byte(batch))).unwrap();

        let mut batches: Vec<usize> = Vec::new();
        let vectors = embed_memoized(&memo, &owned(&["y", "z", "x", "w", "v"]), 2, |batch| {
            batches.push(batch.len());
            Ok(first_byte(batch))
        })
        .unwrap();

        assert_eq!(batches, vec![2, 1]);
        assert_eq!(
            vectors,
            vec![vec![121.0], vec![122.0], vec![120.0], vec![119.0], vec![118.0]]
        );
    }

    #[test]
    fn short_encoder_output_is_an_error() {
        let memo = Mutex::new(Memo::new());
        let err = embed_memoized(&memo, &owned(&["x", "y"]), 8, |_| Ok(vec![vec![1.0]]))
            .unwrap_err();
        assert!(matches!(err, EmbedderError::Other(_)));
    }
}
