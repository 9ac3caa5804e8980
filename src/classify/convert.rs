use ndarray::prelude::*;
use tracing::trace;

use crate::{AppError, AppResult};

/// Stack per-document vectors into an `(n_documents, dim)` matrix.
#[tracing::instrument(name = "Stacking embeddings", level = "debug", skip(embs))]
pub fn embeddings_to_ndarray(embs: &[Vec<f32>]) -> AppResult<Array2<f64>> {
    let dim = match embs.first() {
        Some(first) if !first.is_empty() => first.len(),
        Some(_) => {
            return Err(AppError::InvalidEmbeddings(
                "embeddings have zero dimensions".to_string(),
            ));
        }
        None => return Err(AppError::InvalidEmbeddings("no embeddings".to_string())),
    };
    if let Some((i, ragged)) = embs.iter().enumerate().find(|(_, e)| e.len() != dim) {
        return Err(AppError::InvalidEmbeddings(format!(
            "embedding {} has {} dimensions, expected {}",
            i,
            ragged.len(),
            dim
        )));
    }

    let flat: Vec<f64> = embs.iter().flatten().map(|&v| v as f64).collect();
    let arr = Array2::from_shape_vec((embs.len(), dim), flat)?;
    trace!("Initialized ndarray with shape: {:?}", arr.dim());
    Ok(arr)
}
