use crate::{EmbedderError, Result};

/// How token-level hidden states are reduced to one vector per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pooling {
    /// Average over every position of the sequence, padding included.
    #[default]
    Mean,
    /// Average over positions with a non-zero attention mask.
    MaskedMean,
}

/// Tokenization and batching settings held for the lifetime of an embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderConfig {
    /// Token budget per document; anything past it is silently dropped.
    pub max_length: usize,
    /// Pad every sequence to `max_length` instead of the longest in the batch.
    pub pad_to_max_length: bool,
    pub pooling: Pooling,
    pub batch_size: usize,
    pub force_cpu: bool,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            max_length: 512,
            pad_to_max_length: true,
            pooling: Pooling::Mean,
            batch_size: 8,
            force_cpu: false,
        }
    }
}

impl EmbedderConfig {
    /// Check the settings against the position limit of the loaded model.
    pub fn validate(&self, max_position_embeddings: usize) -> Result<()> {
        if self.max_length == 0 {
            return Err(EmbedderError::InvalidConfig(
                "max_length must be at least 1".to_string(),
            ));
        }
        if self.max_length > max_position_embeddings {
            return Err(EmbedderError::InvalidConfig(format!(
                "max_length {} exceeds the model's {} position embeddings",
                self.max_length, max_position_embeddings
            )));
        }
        if self.batch_size == 0 {
            return Err(EmbedderError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        // Batch-longest padding under a plain mean would make a document's
        // vector depend on its batch neighbours.
        if !self.pad_to_max_length && self.pooling == Pooling::Mean && self.batch_size > 1 {
            return Err(EmbedderError::InvalidConfig(
                "unpadded batches need masked-mean pooling or a batch size of 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fit_a_bert_base_model() {
        let config = EmbedderConfig::default();
        assert_eq!(config.max_length, 512);
        assert!(config.pad_to_max_length);
        assert_eq!(config.pooling, Pooling::Mean);
        assert!(config.validate(512).is_ok());
    }

    #[test]
    fn rejects_length_past_position_embeddings() {
        let config = EmbedderConfig {
            max_length: 1024,
            ..Default::default()
        };
        let err = config.validate(512).unwrap_err();
        assert!(matches!(err, EmbedderError::InvalidConfig(_)));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn rejects_zero_length_and_zero_batch() {
        let zero_len = EmbedderConfig {
            max_length: 0,
            ..Default::default()
        };
        assert!(zero_len.validate(512).is_err());

        let zero_batch = EmbedderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate(512).is_err());
    }

    #[test]
    fn unpadded_mean_pooling_needs_single_document_batches() {
        let batched = EmbedderConfig {
            pad_to_max_length: false,
            pooling: Pooling::Mean,
            batch_size: 8,
            ..Default::default()
        };
        assert!(matches!(
            batched.validate(512),
            Err(EmbedderError::InvalidConfig(_))
        ));

        let single = EmbedderConfig {
            batch_size: 1,
            ..batched.clone()
        };
        assert!(single.validate(512).is_ok());

        let masked = EmbedderConfig {
            pooling: Pooling::MaskedMean,
            ..batched
        };
        assert!(masked.validate(512).is_ok());
    }
}
