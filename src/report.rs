use std::fmt::Display;

use clap::ValueEnum;
use serde::Serialize;

use crate::AppResult;

/// How the outcome of an evaluation is printed.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// A single human-readable line
    #[default]
    Text,

    /// A single JSON object with a `status` field
    Json,
}

/// Result of one evaluation run. The two skip variants are normal endings,
/// not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Scored {
        silhouette: f64,
        n_clusters: usize,
        n_documents: usize,
    },
    InsufficientLabels {
        distinct_labels: usize,
    },
    SingleCluster {
        n_clusters: usize,
    },
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Scored { silhouette, .. } => {
                write!(f, "Silhouette Score [Category Clustering]: {:.4}", silhouette)
            }
            Outcome::InsufficientLabels { .. } => write!(
                f,
                "Clustering evaluation skipped due to insufficient unique labels in the dataset."
            ),
            Outcome::SingleCluster { .. } => write!(
                f,
                "Silhouette Score cannot be computed because only one unique cluster was found."
            ),
        }
    }
}

impl Outcome {
    pub fn render(&self, format: OutputFormat) -> AppResult<String> {
        match format {
            OutputFormat::Text => Ok(self.to_string()),
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_line_has_four_decimals() {
        let outcome = Outcome::Scored {
            silhouette: 0.123456,
            n_clusters: 2,
            n_documents: 10,
        };
        assert_eq!(
            outcome.render(OutputFormat::Text).unwrap(),
            "Silhouette Score [Category Clustering]: 0.1235"
        );
    }

    #[test]
    fn negative_scores_keep_their_sign() {
        let outcome = Outcome::Scored {
            silhouette: -0.05,
            n_clusters: 3,
            n_documents: 7,
        };
        assert_eq!(
            outcome.to_string(),
            "Silhouette Score [Category Clustering]: -0.0500"
        );
    }

    #[test]
    fn skip_messages_are_fixed() {
        assert_eq!(
            Outcome::InsufficientLabels { distinct_labels: 1 }.to_string(),
            "Clustering evaluation skipped due to insufficient unique labels in the dataset."
        );
        assert_eq!(
            Outcome::SingleCluster { n_clusters: 4 }.to_string(),
            "Silhouette Score cannot be computed because only one unique cluster was found."
        );
    }

    #[test]
    fn json_is_tagged_by_status() {
        let json = Outcome::Scored {
            silhouette: 0.5,
            n_clusters: 2,
            n_documents: 10,
        }
        .render(OutputFormat::Json)
        .unwrap();
        assert_eq!(
            json,
            r#"{"status":"scored","silhouette":0.5,"n_clusters":2,"n_documents":10}"#
        );

        let skipped = Outcome::InsufficientLabels { distinct_labels: 0 }
            .render(OutputFormat::Json)
            .unwrap();
        assert_eq!(
            skipped,
            r#"{"status":"insufficient_labels","distinct_labels":0}"#
        );
    }
}
