use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;

use category_clustering_local_embedder::{EmbedderConfig, Pooling};
use clap::builder::RangedU64ValueParser;
use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{ArgAction, Args, ColorChoice, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::{Generator, Shell, generate};
use clap_complete_nushell::Nushell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::info;

use crate::AppResult;
use crate::classify::ClusterEvaluation;
use crate::classify::bert::BertEmbedder;
use crate::classify::kmeans::{KMeans, KMeansInit};
use crate::dataset::Dataset;
use crate::report::OutputFormat;

const BIN_NAME: &str = "category-clustering";

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "Category Clustering - How well do BERT embeddings separate your labels?

Each document is embedded with a pretrained \x1b]8;;https://huggingface.co/docs/transformers/model_doc/bert\x1b\\\x1b[4;36mBERT\x1b[24;39m\x1b]8;;\x1b\\ encoder,
the embeddings are partitioned with seeded k-means into as many clusters as there are distinct labels,
and the partition is scored with the silhouette coefficient (from -1 to 1, higher is better).

Datasets with fewer than two labels, and clusterings that collapse into a single group, are reported
as skipped rather than scored.";

/// Category Clustering - Score how well document embeddings cluster by label.
#[derive(Parser, Debug, Clone)]
#[command(author, version, propagate_version = true, about, long_about = Some(LONG_ABOUT), styles = STYLES)]
pub struct Cli {
    /// Color choice for the output
    #[arg(long, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands supported by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Embed, cluster and score a labelled CSV dataset
    Evaluate(EvaluateArgs),

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: CompletionShell,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },
}

/// Supported completion targets for shell auto-completion.
#[derive(ValueEnum, Clone, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
    Nushell,
}

impl Display for CompletionShell {
    /// Render the canonical shell name string.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionShell::Bash => "bash",
            CompletionShell::Zsh => "zsh",
            CompletionShell::Fish => "fish",
            CompletionShell::PowerShell => "powershell",
            CompletionShell::Elvish => "elvish",
            CompletionShell::Nushell => "nushell",
        };
        write!(f, "{}", s)
    }
}

impl Generator for &CompletionShell {
    fn generate(&self, cmd: &clap::builder::Command, buf: &mut dyn Write) {
        match self {
            CompletionShell::Bash => Shell::Bash.generate(cmd, buf),
            CompletionShell::Zsh => Shell::Zsh.generate(cmd, buf),
            CompletionShell::Fish => Shell::Fish.generate(cmd, buf),
            CompletionShell::PowerShell => Shell::PowerShell.generate(cmd, buf),
            CompletionShell::Elvish => Shell::Elvish.generate(cmd, buf),
            CompletionShell::Nushell => Nushell.generate(cmd, buf),
        }
    }

    fn file_name(&self, name: &str) -> String {
        match self {
            CompletionShell::Bash => Shell::Bash.file_name(name),
            CompletionShell::Zsh => Shell::Zsh.file_name(name),
            CompletionShell::Fish => Shell::Fish.file_name(name),
            CompletionShell::PowerShell => Shell::PowerShell.file_name(name),
            CompletionShell::Elvish => Shell::Elvish.file_name(name),
            CompletionShell::Nushell => Nushell.file_name(name),
        }
    }
}

/// Options for the `evaluate` command.
#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// CSV file with a header row
    #[arg(value_name = "DATA")]
    pub data: PathBuf,

    #[command(flatten)]
    pub dataset: DatasetArgs,

    #[command(flatten)]
    pub embedding: EmbeddingArgs,

    #[command(flatten)]
    pub clustering: ClusteringArgs,

    /// Output format for the result
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

/// Which columns of the CSV hold the documents and their labels.
#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Column holding the document text
    #[arg(long, default_value = "full_text")]
    pub text_column: String,

    /// Column holding the category label
    /// Empty cells are clustered but do not count as a label
    #[arg(long, default_value = "labels")]
    pub label_column: String,
}

/// Pooling of token states into one document vector.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolingArg {
    /// Average every position, padding included
    Mean,
    /// Average only the positions covered by the attention mask
    MaskedMean,
}

impl From<PoolingArg> for Pooling {
    fn from(value: PoolingArg) -> Self {
        match value {
            PoolingArg::Mean => Pooling::Mean,
            PoolingArg::MaskedMean => Pooling::MaskedMean,
        }
    }
}

/// Options controlling the encoder.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Local model directory (config.json, model.safetensors, tokenizer.json)
    /// or a Hugging Face model id to download into the cache
    #[arg(long, default_value = "bert_classification_model")]
    pub model: String,

    /// Maximum number of tokens per document; longer documents are truncated
    #[arg(long, default_value_t = 512, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_length: usize,

    /// Pad each batch to its longest document instead of to --max-length
    /// Needs --pooling masked-mean unless --batch-size is 1
    #[arg(long = "no-padding", default_value_t = true, action = ArgAction::SetFalse)]
    pub pad_to_max_length: bool,

    /// How token states are pooled into a document embedding
    #[arg(long, value_enum, default_value_t = PoolingArg::Mean)]
    pub pooling: PoolingArg,

    /// Number of documents per forward pass
    #[arg(long, default_value_t = 8, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub batch_size: usize,

    /// Run the encoder on the CPU even when an accelerator is available
    #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
    pub cpu: bool,
}

impl EmbeddingArgs {
    pub fn config(&self) -> EmbedderConfig {
        EmbedderConfig {
            max_length: self.max_length,
            pad_to_max_length: self.pad_to_max_length,
            pooling: self.pooling.into(),
            batch_size: self.batch_size,
            force_cpu: self.cpu,
        }
    }
}

/// Centroid seeding strategy.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitArg {
    /// Spread the initial centres apart, sampling by squared distance
    #[value(name = "k-means++")]
    KMeansPlusPlus,
    /// Pick initial centres uniformly from the documents
    Random,
}

/// Options controlling k-means.
#[derive(Args, Debug, Clone)]
pub struct ClusteringArgs {
    /// Seed for centroid initialization
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Centroid seeding strategy
    #[arg(long, value_enum, default_value_t = InitArg::KMeansPlusPlus)]
    pub init: InitArg,

    /// Number of seedings to try, keeping the lowest inertia
    /// Defaults to 1 for k-means++ and 10 for random
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub n_init: Option<usize>,

    /// Maximum Lloyd iterations per seeding
    #[arg(long, default_value_t = 300, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_iter: usize,

    /// Convergence tolerance, relative to the mean feature variance
    #[arg(long, default_value_t = 1e-4, value_parser = parse_tolerance)]
    pub tol: f64,
}

fn parse_tolerance(s: &str) -> Result<f64, String> {
    let tol: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if tol.is_finite() && tol >= 0.0 {
        Ok(tol)
    } else {
        Err(format!("`{s}` is not a finite, non-negative number"))
    }
}

impl ClusteringArgs {
    /// k-means with these settings; the cluster count is filled in per dataset.
    pub fn kmeans(&self) -> KMeans {
        let n_init = self.n_init.unwrap_or(0);
        let init = match self.init {
            InitArg::KMeansPlusPlus => KMeansInit::KMeansPlusPlus(n_init),
            InitArg::Random => KMeansInit::Random(n_init),
        };
        let mut kmeans = KMeans::default();
        kmeans
            .set_init(init)
            .set_max_iterations(self.max_iter)
            .set_tolerance(self.tol)
            .set_seed(self.seed);
        kmeans
    }
}

/// Helper trait for accessing verbosity flags on commands.
pub trait GetVerbosity {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel>;
}

impl GetVerbosity for Cmd {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel> {
        match self {
            Cmd::Evaluate(args) => &args.verbosity,
            Cmd::Completion { verbosity, .. } => verbosity,
        }
    }
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "info", skip(self))]
    pub async fn run(&self) -> AppResult<()> {
        match self {
            Cmd::Evaluate(args) => args.run().await,
            Cmd::Completion { shell, output, .. } => {
                let mut cmd = Cli::command();
                if let Some(output_path) = output {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .create(true)
                        .open(output_path)?;
                    generate(shell, &mut cmd, BIN_NAME, &mut file);
                    info!(
                        "Generated completion script for {} at {}",
                        shell,
                        output_path.display()
                    );
                } else {
                    generate(shell, &mut cmd, BIN_NAME, &mut std::io::stdout());
                }
                Ok(())
            }
        }
    }
}

impl EvaluateArgs {
    /// Load the encoder and the dataset, run the evaluation and print its outcome.
    pub async fn run(&self) -> AppResult<()> {
        let embedder = BertEmbedder::load(&self.embedding.model, self.embedding.config()).await?;
        let dataset = Dataset::from_path(
            &self.data,
            &self.dataset.text_column,
            &self.dataset.label_column,
        )?;

        let evaluation = ClusterEvaluation::new(embedder, self.clustering.kmeans());
        let outcome = evaluation.run(&dataset).await?;
        tracing_indicatif::indicatif_println!("{}", outcome.render(self.format)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate(args: &[&str]) -> EvaluateArgs {
        let cli = Cli::try_parse_from([BIN_NAME, "evaluate"].iter().chain(args).copied()).unwrap();
        match cli.cmd {
            Cmd::Evaluate(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn evaluate_defaults() {
        let args = evaluate(&["papers.csv"]);
        assert_eq!(args.data, PathBuf::from("papers.csv"));
        assert_eq!(args.dataset.text_column, "full_text");
        assert_eq!(args.dataset.label_column, "labels");
        assert_eq!(args.embedding.model, "bert_classification_model");
        assert_eq!(args.embedding.config(), EmbedderConfig::default());
        assert_eq!(args.format, OutputFormat::Text);

        let kmeans = args.clustering.kmeans();
        assert_eq!(kmeans.seed, 42);
        assert_eq!(kmeans.init, KMeansInit::KMeansPlusPlus(0));
        assert_eq!(kmeans.init.n_init(), 1);
        assert_eq!(kmeans.max_iterations, 300);
        assert_eq!(kmeans.tolerance, 1e-4);
    }

    #[test]
    fn embedding_options_reach_the_config() {
        let args = evaluate(&[
            "papers.csv",
            "--max-length",
            "128",
            "--no-padding",
            "--pooling",
            "masked-mean",
            "--batch-size",
            "2",
            "--cpu",
        ]);
        assert_eq!(
            args.embedding.config(),
            EmbedderConfig {
                max_length: 128,
                pad_to_max_length: false,
                pooling: Pooling::MaskedMean,
                batch_size: 2,
                force_cpu: true,
            }
        );
    }

    #[test]
    fn clustering_options_reach_kmeans() {
        let args = evaluate(&[
            "papers.csv",
            "--init",
            "random",
            "--seed",
            "7",
            "--max-iter",
            "50",
            "--format",
            "json",
        ]);
        let kmeans = args.clustering.kmeans();
        assert_eq!(kmeans.init, KMeansInit::Random(0));
        assert_eq!(kmeans.init.n_init(), 10);
        assert_eq!(kmeans.seed, 7);
        assert_eq!(kmeans.max_iterations, 50);
        assert_eq!(args.format, OutputFormat::Json);

        let args = evaluate(&["papers.csv", "--init", "k-means++", "--n-init", "4"]);
        assert_eq!(
            args.clustering.kmeans().init,
            KMeansInit::KMeansPlusPlus(4)
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        for flag in ["--max-length", "--batch-size", "--n-init", "--max-iter"] {
            let parsed = Cli::try_parse_from([BIN_NAME, "evaluate", "papers.csv", flag, "0"]);
            assert!(parsed.is_err(), "{flag} 0 was accepted");
        }
    }

    #[test]
    fn tolerance_must_be_finite_and_non_negative() {
        for bad in ["-0.1", "NaN", "inf", "abc"] {
            let parsed =
                Cli::try_parse_from([BIN_NAME, "evaluate", "papers.csv", "--tol", bad]);
            assert!(parsed.is_err(), "--tol {bad} was accepted");
        }
        let args = evaluate(&["papers.csv", "--tol", "0"]);
        assert_eq!(args.clustering.kmeans().tolerance, 0.0);
    }

    #[test]
    fn completion_takes_a_shell() {
        let cli = Cli::try_parse_from([BIN_NAME, "completion", "nushell"]).unwrap();
        match cli.cmd {
            Cmd::Completion { shell, output, .. } => {
                assert_eq!(shell.to_string(), "nushell");
                assert!(output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
