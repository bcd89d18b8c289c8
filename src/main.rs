//! rnnlm - RNN language model toolkit
//!
//! Command-line driver for the training core.
//!
//! # Usage
//!
//! ```bash
//! # Finite-difference check of both output layers' gradients
//! rnnlm grad-check --vocab 10 --hidden 5
//! rnnlm grad-check --flat --bptt 4
//!
//! # Train on a synthetic cyclic corpus and sample from the result
//! rnnlm sample --epochs 200 --learning-rate 0.1
//! ```
//!
//! # Environment Variables
//!
//! - `RNNLM_CONFIG`: Path to a TOML config file (default: ./rnnlm.toml)
//! - `RUST_LOG`: Logging level (default: info)

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use rnnlm::config::{ModelConfig, OutputKind};
use rnnlm::rnn::eval::perplexity;
use rnnlm::rnn::RnnLm;

/// Words per training window in the synthetic corpus.
const WINDOW: usize = 8;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "rnnlm")]
#[command(about = "RNN language model with truncated BPTT and hierarchical softmax")]
#[command(version)]
struct CliArgs {
    /// Explicit TOML config file (overrides $RNNLM_CONFIG and ./rnnlm.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Check analytic gradients against central differences on a random model
    GradCheck {
        /// Vocabulary size
        #[arg(long, default_value = "10")]
        vocab: usize,
        /// Hidden dimension
        #[arg(long, default_value = "5")]
        hidden: usize,
        /// Sequence length (xs = 0..len, ys = 1..=len)
        #[arg(long, default_value = "5")]
        len: usize,
        /// Use the flat softmax output layer instead of the tree
        #[arg(long)]
        flat: bool,
        /// Override the configured truncation window
        #[arg(long)]
        bptt: Option<usize>,
        /// Override the configured random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Train on a synthetic cyclic corpus, then generate sequences
    Sample {
        /// Vocabulary size
        #[arg(long, default_value = "12")]
        vocab: usize,
        /// Hidden dimension
        #[arg(long, default_value = "8")]
        hidden: usize,
        /// Passes over the corpus
        #[arg(long, default_value = "100")]
        epochs: usize,
        /// Number of sequences to generate
        #[arg(long, default_value = "3")]
        samples: usize,
        /// Use the flat softmax output layer instead of the tree
        #[arg(long)]
        flat: bool,
        /// Override the configured learning rate
        #[arg(long)]
        learning_rate: Option<f64>,
        /// Override the configured random seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

// ============================================================================
// Subcommands
// ============================================================================

fn run_grad_check(
    mut config: ModelConfig,
    vocab: usize,
    hidden: usize,
    len: usize,
    flat: bool,
    bptt: Option<usize>,
    seed: Option<u64>,
) -> Result<()> {
    if len + 1 > vocab {
        bail!("sequence length {} needs a vocabulary of at least {} words", len, len + 1);
    }
    if flat {
        config.model.output_layer = OutputKind::Flat;
    }
    if let Some(bptt) = bptt {
        config.model.bptt = bptt;
    }
    if let Some(seed) = seed {
        config.model.seed = seed;
    }

    let mut model = RnnLm::with_random_embeddings(vocab, hidden, &config)
        .context("Failed to build model")?;
    let xs: Vec<usize> = (0..len).collect();
    let ys: Vec<usize> = (1..=len).collect();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let (eps, tol) = (config.grad_check.epsilon, config.grad_check.tolerance);
    let report = model
        .grad_check(&xs, &ys, eps, tol, &mut out)
        .context("Gradient check aborted")?;
    out.flush()?;

    if !report.passed() {
        let failed: Vec<&str> = report
            .entries
            .iter()
            .filter(|e| !e.passed)
            .map(|e| e.name.as_str())
            .collect();
        bail!("gradient check failed for {}", failed.join(", "));
    }
    Ok(())
}

/// Overlapping windows over the cycle `0, 1, …, vocab-1, 0, …`.
fn cyclic_corpus(vocab: usize) -> Vec<(Vec<usize>, Vec<usize>)> {
    (0..vocab)
        .map(|start| {
            let xs: Vec<usize> = (0..WINDOW).map(|k| (start + k) % vocab).collect();
            let ys: Vec<usize> = xs.iter().map(|&x| (x + 1) % vocab).collect();
            (xs, ys)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn run_sample(
    mut config: ModelConfig,
    vocab: usize,
    hidden: usize,
    epochs: usize,
    samples: usize,
    flat: bool,
    learning_rate: Option<f64>,
    seed: Option<u64>,
) -> Result<()> {
    if vocab < 2 {
        bail!("vocabulary needs at least a start and an end word");
    }
    if flat {
        config.model.output_layer = OutputKind::Flat;
    }
    if let Some(lr) = learning_rate {
        config.training.learning_rate = lr;
    }
    if let Some(seed) = seed {
        config.model.seed = seed;
    }
    config.validate().context("Invalid configuration")?;

    let mut model = RnnLm::with_random_embeddings(vocab, hidden, &config)
        .context("Failed to build model")?;
    let corpus = cyclic_corpus(vocab);

    let initial = model.compute_mean_loss(&corpus)?;
    info!(loss = initial, perplexity = perplexity(initial), "Untrained model");

    let report_every = (epochs / 10).max(1);
    for epoch in 1..=epochs {
        let loss = model
            .train_minibatch(&corpus)
            .with_context(|| format!("Training failed in epoch {}", epoch))?;
        if epoch % report_every == 0 {
            info!(epoch, loss, "Epoch complete");
        }
    }

    let mean = model.compute_mean_loss(&corpus)?;
    println!(
        "mean loss {:.4} (perplexity {:.3}, untrained {:.3})",
        mean,
        perplexity(mean),
        perplexity(initial)
    );

    let (start, end) = (0, vocab - 1);
    let mut rng = StdRng::seed_from_u64(config.model.seed);
    for _ in 0..samples {
        let (seq, loss) = model
            .generate_sequence(start, end, config.generation.max_len, &mut rng)
            .context("Generation failed")?;
        let words: Vec<String> = seq.iter().map(|w| w.to_string()).collect();
        println!("[{:.3}] {}", loss, words.join(" "));
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => ModelConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ModelConfig::load(),
    };

    match args.command {
        SubCommand::GradCheck { vocab, hidden, len, flat, bptt, seed } => {
            run_grad_check(config, vocab, hidden, len, flat, bptt, seed)
        }
        SubCommand::Sample { vocab, hidden, epochs, samples, flat, learning_rate, seed } => {
            run_sample(config, vocab, hidden, epochs, samples, flat, learning_rate, seed)
        }
    }
}
