//! Training driver: stream the train corpus in batches, step the network,
//! and periodically measure test accuracy.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hashnet::config::Config;
use hashnet::corpus::Scanner;
use hashnet::network::{CowId, Network};

/// The single snapshot tag of a standalone training run.
const COW_ID: CowId = 0;

/// Test batches evaluated at the mid-epoch checkpoints.
const STEP_EVAL_BATCHES: usize = 20;

/// Test batches evaluated after each non-final epoch.
const EPOCH_EVAL_BATCHES: usize = 50;

#[derive(Parser)]
#[command(about = "Train a sparse LSH-selected classifier")]
struct Args {
    /// Path to the JSON run configuration.
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_json_file(&args.config)?;

    tracing::info!(
        layers = config.num_layers,
        sizes = ?config.layer_sizes,
        hash = %config.hash_function,
        "building network"
    );
    let start = Instant::now();
    let mut net = Network::new(COW_ID, &config);
    tracing::info!(elapsed = ?start.elapsed(), "network initialized");

    let num_batches = config.total_records / config.batch_size;
    let num_batches_test = config.total_records_test / config.batch_size;
    let mut train_time = Duration::ZERO;

    for epoch in 0..config.epochs {
        tracing::info!(epoch, "starting epoch");
        net = train_epoch(&config, net, epoch, num_batches, &mut train_time)?;

        let eval_batches = if epoch == config.epochs - 1 {
            num_batches_test
        } else {
            EPOCH_EVAL_BATCHES.min(num_batches_test)
        };
        net = evaluate(&config, net, eval_batches, (epoch + 1) * num_batches)?;
    }

    tracing::info!(?train_time, "training complete");
    Ok(())
}

fn open_scanner(path: &str) -> Result<Scanner<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("opening corpus {path}"))?;
    Scanner::new(BufReader::new(file)).with_context(|| format!("reading corpus header {path}"))
}

fn train_epoch(
    config: &Config,
    mut net: Network,
    epoch: usize,
    num_batches: usize,
    train_time: &mut Duration,
) -> Result<Network> {
    let mut scanner = open_scanner(&config.train_data_path)?;

    for i in 0..num_batches {
        let iter = epoch * num_batches + i;

        if i > 0 && iter % config.step_size == 0 {
            net = evaluate(
                config,
                net,
                STEP_EVAL_BATCHES.min(config.total_records_test / config.batch_size),
                iter,
            )?;
        }

        let batch = scanner.next_batch(config.batch_size);
        if batch.is_empty() {
            tracing::warn!(epoch, batch = i, "train corpus exhausted early");
            break;
        }

        let rehash = config.rehash_due(iter);
        let rebuild = config.rebuild_due(iter);

        let step_start = Instant::now();
        let (_, next) = net.process_input(COW_ID, &batch, iter, rehash, rebuild);
        net = next;
        *train_time += step_start.elapsed();
    }

    Ok(net)
}

fn evaluate(
    config: &Config,
    mut net: Network,
    num_batches: usize,
    iter: usize,
) -> Result<Network> {
    let mut scanner = open_scanner(&config.test_data_path)?;
    let eval_start = Instant::now();

    let mut correct = 0usize;
    let mut total = 0usize;
    for i in 0..num_batches {
        let batch = scanner.next_batch(config.batch_size);
        if batch.is_empty() {
            break;
        }

        let (batch_correct, next) = net.predict(COW_ID, &batch);
        net = next;
        correct += batch_correct;
        total += batch.len();

        tracing::debug!(
            batch = i,
            running_accuracy = correct as f64 / total as f64,
            "evaluation progress"
        );
    }

    tracing::info!(
        iter,
        examples = total,
        accuracy = correct as f64 / total.max(1) as f64,
        elapsed = ?eval_start.elapsed(),
        "evaluation"
    );
    Ok(net)
}
