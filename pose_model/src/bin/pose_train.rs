//! pose_train: retrain a saved model bundle from the dataset stored in it.
//!
//! ```text
//! pose_train --bundle gestures.json --out gestures.v2.json --epochs 80
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;

use pose_model::{train, ModelBundle, TrainConfig};

#[derive(Parser, Debug)]
#[command(name = "pose_train", about = "Retrain a gesture model bundle offline")]
struct Args {
    /// Bundle to read; must contain a dataset.
    #[arg(long)]
    bundle: String,

    /// Where to write the retrained bundle (defaults to overwriting --bundle).
    #[arg(long)]
    out: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f32>,

    /// Hidden layer widths, comma separated (e.g. 128,64).
    #[arg(long, value_delimiter = ',')]
    hidden: Option<Vec<usize>>,

    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let bundle = ModelBundle::load(&args.bundle)
        .with_context(|| format!("failed to read bundle {}", args.bundle))?;
    let Some(dataset) = bundle.dataset.clone() else {
        bail!("bundle {} has no dataset to train from", args.bundle);
    };

    let mut cfg = TrainConfig::default();
    if let Some(e) = args.epochs        { cfg.epochs = e; }
    if let Some(b) = args.batch_size    { cfg.batch_size = b; }
    if let Some(r) = args.learning_rate { cfg.learning_rate = r; }
    if let Some(h) = args.hidden        { cfg.hidden_units = h; }
    if let Some(s) = args.seed          { cfg.seed = s; }

    println!();
    println!("  Bundle:  {}  ({} classes, {} samples)", bundle.name, dataset.num_classes(), dataset.len());
    for (name, count) in bundle.class_names.iter().zip(dataset.counts()) {
        println!("    {:<24} {:>5}", name, count);
    }
    println!();

    let model = train(&dataset, &cfg, |p| {
        println!("  epoch {:>4}/{}  loss {:.4}  acc {:.3}", p.epoch + 1, p.epochs, p.loss, p.accuracy);
    })?;

    let mut out = ModelBundle::new(&bundle.name, &model, bundle.class_names.clone())
        .with_dataset(dataset);
    out.description = bundle.description.clone();

    let path = args.out.unwrap_or(args.bundle);
    out.save(&path).with_context(|| format!("failed to write {}", path))?;
    println!();
    println!("  ✓ Written: {}", path);
    Ok(())
}
