use std::env;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use signal_browser::adapters::Source;
use signal_browser::dataset::ChannelRef;
use signal_browser::query::TimeWindow;
use signal_browser::session::Session;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // signal-inspect <file> [t0 t1] [points]
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(path) = args.first() else {
        bail!("usage: signal-inspect <file> [t0 t1] [points]");
    };
    let window = match (args.get(1), args.get(2)) {
        (Some(t0), Some(t1)) => Some(TimeWindow::new(
            t0.parse().context("t0 is not a number")?,
            t1.parse().context("t1 is not a number")?,
        )),
        _ => None,
    };

    let mut session = Session::with_defaults();
    let points = match args.get(3) {
        Some(points) => points.parse().context("points is not a number")?,
        None => session.config().target_points,
    };

    println!("Reading file: {}", path);
    let id = session
        .open(&Source::file(path))
        .with_context(|| format!("failed to open {}", path))?;
    let Some(dataset) = session.dataset(id).cloned() else {
        bail!("dataset {} vanished after loading", id);
    };

    println!("\n=== Load Results ===");
    println!("Format: {} (adapter {})", dataset.format(), dataset.adapter());
    println!("Channels: {}", dataset.channel_count());
    println!("Samples: {}", dataset.total_samples());
    if let Some((first, last)) = dataset.time_range() {
        println!("Time range: {:.3} to {:.3} seconds", first, last);
    }
    for (key, value) in dataset.meta() {
        println!("  {}: {}", key, value);
    }

    println!("\n=== First 15 Channels (with units) ===");
    for (i, channel) in dataset.channels().take(15).enumerate() {
        let unit = channel.unit();
        let unit_str = if unit.is_dimensionless() {
            String::new()
        } else {
            format!(" [{}]", unit)
        };
        println!(
            "  {:2}. {}{} - {} samples",
            i + 1,
            channel.name(),
            unit_str,
            channel.sample_count()
        );
    }
    if dataset.channel_count() > 15 {
        println!("  ... and {} more channels", dataset.channel_count() - 15);
    }

    let Some(window) = window.or_else(|| dataset.time_range().map(TimeWindow::from)) else {
        println!("\nDataset has no samples");
        return Ok(());
    };

    println!(
        "\n=== Query [{:.3}, {:.3}] at {} points (first 8 channels) ===",
        window.start, window.end, points
    );
    for channel in dataset.channels().take(8) {
        let channel_ref = ChannelRef::new(id, channel.name());
        let result = session.query(&channel_ref, window, points)?;
        let (min, max) = result
            .points
            .iter()
            .filter(|b| b.has_values())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), b| {
                (lo.min(b.value_min), hi.max(b.value_max))
            });
        if result.points.iter().any(|b| b.has_values()) {
            println!(
                "  {:>24}: tier {}, {} points, min {:.3}, max {:.3}",
                channel.name(),
                result.level,
                result.len(),
                min,
                max
            );
        } else {
            println!("  {:>24}: tier {}, no values in window", channel.name(), result.level);
        }
    }

    Ok(())
}
