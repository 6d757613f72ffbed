use crate::nyiso_archive::raw_day_file_name;
use anyhow::{bail, Result};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use polars::prelude::*;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use storage_arbitrage::data_loader::cached_file_name;

/// Raw column -> cached column
const PRICE_COLUMNS: [(&str, &str); 4] = [
    ("Time Stamp", "time"),
    ("LBMP ($/MWHr)", "LB_MargPrice"),
    ("Marginal Cost Losses ($/MWHr)", "MargCostLosses"),
    ("Marginal Cost Congestion ($/MWHr)", "MargCostCongestion"),
];

pub fn extended_series_path(
    storage_dir: &Path,
    start: NaiveDate,
    end: NaiveDate,
    generator_name: &str,
) -> PathBuf {
    storage_dir.join("extended_time_series").join(format!(
        "{}_{}_{}.csv",
        start.format("%Y%m%d"),
        end.format("%Y%m%d"),
        generator_name
    ))
}

/// Write the cached per-generator file for `date` from the raw day file.
/// An existing cached file is left alone.
pub fn extract_generator_day(
    storage_dir: &Path,
    date: NaiveDate,
    generator_name: &str,
) -> Result<PathBuf> {
    let cached = storage_dir.join(cached_file_name(date, generator_name));
    if cached.exists() {
        return Ok(cached);
    }

    let raw = storage_dir.join(raw_day_file_name(date));
    if !raw.exists() {
        bail!("raw price file missing for {}: {}", date, raw.display());
    }

    let df = CsvReader::from_path(&raw)?.has_header(true).finish()?;

    let selection: Vec<Expr> = PRICE_COLUMNS
        .iter()
        .map(|(raw_name, cached_name)| col(raw_name).alias(cached_name))
        .collect();

    let mut prices = df
        .lazy()
        .filter(col("Name").eq(lit(generator_name)))
        .select(selection)
        .collect()?;

    if prices.height() == 0 {
        bail!("generator '{}' not present in {}", generator_name, raw.display());
    }

    CsvWriter::new(std::fs::File::create(&cached)?).finish(&mut prices)?;
    Ok(cached)
}

/// Extract every date in parallel; returns the dates that failed.
pub fn extract_generator_days(
    storage_dir: &Path,
    dates: &[NaiveDate],
    generator_name: &str,
) -> Vec<NaiveDate> {
    println!("Extracting {} day(s) for {}", dates.len(), generator_name);

    let pb = ProgressBar::new(dates.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap(),
    );

    let failed: Vec<NaiveDate> = dates
        .par_iter()
        .filter_map(|date| {
            let result = extract_generator_day(storage_dir, *date, generator_name);
            pb.inc(1);
            match result {
                Ok(_) => None,
                Err(e) => {
                    eprintln!("  {}: {}", date, e);
                    Some(*date)
                }
            }
        })
        .collect();

    pb.finish();
    failed
}

/// Concatenate the cached day files from `start` to `end` (inclusive) into
/// one file under `extended_time_series/`. Days without a cached file are
/// skipped.
pub fn create_extended_time_series(
    storage_dir: &Path,
    start: NaiveDate,
    end: NaiveDate,
    generator_name: &str,
) -> Result<PathBuf> {
    let out_path = extended_series_path(storage_dir, start, end, generator_name);
    if out_path.exists() {
        println!("Extended time series already created: {}", out_path.display());
        return Ok(out_path);
    }

    let mut frames = Vec::new();
    let mut date = start;
    while date <= end {
        let cached = storage_dir.join(cached_file_name(date, generator_name));
        if cached.exists() {
            let day = CsvReader::from_path(&cached)?.has_header(true).finish()?;
            frames.push(day.lazy().select([
                col("time").cast(DataType::Utf8),
                col("LB_MargPrice").cast(DataType::Float64),
                col("MargCostLosses").cast(DataType::Float64),
                col("MargCostCongestion").cast(DataType::Float64),
            ]));
        } else {
            println!("  No cached prices for {}, skipping", date);
        }
        date += chrono::Duration::days(1);
    }

    if frames.is_empty() {
        bail!(
            "no cached prices for {} between {} and {}",
            generator_name,
            start,
            end
        );
    }

    let mut combined = concat(frames.as_slice(), UnionArgs::default())?.collect()?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    CsvWriter::new(std::fs::File::create(&out_path)?).finish(&mut combined)?;
    println!(
        "Saved {} periods to {}",
        combined.height(),
        out_path.display()
    );
    Ok(out_path)
}
