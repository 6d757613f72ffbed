use anyhow::{bail, Result};
use chrono::{Duration, Local, NaiveDate};
use std::path::{Path, PathBuf};
use storage_arbitrage::{
    ArbitrageConfig, CsvPriceSource, GoodLpSolver, PriceSeriesSource, TwoStageOrchestrator,
};

mod arbitrage_charts;
mod generator_extractor;
mod nyiso_archive;

use arbitrage_charts::ArbitrageCharts;

const STORAGE_DIR: &str = "Data";
const FIGURES_DIR: &str = "Figures";

fn parse_date(raw: &str) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(raw, "%Y-%m-%d")?)
}

fn date_span(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut date = start;
    while date <= end {
        dates.push(date);
        date += Duration::days(1);
    }
    dates
}

fn load_config(path: Option<&String>) -> Result<ArbitrageConfig> {
    let config = match path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ArbitrageConfig::nyiso_default(),
    };
    config.validate()?;
    Ok(config)
}

fn prepare_prices(archive_dir: &Path, generator_name: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
    println!("\n📦 Preparing NYISO day-ahead prices for {}", generator_name);
    println!("{}", "=".repeat(60));

    let storage_dir = PathBuf::from(STORAGE_DIR);
    let dates = date_span(start, end);

    let missing = nyiso_archive::missing_raw_days(&storage_dir, &dates);
    if !missing.is_empty() {
        let extractor = nyiso_archive::ArchiveExtractor::new(archive_dir.to_path_buf(), storage_dir.clone());
        extractor.extract_all()?;
    }

    let still_missing = nyiso_archive::missing_raw_days(&storage_dir, &dates);
    if !still_missing.is_empty() {
        println!("⚠️  {} day(s) have no raw file:", still_missing.len());
        for date in &still_missing {
            println!("    {} (archive {})", date, nyiso_archive::monthly_archive_name(*date));
        }
    }

    let failed = generator_extractor::extract_generator_days(&storage_dir, &dates, generator_name);
    println!(
        "Cached {} of {} day(s) for {}",
        dates.len() - failed.len(),
        dates.len(),
        generator_name
    );

    if dates.len() > 1 {
        generator_extractor::create_extended_time_series(&storage_dir, start, end, generator_name)?;
    }
    Ok(())
}

fn plot_prices(generator_name: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
    let source = CsvPriceSource::new(STORAGE_DIR);
    let dates = date_span(start, end);
    let missing = source.missing_dates(&dates, generator_name);
    if !missing.is_empty() {
        bail!("no cached prices for {:?}; run --prepare first", missing);
    }

    let series = source.get_prices(&dates, generator_name)?;
    let charts = ArbitrageCharts::new(FIGURES_DIR)?;
    charts.plot_price_time_series(&series, generator_name)?;
    Ok(())
}

fn run_single(config: &ArbitrageConfig) -> Result<()> {
    println!("\n⚡ Single arbitrage model: {}", config.name);
    println!("{}", "=".repeat(60));

    let source = CsvPriceSource::new(STORAGE_DIR);
    let solver = GoodLpSolver::for_config(config);
    let run = storage_arbitrage::run(config, &source, &solver, Local::now().date_naive())?;

    match &run.results {
        Some(results) => {
            println!("Status: {}", run.status);
            println!("Total profit: ${:.2}", results.total_profit);
            if let Some(plan) = &run.capital_plan {
                for (name, count) in &plan.battery_counts {
                    println!("  {}: {} unit(s)", name, count);
                }
            }
            let charts = ArbitrageCharts::new(FIGURES_DIR)?;
            charts.plot_result_time_series(&config.name, results, &run.constraint_parameters)?;
        }
        None => println!("No solution found ({})", run.status),
    }
    Ok(())
}

fn run_two_stage(config: &ArbitrageConfig, reference: Option<NaiveDate>) -> Result<()> {
    let source = CsvPriceSource::new(STORAGE_DIR);
    let solver = GoodLpSolver::for_config(config);
    let orchestrator = TwoStageOrchestrator::new(&source, &solver);
    let reference =
        reference.unwrap_or_else(|| orchestrator.default_reference_date(Local::now().date_naive()));

    println!("\n⚡ Two-stage arbitrage: {} from {}", config.name, reference);
    println!("Using {} worker(s) for daily solves", config.max_workers);
    println!("{}", "=".repeat(60));

    let start = std::time::Instant::now();
    let outcome = orchestrator.run_two_stage(config, reference)?;
    let capital = outcome.capital_plan.capital_cost(config);

    println!("Battery counts: {:?}", outcome.capital_plan.battery_counts);
    println!("Warehouses used: {:?}", outcome.capital_plan.warehouses_used);
    println!("Capital cost: ${:.2}", capital);
    for day in &outcome.daily_profits {
        match day.profit {
            Some(p) => println!("  {}: ${:.2}", day.date, p),
            None => println!("  {}: no solution", day.date),
        }
    }
    println!(
        "Operating profit ${:.2} over {} day(s), net ${:.2}",
        outcome.total_operating_profit(),
        outcome.solved_days(),
        outcome.total_operating_profit() - capital
    );

    let charts = ArbitrageCharts::new(FIGURES_DIR)?;
    charts.plot_result_time_series(
        &format!("{}_sizing", config.name),
        &outcome.sizing_results,
        &outcome.sizing_parameters,
    )?;
    charts.plot_waterfall_chart(&config.name, capital, &outcome.daily_profits)?;

    println!("\n✅ Two-stage run complete in {:?}", start.elapsed());
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  --prepare <archive_dir> <generator> <start YYYY-MM-DD> <end YYYY-MM-DD>");
    println!("  --plot-prices <generator> <start YYYY-MM-DD> [end YYYY-MM-DD]");
    println!("  --single [config.json]");
    println!("  --two-stage [config.json] [reference YYYY-MM-DD]");
}

fn main() -> Result<()> {
    env_logger::init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()?;

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--prepare" {
        if args.len() > 5 {
            let archive_dir = PathBuf::from(&args[2]);
            prepare_prices(&archive_dir, &args[3], parse_date(&args[4])?, parse_date(&args[5])?)?;
        } else {
            println!("Usage: --prepare <archive_dir> <generator> <start> <end>");
            println!("Example: --prepare NYISO_archives \"ADK HUDSON___FALLS\" 2023-11-01 2023-11-30");
        }
    } else if args.len() > 1 && args[1] == "--plot-prices" {
        if args.len() > 3 {
            let start = parse_date(&args[3])?;
            let end = match args.get(4) {
                Some(raw) => parse_date(raw)?,
                None => start,
            };
            plot_prices(&args[2], start, end)?;
        } else {
            println!("Usage: --plot-prices <generator> <start> [end]");
        }
    } else if args.len() > 1 && args[1] == "--single" {
        let config = load_config(args.get(2))?;
        run_single(&config)?;
    } else if args.len() > 1 && args[1] == "--two-stage" {
        let config = load_config(args.get(2))?;
        let reference = match args.get(3) {
            Some(raw) => Some(parse_date(raw)?),
            None => None,
        };
        run_two_stage(&config, reference)?;
    } else {
        println!("🔋 Battery storage arbitrage pipeline");
        println!("Using {} CPU cores", num_cpus::get());
        println!("{}", "=".repeat(60));
        print_usage();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_span_is_inclusive() {
        let start = NaiveDate::from_ymd_opt(2023, 11, 29).unwrap();
        let end = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        let span = date_span(start, end);
        assert_eq!(span.len(), 3);
        assert_eq!(span[2], end);
        assert!(date_span(end, start).is_empty());
    }

    #[test]
    fn test_default_config_loads() {
        let config = load_config(None).unwrap();
        assert_eq!(config.generator_name, "ADK HUDSON___FALLS");
    }
}
