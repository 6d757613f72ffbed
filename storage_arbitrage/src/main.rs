use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use storage_arbitrage::{
    orchestrator::{DEFAULT_EVALUATION_DAYS, DEFAULT_LOOKBACK_DAYS},
    ArbitrageConfig, CsvPriceSource, GoodLpSolver, TwoStageOrchestrator,
};

#[derive(Parser)]
#[command(name = "storage_arbitrage")]
#[command(about = "Size and evaluate battery storage arbitrage against day-ahead prices")]
struct Args {
    /// What to run
    #[arg(short, long, value_enum, default_value = "two-stage")]
    mode: RunMode,

    /// Parameter bundle as JSON (defaults to the built-in NYISO sample)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding cached per-generator day files
    #[arg(short, long, default_value = "Data")]
    data_dir: PathBuf,

    /// Override the generator name from the config
    #[arg(short, long)]
    generator: Option<String>,

    /// Reference date (YYYY-MM-DD); sizing looks back from it, evaluation starts on it.
    /// Defaults to today minus the evaluation window (today in single mode)
    #[arg(long)]
    reference_date: Option<String>,

    /// Days in the sizing window
    #[arg(long, default_value_t = DEFAULT_LOOKBACK_DAYS)]
    lookback_days: usize,

    /// Days in the evaluation window
    #[arg(long, default_value_t = DEFAULT_EVALUATION_DAYS)]
    evaluation_days: usize,

    /// Let stored energy cross day boundaries
    #[arg(long)]
    carry_over: bool,

    /// Worker threads for per-day solves
    #[arg(short, long)]
    workers: Option<usize>,

    /// Per-solve timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "summary")]
    output: OutputFormat,
}

#[derive(Clone, ValueEnum)]
enum RunMode {
    /// One model over the configured dates
    Single,
    /// Capital sizing only
    Sizing,
    /// Sizing followed by per-day evaluation
    TwoStage,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

fn load_config(args: &Args) -> Result<ArbitrageConfig> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ArbitrageConfig::nyiso_default(),
    };

    if let Some(generator) = &args.generator {
        config.generator_name = generator.clone();
    }
    if args.carry_over {
        config.carry_over = true;
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if args.timeout_secs.is_some() {
        config.solve_timeout_secs = args.timeout_secs;
    }

    config.validate()?;
    Ok(config)
}

/// The given date wins. Otherwise single runs use today and the staged modes
/// step back far enough that every evaluation day has published prices.
fn resolve_reference(
    mode: &RunMode,
    given: Option<NaiveDate>,
    today: NaiveDate,
    orchestrator: &TwoStageOrchestrator,
) -> NaiveDate {
    match (given, mode) {
        (Some(date), _) => date,
        (None, RunMode::Single) => today,
        (None, _) => orchestrator.default_reference_date(today),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = load_config(&args)?;
    let today = Local::now().date_naive();
    let reference_date = match &args.reference_date {
        Some(s) => Some(NaiveDate::parse_from_str(s, "%Y-%m-%d")?),
        None => None,
    };

    info!(
        "Running {} for generator {}",
        config.name, config.generator_name
    );

    let source = CsvPriceSource::new(args.data_dir.clone());
    let solver = GoodLpSolver::for_config(&config);
    let orchestrator = TwoStageOrchestrator::new(&source, &solver)
        .with_lookback_days(args.lookback_days)
        .with_evaluation_days(args.evaluation_days);
    let reference = resolve_reference(&args.mode, reference_date, today, &orchestrator);

    match args.mode {
        RunMode::Single => {
            let run = storage_arbitrage::run(&config, &source, &solver, reference)?;
            match args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run.results)?),
                OutputFormat::Summary => match &run.results {
                    Some(results) => {
                        println!("Single Model Results");
                        println!("====================");
                        println!("Periods: {}", results.num_periods);
                        println!("Total Profit: ${:.2}", results.total_profit);
                        if let Some(plan) = &run.capital_plan {
                            println!("Battery counts: {:?}", plan.battery_counts);
                            println!("Warehouses used: {:?}", plan.warehouses_used);
                        }
                    }
                    None => println!("No solution found ({})", run.status),
                },
            }
        }
        RunMode::Sizing => {
            let (plan, run) = orchestrator.stage_one(&config, reference)?;
            match args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
                OutputFormat::Summary => {
                    println!("Capital Plan");
                    println!("============");
                    for (name, count) in &plan.battery_counts {
                        println!("  {}: {} unit(s)", name, count);
                    }
                    for (i, used) in plan.warehouses_used.iter().enumerate() {
                        println!("  Lease warehouse {}? {}", i, used);
                    }
                    println!("Capital cost: ${:.2}", plan.capital_cost(&config));
                    if let Some(objective) = run.objective_value() {
                        println!("Sizing objective: ${:.2}", objective);
                    }
                }
            }
        }
        RunMode::TwoStage => {
            let outcome = orchestrator.run_two_stage(&config, reference)?;
            match args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
                OutputFormat::Summary => {
                    let capital = outcome.capital_plan.capital_cost(&config);
                    println!("Two-Stage Arbitrage Summary");
                    println!("===========================");
                    println!("Reference date: {}", outcome.reference_date);
                    println!("Battery counts: {:?}", outcome.capital_plan.battery_counts);
                    println!("Warehouses used: {:?}", outcome.capital_plan.warehouses_used);
                    println!("Capital cost: ${:.2}", capital);
                    println!();
                    println!("Daily profits:");
                    for day in &outcome.daily_profits {
                        match day.profit {
                            Some(p) => println!("  {}: ${:.2}", day.date, p),
                            None => println!("  {}: no solution", day.date),
                        }
                    }
                    println!();
                    println!(
                        "Operating profit: ${:.2} over {} solved day(s)",
                        outcome.total_operating_profit(),
                        outcome.solved_days()
                    );
                    println!(
                        "Net after capital: ${:.2}",
                        outcome.total_operating_profit() - capital
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_arbitrage::InMemoryPriceSource;

    #[test]
    fn test_reference_date_resolution() {
        let source = InMemoryPriceSource::new();
        let solver = GoodLpSolver::new();
        let orchestrator = TwoStageOrchestrator::new(&source, &solver).with_evaluation_days(30);
        let today = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        let given = NaiveDate::from_ymd_opt(2023, 11, 28).unwrap();

        assert_eq!(resolve_reference(&RunMode::Single, Some(given), today, &orchestrator), given);
        assert_eq!(resolve_reference(&RunMode::Single, None, today, &orchestrator), today);
        assert_eq!(resolve_reference(&RunMode::TwoStage, Some(given), today, &orchestrator), given);
        assert_eq!(
            resolve_reference(&RunMode::TwoStage, None, today, &orchestrator),
            NaiveDate::from_ymd_opt(2023, 12, 1).unwrap()
        );
        assert_eq!(
            resolve_reference(&RunMode::Sizing, None, today, &orchestrator),
            NaiveDate::from_ymd_opt(2023, 12, 1).unwrap()
        );
    }
}
