use chrono::{Duration, NaiveDate};
use storage_arbitrage::{
    data_loader::{following_days, preceding_days},
    ArbitrageConfig, GoodLpSolver, InMemoryPriceSource, TwoStageOrchestrator,
};

fn main() {
    env_logger::init();

    let mut config = ArbitrageConfig::nyiso_default();
    config.generator_name = "EXAMPLE_GEN".to_string();
    config.max_workers = 4;

    let reference = NaiveDate::from_ymd_opt(2023, 11, 15).unwrap();

    // Night hours cheap, evening peak expensive, a little noise per day
    let mut dates = preceding_days(reference, 7);
    dates.extend(following_days(reference, 7));
    let mut source = InMemoryPriceSource::new();
    for (i, date) in dates.iter().enumerate() {
        let profile: Vec<f64> = (0..24)
            .map(|hour| {
                let base = match hour {
                    0..=5 | 22..=23 => 18.0,
                    17..=20 => 95.0,
                    _ => 45.0,
                };
                base + (i % 3) as f64 * 2.5
            })
            .collect();
        source.insert(
            &config.generator_name,
            storage_arbitrage::PriceSeries::hourly_from_prices(*date, &profile),
        );
    }

    let solver = GoodLpSolver::with_timeout(std::time::Duration::from_secs(60));
    let orchestrator = TwoStageOrchestrator::new(&source, &solver)
        .with_lookback_days(7)
        .with_evaluation_days(7);

    let outcome = match orchestrator.run_two_stage(&config, reference) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Two-stage run failed: {}", e);
            return;
        }
    };

    println!("Two-Stage Walkthrough");
    println!("=====================");
    println!(
        "Sizing window: {} to {}",
        reference - Duration::days(7),
        reference - Duration::days(1)
    );
    println!("Battery counts: {:?}", outcome.capital_plan.battery_counts);
    println!("Warehouses used: {:?}", outcome.capital_plan.warehouses_used);
    println!(
        "Capital cost: ${:.2}",
        outcome.capital_plan.capital_cost(&config)
    );
    println!();

    for day in &outcome.daily_profits {
        match day.profit {
            Some(p) => println!("  {}: ${:.2}", day.date, p),
            None => println!("  {}: no solution", day.date),
        }
    }
    println!();
    println!(
        "Operating profit over {} day(s): ${:.2}",
        outcome.solved_days(),
        outcome.total_operating_profit()
    );
}
