use crate::data_loader::{ensure_complete, following_days, preceding_days, PriceSeriesSource};
use crate::error::ArbitrageError;
use crate::model_builder::{state_of_charge_path, ArbitrageModelBuilder};
use crate::models::{
    ArbitrageConfig, CapitalPlan, ConstraintParameters, DailyProfit, ModelResults, PriceSeries,
    TwoStageOutcome,
};
use crate::solver::{SolveStatus, SolverOracle};
use chrono::{Duration, NaiveDate};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;

pub const DEFAULT_LOOKBACK_DAYS: usize = 31;
pub const DEFAULT_EVALUATION_DAYS: usize = 30;

/// Outcome of one build + solve.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRun {
    pub status: SolveStatus,
    /// Solved schedule, `None` unless the solve was optimal
    pub results: Option<ModelResults>,
    /// Capital in force for this run: solved when it was a decision,
    /// copied from the config when it was fixed
    pub capital_plan: Option<CapitalPlan>,
    pub constraint_parameters: ConstraintParameters,
}

impl ModelRun {
    pub fn objective_value(&self) -> Option<f64> {
        self.results.as_ref().map(|r| r.total_profit)
    }
}

/// Build and solve one model over an already loaded price series.
pub fn solve_model(
    config: &ArbitrageConfig,
    prices: &PriceSeries,
    solver: &dyn SolverOracle,
) -> Result<ModelRun, ArbitrageError> {
    let problem = ArbitrageModelBuilder::new(config.clone()).build(prices)?;
    let constraint_parameters = problem.constraint_parameters.clone();
    let num_periods = problem.num_periods;

    let solved = solver.solve(problem);

    let (decisions, total_profit) = match (solved.decisions, solved.objective_value) {
        (Some(decisions), Some(objective)) if solved.status == SolveStatus::Optimal => {
            (decisions, objective)
        }
        _ => {
            return Ok(ModelRun {
                status: solved.status,
                results: None,
                capital_plan: None,
                constraint_parameters,
            })
        }
    };

    let mut state_of_charge_ts = BTreeMap::new();
    for (name, buy) in &decisions.buy {
        let charge_loss = config.battery(name)?.charge_loss;
        let sell = decisions.sell.get(name).map(Vec::as_slice).unwrap_or(&[]);
        state_of_charge_ts.insert(name.clone(), state_of_charge_path(buy, sell, charge_loss));
    }

    let battery_counts = decisions
        .rounded_unit_counts()
        .or_else(|| config.battery_counts.clone());
    let warehouses_used = decisions
        .warehouse_selection()
        .or_else(|| config.warehouses_used.clone());
    let capital_plan = match (battery_counts, warehouses_used) {
        (Some(battery_counts), Some(warehouses_used)) => Some(CapitalPlan {
            battery_counts,
            warehouses_used,
        }),
        _ => None,
    };

    Ok(ModelRun {
        status: SolveStatus::Optimal,
        results: Some(ModelResults {
            num_periods,
            time: (0..num_periods).collect(),
            buy_ts: decisions.buy,
            sell_ts: decisions.sell,
            state_of_charge_ts,
            total_profit,
        }),
        capital_plan,
        constraint_parameters,
    })
}

/// Load prices for the configured dates (today when none are set) and
/// solve one model over them.
pub fn run(
    config: &ArbitrageConfig,
    source: &dyn PriceSeriesSource,
    solver: &dyn SolverOracle,
    today: NaiveDate,
) -> Result<ModelRun, ArbitrageError> {
    let dates = config.dates(today);
    let prices = source.get_prices(&dates, &config.generator_name)?;
    ensure_complete(&prices, dates.len(), config.periods_per_day)?;

    info!(
        "Solving {} over {} day(s), {} periods",
        config.name,
        dates.len(),
        prices.len()
    );
    solve_model(config, &prices, solver)
}

/// Sizes capital over a lookback window, then estimates each following
/// day's profit with that capital fixed.
pub struct TwoStageOrchestrator<'a> {
    source: &'a dyn PriceSeriesSource,
    solver: &'a dyn SolverOracle,
    lookback_days: usize,
    evaluation_days: usize,
}

impl<'a> TwoStageOrchestrator<'a> {
    pub fn new(source: &'a dyn PriceSeriesSource, solver: &'a dyn SolverOracle) -> Self {
        Self {
            source,
            solver,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            evaluation_days: DEFAULT_EVALUATION_DAYS,
        }
    }

    pub fn with_lookback_days(mut self, days: usize) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_evaluation_days(mut self, days: usize) -> Self {
        self.evaluation_days = days;
        self
    }

    /// Latest reference date whose evaluation window ends before `today`, so
    /// both windows only need published prices.
    pub fn default_reference_date(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(self.evaluation_days as i64)
    }

    pub fn sizing_dates(&self, reference: NaiveDate) -> Vec<NaiveDate> {
        preceding_days(reference, self.lookback_days)
    }

    pub fn evaluation_dates(&self, reference: NaiveDate) -> Vec<NaiveDate> {
        following_days(reference, self.evaluation_days)
    }

    /// Stage 1: capital is a decision over the lookback window.
    pub fn stage_one(
        &self,
        config: &ArbitrageConfig,
        reference: NaiveDate,
    ) -> Result<(CapitalPlan, ModelRun), ArbitrageError> {
        let dates = self.sizing_dates(reference);
        if dates.is_empty() {
            return Err(ArbitrageError::Configuration(
                "lookback window is empty".to_string(),
            ));
        }
        info!(
            "Stage 1: sizing over {} to {}",
            dates[0],
            dates[dates.len() - 1]
        );

        let sizing_config = config.with_capital_as_decisions().with_dates(dates);
        let run = run(&sizing_config, self.source, self.solver, reference)?;

        match (&run.results, &run.capital_plan) {
            (Some(results), Some(plan)) => {
                info!(
                    "Stage 1 objective {:.2}, battery counts {:?}, warehouses {:?}",
                    results.total_profit, plan.battery_counts, plan.warehouses_used
                );
                let plan = plan.clone();
                Ok((plan, run))
            }
            _ => {
                warn!("Stage 1 ended {}, no capital plan", run.status);
                Err(ArbitrageError::NoCapitalPlan(run.status))
            }
        }
    }

    /// Stage 2: one independent single-day model per evaluation date, solved
    /// on at most `config.max_workers` threads. Profits come back in date
    /// order; a day without an optimal solve is recorded as `None`.
    pub fn stage_two(
        &self,
        config: &ArbitrageConfig,
        plan: &CapitalPlan,
        reference: NaiveDate,
    ) -> Result<Vec<DailyProfit>, ArbitrageError> {
        let fixed = config.with_capital_plan(plan);
        fixed.validate()?;
        let dates = self.evaluation_dates(reference);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .build()
            .map_err(|e| ArbitrageError::Configuration(format!("worker pool: {}", e)))?;

        info!(
            "Stage 2: evaluating {} day(s) on {} worker(s)",
            dates.len(),
            pool.current_num_threads()
        );

        pool.install(|| {
            dates
                .par_iter()
                .map(|date| self.evaluate_day(&fixed, *date))
                .collect()
        })
    }

    fn evaluate_day(
        &self,
        fixed: &ArbitrageConfig,
        date: NaiveDate,
    ) -> Result<DailyProfit, ArbitrageError> {
        let prices = self.source.get_prices(&[date], &fixed.generator_name)?;
        ensure_complete(&prices, 1, fixed.periods_per_day)?;

        let day_config = fixed.with_dates(vec![date]);
        let run = solve_model(&day_config, &prices, self.solver)?;

        let profit = run.objective_value();
        match profit {
            Some(p) => info!("{}: profit {:.2}", date, p),
            None => warn!("{}: solve ended {}, no profit recorded", date, run.status),
        }

        Ok(DailyProfit { date, profit })
    }

    /// Stage 1 followed by Stage 2 around `reference`.
    pub fn run_two_stage(
        &self,
        config: &ArbitrageConfig,
        reference: NaiveDate,
    ) -> Result<TwoStageOutcome, ArbitrageError> {
        config.validate()?;

        let (capital_plan, sizing) = self.stage_one(config, reference)?;
        let daily_profits = self.stage_two(config, &capital_plan, reference)?;

        let sizing_results = sizing
            .results
            .ok_or(ArbitrageError::NoCapitalPlan(sizing.status))?;

        Ok(TwoStageOutcome {
            reference_date: reference,
            capital_plan,
            sizing_results,
            sizing_parameters: sizing.constraint_parameters,
            daily_profits,
        })
    }
}
