use crate::model_builder::{ArbitrageProblem, DecisionVariableSet, UnitCount};
use crate::models::ArbitrageConfig;
use good_lp::{ResolutionError, Solution, SolverModel, Variable};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Timeout,
    /// The solver gave up for a reason of its own
    Failed,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SolveStatus::Optimal => "OPTIMAL",
            SolveStatus::Infeasible => "INFEASIBLE",
            SolveStatus::Unbounded => "UNBOUNDED",
            SolveStatus::Timeout => "TIMEOUT",
            SolveStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Decision values copied out of a solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedDecisions {
    pub buy: BTreeMap<String, Vec<f64>>,
    pub sell: BTreeMap<String, Vec<f64>>,
    /// Present only when unit counts were decisions
    pub unit_counts: Option<BTreeMap<String, f64>>,
    /// Present only when warehouse selection was a decision
    pub warehouses_used: Option<Vec<f64>>,
}

impl SolvedDecisions {
    /// Integer unit counts, rounding away solver noise.
    pub fn rounded_unit_counts(&self) -> Option<BTreeMap<String, u32>> {
        self.unit_counts.as_ref().map(|counts| {
            counts
                .iter()
                .map(|(name, value)| (name.clone(), value.round().max(0.0) as u32))
                .collect()
        })
    }

    pub fn warehouse_selection(&self) -> Option<Vec<bool>> {
        self.warehouses_used
            .as_ref()
            .map(|values| values.iter().map(|v| *v > 0.5).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveResult {
    pub status: SolveStatus,
    pub objective_value: Option<f64>,
    pub decisions: Option<SolvedDecisions>,
}

impl SolveResult {
    pub fn optimal(objective_value: f64, decisions: SolvedDecisions) -> Self {
        Self {
            status: SolveStatus::Optimal,
            objective_value: Some(objective_value),
            decisions: Some(decisions),
        }
    }

    pub fn without_solution(status: SolveStatus) -> Self {
        Self {
            status,
            objective_value: None,
            decisions: None,
        }
    }

    pub fn is_optimal(&self) -> bool {
        self.status == SolveStatus::Optimal
    }
}

/// Turns a problem into a result. Each call owns its problem; nothing is
/// shared between calls.
pub trait SolverOracle: Send + Sync {
    fn solve(&self, problem: ArbitrageProblem) -> SolveResult;
}

/// Caps how many solves may be alive at once. A solve abandoned after a
/// timeout keeps its slot until its thread actually finishes.
#[derive(Debug)]
struct SolveSlots {
    limit: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl SolveSlots {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>) -> SolveSlot {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.limit {
            in_use = self
                .freed
                .wait(in_use)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *in_use += 1;
        SolveSlot {
            slots: Arc::clone(self),
        }
    }

    fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the lifetime of one solve thread.
struct SolveSlot {
    slots: Arc<SolveSlots>,
}

impl Drop for SolveSlot {
    fn drop(&mut self) {
        let mut in_use = self
            .slots
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *in_use -= 1;
        self.slots.freed.notify_one();
    }
}

/// Mixed-integer solver backed by good_lp's pure-Rust microlp backend.
#[derive(Debug, Clone)]
pub struct GoodLpSolver {
    timeout: Option<Duration>,
    slots: Arc<SolveSlots>,
}

impl Default for GoodLpSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GoodLpSolver {
    pub fn new() -> Self {
        Self {
            timeout: None,
            slots: Arc::new(SolveSlots::new(usize::MAX)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new()
        }
    }

    pub fn from_timeout_secs(timeout_secs: Option<u64>) -> Self {
        Self {
            timeout: timeout_secs.map(Duration::from_secs),
            ..Self::new()
        }
    }

    /// Timeout and concurrency limit taken from the run settings.
    pub fn for_config(config: &ArbitrageConfig) -> Self {
        Self::from_timeout_secs(config.solve_timeout_secs).with_max_concurrent(config.max_workers)
    }

    /// At most `limit` solves alive at once, including timed-out ones that
    /// are still running.
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.slots = Arc::new(SolveSlots::new(limit));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_concurrent(&self) -> usize {
        self.slots.limit
    }

    /// Solves currently holding a slot.
    pub fn active_solves(&self) -> usize {
        self.slots.in_use()
    }

    fn run_in_slot<F>(&self, job: F) -> SolveResult
    where
        F: FnOnce() -> SolveResult + Send + 'static,
    {
        let slot = self.slots.acquire();
        match self.timeout {
            None => {
                let result = job();
                drop(slot);
                result
            }
            Some(limit) => solve_with_timeout(limit, move || {
                let _slot = slot;
                job()
            }),
        }
    }
}

impl SolverOracle for GoodLpSolver {
    fn solve(&self, problem: ArbitrageProblem) -> SolveResult {
        self.run_in_slot(move || solve_problem(problem))
    }
}

/// Run `job` on a detached thread and give up after `limit`.
///
/// An expired job keeps running until it finishes on its own; its result is
/// dropped.
pub fn solve_with_timeout<F>(limit: Duration, job: F) -> SolveResult
where
    F: FnOnce() -> SolveResult + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let started = Instant::now();
        let result = job();
        if tx.send(result).is_err() {
            debug!(
                "Timed-out solve finished after {:?}, result discarded",
                started.elapsed()
            );
        }
    });

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("Solve exceeded {:?}, treating as non-optimal", limit);
            SolveResult::without_solution(SolveStatus::Timeout)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            warn!("Solver thread ended without a result");
            SolveResult::without_solution(SolveStatus::Failed)
        }
    }
}

fn solve_problem(problem: ArbitrageProblem) -> SolveResult {
    let ArbitrageProblem {
        variables,
        objective,
        constraints,
        decisions,
        num_periods,
        ..
    } = problem;

    let started = Instant::now();
    let num_constraints = constraints.len();

    let mut model = variables.maximise(objective.clone()).using(good_lp::microlp);
    for c in constraints {
        model = model.with(c);
    }

    match model.solve() {
        Ok(solution) => {
            let objective_value = solution.eval(objective);
            debug!(
                "Solved {} periods / {} constraints in {:?}, objective {:.2}",
                num_periods,
                num_constraints,
                started.elapsed(),
                objective_value
            );
            SolveResult::optimal(objective_value, extract_decisions(&solution, &decisions))
        }
        Err(ResolutionError::Infeasible) => SolveResult::without_solution(SolveStatus::Infeasible),
        Err(ResolutionError::Unbounded) => SolveResult::without_solution(SolveStatus::Unbounded),
        Err(e) => {
            warn!("Solver failed: {}", e);
            SolveResult::without_solution(SolveStatus::Failed)
        }
    }
}

fn extract_decisions<S: Solution>(solution: &S, decisions: &DecisionVariableSet) -> SolvedDecisions {
    let values = |vars: &[Variable]| -> Vec<f64> { vars.iter().map(|&v| solution.value(v)).collect() };

    let mut buy = BTreeMap::new();
    let mut sell = BTreeMap::new();
    let mut unit_counts = BTreeMap::new();

    for (name, battery) in &decisions.batteries {
        buy.insert(name.clone(), values(&battery.buy));
        sell.insert(name.clone(), values(&battery.sell));
        if let UnitCount::Decision(count) = battery.unit_count {
            unit_counts.insert(name.clone(), solution.value(count));
        }
    }

    SolvedDecisions {
        buy,
        sell,
        unit_counts: if unit_counts.is_empty() {
            None
        } else {
            Some(unit_counts)
        },
        warehouses_used: decisions.warehouses_used.as_deref().map(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_builder::{state_of_charge_path, ArbitrageModelBuilder};
    use crate::models::{ArbitrageConfig, BatteryTypeSpec, PriceSeries, WarehouseOption};
    use chrono::NaiveDate;

    const TOL: f64 = 1e-5;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 11, 28).unwrap()
    }

    /// One battery type with unit-sized limits and a single warehouse.
    fn unit_battery_config(count: Option<u32>) -> ArbitrageConfig {
        let mut config = ArbitrageConfig::nyiso_default();
        config.battery_types.clear();
        config.battery_types.insert(
            "lithium".to_string(),
            BatteryTypeSpec {
                size: 0.0,
                capacity: 100.0,
                charge_loss: 1.0,
                max_charge: 100.0,
                max_discharge: 100.0,
                cost: 0.0,
            },
        );
        config.battery_types_used = vec!["lithium".to_string()];
        config.battery_counts = count.map(|n| [("lithium".to_string(), n)].into_iter().collect());
        config.warehouse_data = vec![WarehouseOption {
            area: 1000.0,
            cost: 0.0,
        }];
        config.carry_over = true;
        config
    }

    fn solve(config: ArbitrageConfig, prices: &[f64]) -> SolveResult {
        let series = PriceSeries::hourly_from_prices(day(), prices);
        let problem = ArbitrageModelBuilder::new(config).build(&series).unwrap();
        GoodLpSolver::new().solve(problem)
    }

    #[test]
    fn test_buy_low_sell_high() {
        let result = solve(unit_battery_config(Some(1)), &[10.0, 50.0, 10.0, 50.0]);
        assert!(result.is_optimal());

        let objective = result.objective_value.unwrap();
        assert!(objective > 0.0);
        assert!((objective - 8000.0).abs() < 1e-4);

        let decisions = result.decisions.unwrap();
        let buy = &decisions.buy["lithium"];
        let sell = &decisions.sell["lithium"];
        assert!((buy[0] - 100.0).abs() < TOL && (buy[2] - 100.0).abs() < TOL);
        assert!((sell[1] - 100.0).abs() < TOL && (sell[3] - 100.0).abs() < TOL);
        assert!(decisions.unit_counts.is_none());
        assert!(decisions.warehouses_used.is_some());
    }

    #[test]
    fn test_zero_warehouse_area_is_infeasible() {
        let mut config = unit_battery_config(Some(2));
        config.battery_types.get_mut("lithium").unwrap().size = 5.0;
        config.warehouse_data = vec![
            WarehouseOption { area: 0.0, cost: 0.0 },
            WarehouseOption { area: 0.0, cost: 10.0 },
        ];

        let result = solve(config, &[10.0, 50.0, 10.0, 50.0]);
        assert_eq!(result.status, SolveStatus::Infeasible);
        assert!(result.objective_value.is_none());
        assert!(result.decisions.is_none());
    }

    #[test]
    fn test_solved_state_of_charge_within_bounds() {
        let mut config = ArbitrageConfig::nyiso_default();
        config.carry_over = true;
        config.battery_counts = Some(
            [("lithium", 2), ("lead", 1), ("palladium", 3)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
        config.warehouses_used = Some(vec![true, false, false, false, false]);
        let counts = config.battery_counts.clone().unwrap();

        let prices: Vec<f64> = (0..48)
            .map(|h| 30.0 + 25.0 * ((h as f64) * std::f64::consts::PI / 6.0).sin())
            .collect();
        let result = solve(config.clone(), &prices);
        assert!(result.is_optimal());
        let decisions = result.decisions.unwrap();

        for (name, count) in counts {
            let battery = &config.battery_types[&name];
            let path = state_of_charge_path(
                &decisions.buy[&name],
                &decisions.sell[&name],
                battery.charge_loss,
            );
            let upper = battery.capacity * count as f64;
            for level in path {
                assert!(level >= -TOL, "{} dropped below empty: {}", name, level);
                assert!(level <= upper + TOL, "{} over capacity: {}", name, level);
            }
        }
    }

    #[test]
    fn test_day_boundaries_hold_no_charge_without_carry_over() {
        let mut config = unit_battery_config(Some(1));
        config.carry_over = false;

        // Cheap at each midnight, expensive an hour later
        let prices: Vec<f64> = (0..48).map(|h| if h % 24 == 0 { 5.0 } else { 40.0 }).collect();
        let result = solve(config, &prices);
        assert!(result.is_optimal());

        let decisions = result.decisions.unwrap();
        let path = state_of_charge_path(&decisions.buy["lithium"], &decisions.sell["lithium"], 1.0);
        assert!(path[0] <= TOL);
        assert!(path[24] <= TOL);
        assert!(result.objective_value.unwrap().abs() < 1e-4);
    }

    #[test]
    fn test_rebuild_gives_same_objective() {
        let prices = [12.0, 44.0, 8.0, 31.0, 55.0, 9.0];
        let first = solve(unit_battery_config(Some(2)), &prices);
        let second = solve(unit_battery_config(Some(2)), &prices);
        assert!(first.is_optimal() && second.is_optimal());
        assert!((first.objective_value.unwrap() - second.objective_value.unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_decision_counts_are_reported() {
        let mut config = unit_battery_config(None);
        config.battery_types.get_mut("lithium").unwrap().cost = 100.0;
        config.battery_types.get_mut("lithium").unwrap().size = 1.0;
        config.warehouse_data = vec![WarehouseOption { area: 3.0, cost: 50.0 }];

        let result = solve(config, &[10.0, 50.0, 10.0, 50.0]);
        assert!(result.is_optimal());
        let decisions = result.decisions.unwrap();
        // Each unit earns 8000 for a rental of 100, so the floor area is filled
        assert_eq!(decisions.rounded_unit_counts().unwrap()["lithium"], 3);
        assert_eq!(decisions.warehouse_selection(), Some(vec![true]));
        let objective = result.objective_value.unwrap();
        assert!((objective - (3.0 * 8000.0 - 300.0 - 50.0)).abs() < 1e-3);
    }

    #[test]
    fn test_timeout_reports_non_optimal() {
        let result = solve_with_timeout(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            SolveResult::without_solution(SolveStatus::Optimal)
        });
        assert_eq!(result.status, SolveStatus::Timeout);
    }

    #[test]
    fn test_timed_out_solves_keep_their_slot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let solver = GoodLpSolver::with_timeout(Duration::from_millis(10)).with_max_concurrent(2);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let statuses: Vec<SolveStatus> = thread::scope(|scope| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let (solver, live, peak) = (&solver, Arc::clone(&live), Arc::clone(&peak));
                    scope.spawn(move || {
                        solver
                            .run_in_slot(move || {
                                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(80));
                                live.fetch_sub(1, Ordering::SeqCst);
                                SolveResult::without_solution(SolveStatus::Optimal)
                            })
                            .status
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(statuses.iter().all(|s| *s == SolveStatus::Timeout));
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));

        // Abandoned jobs release their slots once they finish
        let deadline = Instant::now() + Duration::from_secs(5);
        while solver.active_solves() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(solver.active_solves(), 0);
    }

    #[test]
    fn test_config_sets_limits() {
        let mut config = ArbitrageConfig::nyiso_default();
        config.max_workers = 3;
        config.solve_timeout_secs = Some(7);
        let solver = GoodLpSolver::for_config(&config);
        assert_eq!(solver.max_concurrent(), 3);
        assert_eq!(solver.timeout(), Some(Duration::from_secs(7)));
        assert_eq!(solver.active_solves(), 0);
    }

    #[test]
    fn test_timeout_passes_through_fast_solves() {
        let series = PriceSeries::hourly_from_prices(day(), &[10.0, 50.0]);
        let problem = ArbitrageModelBuilder::new(unit_battery_config(Some(1)))
            .build(&series)
            .unwrap();
        let result = GoodLpSolver::with_timeout(Duration::from_secs(30)).solve(problem);
        assert!(result.is_optimal());
        assert!((result.objective_value.unwrap() - 4000.0).abs() < 1e-4);
    }
}
