use crate::error::ArbitrageError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Physical and financial description of one battery type.
///
/// Field names follow the parameter files used by the price pipeline, so a
/// catalog can be written by hand as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryTypeSpec {
    /// Floor area one unit occupies
    pub size: f64,
    /// Energy one unit can hold
    pub capacity: f64,
    /// Fraction of purchased energy that ends up stored, in (0, 1]
    pub charge_loss: f64,
    /// Max stored energy gained per period, per unit
    pub max_charge: f64,
    /// Max energy released per period, per unit
    pub max_discharge: f64,
    /// Rental cost per unit over the planning horizon
    #[serde(default)]
    pub cost: f64,
}

pub type BatteryCatalog = BTreeMap<String, BatteryTypeSpec>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarehouseOption {
    pub area: f64,
    pub cost: f64,
}

/// Dates a model is built over. Absent in the config means "today".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateSelection {
    Single(NaiveDate),
    List(Vec<NaiveDate>),
}

impl DateSelection {
    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            DateSelection::Single(date) => vec![*date],
            DateSelection::List(dates) => dates.clone(),
        }
    }
}

fn default_periods_per_day() -> usize {
    24
}

fn default_max_workers() -> usize {
    1
}

/// The parameter bundle for one model build.
///
/// Treated as an immutable value: stage transitions produce a new bundle via
/// [`ArbitrageConfig::with_capital_plan`] instead of editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    pub name: String,
    pub generator_name: String,
    #[serde(default)]
    pub date_range: Option<DateSelection>,
    pub battery_types: BatteryCatalog,
    pub battery_types_used: Vec<String>,
    #[serde(default)]
    pub battery_counts: Option<BTreeMap<String, u32>>,
    pub warehouse_data: Vec<WarehouseOption>,
    #[serde(default)]
    pub warehouses_used: Option<Vec<bool>>,
    #[serde(default)]
    pub carry_over: bool,
    #[serde(default = "default_periods_per_day")]
    pub periods_per_day: usize,
    #[serde(default)]
    pub solve_timeout_secs: Option<u64>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl ArbitrageConfig {
    /// Sample bundle for the ADK Hudson Falls generator on the NYISO
    /// day-ahead market.
    pub fn nyiso_default() -> Self {
        let mut battery_types = BatteryCatalog::new();
        battery_types.insert(
            "lithium".to_string(),
            BatteryTypeSpec {
                size: 22.1,
                capacity: 100.0,
                charge_loss: 0.75,
                max_charge: 40.0,
                max_discharge: 15.0,
                cost: 12_500.0,
            },
        );
        battery_types.insert(
            "lead".to_string(),
            BatteryTypeSpec {
                size: 20.3,
                capacity: 350.0,
                charge_loss: 0.68,
                max_charge: 10.0,
                max_discharge: 40.0,
                cost: 11_000.0,
            },
        );
        battery_types.insert(
            "palladium".to_string(),
            BatteryTypeSpec {
                size: 0.1,
                capacity: 5.0,
                charge_loss: 0.33,
                max_charge: 5.0,
                max_discharge: 5.0,
                cost: 50.0,
            },
        );

        let warehouse_data = [30_000.0, 50_000.0, 100_000.0, 300_000.0, 8_000_000.0]
            .into_iter()
            .map(|cost| WarehouseOption { area: 100.0, cost })
            .collect();

        Self {
            name: "ElectricityArbitrage".to_string(),
            generator_name: "ADK HUDSON___FALLS".to_string(),
            date_range: None,
            battery_types,
            battery_types_used: vec![
                "lithium".to_string(),
                "lead".to_string(),
                "palladium".to_string(),
            ],
            battery_counts: None,
            warehouse_data,
            warehouses_used: None,
            carry_over: false,
            periods_per_day: default_periods_per_day(),
            solve_timeout_secs: None,
            max_workers: default_max_workers(),
        }
    }

    /// Check the bundle before any model is built.
    pub fn validate(&self) -> Result<(), ArbitrageError> {
        if self.battery_types_used.is_empty() {
            return Err(ArbitrageError::Configuration(
                "battery_types_used is empty".to_string(),
            ));
        }
        if self.periods_per_day == 0 {
            return Err(ArbitrageError::Configuration(
                "periods_per_day must be positive".to_string(),
            ));
        }

        for name in &self.battery_types_used {
            let battery = self.battery(name)?;
            if !(battery.charge_loss > 0.0 && battery.charge_loss <= 1.0) {
                return Err(ArbitrageError::Configuration(format!(
                    "charge_loss for battery type '{}' must be in (0, 1], got {}",
                    name, battery.charge_loss
                )));
            }
            let physical = [
                battery.size,
                battery.capacity,
                battery.max_charge,
                battery.max_discharge,
            ];
            if physical.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ArbitrageError::Configuration(format!(
                    "battery type '{}' has a negative or non-finite physical parameter",
                    name
                )));
            }
        }

        if let Some(counts) = &self.battery_counts {
            let mut expected: Vec<&String> = self.battery_types_used.iter().collect();
            expected.sort();
            expected.dedup();
            let given: Vec<&String> = counts.keys().collect();
            if given != expected {
                return Err(ArbitrageError::Configuration(format!(
                    "fixed battery counts cover {:?}, expected {:?}",
                    given, expected
                )));
            }
        }

        if let Some(selection) = &self.warehouses_used {
            if selection.len() != self.warehouse_data.len() {
                return Err(ArbitrageError::Configuration(format!(
                    "fixed warehouse selection has {} entries for {} warehouse options",
                    selection.len(),
                    self.warehouse_data.len()
                )));
            }
        }

        Ok(())
    }

    pub fn battery(&self, name: &str) -> Result<&BatteryTypeSpec, ArbitrageError> {
        self.battery_types.get(name).ok_or_else(|| {
            ArbitrageError::Configuration(format!("undefined battery type '{}'", name))
        })
    }

    /// A copy of this bundle with capital fixed to `plan`.
    pub fn with_capital_plan(&self, plan: &CapitalPlan) -> Self {
        Self {
            battery_counts: Some(plan.battery_counts.clone()),
            warehouses_used: Some(plan.warehouses_used.clone()),
            ..self.clone()
        }
    }

    /// A copy of this bundle with capital left as decisions.
    pub fn with_capital_as_decisions(&self) -> Self {
        Self {
            battery_counts: None,
            warehouses_used: None,
            ..self.clone()
        }
    }

    pub fn with_dates(&self, dates: Vec<NaiveDate>) -> Self {
        Self {
            date_range: Some(DateSelection::List(dates)),
            ..self.clone()
        }
    }

    /// Resolve the date selection, falling back to `today`.
    pub fn dates(&self, today: NaiveDate) -> Vec<NaiveDate> {
        self.date_range
            .as_ref()
            .map(DateSelection::dates)
            .unwrap_or_else(|| vec![today])
    }
}

/// One settlement period of the day-ahead market for a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub marginal_cost_losses: f64,
    pub marginal_cost_congestion: f64,
}

/// Chronologically ordered prices, one per period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Sorts the points by timestamp.
    pub fn new(mut points: Vec<PricePoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        Self { points }
    }

    /// Hourly series starting at midnight of `date`, used by tests and demos.
    pub fn hourly_from_prices(date: NaiveDate, prices: &[f64]) -> Self {
        let start = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        let points = prices
            .iter()
            .enumerate()
            .map(|(hour, &price)| PricePoint {
                timestamp: start + chrono::Duration::hours(hour as i64),
                price,
                marginal_cost_losses: 0.0,
                marginal_cost_congestion: 0.0,
            })
            .collect();
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.points.iter().map(|p| p.timestamp).collect()
    }

    pub fn extend(&mut self, other: PriceSeries) {
        self.points.extend(other.points);
        self.points.sort_by_key(|p| p.timestamp);
    }

    /// Points whose timestamp falls on `date`.
    pub fn for_date(&self, date: NaiveDate) -> PriceSeries {
        PriceSeries {
            points: self
                .points
                .iter()
                .filter(|p| p.timestamp.date() == date)
                .cloned()
                .collect(),
        }
    }

    pub fn constraint_parameters(&self) -> ConstraintParameters {
        ConstraintParameters {
            price_times: self.timestamps(),
            prices: self.prices(),
        }
    }
}

/// Price inputs retained next to a solve for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintParameters {
    pub price_times: Vec<NaiveDateTime>,
    pub prices: Vec<f64>,
}

/// Capital decisions from the sizing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalPlan {
    pub battery_counts: BTreeMap<String, u32>,
    pub warehouses_used: Vec<bool>,
}

impl CapitalPlan {
    pub fn battery_rental_cost(&self, config: &ArbitrageConfig) -> f64 {
        self.battery_counts
            .iter()
            .filter_map(|(name, count)| {
                config
                    .battery_types
                    .get(name)
                    .map(|b| b.cost * *count as f64)
            })
            .sum()
    }

    pub fn warehouse_cost(&self, config: &ArbitrageConfig) -> f64 {
        self.warehouses_used
            .iter()
            .zip(&config.warehouse_data)
            .filter(|(used, _)| **used)
            .map(|(_, w)| w.cost)
            .sum()
    }

    pub fn capital_cost(&self, config: &ArbitrageConfig) -> f64 {
        self.battery_rental_cost(config) + self.warehouse_cost(config)
    }

    pub fn floor_area_required(&self, config: &ArbitrageConfig) -> f64 {
        self.battery_counts
            .iter()
            .filter_map(|(name, count)| {
                config
                    .battery_types
                    .get(name)
                    .map(|b| b.size * *count as f64)
            })
            .sum()
    }

    pub fn floor_area_leased(&self, config: &ArbitrageConfig) -> f64 {
        self.warehouses_used
            .iter()
            .zip(&config.warehouse_data)
            .filter(|(used, _)| **used)
            .map(|(_, w)| w.area)
            .sum()
    }
}

/// Solved operating schedule of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResults {
    pub num_periods: usize,
    pub time: Vec<usize>,
    pub buy_ts: BTreeMap<String, Vec<f64>>,
    pub sell_ts: BTreeMap<String, Vec<f64>>,
    pub state_of_charge_ts: BTreeMap<String, Vec<f64>>,
    pub total_profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyProfit {
    pub date: NaiveDate,
    /// `None` when the day's model had no optimal solution
    pub profit: Option<f64>,
}

/// Everything the two-stage run hands to the presenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoStageOutcome {
    pub reference_date: NaiveDate,
    pub capital_plan: CapitalPlan,
    pub sizing_results: ModelResults,
    pub sizing_parameters: ConstraintParameters,
    pub daily_profits: Vec<DailyProfit>,
}

impl TwoStageOutcome {
    pub fn total_operating_profit(&self) -> f64 {
        self.daily_profits.iter().filter_map(|d| d.profit).sum()
    }

    pub fn solved_days(&self) -> usize {
        self.daily_profits.iter().filter(|d| d.profit.is_some()).count()
    }

    pub fn missing_days(&self) -> Vec<NaiveDate> {
        self.daily_profits
            .iter()
            .filter(|d| d.profit.is_none())
            .map(|d| d.date)
            .collect()
    }
}
