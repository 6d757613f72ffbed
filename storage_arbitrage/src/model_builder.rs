use crate::error::ArbitrageError;
use crate::models::{ArbitrageConfig, ConstraintParameters, PriceSeries};
use good_lp::{constraint, variable, Constraint, Expression, ProblemVariables, Variable};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Constraint groups emitted by the builder, tallied per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintFamily {
    Capacity,
    Supply,
    Charge,
    Discharge,
    CarryOver,
    Area,
}

/// Number of units of a battery type: either an input or a decision.
#[derive(Debug, Clone, Copy)]
pub enum UnitCount {
    Fixed(u32),
    Decision(Variable),
}

impl UnitCount {
    /// `factor × unit count` as an affine expression.
    fn scaled(&self, factor: f64) -> Expression {
        match *self {
            UnitCount::Fixed(count) => Expression::from_other_affine(factor * count as f64),
            UnitCount::Decision(count) => factor * count,
        }
    }
}

/// Decision handles for one battery type.
#[derive(Debug, Clone)]
pub struct BatteryDecisions {
    pub buy: Vec<Variable>,
    pub sell: Vec<Variable>,
    pub unit_count: UnitCount,
    pub charge_loss: f64,
}

#[derive(Debug, Clone)]
pub struct DecisionVariableSet {
    pub batteries: BTreeMap<String, BatteryDecisions>,
    /// One binary per warehouse option, only when selection is a decision
    pub warehouses_used: Option<Vec<Variable>>,
}

/// A fully specified maximisation problem, ready for a [`crate::SolverOracle`].
pub struct ArbitrageProblem {
    pub(crate) variables: ProblemVariables,
    pub(crate) objective: Expression,
    pub(crate) constraints: Vec<Constraint>,
    pub decisions: DecisionVariableSet,
    pub constraint_parameters: ConstraintParameters,
    pub num_periods: usize,
    family_counts: BTreeMap<ConstraintFamily, usize>,
}

impl ArbitrageProblem {
    pub fn constraint_count(&self, family: ConstraintFamily) -> usize {
        self.family_counts.get(&family).copied().unwrap_or(0)
    }

    pub fn total_constraints(&self) -> usize {
        self.constraints.len()
    }
}

/// Periods whose net charge has accumulated by the end of `period`.
pub fn state_of_charge_window(period: usize) -> RangeInclusive<usize> {
    0..=period
}

/// Charge level of one battery type at the end of `period`.
pub fn state_of_charge_expression(
    buy: &[Variable],
    sell: &[Variable],
    charge_loss: f64,
    period: usize,
) -> Expression {
    state_of_charge_window(period)
        .map(|p| charge_loss * buy[p] - sell[p])
        .sum()
}

/// Same accumulation as [`state_of_charge_expression`], over solved values.
pub fn state_of_charge_path(buy: &[f64], sell: &[f64], charge_loss: f64) -> Vec<f64> {
    (0..buy.len().min(sell.len()))
        .map(|period| {
            state_of_charge_window(period)
                .map(|p| charge_loss * buy[p] - sell[p])
                .sum()
        })
        .collect()
}

pub struct ArbitrageModelBuilder {
    config: ArbitrageConfig,
}

impl ArbitrageModelBuilder {
    pub fn new(config: ArbitrageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbitrageConfig {
        &self.config
    }

    /// Assemble the problem for one horizon; the horizon is the length of
    /// `prices`.
    pub fn build(&self, prices: &PriceSeries) -> Result<ArbitrageProblem, ArbitrageError> {
        self.config.validate()?;

        if prices.is_empty() {
            return Err(ArbitrageError::Configuration(
                "price series has no periods".to_string(),
            ));
        }
        let price_values = prices.prices();
        if let Some(p) = price_values.iter().position(|v| !v.is_finite()) {
            return Err(ArbitrageError::Configuration(format!(
                "price at period {} is not a finite number",
                p
            )));
        }

        let num_periods = price_values.len();
        let periods_per_day = self.config.periods_per_day;

        let mut variables = ProblemVariables::new();
        let mut objective = Expression::default();
        let mut floor_area_required = Expression::default();
        let mut constraints = Vec::new();
        let mut family_counts = BTreeMap::new();
        let mut push = |family: ConstraintFamily, c: Constraint| {
            constraints.push(c);
            *family_counts.entry(family).or_insert(0) += 1;
        };

        let mut batteries = BTreeMap::new();

        for battery_type in &self.config.battery_types_used {
            if batteries.contains_key(battery_type) {
                continue;
            }
            let battery = self.config.battery(battery_type)?;

            let buy: Vec<Variable> = (0..num_periods)
                .map(|_| variables.add(variable().min(0.0)))
                .collect();
            let sell: Vec<Variable> = (0..num_periods)
                .map(|_| variables.add(variable().min(0.0)))
                .collect();

            let unit_count = match &self.config.battery_counts {
                Some(counts) => {
                    let count = counts.get(battery_type).copied().ok_or_else(|| {
                        ArbitrageError::Configuration(format!(
                            "no fixed unit count for battery type '{}'",
                            battery_type
                        ))
                    })?;
                    UnitCount::Fixed(count)
                }
                None => {
                    let count = variables.add(variable().integer().min(0.0));
                    objective -= battery.cost * count;
                    UnitCount::Decision(count)
                }
            };

            let capacity_limit = unit_count.scaled(battery.capacity);
            let charge_limit = unit_count.scaled(battery.max_charge);
            let discharge_limit = unit_count.scaled(battery.max_discharge);

            for p in 0..num_periods {
                let level = state_of_charge_expression(&buy, &sell, battery.charge_loss, p);

                if !self.config.carry_over && p % periods_per_day == 0 {
                    push(ConstraintFamily::CarryOver, constraint!(level.clone() <= 0.0));
                }

                push(
                    ConstraintFamily::Capacity,
                    constraint!(level.clone() <= capacity_limit.clone()),
                );
                push(ConstraintFamily::Supply, constraint!(level >= 0.0));
                push(
                    ConstraintFamily::Charge,
                    constraint!(battery.charge_loss * buy[p] <= charge_limit.clone()),
                );
                push(
                    ConstraintFamily::Discharge,
                    constraint!(sell[p] <= discharge_limit.clone()),
                );

                objective += price_values[p] * sell[p] - price_values[p] * buy[p];
            }

            floor_area_required += unit_count.scaled(battery.size);

            batteries.insert(
                battery_type.clone(),
                BatteryDecisions {
                    buy,
                    sell,
                    unit_count,
                    charge_loss: battery.charge_loss,
                },
            );
        }

        // A fixed selection was paid for in an earlier stage, so neither its
        // cost nor its area check enter this model.
        let warehouses_used = match &self.config.warehouses_used {
            Some(_) => None,
            None => {
                let selected: Vec<Variable> = self
                    .config
                    .warehouse_data
                    .iter()
                    .map(|_| variables.add(variable().binary()))
                    .collect();

                let leased_area: Expression = selected
                    .iter()
                    .zip(&self.config.warehouse_data)
                    .map(|(&used, option)| option.area * used)
                    .sum();
                push(
                    ConstraintFamily::Area,
                    constraint!(leased_area >= floor_area_required),
                );

                for (&used, option) in selected.iter().zip(&self.config.warehouse_data) {
                    objective -= option.cost * used;
                }

                Some(selected)
            }
        };

        Ok(ArbitrageProblem {
            variables,
            objective,
            constraints,
            decisions: DecisionVariableSet {
                batteries,
                warehouses_used,
            },
            constraint_parameters: prices.constraint_parameters(),
            num_periods,
            family_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatteryTypeSpec, WarehouseOption};
    use chrono::NaiveDate;

    fn single_battery_config() -> ArbitrageConfig {
        let mut config = ArbitrageConfig::nyiso_default();
        config.battery_types.clear();
        config.battery_types.insert(
            "flow".to_string(),
            BatteryTypeSpec {
                size: 1.0,
                capacity: 100.0,
                charge_loss: 0.9,
                max_charge: 50.0,
                max_discharge: 50.0,
                cost: 10.0,
            },
        );
        config.battery_types_used = vec!["flow".to_string()];
        config.warehouse_data = vec![
            WarehouseOption { area: 10.0, cost: 5.0 },
            WarehouseOption { area: 20.0, cost: 8.0 },
        ];
        config
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 11, 28).unwrap()
    }

    #[test]
    fn test_state_of_charge_window_is_prefix() {
        for p in [0usize, 1, 5, 23, 24, 100] {
            let window: Vec<usize> = state_of_charge_window(p).collect();
            assert_eq!(window.len(), p + 1);
            assert_eq!(window.first(), Some(&0));
            assert_eq!(window.last(), Some(&p));
        }
    }

    #[test]
    fn test_state_of_charge_path_accumulates() {
        let buy = [10.0, 0.0, 5.0, 0.0];
        let sell = [0.0, 4.0, 0.0, 7.5];
        let path = state_of_charge_path(&buy, &sell, 0.5);
        assert_eq!(path, vec![5.0, 1.0, 3.5, -4.0]);
    }

    #[test]
    fn test_decision_capital_emits_all_families() {
        let config = single_battery_config();
        let prices = PriceSeries::hourly_from_prices(day(), &[20.0; 48]);
        let problem = ArbitrageModelBuilder::new(config).build(&prices).unwrap();

        assert_eq!(problem.num_periods, 48);
        assert_eq!(problem.constraint_count(ConstraintFamily::Capacity), 48);
        assert_eq!(problem.constraint_count(ConstraintFamily::Supply), 48);
        assert_eq!(problem.constraint_count(ConstraintFamily::Charge), 48);
        assert_eq!(problem.constraint_count(ConstraintFamily::Discharge), 48);
        // Periods 0 and 24 are day boundaries
        assert_eq!(problem.constraint_count(ConstraintFamily::CarryOver), 2);
        assert_eq!(problem.constraint_count(ConstraintFamily::Area), 1);
        assert_eq!(problem.total_constraints(), 4 * 48 + 2 + 1);

        let flow = &problem.decisions.batteries["flow"];
        assert_eq!(flow.buy.len(), 48);
        assert_eq!(flow.sell.len(), 48);
        assert!(matches!(flow.unit_count, UnitCount::Decision(_)));
        assert_eq!(problem.decisions.warehouses_used.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_fixed_capital_creates_no_capital_variables() {
        let mut config = single_battery_config();
        config.carry_over = true;
        config.battery_counts = Some([("flow".to_string(), 3)].into_iter().collect());
        config.warehouses_used = Some(vec![true, false]);

        let prices = PriceSeries::hourly_from_prices(day(), &[20.0; 24]);
        let problem = ArbitrageModelBuilder::new(config).build(&prices).unwrap();

        assert!(matches!(
            problem.decisions.batteries["flow"].unit_count,
            UnitCount::Fixed(3)
        ));
        assert!(problem.decisions.warehouses_used.is_none());
        assert_eq!(problem.constraint_count(ConstraintFamily::Area), 0);
        assert_eq!(problem.constraint_count(ConstraintFamily::CarryOver), 0);
    }

    #[test]
    fn test_custom_day_length_moves_boundaries() {
        let mut config = single_battery_config();
        config.periods_per_day = 12;
        let prices = PriceSeries::hourly_from_prices(day(), &[20.0; 24]);
        let problem = ArbitrageModelBuilder::new(config).build(&prices).unwrap();
        assert_eq!(problem.constraint_count(ConstraintFamily::CarryOver), 2);
    }

    #[test]
    fn test_empty_price_series_is_configuration_error() {
        let builder = ArbitrageModelBuilder::new(single_battery_config());
        let err = builder.build(&PriceSeries::default()).err().unwrap();
        assert!(matches!(err, ArbitrageError::Configuration(_)));
    }

    #[test]
    fn test_undefined_battery_type_is_configuration_error() {
        let mut config = single_battery_config();
        config.battery_types_used.push("zinc".to_string());
        let prices = PriceSeries::hourly_from_prices(day(), &[20.0; 24]);
        let err = ArbitrageModelBuilder::new(config).build(&prices).err().unwrap();
        assert!(matches!(err, ArbitrageError::Configuration(_)));
    }

    #[test]
    fn test_non_finite_price_rejected() {
        let mut prices = vec![20.0; 24];
        prices[7] = f64::NAN;
        let series = PriceSeries::hourly_from_prices(day(), &prices);
        let err = ArbitrageModelBuilder::new(single_battery_config())
            .build(&series)
            .err()
            .unwrap();
        assert!(err.to_string().contains("period 7"));
    }

    #[test]
    fn test_constraint_parameters_track_prices() {
        let prices = PriceSeries::hourly_from_prices(day(), &[1.0, 2.0, 3.0]);
        let problem = ArbitrageModelBuilder::new(single_battery_config())
            .build(&prices)
            .unwrap();
        assert_eq!(problem.constraint_parameters.prices, vec![1.0, 2.0, 3.0]);
        assert_eq!(problem.constraint_parameters.price_times.len(), 3);
    }
}
