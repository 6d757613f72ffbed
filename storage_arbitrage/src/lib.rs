pub mod data_loader;
pub mod error;
pub mod model_builder;
pub mod models;
pub mod orchestrator;
pub mod solver;

pub use data_loader::{CsvPriceSource, InMemoryPriceSource, PriceSeriesSource};
pub use error::ArbitrageError;
pub use model_builder::{ArbitrageModelBuilder, ArbitrageProblem, DecisionVariableSet};
pub use models::{
    ArbitrageConfig, BatteryTypeSpec, CapitalPlan, ConstraintParameters, DailyProfit,
    ModelResults, PricePoint, PriceSeries, TwoStageOutcome, WarehouseOption,
};
pub use orchestrator::{run, solve_model, ModelRun, TwoStageOrchestrator};
pub use solver::{GoodLpSolver, SolveResult, SolveStatus, SolverOracle};
