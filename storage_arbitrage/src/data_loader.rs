use crate::error::ArbitrageError;
use crate::models::{PricePoint, PriceSeries};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Anything that can hand back a gap-free price series for a set of dates.
pub trait PriceSeriesSource: Send + Sync {
    fn get_prices(
        &self,
        dates: &[NaiveDate],
        generator_name: &str,
    ) -> Result<PriceSeries, ArbitrageError>;
}

/// Cached per-generator day file, e.g. `20231128_ADK HUDSON___FALLS.csv`.
pub fn cached_file_name(date: NaiveDate, generator_name: &str) -> String {
    format!("{}_{}.csv", date.format("%Y%m%d"), generator_name)
}

/// The `n` dates strictly before `reference`, oldest first.
pub fn preceding_days(reference: NaiveDate, n: usize) -> Vec<NaiveDate> {
    (1..=n as i64)
        .rev()
        .map(|i| reference - Duration::days(i))
        .collect()
}

/// `reference` and the `n - 1` dates after it.
pub fn following_days(reference: NaiveDate, n: usize) -> Vec<NaiveDate> {
    (0..n as i64).map(|i| reference + Duration::days(i)).collect()
}

/// Reject a series that is shorter than the requested days, runs backwards,
/// or holds more periods on one date than a fall-back clock change allows.
/// The repeated hour of a 25-hour day is kept as its own period.
pub fn ensure_complete(
    series: &PriceSeries,
    days: usize,
    periods_per_day: usize,
) -> Result<(), ArbitrageError> {
    let expected = days * periods_per_day;
    if series.len() < expected {
        return Err(ArbitrageError::DataSource(format!(
            "expected {} periods for {} day(s), got {}",
            expected,
            days,
            series.len()
        )));
    }

    if let Some(pair) = series
        .points()
        .windows(2)
        .find(|w| w[0].timestamp > w[1].timestamp)
    {
        return Err(ArbitrageError::DataSource(format!(
            "price series goes backwards at {}",
            pair[1].timestamp
        )));
    }

    let mut per_date: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for point in series.points() {
        *per_date.entry(point.timestamp.date()).or_insert(0) += 1;
    }
    if let Some((date, count)) = per_date
        .into_iter()
        .find(|(_, count)| *count > periods_per_day + 1)
    {
        return Err(ArbitrageError::DataSource(format!(
            "{} periods on {}, at most {} expected",
            count,
            date,
            periods_per_day + 1
        )));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct CachedPriceRecord {
    time: String,
    #[serde(rename = "LB_MargPrice")]
    price: f64,
    #[serde(rename = "MargCostLosses", default)]
    marginal_cost_losses: f64,
    #[serde(rename = "MargCostCongestion", default)]
    marginal_cost_congestion: f64,
}

const TIMESTAMP_FORMATS: [&str; 3] = ["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M", "%Y-%m-%d %H:%M:%S"];

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
}

/// Reads the cached day files written by the extraction pipeline.
pub struct CsvPriceSource {
    storage_dir: PathBuf,
}

impl CsvPriceSource {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn path_for(&self, date: NaiveDate, generator_name: &str) -> PathBuf {
        self.storage_dir.join(cached_file_name(date, generator_name))
    }

    /// Dates in `dates` that have no cached file yet.
    pub fn missing_dates(&self, dates: &[NaiveDate], generator_name: &str) -> Vec<NaiveDate> {
        dates
            .iter()
            .copied()
            .filter(|d| !self.path_for(*d, generator_name).exists())
            .collect()
    }

    fn load_day(&self, date: NaiveDate, generator_name: &str) -> Result<Vec<PricePoint>, ArbitrageError> {
        let path = self.path_for(date, generator_name);
        if !path.exists() {
            return Err(ArbitrageError::DataSource(format!(
                "no cached prices for {} on {} ({})",
                generator_name,
                date,
                path.display()
            )));
        }

        let mut reader = csv::Reader::from_path(&path)?;
        let mut points = Vec::new();

        for record in reader.deserialize() {
            let record: CachedPriceRecord = record?;
            let timestamp = parse_timestamp(&record.time).ok_or_else(|| {
                ArbitrageError::DataSource(format!(
                    "unreadable timestamp '{}' in {}",
                    record.time,
                    path.display()
                ))
            })?;
            points.push(PricePoint {
                timestamp,
                price: record.price,
                marginal_cost_losses: record.marginal_cost_losses,
                marginal_cost_congestion: record.marginal_cost_congestion,
            });
        }

        debug!("Loaded {} periods from {}", points.len(), path.display());
        Ok(points)
    }
}

impl PriceSeriesSource for CsvPriceSource {
    fn get_prices(
        &self,
        dates: &[NaiveDate],
        generator_name: &str,
    ) -> Result<PriceSeries, ArbitrageError> {
        let mut points = Vec::new();
        for date in dates {
            points.extend(self.load_day(*date, generator_name)?);
        }
        Ok(PriceSeries::new(points))
    }
}

/// Price source backed by series held in memory, keyed by generator.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPriceSource {
    series: HashMap<String, PriceSeries>,
}

impl InMemoryPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, generator_name: &str, series: PriceSeries) {
        self.series
            .entry(generator_name.to_string())
            .or_default()
            .extend(series);
    }

    /// Register the same hourly profile for every date in `dates`.
    pub fn with_daily_profile(generator_name: &str, dates: &[NaiveDate], profile: &[f64]) -> Self {
        let mut source = Self::new();
        for date in dates {
            source.insert(generator_name, PriceSeries::hourly_from_prices(*date, profile));
        }
        source
    }
}

impl PriceSeriesSource for InMemoryPriceSource {
    fn get_prices(
        &self,
        dates: &[NaiveDate],
        generator_name: &str,
    ) -> Result<PriceSeries, ArbitrageError> {
        let all = self.series.get(generator_name).ok_or_else(|| {
            ArbitrageError::DataSource(format!("unknown generator '{}'", generator_name))
        })?;

        let mut result = PriceSeries::default();
        for date in dates {
            let day = all.for_date(*date);
            if day.is_empty() {
                return Err(ArbitrageError::DataSource(format!(
                    "no prices for {} on {}",
                    generator_name, date
                )));
            }
            result.extend(day);
        }
        Ok(result)
    }
}
