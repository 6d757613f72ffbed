use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use storage_arbitrage::{ConstraintParameters, DailyProfit, ModelResults, PriceSeries};

/// One bar of the profit waterfall.
#[derive(Debug, Clone, PartialEq)]
pub struct WaterfallBar {
    pub label: String,
    pub start: f64,
    pub end: f64,
}

impl WaterfallBar {
    pub fn delta(&self) -> f64 {
        self.end - self.start
    }
}

/// Capital cost first (as a drop), then each day's profit stacked on the
/// running total. Days without a solution get no bar and leave the total
/// unchanged.
pub fn waterfall_bars(capital_cost: f64, daily_profits: &[DailyProfit]) -> Vec<WaterfallBar> {
    let mut bars = Vec::with_capacity(daily_profits.len() + 1);
    bars.push(WaterfallBar {
        label: "Capital".to_string(),
        start: 0.0,
        end: -capital_cost,
    });

    let mut running = -capital_cost;
    for day in daily_profits {
        if let Some(profit) = day.profit {
            bars.push(WaterfallBar {
                label: day.date.format("%m-%d").to_string(),
                start: running,
                end: running + profit,
            });
            running += profit;
        }
    }
    bars
}

/// Value range with a margin; flat data still gets a visible band.
fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    let span = max - min;
    let pad = if span > 0.0 { span * 0.1 } else { min.abs().max(1.0) * 0.1 };
    (min - pad, max + pad)
}

fn hours_since(start: NaiveDateTime, t: NaiveDateTime) -> f64 {
    (t - start).num_minutes() as f64 / 60.0
}

fn file_safe(name: &str) -> String {
    name.replace('/', "_").replace(' ', "_")
}

pub struct ArbitrageCharts {
    output_dir: PathBuf,
}

impl ArbitrageCharts {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn plot_price_time_series(&self, series: &PriceSeries, generator_name: &str) -> Result<PathBuf> {
        let points = series.points();
        let (first, last) = match (points.first(), points.last()) {
            (Some(f), Some(l)) => (f.timestamp, l.timestamp),
            _ => bail!("no prices to plot for {}", generator_name),
        };

        let output_path = self.output_dir.join(format!(
            "price_time_series_{}_{}_{}.png",
            first.format("%Y%m%d"),
            last.format("%Y%m%d"),
            file_safe(generator_name)
        ));

        let backend_path = output_path.clone();
        let root = BitMapBackend::new(&backend_path, (1500, 500)).into_drawing_area();
        root.fill(&WHITE)?;

        let x_max = hours_since(first, last).max(1.0);
        let (y_min, y_max) = padded_range(points.iter().map(|p| p.price));

        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("Price Time Series for {} from {}", generator_name, first.format("%Y-%m-%d")),
                ("sans-serif", 30).into_font(),
            )
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(70)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)?;

        chart
            .configure_mesh()
            .x_desc("Hours")
            .y_desc("Price ($/MWh)")
            .draw()?;

        chart.draw_series(LineSeries::new(
            points.iter().map(|p| (hours_since(first, p.timestamp), p.price)),
            &BLUE,
        ))?;

        root.present()?;
        println!("  ✅ Saved {}", output_path.display());
        Ok(output_path)
    }

    /// Price, buy/sell and state of charge stacked in three panels.
    pub fn plot_result_time_series(
        &self,
        run_name: &str,
        results: &ModelResults,
        parameters: &ConstraintParameters,
    ) -> Result<PathBuf> {
        if results.num_periods == 0 {
            bail!("model results for {} are empty", run_name);
        }

        let output_path = self
            .output_dir
            .join(format!("result_time_series_{}.png", file_safe(run_name)));
        let backend_path = output_path.clone();
        let root = BitMapBackend::new(&backend_path, (1500, 1200)).into_drawing_area();
        root.fill(&WHITE)?;

        let panels = root.split_evenly((3, 1));
        let x_max = results.num_periods as f64;

        // Price
        let (y_min, y_max) = padded_range(parameters.prices.iter().copied());
        let mut price_chart = ChartBuilder::on(&panels[0])
            .caption(format!("{}: price", run_name), ("sans-serif", 24).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(70)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)?;
        price_chart.configure_mesh().y_desc("Price ($/MWh)").draw()?;
        price_chart.draw_series(LineSeries::new(
            parameters.prices.iter().enumerate().map(|(i, p)| (i as f64, *p)),
            &BLACK,
        ))?;

        // Buy and sell
        let flows = results
            .buy_ts
            .values()
            .chain(results.sell_ts.values())
            .flat_map(|v| v.iter().copied());
        let (y_min, y_max) = padded_range(flows.chain(std::iter::once(0.0)));
        let mut flow_chart = ChartBuilder::on(&panels[1])
            .caption("Energy bought and sold", ("sans-serif", 24).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(70)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)?;
        flow_chart.configure_mesh().y_desc("MWh").draw()?;

        for (i, (name, buy)) in results.buy_ts.iter().enumerate() {
            let buy_color = Palette99::pick(2 * i).to_rgba();
            flow_chart
                .draw_series(LineSeries::new(
                    buy.iter().enumerate().map(|(t, v)| (t as f64, *v)),
                    &buy_color,
                ))?
                .label(format!("{} buy", name))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], buy_color));

            if let Some(sell) = results.sell_ts.get(name) {
                let sell_color = Palette99::pick(2 * i + 1).to_rgba();
                flow_chart
                    .draw_series(LineSeries::new(
                        sell.iter().enumerate().map(|(t, v)| (t as f64, *v)),
                        &sell_color,
                    ))?
                    .label(format!("{} sell", name))
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], sell_color));
            }
        }
        flow_chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;

        // State of charge
        let levels = results.state_of_charge_ts.values().flat_map(|v| v.iter().copied());
        let (y_min, y_max) = padded_range(levels.chain(std::iter::once(0.0)));
        let mut soc_chart = ChartBuilder::on(&panels[2])
            .caption("State of charge", ("sans-serif", 24).into_font())
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(70)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)?;
        soc_chart
            .configure_mesh()
            .x_desc("Period")
            .y_desc("MWh")
            .draw()?;

        for (i, (name, soc)) in results.state_of_charge_ts.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            soc_chart
                .draw_series(LineSeries::new(
                    soc.iter().enumerate().map(|(t, v)| (t as f64, *v)),
                    color.stroke_width(2),
                ))?
                .label(name.clone())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], color));
        }
        soc_chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;

        root.present()?;
        println!("  ✅ Saved {}", output_path.display());
        Ok(output_path)
    }

    pub fn plot_waterfall_chart(
        &self,
        run_name: &str,
        capital_cost: f64,
        daily_profits: &[DailyProfit],
    ) -> Result<PathBuf> {
        let bars = waterfall_bars(capital_cost, daily_profits);

        let output_path = self
            .output_dir
            .join(format!("waterfall_{}.png", file_safe(run_name)));
        let backend_path = output_path.clone();
        let root = BitMapBackend::new(&backend_path, (1200, 600)).into_drawing_area();
        root.fill(&WHITE)?;

        let (y_min, y_max) = padded_range(bars.iter().flat_map(|b| [b.start, b.end]));
        let x_max = bars.len() as f64 - 0.5;

        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("Cumulative profit after capital: {}", run_name),
                ("sans-serif", 30).into_font(),
            )
            .margin(15)
            .x_label_area_size(50)
            .y_label_area_size(80)
            .build_cartesian_2d(-0.5..x_max, y_min..y_max)?;

        let labels: Vec<String> = bars.iter().map(|b| b.label.clone()).collect();
        chart
            .configure_mesh()
            .x_labels(bars.len())
            .x_label_formatter(&|x| {
                let idx = x.round();
                if idx >= 0.0 && (idx - x).abs() < 1e-6 {
                    labels.get(idx as usize).cloned().unwrap_or_default()
                } else {
                    String::new()
                }
            })
            .y_desc("Profit ($)")
            .draw()?;

        chart.draw_series(bars.iter().enumerate().map(|(i, bar)| {
            let style = if bar.delta() >= 0.0 { GREEN.filled() } else { RED.filled() };
            Rectangle::new([(i as f64 - 0.4, bar.start), (i as f64 + 0.4, bar.end)], style)
        }))?;

        root.present()?;
        println!("  ✅ Saved {}", output_path.display());
        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32, profit: Option<f64>) -> DailyProfit {
        DailyProfit {
            date: NaiveDate::from_ymd_opt(2023, 11, d).unwrap(),
            profit,
        }
    }

    #[test]
    fn test_waterfall_starts_with_capital_drop() {
        let bars = waterfall_bars(500.0, &[day(1, Some(200.0)), day(2, Some(-50.0))]);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].label, "Capital");
        assert_eq!(bars[0].end, -500.0);
        assert_eq!(bars[1].start, -500.0);
        assert_eq!(bars[1].end, -300.0);
        assert_eq!(bars[2].label, "11-02");
        assert_eq!(bars[2].end, -350.0);
        assert!(bars[2].delta() < 0.0);
    }

    #[test]
    fn test_waterfall_skips_unsolved_days() {
        let bars = waterfall_bars(0.0, &[day(1, Some(10.0)), day(2, None), day(3, Some(5.0))]);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[2].label, "11-03");
        assert_eq!(bars[2].start, 10.0);
        assert_eq!(bars[2].end, 15.0);
    }

    #[test]
    fn test_padded_range_handles_flat_and_empty_data() {
        assert_eq!(padded_range(std::iter::empty()), (0.0, 1.0));
        let (lo, hi) = padded_range([5.0, 5.0].into_iter());
        assert!(lo < 5.0 && hi > 5.0);
        let (lo, hi) = padded_range([0.0, 10.0].into_iter());
        assert_eq!((lo, hi), (-1.0, 11.0));
    }

    #[test]
    fn test_file_safe_names() {
        assert_eq!(file_safe("ADK HUDSON___FALLS"), "ADK_HUDSON___FALLS");
        assert_eq!(file_safe("a/b"), "a_b");
    }
}
