use anyhow::Result;
use chrono::Local;

use pantry_core::broadcast::{ListLine, SendStatus, render_shopping_list};
use pantry_core::db::Database;
use pantry_core::models::ShoppingItem;
use pantry_core::reconcile::{AggregationOptions, DemandHorizon, ShortageMode};

use crate::config::Config;
use crate::line::LineClient;

use super::helpers::{print_json, print_shopping_table};

/// Per-invocation overrides of the configured shortage settings.
#[derive(Default)]
pub(crate) struct ShoppingArgs {
    pub mode: Option<String>,
    pub threshold: Option<f64>,
    pub horizon: Option<DemandHorizon>,
    pub include_cooked: bool,
}

impl ShoppingArgs {
    fn resolve(&self, config: &Config) -> Result<(ShortageMode, AggregationOptions)> {
        let mode = match (&self.mode, self.threshold) {
            (Some(mode), threshold) => ShortageMode::parse(mode, threshold)?,
            (None, Some(threshold)) => ShortageMode::parse("threshold", Some(threshold))?,
            (None, None) => config.shortage_mode,
        };
        let mut options = config.aggregation;
        if let Some(horizon) = self.horizon {
            options.horizon = horizon;
        }
        options.include_cooked |= self.include_cooked;
        Ok((mode, options))
    }
}

fn compute(db: &Database, config: &Config, args: &ShoppingArgs) -> Result<Vec<ShoppingItem>> {
    let (mode, options) = args.resolve(config)?;
    let today = Local::now().date_naive();
    Ok(db.shopping_list(mode, options, today)?)
}

pub(crate) fn cmd_shopping_list(
    db: &Database,
    config: &Config,
    args: &ShoppingArgs,
    text: bool,
    json: bool,
) -> Result<()> {
    let items = compute(db, config, args)?;

    if json {
        return print_json(&items);
    }
    if items.is_empty() {
        println!("Nothing to buy.");
        return Ok(());
    }
    if text {
        let lines: Vec<ListLine> = items.iter().map(ListLine::from).collect();
        print!("{}", render_shopping_list(&lines));
        return Ok(());
    }
    print_shopping_table(&items);
    let total: f64 = items.iter().map(|i| i.estimated_cost).sum();
    println!("Estimated total: {total:.2}");
    Ok(())
}

pub(crate) async fn cmd_shopping_send(
    db: &Database,
    config: &Config,
    line: &LineClient,
    args: &ShoppingArgs,
    json: bool,
) -> Result<()> {
    let items = compute(db, config, args)?;
    let lines: Vec<ListLine> = items.iter().map(ListLine::from).collect();
    let outcome = line.broadcast(&lines).await?;

    if json {
        return print_json(&outcome);
    }
    match outcome.status {
        SendStatus::Sent => println!("Sent {} item(s) to LINE.", outcome.items),
        SendStatus::NoItems => println!("Nothing to buy, no message sent."),
    }
    Ok(())
}
