use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

use pantry_core::models::validate_meal_type;
use pantry_core::reconcile::{AggregationOptions, DemandHorizon, ShortageMode};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub shortage_mode: ShortageMode,
    /// Demand horizon used for the shopping list.
    pub aggregation: AggregationOptions,
    /// Allowed meal types; `None` accepts any label.
    pub meal_types: Option<Vec<String>>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "pantry").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Self::from_lookup(data_dir.join("pantry.db"), |key| std::env::var(key).ok())
    }

    /// Build a config from environment-style lookups, falling back to defaults.
    fn from_lookup(default_db: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = get("PANTRY_DB").map_or(default_db, PathBuf::from);

        let threshold = get("PANTRY_LOW_STOCK_THRESHOLD")
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .with_context(|| format!("Invalid PANTRY_LOW_STOCK_THRESHOLD '{v}'"))
            })
            .transpose()?;
        let shortage_mode =
            ShortageMode::parse(get("PANTRY_SHORTAGE_MODE").as_deref().unwrap_or("demand"), threshold)
                .context("Invalid PANTRY_SHORTAGE_MODE")?;

        let mut aggregation = AggregationOptions::upcoming();
        if let Some(horizon) = get("PANTRY_DEMAND_HORIZON") {
            aggregation.horizon = horizon
                .parse::<DemandHorizon>()
                .context("Invalid PANTRY_DEMAND_HORIZON")?;
        }
        if let Some(flag) = get("PANTRY_INCLUDE_COOKED") {
            aggregation.include_cooked = parse_bool(&flag)
                .with_context(|| format!("Invalid PANTRY_INCLUDE_COOKED '{flag}'"))?;
        }

        let meal_types = get("PANTRY_MEAL_TYPES").map(|list| {
            list.split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect::<Vec<_>>()
        });

        Ok(Config {
            db_path,
            shortage_mode,
            aggregation,
            meal_types,
        })
    }

    /// Check a meal type against the allow-list, if any. A match is case-insensitive
    /// and yields the label as configured; without a list the input is kept as written.
    pub fn check_meal_type(&self, meal: &str) -> pantry_core::Result<String> {
        let meal = validate_meal_type(meal)?;
        let Some(allowed) = &self.meal_types else {
            return Ok(meal);
        };
        let wanted = meal.to_lowercase();
        allowed
            .iter()
            .find(|m| m.to_lowercase() == wanted)
            .cloned()
            .ok_or_else(|| {
                pantry_core::Error::invalid(format!(
                    "Invalid meal type '{meal}'. Must be one of: {}",
                    allowed.join(", ")
                ))
            })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("expected true or false"),
    }
}
