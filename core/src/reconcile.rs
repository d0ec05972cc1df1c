//! Stock reconciliation: how much the meal plan needs, what is missing, and the
//! one-way "cook" transition that consumes stock.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{CookReceipt, Ingredient, MealPlanEntry, ShoppingItem, StockChange};

pub const DEFAULT_LOW_STOCK_THRESHOLD: f64 = 1.0;

/// Which part of the schedule counts as demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemandHorizon {
    /// Every scheduled entry, past and future.
    All,
    /// Entries dated today or later.
    Upcoming,
}

impl FromStr for DemandHorizon {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "upcoming" | "future" => Ok(Self::Upcoming),
            other => Err(Error::invalid(format!(
                "Invalid demand horizon '{other}'. Must be one of: all, upcoming"
            ))),
        }
    }
}

impl fmt::Display for DemandHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Upcoming => f.write_str("upcoming"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationOptions {
    pub horizon: DemandHorizon,
    /// Cooked entries have already been taken out of stock, so they are
    /// normally left out.
    pub include_cooked: bool,
}

impl AggregationOptions {
    /// Shopping list default: what is still to be cooked from today on.
    #[must_use]
    pub const fn upcoming() -> Self {
        Self {
            horizon: DemandHorizon::Upcoming,
            include_cooked: false,
        }
    }

    /// Inventory "planned consumption" default: the whole uncooked schedule.
    #[must_use]
    pub const fn whole_schedule() -> Self {
        Self {
            horizon: DemandHorizon::All,
            include_cooked: false,
        }
    }
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self::upcoming()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShortageMode {
    /// Required by the meal plan minus current stock.
    Demand,
    /// Anything whose stock fell below a fixed level, regardless of the plan.
    Threshold { threshold: f64 },
}

impl ShortageMode {
    pub fn parse(mode: &str, threshold: Option<f64>) -> Result<Self> {
        match mode.trim().to_lowercase().as_str() {
            "demand" => Ok(Self::Demand),
            "threshold" => {
                let threshold = threshold.unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD);
                if !threshold.is_finite() {
                    return Err(Error::invalid("threshold must be a finite number"));
                }
                Ok(Self::Threshold { threshold })
            }
            other => Err(Error::invalid(format!(
                "Invalid shortage mode '{other}'. Must be one of: demand, threshold"
            ))),
        }
    }
}

/// A single (ingredient, quantity) edge of the recipe graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Requirement {
    pub ingredient_id: i64,
    pub quantity: f64,
}

/// recipe id -> what one batch of that recipe needs.
pub type RecipeGraph = HashMap<i64, Vec<Requirement>>;

/// Sum the quantity of every ingredient over the scheduled entries selected by
/// `options`. Entries without a recipe, or whose recipe has no lines, add nothing.
#[must_use]
pub fn aggregate_requirements(
    schedule: &[MealPlanEntry],
    graph: &RecipeGraph,
    options: AggregationOptions,
    today: NaiveDate,
) -> HashMap<i64, f64> {
    let mut required: HashMap<i64, f64> = HashMap::new();
    for entry in schedule {
        if entry.is_cooked && !options.include_cooked {
            continue;
        }
        if options.horizon == DemandHorizon::Upcoming && entry.date < today {
            continue;
        }
        let Some(lines) = entry.recipe_id.and_then(|id| graph.get(&id)) else {
            continue;
        };
        for line in lines {
            *required.entry(line.ingredient_id).or_insert(0.0) += line.quantity;
        }
    }
    required
}

/// Build the shopping list from a ledger snapshot. Untracked ingredients never
/// appear; results are sorted by name.
#[must_use]
pub fn compute_shortage(
    mode: ShortageMode,
    ledger: &[Ingredient],
    required: &HashMap<i64, f64>,
) -> Vec<ShoppingItem> {
    let mut items: Vec<ShoppingItem> = ledger
        .iter()
        .filter(|i| i.is_tracked)
        .filter_map(|i| {
            let needed = match mode {
                ShortageMode::Demand => {
                    let req = required.get(&i.id).copied()?;
                    req - i.current_stock
                }
                ShortageMode::Threshold { threshold } => {
                    if i.current_stock >= threshold {
                        return None;
                    }
                    threshold - i.current_stock
                }
            };
            (needed > 0.0).then(|| ShoppingItem {
                ingredient_id: i.id,
                name: i.name.clone(),
                quantity_needed: needed,
                unit: i.unit.clone(),
                estimated_cost: needed * i.price.unwrap_or(0.0),
            })
        })
        .collect();
    items.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then(a.ingredient_id.cmp(&b.ingredient_id))
    });
    items
}

/// What a recipe consumes from one ingredient, as seen inside a cook scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumption {
    pub ingredient_id: i64,
    pub name: String,
    pub quantity: f64,
    pub is_tracked: bool,
}

/// Exclusive write scope over the store for the duration of one cook transition.
///
/// Implementations hold their lock from creation until [`commit`](Self::commit);
/// dropping a scope without committing must discard every change made through it.
pub trait ConsumptionScope {
    /// Read the entry, holding it exclusively until the scope ends.
    fn lock_entry(&mut self, entry_id: i64) -> Result<Option<MealPlanEntry>>;
    fn recipe_consumption(&mut self, recipe_id: i64) -> Result<Vec<Consumption>>;
    fn mark_cooked(&mut self, entry_id: i64) -> Result<()>;
    /// Subtract `quantity` from stock, returning the new stock level.
    fn decrement_stock(&mut self, ingredient_id: i64, quantity: f64) -> Result<f64>;
    fn commit(self) -> Result<()>;
}

/// Mark a meal cooked and take its tracked ingredients out of stock, all or
/// nothing. A second call on the same entry fails with `Conflict`.
pub fn commit_consumption<S: ConsumptionScope>(mut scope: S, entry_id: i64) -> Result<CookReceipt> {
    let entry = scope
        .lock_entry(entry_id)?
        .ok_or_else(|| Error::not_found("meal plan entry", entry_id))?;

    if entry.is_cooked {
        return Err(Error::conflict(format!(
            "Meal plan entry {entry_id} has already been cooked"
        )));
    }
    let recipe_id = entry.recipe_id.ok_or_else(|| {
        Error::InvalidState(format!(
            "Meal plan entry {entry_id} has no recipe, nothing to consume"
        ))
    })?;

    let lines = scope.recipe_consumption(recipe_id)?;
    scope.mark_cooked(entry_id)?;

    let mut consumed = Vec::with_capacity(lines.len());
    for line in lines.into_iter().filter(|l| l.is_tracked) {
        let remaining_stock = scope.decrement_stock(line.ingredient_id, line.quantity)?;
        debug!(
            ingredient_id = line.ingredient_id,
            consumed = line.quantity,
            remaining_stock,
            "stock decremented"
        );
        consumed.push(StockChange {
            ingredient_id: line.ingredient_id,
            name: line.name,
            consumed: line.quantity,
            remaining_stock,
        });
    }

    scope.commit()?;
    info!(
        entry_id,
        recipe_id,
        ingredients = consumed.len(),
        "meal cooked"
    );
    Ok(CookReceipt {
        entry_id,
        recipe_id,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn entry(id: i64, date: NaiveDate, recipe_id: Option<i64>, is_cooked: bool) -> MealPlanEntry {
        MealPlanEntry {
            id,
            date,
            meal_type: "dinner".to_string(),
            recipe_id,
            recipe_name: None,
            is_cooked,
            cooked_at: None,
            created_at: String::new(),
        }
    }

    fn ingredient(id: i64, name: &str, stock: f64, price: Option<f64>, tracked: bool) -> Ingredient {
        Ingredient {
            id,
            name: name.to_string(),
            current_stock: stock,
            unit: "kg".to_string(),
            price,
            category: "food".to_string(),
            is_tracked: tracked,
            expiry_date: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn graph() -> RecipeGraph {
        let mut g = RecipeGraph::new();
        g.insert(
            1,
            vec![
                Requirement {
                    ingredient_id: 10,
                    quantity: 3.0,
                },
                Requirement {
                    ingredient_id: 11,
                    quantity: 0.5,
                },
            ],
        );
        g.insert(
            2,
            vec![Requirement {
                ingredient_id: 10,
                quantity: 1.0,
            }],
        );
        // Never scheduled
        g.insert(
            3,
            vec![Requirement {
                ingredient_id: 12,
                quantity: 9.0,
            }],
        );
        g
    }

    #[test]
    fn test_aggregate_sums_only_scheduled_recipes() {
        let schedule = vec![
            entry(1, day(10), Some(1), false),
            entry(2, day(11), Some(1), false),
            entry(3, day(12), Some(2), false),
            entry(4, day(12), None, false),
        ];
        let required =
            aggregate_requirements(&schedule, &graph(), AggregationOptions::whole_schedule(), day(1));
        assert_eq!(required.get(&10), Some(&7.0));
        assert_eq!(required.get(&11), Some(&1.0));
        assert!(!required.contains_key(&12));
    }

    #[test]
    fn test_aggregate_horizon() {
        let schedule = vec![
            entry(1, day(9), Some(1), false),
            entry(2, day(10), Some(1), false),
            entry(3, day(11), Some(2), false),
        ];
        let all = aggregate_requirements(&schedule, &graph(), AggregationOptions::whole_schedule(), day(10));
        assert_eq!(all.get(&10), Some(&7.0));

        // Default horizon for the shopping list: today and later.
        let upcoming = aggregate_requirements(&schedule, &graph(), AggregationOptions::default(), day(10));
        assert_eq!(upcoming.get(&10), Some(&4.0));
        assert_eq!(upcoming.get(&11), Some(&0.5));
    }

    #[test]
    fn test_aggregate_skips_cooked_unless_asked() {
        let schedule = vec![
            entry(1, day(10), Some(1), true),
            entry(2, day(10), Some(2), false),
        ];
        let without = aggregate_requirements(&schedule, &graph(), AggregationOptions::upcoming(), day(10));
        assert_eq!(without.get(&10), Some(&1.0));

        let with = aggregate_requirements(
            &schedule,
            &graph(),
            AggregationOptions {
                horizon: DemandHorizon::Upcoming,
                include_cooked: true,
            },
            day(10),
        );
        assert_eq!(with.get(&10), Some(&4.0));
    }

    #[test]
    fn test_demand_shortage() {
        let ledger = vec![
            ingredient(10, "flour", 2.0, Some(1.5), true),
            ingredient(11, "yeast", 5.0, Some(4.0), true),
            ingredient(12, "water", 0.0, None, false),
            ingredient(13, "sugar", 0.0, None, true),
        ];
        let required = HashMap::from([(10, 3.0), (11, 1.0), (12, 2.0)]);
        let list = compute_shortage(ShortageMode::Demand, &ledger, &required);

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "flour");
        assert!((list[0].quantity_needed - 1.0).abs() < 1e-9);
        assert!((list[0].estimated_cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_demand_shortage_total_matches_gap() {
        let ledger = vec![
            ingredient(1, "b", -1.0, None, true),
            ingredient(2, "a", 4.0, Some(2.0), true),
            ingredient(3, "c", 10.0, None, true),
            ingredient(4, "d", 0.0, None, false),
        ];
        let required = HashMap::from([(1, 2.0), (2, 6.5), (3, 10.0), (4, 8.0)]);
        let list = compute_shortage(ShortageMode::Demand, &ledger, &required);

        let total: f64 = list.iter().map(|i| i.quantity_needed).sum();
        let expected: f64 = ledger
            .iter()
            .filter(|i| i.is_tracked)
            .filter_map(|i| {
                let r = required.get(&i.id)?;
                (*r > i.current_stock).then(|| r - i.current_stock)
            })
            .sum();
        assert!((total - expected).abs() < 1e-9);
        assert!(list.iter().all(|i| i.ingredient_id != 4));
        // sorted by name
        let names: Vec<&str> = list.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_threshold_shortage_ignores_schedule() {
        let ledger = vec![
            ingredient(1, "Milk", 0.25, Some(2.0), true),
            ingredient(2, "Eggs", 6.0, None, true),
            ingredient(3, "Soap", 0.0, None, false),
        ];
        let list = compute_shortage(
            ShortageMode::Threshold { threshold: 1.0 },
            &ledger,
            &HashMap::new(),
        );
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "Milk");
        assert!((list[0].quantity_needed - 0.75).abs() < 1e-9);
        assert!((list[0].estimated_cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_unpriced_cost_is_zero() {
        let ledger = vec![ingredient(1, "rice", 0.0, None, true)];
        let list = compute_shortage(ShortageMode::Demand, &ledger, &HashMap::from([(1, 2.0)]));
        assert_eq!(list[0].estimated_cost, 0.0);
    }

    #[test]
    fn test_mode_and_horizon_parsing() {
        assert_eq!(ShortageMode::parse("demand", None).unwrap(), ShortageMode::Demand);
        assert_eq!(
            ShortageMode::parse("Threshold", None).unwrap(),
            ShortageMode::Threshold {
                threshold: DEFAULT_LOW_STOCK_THRESHOLD
            }
        );
        assert_eq!(
            ShortageMode::parse("weekly", None).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!("all".parse::<DemandHorizon>().unwrap(), DemandHorizon::All);
        assert_eq!(
            "upcoming".parse::<DemandHorizon>().unwrap(),
            DemandHorizon::Upcoming
        );
        assert!("someday".parse::<DemandHorizon>().is_err());
    }

    /// In-memory scope that records the calls the engine makes.
    struct RecordingScope {
        entry: Option<MealPlanEntry>,
        lines: Vec<Consumption>,
        calls: Vec<String>,
    }

    impl ConsumptionScope for &mut RecordingScope {
        fn lock_entry(&mut self, entry_id: i64) -> Result<Option<MealPlanEntry>> {
            self.calls.push(format!("lock {entry_id}"));
            Ok(self.entry.clone())
        }

        fn recipe_consumption(&mut self, recipe_id: i64) -> Result<Vec<Consumption>> {
            self.calls.push(format!("lines {recipe_id}"));
            Ok(self.lines.clone())
        }

        fn mark_cooked(&mut self, entry_id: i64) -> Result<()> {
            self.calls.push(format!("cooked {entry_id}"));
            Ok(())
        }

        fn decrement_stock(&mut self, ingredient_id: i64, quantity: f64) -> Result<f64> {
            self.calls.push(format!("take {ingredient_id} {quantity}"));
            Ok(-quantity)
        }

        fn commit(self) -> Result<()> {
            self.calls.push("commit".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_engine_call_order_skips_untracked() {
        let mut scope = RecordingScope {
            entry: Some(entry(5, day(10), Some(1), false)),
            lines: vec![
                Consumption {
                    ingredient_id: 10,
                    name: "flour".to_string(),
                    quantity: 3.0,
                    is_tracked: true,
                },
                Consumption {
                    ingredient_id: 12,
                    name: "water".to_string(),
                    quantity: 1.0,
                    is_tracked: false,
                },
            ],
            calls: Vec::new(),
        };
        let receipt = commit_consumption(&mut scope, 5).unwrap();
        assert_eq!(receipt.consumed.len(), 1);
        assert_eq!(
            scope.calls,
            vec!["lock 5", "lines 1", "cooked 5", "take 10 3", "commit"]
        );
    }

    #[test]
    fn test_engine_rejects_without_mutation() {
        let mut missing = RecordingScope {
            entry: None,
            lines: Vec::new(),
            calls: Vec::new(),
        };
        let err = commit_consumption(&mut missing, 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(missing.calls, vec!["lock 7"]);

        let mut cooked = RecordingScope {
            entry: Some(entry(7, day(10), Some(1), true)),
            lines: Vec::new(),
            calls: Vec::new(),
        };
        let err = commit_consumption(&mut cooked, 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(cooked.calls, vec!["lock 7"]);

        let mut empty_slot = RecordingScope {
            entry: Some(entry(7, day(10), None, false)),
            lines: Vec::new(),
            calls: Vec::new(),
        };
        let err = commit_consumption(&mut empty_slot, 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(empty_slot.calls, vec!["lock 7"]);
    }
}
