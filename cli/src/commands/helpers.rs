use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use pantry_core::ErrorKind;
use pantry_core::db::Database;
use pantry_core::models::{Ingredient, MealPlanEntry, Recipe, ShoppingItem};

/// Unwrap a core result, turning missing rows, conflicts and impossible
/// transitions into a printed message with exit code 2.
pub(crate) fn expect_found<T>(result: pantry_core::Result<T>, json: bool) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::InvalidState
            ) =>
        {
            if json {
                println!("{}", json_error(&e.to_string()));
            } else {
                eprintln!("{e}");
            }
            process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn parse_date(date_str: Option<&str>) -> Result<NaiveDate> {
    let today = Local::now().date_naive();
    match date_str {
        None | Some("today") => Ok(today),
        Some("yesterday") => today.pred_opt().context("date out of range"),
        Some("tomorrow") => today.succ_opt().context("date out of range"),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| {
            format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
        }),
    }
}

/// Resolve a recipe given either its id or its name.
pub(crate) fn find_recipe(db: &Database, key: &str, json: bool) -> Result<Recipe> {
    if let Ok(id) = key.trim().parse::<i64>() {
        return expect_found(db.get_recipe(id), json);
    }
    let found = db.find_recipe_by_name(key)?;
    expect_found(
        found.ok_or_else(|| pantry_core::Error::not_found("recipe", format!("'{key}'"))),
        json,
    )
}

/// Resolve an ingredient given either its id or its name.
pub(crate) fn find_ingredient(db: &Database, key: &str, json: bool) -> Result<Ingredient> {
    if let Ok(id) = key.trim().parse::<i64>() {
        return expect_found(db.get_ingredient(id), json);
    }
    let found = db.find_ingredient_by_name(key)?;
    expect_found(
        found.ok_or_else(|| pantry_core::Error::not_found("ingredient", format!("'{key}'"))),
        json,
    )
}

pub(crate) fn print_ingredient_table(items: &[(&Ingredient, Option<f64>)]) {
    #[derive(Tabled)]
    struct IngredientRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Stock")]
        stock: String,
        #[tabled(rename = "Planned")]
        planned: String,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Price")]
        price: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Tracked")]
        tracked: String,
        #[tabled(rename = "Expires")]
        expires: String,
    }

    let rows: Vec<IngredientRow> = items
        .iter()
        .map(|(i, planned)| IngredientRow {
            id: i.id,
            name: truncate(&i.name, 30),
            stock: fmt_qty(i.current_stock),
            planned: planned.map_or("-".into(), fmt_qty),
            unit: i.unit.clone(),
            price: i.price.map_or("-".into(), |p| format!("{p:.2}")),
            category: i.category.clone(),
            tracked: if i.is_tracked { "yes" } else { "no" }.to_string(),
            expires: i.expiry_date.map(|d| d.to_string()).unwrap_or_default(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .with(Modify::new(Columns::new(5..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_meal_plan_table(entries: &[MealPlanEntry]) {
    #[derive(Tabled)]
    struct MealPlanRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Recipe")]
        recipe: String,
        #[tabled(rename = "Cooked")]
        cooked: String,
    }

    let rows: Vec<MealPlanRow> = entries
        .iter()
        .map(|e| MealPlanRow {
            id: e.id,
            date: e.date.to_string(),
            meal: e.meal_type.clone(),
            recipe: e
                .recipe_name
                .as_deref()
                .map_or("(none)".into(), |n| truncate(n, 30)),
            cooked: if e.is_cooked { "✓" } else { "" }.to_string(),
        })
        .collect();

    println!("{}", Table::new(&rows).with(Style::rounded()));
}

pub(crate) fn print_shopping_table(items: &[ShoppingItem]) {
    #[derive(Tabled)]
    struct ShoppingRow {
        #[tabled(rename = "Ingredient")]
        name: String,
        #[tabled(rename = "Need")]
        needed: String,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Est. cost")]
        cost: String,
    }

    let rows: Vec<ShoppingRow> = items
        .iter()
        .map(|i| ShoppingRow {
            name: truncate(&i.name, 30),
            needed: fmt_qty(i.quantity_needed),
            unit: i.unit.clone(),
            cost: format!("{:.2}", no_neg_zero(i.estimated_cost)),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(1)).with(Alignment::right()))
        .with(Modify::new(Columns::single(3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// Quantities print with at most two decimals and no trailing zeros.
pub(crate) fn fmt_qty(v: f64) -> String {
    let s = format!("{:.2}", no_neg_zero(v));
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
