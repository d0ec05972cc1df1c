use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};

use pantry_core::db::Database;
use pantry_core::models::{NewMealPlanEntry, UpdateMealPlanEntry};

use crate::config::Config;

use super::helpers::{
    expect_found, find_recipe, fmt_qty, parse_date, print_json, print_meal_plan_table,
};

pub(crate) fn cmd_plan_add(
    db: &Database,
    config: &Config,
    recipe: Option<&str>,
    date: Option<&str>,
    meal: &str,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let meal_type = config.check_meal_type(meal)?;
    let recipe = recipe.map(|key| find_recipe(db, key, json)).transpose()?;

    let entry = expect_found(
        db.schedule_meal(&NewMealPlanEntry {
            date,
            meal_type,
            recipe_id: recipe.as_ref().map(|r| r.id),
        }),
        json,
    )?;

    if json {
        print_json(&entry)
    } else {
        let what = entry.recipe_name.as_deref().unwrap_or("(no recipe)");
        println!(
            "Planned {what} for {} on {} (id: {})",
            entry.meal_type, entry.date, entry.id
        );
        Ok(())
    }
}

pub(crate) fn cmd_plan_list(
    db: &Database,
    start: Option<&str>,
    end: Option<&str>,
    days: Option<u32>,
    json: bool,
) -> Result<()> {
    let (start, end) = match days {
        Some(days) => {
            let (start, end) = days_from(Local::now().date_naive(), days)?;
            (Some(start), Some(end))
        }
        None => (
            start.map(|s| parse_date(Some(s))).transpose()?,
            end.map(|s| parse_date(Some(s))).transpose()?,
        ),
    };
    let entries = db.list_meal_plan(start, end)?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("Nothing planned.");
        return Ok(());
    }
    print_meal_plan_table(&entries);
    Ok(())
}

/// The window of `days` days starting at `today`.
fn days_from(today: NaiveDate, days: u32) -> Result<(NaiveDate, NaiveDate)> {
    let end = today
        .checked_add_days(chrono::Days::new(u64::from(days.saturating_sub(1))))
        .context("date out of range")?;
    Ok((today, end))
}

pub(crate) struct PlanEdit<'a> {
    pub date: Option<&'a str>,
    pub meal: Option<&'a str>,
    pub recipe: Option<&'a str>,
    pub clear_recipe: bool,
}

pub(crate) fn cmd_plan_edit(
    db: &Database,
    config: &Config,
    entry_id: i64,
    edit: &PlanEdit<'_>,
    json: bool,
) -> Result<()> {
    if edit.date.is_none() && edit.meal.is_none() && edit.recipe.is_none() && !edit.clear_recipe {
        bail!("Nothing to update. Provide at least one of --date, --meal, --recipe or --clear-recipe");
    }
    let current = expect_found(db.get_meal_plan_entry(entry_id), json)?;

    let date = match edit.date {
        Some(d) => parse_date(Some(d))?,
        None => current.date,
    };
    let meal_type = match edit.meal {
        Some(m) => config.check_meal_type(m)?,
        None => current.meal_type,
    };
    let recipe_id = if edit.clear_recipe {
        None
    } else {
        match edit.recipe {
            Some(key) => Some(find_recipe(db, key, json)?.id),
            None => current.recipe_id,
        }
    };

    let entry = expect_found(
        db.update_meal_plan_entry(
            entry_id,
            &UpdateMealPlanEntry {
                date,
                meal_type,
                recipe_id,
            },
        ),
        json,
    )?;

    if json {
        print_json(&entry)
    } else {
        println!("Updated plan entry {entry_id}");
        Ok(())
    }
}

pub(crate) fn cmd_plan_delete(db: &Database, entry_id: i64, json: bool) -> Result<()> {
    expect_found(db.delete_meal_plan_entry(entry_id), json)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": entry_id }));
    } else {
        println!("Deleted plan entry {entry_id}");
    }
    Ok(())
}

/// Mark an entry cooked and take its ingredients out of stock.
pub(crate) fn cmd_plan_cook(db: &mut Database, entry_id: i64, json: bool) -> Result<()> {
    let receipt = expect_found(db.cook_meal(entry_id), json)?;

    if json {
        return print_json(&receipt);
    }
    println!("Cooked plan entry {entry_id}");
    for change in &receipt.consumed {
        let warn = if change.remaining_stock < 0.0 { "  (short!)" } else { "" };
        println!(
            "  -{} {} → {} left{warn}",
            fmt_qty(change.consumed),
            change.name,
            fmt_qty(change.remaining_stock)
        );
    }
    Ok(())
}
