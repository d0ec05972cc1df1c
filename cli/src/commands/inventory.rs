use anyhow::{Result, bail};
use chrono::Local;

use pantry_core::db::Database;
use pantry_core::models::{NewIngredient, UpdateIngredient};
use pantry_core::reconcile::AggregationOptions;

use super::helpers::{
    expect_found, find_ingredient, fmt_qty, parse_date, print_ingredient_table, print_json,
};

pub(crate) struct IngredientArgs {
    pub name: Option<String>,
    pub stock: Option<f64>,
    pub unit: Option<String>,
    pub price: Option<f64>,
    pub clear_price: bool,
    pub category: Option<String>,
    pub tracked: Option<bool>,
    pub expires: Option<String>,
    pub clear_expiry: bool,
}

impl IngredientArgs {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.stock.is_none()
            && self.unit.is_none()
            && self.price.is_none()
            && !self.clear_price
            && self.category.is_none()
            && self.tracked.is_none()
            && self.expires.is_none()
            && !self.clear_expiry
    }
}

pub(crate) fn cmd_inventory_list(db: &Database, low_only: bool, json: bool) -> Result<()> {
    let today = Local::now().date_naive();
    let mut items = db.list_inventory(AggregationOptions::whole_schedule(), today)?;
    if low_only {
        items.retain(|i| i.ingredient.is_tracked && i.planned_consumption > i.ingredient.current_stock);
    }

    if json {
        return print_json(&items);
    }
    if items.is_empty() {
        println!("No ingredients. Add one with: pantry inventory add <name>");
        return Ok(());
    }
    let rows: Vec<_> = items
        .iter()
        .map(|i| (&i.ingredient, Some(i.planned_consumption)))
        .collect();
    print_ingredient_table(&rows);
    Ok(())
}

pub(crate) fn cmd_inventory_add(db: &Database, name: &str, args: IngredientArgs, json: bool) -> Result<()> {
    let expiry_date = args.expires.as_deref().map(|d| parse_date(Some(d))).transpose()?;
    let new = NewIngredient {
        name: name.to_string(),
        current_stock: args.stock.unwrap_or(0.0),
        unit: args.unit.unwrap_or_default(),
        price: args.price,
        category: args.category.unwrap_or_default(),
        is_tracked: args.tracked.unwrap_or(true),
        expiry_date,
    };
    let ingredient = expect_found(db.insert_ingredient(&new), json)?;

    if json {
        print_json(&ingredient)
    } else {
        println!(
            "Added {} (id: {}, stock: {} {})",
            ingredient.name,
            ingredient.id,
            fmt_qty(ingredient.current_stock),
            ingredient.unit
        );
        Ok(())
    }
}

pub(crate) fn cmd_inventory_show(db: &Database, key: &str, json: bool) -> Result<()> {
    let ingredient = find_ingredient(db, key, json)?;
    let today = Local::now().date_naive();
    let planned = db
        .required_quantities(AggregationOptions::whole_schedule(), today)?
        .get(&ingredient.id)
        .copied()
        .unwrap_or(0.0);

    if json {
        return print_json(&serde_json::json!({
            "ingredient": ingredient,
            "planned_consumption": planned,
        }));
    }
    print_ingredient_table(&[(&ingredient, Some(planned))]);
    Ok(())
}

/// Apply the given fields on top of the stored ingredient.
pub(crate) fn cmd_inventory_edit(db: &Database, key: &str, args: IngredientArgs, json: bool) -> Result<()> {
    if args.is_empty() {
        bail!("Nothing to update. Provide at least one field, e.g. --stock or --price");
    }
    let current = find_ingredient(db, key, json)?;

    let expiry_date = if args.clear_expiry {
        None
    } else {
        match args.expires.as_deref() {
            Some(d) => Some(parse_date(Some(d))?),
            None => current.expiry_date,
        }
    };
    let update = UpdateIngredient {
        name: args.name.unwrap_or(current.name),
        current_stock: args.stock.unwrap_or(current.current_stock),
        unit: args.unit.unwrap_or(current.unit),
        price: if args.clear_price { None } else { args.price.or(current.price) },
        category: args.category.unwrap_or(current.category),
        is_tracked: args.tracked.unwrap_or(current.is_tracked),
        expiry_date,
    };
    let updated = expect_found(db.update_ingredient(current.id, &update), json)?;

    if json {
        print_json(&updated)
    } else {
        println!("Updated {} (id: {})", updated.name, updated.id);
        Ok(())
    }
}

pub(crate) fn cmd_inventory_stock(db: &Database, key: &str, stock: f64, json: bool) -> Result<()> {
    let ingredient = find_ingredient(db, key, json)?;
    let updated = expect_found(db.set_stock(ingredient.id, stock), json)?;

    if json {
        print_json(&updated)
    } else {
        println!(
            "{}: {} → {} {}",
            updated.name,
            fmt_qty(ingredient.current_stock),
            fmt_qty(updated.current_stock),
            updated.unit
        );
        Ok(())
    }
}

pub(crate) fn cmd_inventory_delete(db: &Database, key: &str, json: bool) -> Result<()> {
    let ingredient = find_ingredient(db, key, json)?;
    expect_found(db.delete_ingredient(ingredient.id), json)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": ingredient.id }));
    } else {
        println!("Deleted {} (id: {})", ingredient.name, ingredient.id);
    }
    Ok(())
}
