use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use pantry_core::db::Database;
use pantry_core::models::{
    IngredientRef, NewRecipe, NewRecipeIngredient, RecipeDetail, UpdateRecipe,
};

use super::helpers::{
    expect_found, find_ingredient, find_recipe, fmt_qty, print_json, truncate,
};

/// Parse `name=quantity` pairs given on the command line.
fn parse_ingredient_spec(spec: &str) -> Result<NewRecipeIngredient> {
    let Some((name, qty)) = spec.rsplit_once('=') else {
        bail!("Invalid ingredient '{spec}'. Use NAME=QUANTITY, e.g. flour=0.5");
    };
    let quantity: f64 = qty
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid quantity '{qty}' for '{name}'"))?;
    Ok(NewRecipeIngredient {
        ingredient: IngredientRef::Name {
            name: name.trim().to_string(),
            is_tracked: None,
        },
        quantity,
    })
}

pub(crate) fn cmd_recipe_create(
    db: &mut Database,
    name: &str,
    instructions: Option<String>,
    notes: Option<String>,
    ingredients: &[String],
    json: bool,
) -> Result<()> {
    let ingredients = ingredients
        .iter()
        .map(|s| parse_ingredient_spec(s))
        .collect::<Result<Vec<_>>>()?;
    let recipe = NewRecipe {
        name: name.to_string(),
        instructions: instructions.unwrap_or_default(),
        notes: notes.unwrap_or_default(),
        ingredients,
    };
    let detail = expect_found(db.create_recipe(&recipe), json)?;

    if json {
        print_json(&detail)
    } else {
        let id = detail.recipe.id;
        let name = &detail.recipe.name;
        println!(
            "Created recipe: {name} (id: {id}, {} ingredient(s))",
            detail.ingredients.len()
        );
        if detail.ingredients.is_empty() {
            println!("Add ingredients with: pantry recipe add-ingredient \"{name}\" <ingredient> <quantity>");
        }
        Ok(())
    }
}

pub(crate) fn cmd_recipe_list(db: &Database, json: bool) -> Result<()> {
    let details = db
        .list_recipes()?
        .iter()
        .map(|r| db.get_recipe_detail(r.id))
        .collect::<pantry_core::Result<Vec<_>>>()?;

    if json {
        return print_json(&details);
    }
    if details.is_empty() {
        println!("No recipes yet. Create one with: pantry recipe create <name>");
        return Ok(());
    }

    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Ingredients")]
        ingredients: usize,
        #[tabled(rename = "Est. cost")]
        cost: String,
    }

    let rows: Vec<RecipeRow> = details
        .iter()
        .map(|d| RecipeRow {
            id: d.recipe.id,
            name: truncate(&d.recipe.name, 30),
            ingredients: d.ingredients.len(),
            cost: format!("{:.2}", d.estimated_cost),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_recipe_show(db: &Database, key: &str, json: bool) -> Result<()> {
    let recipe = find_recipe(db, key, json)?;
    let detail = expect_found(db.get_recipe_detail(recipe.id), json)?;

    if json {
        return print_json(&detail);
    }
    print_recipe_detail(&detail);
    Ok(())
}

fn print_recipe_detail(detail: &RecipeDetail) {
    #[derive(Tabled)]
    struct LineRow {
        #[tabled(rename = "Ingredient")]
        name: String,
        #[tabled(rename = "Qty")]
        quantity: String,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Price")]
        price: String,
        #[tabled(rename = "Tracked")]
        tracked: String,
    }

    let r = &detail.recipe;
    println!("{} (id: {})", r.name, r.id);
    if !r.notes.is_empty() {
        println!("Notes: {}", r.notes);
    }

    if detail.ingredients.is_empty() {
        println!("\nNo ingredients.");
    } else {
        let rows: Vec<LineRow> = detail
            .ingredients
            .iter()
            .map(|i| LineRow {
                name: truncate(&i.name, 30),
                quantity: fmt_qty(i.quantity),
                unit: i.unit.clone(),
                price: i.price.map_or("-".into(), |p| format!("{p:.2}")),
                tracked: if i.is_tracked { "yes" } else { "no" }.to_string(),
            })
            .collect();
        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::single(1)).with(Alignment::right()))
            .to_string();
        println!("{table}");
        println!("Estimated cost: {:.2}", detail.estimated_cost);
    }

    if !r.instructions.is_empty() {
        println!("\n{}", r.instructions);
    }
}

pub(crate) fn cmd_recipe_edit(
    db: &Database,
    key: &str,
    name: Option<String>,
    instructions: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    if name.is_none() && instructions.is_none() && notes.is_none() {
        bail!("Nothing to update. Provide at least one of --name, --instructions or --notes");
    }
    let current = find_recipe(db, key, json)?;
    let update = UpdateRecipe {
        name: name.unwrap_or(current.name),
        instructions: instructions.unwrap_or(current.instructions),
        notes: notes.unwrap_or(current.notes),
    };
    let recipe = expect_found(db.update_recipe(current.id, &update), json)?;

    if json {
        print_json(&recipe)
    } else {
        println!("Updated recipe {} (id: {})", recipe.name, recipe.id);
        Ok(())
    }
}

pub(crate) fn cmd_recipe_delete(db: &Database, key: &str, json: bool) -> Result<()> {
    let recipe = find_recipe(db, key, json)?;
    expect_found(db.delete_recipe(recipe.id), json)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": recipe.id }));
    } else {
        println!("Deleted recipe {} (id: {})", recipe.name, recipe.id);
    }
    Ok(())
}

pub(crate) fn cmd_recipe_add_ingredient(
    db: &mut Database,
    recipe_key: &str,
    ingredient: &str,
    quantity: f64,
    untracked: bool,
    json: bool,
) -> Result<()> {
    let recipe = find_recipe(db, recipe_key, json)?;
    let line = NewRecipeIngredient {
        ingredient: IngredientRef::Name {
            name: ingredient.to_string(),
            is_tracked: untracked.then_some(false),
        },
        quantity,
    };
    let saved = expect_found(db.add_recipe_ingredient(recipe.id, &line), json)?;

    if json {
        print_json(&saved)
    } else {
        let unit = if saved.unit.is_empty() { String::new() } else { format!(" {}", saved.unit) };
        println!(
            "{} now uses {}{unit} of {}",
            recipe.name,
            fmt_qty(saved.quantity),
            saved.name
        );
        Ok(())
    }
}

pub(crate) fn cmd_recipe_set_quantity(
    db: &Database,
    recipe_key: &str,
    ingredient_key: &str,
    quantity: f64,
    json: bool,
) -> Result<()> {
    let recipe = find_recipe(db, recipe_key, json)?;
    let ingredient = find_ingredient(db, ingredient_key, json)?;
    let saved = expect_found(
        db.update_recipe_ingredient_quantity(recipe.id, ingredient.id, quantity),
        json,
    )?;

    if json {
        print_json(&saved)
    } else {
        println!(
            "Set {} in {} to {}",
            saved.name,
            recipe.name,
            fmt_qty(saved.quantity)
        );
        Ok(())
    }
}

pub(crate) fn cmd_recipe_remove_ingredient(
    db: &Database,
    recipe_key: &str,
    ingredient_key: &str,
    json: bool,
) -> Result<()> {
    let recipe = find_recipe(db, recipe_key, json)?;
    let ingredient = find_ingredient(db, ingredient_key, json)?;
    expect_found(db.remove_recipe_ingredient(recipe.id, ingredient.id), json)?;

    if json {
        println!("{}", serde_json::json!({ "removed": ingredient.name }));
    } else {
        println!("Removed {} from {}", ingredient.name, recipe.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ingredient_spec() {
        let line = parse_ingredient_spec("bread flour = 0.5").unwrap();
        assert_eq!(line.quantity, 0.5);
        assert_eq!(
            line.ingredient,
            IngredientRef::Name {
                name: "bread flour".to_string(),
                is_tracked: None
            }
        );
    }

    #[test]
    fn test_parse_ingredient_spec_invalid() {
        assert!(parse_ingredient_spec("flour").is_err());
        assert!(parse_ingredient_spec("flour=lots").is_err());
    }

    #[test]
    fn test_create_with_specs_links_ingredients() {
        let mut db = Database::open_in_memory().unwrap();
        cmd_recipe_create(
            &mut db,
            "Pancakes",
            None,
            None,
            &["flour=0.2".to_string(), "milk=0.3".to_string()],
            true,
        )
        .unwrap();
        let recipe = db.find_recipe_by_name("pancakes").unwrap().unwrap();
        assert_eq!(db.get_recipe_ingredients(recipe.id).unwrap().len(), 2);
    }
}
