use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CATEGORY: &str = "food";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ingredient {
    pub id: i64,
    pub name: String,
    pub current_stock: f64,
    pub unit: String,
    /// Unit price; `None` when never set. Cost math treats it as 0.
    pub price: Option<f64>,
    pub category: String,
    pub is_tracked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<NaiveDate>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// An ingredient as listed in the inventory, with the quantity the meal plan
/// expects to consume.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryItem {
    #[serde(flatten)]
    pub ingredient: Ingredient,
    pub planned_consumption: f64,
}

#[derive(Debug, Clone)]
pub struct NewIngredient {
    pub name: String,
    pub current_stock: f64,
    pub unit: String,
    pub price: Option<f64>,
    pub category: String,
    pub is_tracked: bool,
    pub expiry_date: Option<NaiveDate>,
}

impl NewIngredient {
    /// Defaults used when a recipe names an ingredient the ledger has never seen.
    #[must_use]
    pub fn named(name: &str, is_tracked: bool) -> Self {
        Self {
            name: name.to_string(),
            current_stock: 0.0,
            unit: String::new(),
            price: None,
            category: DEFAULT_CATEGORY.to_string(),
            is_tracked,
            expiry_date: None,
        }
    }
}

/// Full replacement of an ingredient's mutable fields.
#[derive(Debug, Clone)]
pub struct UpdateIngredient {
    pub name: String,
    pub current_stock: f64,
    pub unit: String,
    pub price: Option<f64>,
    pub category: String,
    pub is_tracked: bool,
    pub expiry_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Recipe {
    pub id: i64,
    pub name: String,
    pub instructions: String,
    pub notes: String,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeDetail {
    #[serde(flatten)]
    pub recipe: Recipe,
    pub ingredients: Vec<RecipeIngredient>,
    /// Cost of one batch at current prices; unpriced ingredients count as 0.
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecipeIngredient {
    pub recipe_id: i64,
    pub ingredient_id: i64,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub price: Option<f64>,
    pub is_tracked: bool,
}

/// How a recipe line names its ingredient.
#[derive(Debug, Clone, PartialEq)]
pub enum IngredientRef {
    Id(i64),
    /// Looked up case-insensitively, created with default stock/price when missing.
    Name {
        name: String,
        is_tracked: Option<bool>,
    },
}

#[derive(Debug, Clone)]
pub struct NewRecipeIngredient {
    pub ingredient: IngredientRef,
    pub quantity: f64,
}

#[derive(Debug, Clone)]
pub struct NewRecipe {
    pub name: String,
    pub instructions: String,
    pub notes: String,
    pub ingredients: Vec<NewRecipeIngredient>,
}

#[derive(Debug, Clone)]
pub struct UpdateRecipe {
    pub name: String,
    pub instructions: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MealPlanEntry {
    pub id: i64,
    pub date: NaiveDate,
    pub meal_type: String,
    pub recipe_id: Option<i64>,
    // Joined for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_name: Option<String>,
    pub is_cooked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooked_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMealPlanEntry {
    pub date: NaiveDate,
    pub meal_type: String,
    pub recipe_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct UpdateMealPlanEntry {
    pub date: NaiveDate,
    pub meal_type: String,
    pub recipe_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShoppingItem {
    pub ingredient_id: i64,
    pub name: String,
    pub quantity_needed: f64,
    pub unit: String,
    pub estimated_cost: f64,
}

/// One stock movement applied by a cook transition.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StockChange {
    pub ingredient_id: i64,
    pub name: String,
    pub consumed: f64,
    pub remaining_stock: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CookReceipt {
    pub entry_id: i64,
    pub recipe_id: i64,
    pub consumed: Vec<StockChange>,
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| Error::invalid(format!("Invalid date '{s}'. Use YYYY-MM-DD")))
}

/// Trim a required text field, rejecting blanks.
pub fn validate_name(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub fn validate_quantity(quantity: f64) -> Result<()> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(Error::invalid("quantity must be greater than 0"));
    }
    Ok(())
}

pub fn validate_stock(stock: f64) -> Result<()> {
    if !stock.is_finite() {
        return Err(Error::invalid("current_stock must be a finite number"));
    }
    Ok(())
}

pub fn validate_price(price: Option<f64>) -> Result<()> {
    if price.is_some_and(|p| !p.is_finite() || p < 0.0) {
        return Err(Error::invalid("price must not be negative"));
    }
    Ok(())
}

/// Meal types are free-form labels kept as written; the core only requires
/// one to be present.
pub fn validate_meal_type(meal: &str) -> Result<String> {
    validate_name("meal_type", meal)
}

#[must_use]
pub fn normalize_category(category: &str) -> String {
    let trimmed = category.trim();
    if trimmed.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn validate_new_ingredient(ingredient: &NewIngredient) -> Result<()> {
    validate_name("name", &ingredient.name)?;
    validate_stock(ingredient.current_stock)?;
    validate_price(ingredient.price)
}

pub fn validate_update_ingredient(update: &UpdateIngredient) -> Result<()> {
    validate_name("name", &update.name)?;
    validate_stock(update.current_stock)?;
    validate_price(update.price)
}

pub fn validate_recipe_ingredient(line: &NewRecipeIngredient) -> Result<()> {
    validate_quantity(line.quantity)?;
    match &line.ingredient {
        IngredientRef::Id(id) if *id <= 0 => Err(Error::invalid(
            "ingredient_id or ingredient_name required",
        )),
        IngredientRef::Name { name, .. } => validate_name("ingredient_name", name).map(|_| ()),
        IngredientRef::Id(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-06-15").unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
        );
        assert_eq!(
            parse_date("15/06/2024").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("name", "  Flour ").unwrap(), "Flour");
        assert!(validate_name("name", "   ").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(0.5).is_ok());
        assert!(validate_quantity(0.0).is_err());
        assert!(validate_quantity(-2.0).is_err());
        assert!(validate_quantity(f64::NAN).is_err());
    }

    #[test]
    fn test_validate_price() {
        assert!(validate_price(None).is_ok());
        assert!(validate_price(Some(0.0)).is_ok());
        assert!(validate_price(Some(-0.01)).is_err());
    }

    #[test]
    fn test_meal_type_is_free_form() {
        assert_eq!(validate_meal_type(" Second Breakfast ").unwrap(), "Second Breakfast");
        assert!(validate_meal_type("").is_err());
    }

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category(""), "food");
        assert_eq!(normalize_category(" cleaning "), "cleaning");
    }

    #[test]
    fn test_validate_recipe_ingredient() {
        let by_name = NewRecipeIngredient {
            ingredient: IngredientRef::Name {
                name: "Salt".to_string(),
                is_tracked: None,
            },
            quantity: 1.0,
        };
        assert!(validate_recipe_ingredient(&by_name).is_ok());

        let missing = NewRecipeIngredient {
            ingredient: IngredientRef::Id(0),
            quantity: 1.0,
        };
        assert!(validate_recipe_ingredient(&missing).is_err());

        let zero = NewRecipeIngredient {
            ingredient: IngredientRef::Id(3),
            quantity: 0.0,
        };
        assert!(validate_recipe_ingredient(&zero).is_err());
    }
}
