use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    CookReceipt, Ingredient, IngredientRef, InventoryItem, MealPlanEntry, NewIngredient,
    NewMealPlanEntry, NewRecipe, NewRecipeIngredient, Recipe, RecipeDetail, RecipeIngredient,
    ShoppingItem, UpdateIngredient, UpdateMealPlanEntry, UpdateRecipe, normalize_category,
    validate_meal_type, validate_name, validate_new_ingredient, validate_quantity,
    validate_recipe_ingredient, validate_stock, validate_update_ingredient,
};
use crate::reconcile::{
    self, AggregationOptions, Consumption, ConsumptionScope, RecipeGraph, Requirement,
    ShortageMode,
};

/// How long a writer waits for another connection's transaction before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INGREDIENT_COLUMNS: &str = "id, name, current_stock, unit, price, category, is_tracked, expiry_date, created_at, updated_at";

const MEAL_PLAN_SELECT: &str = "SELECT mp.id, mp.date, mp.meal_type, mp.recipe_id, r.name,
        mp.is_cooked, mp.cooked_at, mp.created_at
 FROM meal_plan mp
 LEFT JOIN recipes r ON mp.recipe_id = r.id";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS ingredients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    name_key TEXT NOT NULL UNIQUE,
                    current_stock REAL NOT NULL DEFAULT 0,
                    unit TEXT NOT NULL DEFAULT '',
                    price REAL CHECK (price IS NULL OR price >= 0),
                    category TEXT NOT NULL DEFAULT 'food',
                    is_tracked INTEGER NOT NULL DEFAULT 1,
                    expiry_date TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    name_key TEXT NOT NULL,
                    instructions TEXT NOT NULL DEFAULT '',
                    notes TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    ingredient_id INTEGER NOT NULL REFERENCES ingredients(id) ON DELETE CASCADE,
                    quantity REAL NOT NULL CHECK (quantity > 0),
                    PRIMARY KEY (recipe_id, ingredient_id)
                );

                CREATE TABLE IF NOT EXISTS meal_plan (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    date TEXT NOT NULL,
                    meal_type TEXT NOT NULL,
                    recipe_id INTEGER REFERENCES recipes(id) ON DELETE SET NULL,
                    is_cooked INTEGER NOT NULL DEFAULT 0,
                    cooked_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_recipes_name_key ON recipes(name_key);
                CREATE INDEX IF NOT EXISTS idx_meal_plan_date ON meal_plan(date, meal_type);
                CREATE INDEX IF NOT EXISTS idx_meal_plan_recipe ON meal_plan(recipe_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_ingredient ON recipe_ingredients(ingredient_id);

                -- A cooked meal stays cooked.
                CREATE TRIGGER IF NOT EXISTS trg_meal_plan_no_uncook
                BEFORE UPDATE OF is_cooked ON meal_plan
                WHEN OLD.is_cooked = 1 AND NEW.is_cooked = 0
                BEGIN
                    SELECT RAISE(ABORT, 'a cooked meal cannot be marked uncooked');
                END;

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Ingredients ---

    pub fn insert_ingredient(&self, ingredient: &NewIngredient) -> Result<Ingredient> {
        validate_new_ingredient(ingredient)?;
        let id = insert_ingredient_row(&self.conn, ingredient)?;
        self.get_ingredient(id)
    }

    pub fn get_ingredient(&self, id: i64) -> Result<Ingredient> {
        fetch_ingredient(&self.conn, id)?.ok_or_else(|| Error::not_found("ingredient", id))
    }

    /// Case-insensitive lookup by name.
    pub fn find_ingredient_by_name(&self, name: &str) -> Result<Option<Ingredient>> {
        find_ingredient_id(&self.conn, name)?
            .map(|id| self.get_ingredient(id))
            .transpose()
    }

    pub fn list_ingredients(&self) -> Result<Vec<Ingredient>> {
        load_ingredients(&self.conn)
    }

    /// Every ingredient together with the quantity the meal plan will consume.
    pub fn list_inventory(
        &self,
        options: AggregationOptions,
        today: NaiveDate,
    ) -> Result<Vec<InventoryItem>> {
        let tx = self.conn.unchecked_transaction()?;
        let ledger = load_ingredients(&tx)?;
        let required = reconcile::aggregate_requirements(
            &load_schedule(&tx)?,
            &load_recipe_graph(&tx)?,
            options,
            today,
        );
        tx.commit()?;

        Ok(ledger
            .into_iter()
            .map(|ingredient| {
                let planned_consumption = required.get(&ingredient.id).copied().unwrap_or(0.0);
                InventoryItem {
                    ingredient,
                    planned_consumption,
                }
            })
            .collect())
    }

    pub fn update_ingredient(&self, id: i64, update: &UpdateIngredient) -> Result<Ingredient> {
        validate_update_ingredient(update)?;
        let name = update.name.trim();
        let now = Local::now().to_rfc3339();
        let rows = self
            .conn
            .execute(
                "UPDATE ingredients SET name = ?1, name_key = ?2, current_stock = ?3, unit = ?4,
                 price = ?5, category = ?6, is_tracked = ?7, expiry_date = ?8, updated_at = ?9
                 WHERE id = ?10",
                params![
                    name,
                    name_key(name),
                    update.current_stock,
                    update.unit.trim(),
                    update.price,
                    normalize_category(&update.category),
                    update.is_tracked,
                    update.expiry_date.map(date_to_sql),
                    now,
                    id,
                ],
            )
            .map_err(|e| duplicate_name(e, name))?;
        if rows == 0 {
            return Err(Error::not_found("ingredient", id));
        }
        self.get_ingredient(id)
    }

    /// Overwrite the stock level. Negative values are accepted: they record a
    /// backorder rather than an error.
    pub fn set_stock(&self, id: i64, stock: f64) -> Result<Ingredient> {
        validate_stock(stock)?;
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE ingredients SET current_stock = ?1, updated_at = ?2 WHERE id = ?3",
            params![stock, now, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("ingredient", id));
        }
        info!(ingredient_id = id, stock, "stock set");
        self.get_ingredient(id)
    }

    /// Delete an ingredient and every recipe line that used it.
    pub fn delete_ingredient(&self, id: i64) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM ingredients WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::not_found("ingredient", id));
        }
        info!(ingredient_id = id, "ingredient deleted");
        Ok(())
    }

    // --- Recipes ---

    /// Create a recipe and its ingredient lines in one transaction. Lines naming
    /// an unknown ingredient create it; a line naming a missing id aborts the
    /// whole recipe.
    pub fn create_recipe(&mut self, recipe: &NewRecipe) -> Result<RecipeDetail> {
        let name = validate_name("name", &recipe.name)?;
        for line in &recipe.ingredients {
            validate_recipe_ingredient(line)?;
        }

        let now = Local::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO recipes (name, name_key, instructions, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, name_key(&name), recipe.instructions, recipe.notes, now, now],
        )?;
        let recipe_id = tx.last_insert_rowid();
        for line in &recipe.ingredients {
            let ingredient_id = resolve_ingredient(&tx, &line.ingredient)?;
            upsert_recipe_line(&tx, recipe_id, ingredient_id, line.quantity)?;
        }
        tx.commit()?;

        info!(recipe_id, lines = recipe.ingredients.len(), "recipe created");
        self.get_recipe_detail(recipe_id)
    }

    pub fn get_recipe(&self, id: i64) -> Result<Recipe> {
        fetch_recipe(&self.conn, id)?.ok_or_else(|| Error::not_found("recipe", id))
    }

    /// Case-insensitive lookup by name; the oldest recipe wins when names repeat.
    pub fn find_recipe_by_name(&self, name: &str) -> Result<Option<Recipe>> {
        let recipe = self
            .conn
            .query_row(
                "SELECT id, name, instructions, notes, created_at, updated_at
                 FROM recipes WHERE name_key = ?1 ORDER BY id LIMIT 1",
                params![name_key(name)],
                recipe_from_row,
            )
            .optional()?;
        Ok(recipe)
    }

    pub fn get_recipe_detail(&self, id: i64) -> Result<RecipeDetail> {
        let recipe = self.get_recipe(id)?;
        let ingredients = load_recipe_lines(&self.conn, id)?;
        let estimated_cost = ingredients
            .iter()
            .map(|i| i.quantity * i.price.unwrap_or(0.0))
            .sum();
        Ok(RecipeDetail {
            recipe,
            ingredients,
            estimated_cost,
        })
    }

    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, instructions, notes, created_at, updated_at
             FROM recipes ORDER BY name_key, id",
        )?;
        let recipes = stmt
            .query_map([], recipe_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(recipes)
    }

    pub fn update_recipe(&self, id: i64, update: &UpdateRecipe) -> Result<Recipe> {
        let name = validate_name("name", &update.name)?;
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE recipes SET name = ?1, name_key = ?2, instructions = ?3, notes = ?4,
             updated_at = ?5 WHERE id = ?6",
            params![name, name_key(&name), update.instructions, update.notes, now, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("recipe", id));
        }
        self.get_recipe(id)
    }

    /// Delete a recipe with its lines. Meal plan entries that referenced it
    /// stay scheduled without a recipe.
    pub fn delete_recipe(&self, id: i64) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::not_found("recipe", id));
        }
        info!(recipe_id = id, "recipe deleted");
        Ok(())
    }

    // --- Recipe ingredients ---

    pub fn get_recipe_ingredients(&self, recipe_id: i64) -> Result<Vec<RecipeIngredient>> {
        self.get_recipe(recipe_id)?;
        load_recipe_lines(&self.conn, recipe_id)
    }

    /// Add a line to a recipe, or replace its quantity when the ingredient is
    /// already on it.
    pub fn add_recipe_ingredient(
        &mut self,
        recipe_id: i64,
        line: &NewRecipeIngredient,
    ) -> Result<RecipeIngredient> {
        validate_recipe_ingredient(line)?;

        let tx = self.conn.transaction()?;
        if fetch_recipe(&tx, recipe_id)?.is_none() {
            return Err(Error::not_found("recipe", recipe_id));
        }
        let ingredient_id = resolve_ingredient(&tx, &line.ingredient)?;
        upsert_recipe_line(&tx, recipe_id, ingredient_id, line.quantity)?;
        let saved = fetch_recipe_line(&tx, recipe_id, ingredient_id)?
            .ok_or_else(|| Error::not_found("recipe ingredient", ingredient_id))?;
        tx.commit()?;

        debug!(recipe_id, ingredient_id, quantity = line.quantity, "recipe line saved");
        Ok(saved)
    }

    pub fn update_recipe_ingredient_quantity(
        &self,
        recipe_id: i64,
        ingredient_id: i64,
        quantity: f64,
    ) -> Result<RecipeIngredient> {
        validate_quantity(quantity)?;
        let rows = self.conn.execute(
            "UPDATE recipe_ingredients SET quantity = ?1 WHERE recipe_id = ?2 AND ingredient_id = ?3",
            params![quantity, recipe_id, ingredient_id],
        )?;
        if rows == 0 {
            return Err(recipe_line_not_found(recipe_id, ingredient_id));
        }
        touch_recipe(&self.conn, recipe_id)?;
        fetch_recipe_line(&self.conn, recipe_id, ingredient_id)?
            .ok_or_else(|| recipe_line_not_found(recipe_id, ingredient_id))
    }

    pub fn remove_recipe_ingredient(&self, recipe_id: i64, ingredient_id: i64) -> Result<()> {
        let rows = self.conn.execute(
            "DELETE FROM recipe_ingredients WHERE recipe_id = ?1 AND ingredient_id = ?2",
            params![recipe_id, ingredient_id],
        )?;
        if rows == 0 {
            return Err(recipe_line_not_found(recipe_id, ingredient_id));
        }
        touch_recipe(&self.conn, recipe_id)?;
        Ok(())
    }

    // --- Meal plan ---

    pub fn schedule_meal(&self, entry: &NewMealPlanEntry) -> Result<MealPlanEntry> {
        let meal_type = validate_meal_type(&entry.meal_type)?;
        if let Some(recipe_id) = entry.recipe_id {
            self.get_recipe(recipe_id)?;
        }
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO meal_plan (date, meal_type, recipe_id, is_cooked, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![date_to_sql(entry.date), meal_type, entry.recipe_id, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_meal_plan_entry(id)
    }

    pub fn get_meal_plan_entry(&self, id: i64) -> Result<MealPlanEntry> {
        fetch_meal_plan_entry(&self.conn, id)?
            .ok_or_else(|| Error::not_found("meal plan entry", id))
    }

    /// The schedule ordered by date then meal type, optionally bounded on
    /// either side (inclusive).
    pub fn list_meal_plan(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<MealPlanEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{MEAL_PLAN_SELECT}
             WHERE (?1 IS NULL OR mp.date >= ?1) AND (?2 IS NULL OR mp.date <= ?2)
             ORDER BY mp.date, mp.meal_type, mp.id"
        ))?;
        let entries = stmt
            .query_map(
                params![start.map(date_to_sql), end.map(date_to_sql)],
                meal_plan_entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Reschedule an entry. Cooked entries are history and cannot be moved.
    pub fn update_meal_plan_entry(
        &self,
        id: i64,
        update: &UpdateMealPlanEntry,
    ) -> Result<MealPlanEntry> {
        let meal_type = validate_meal_type(&update.meal_type)?;
        if let Some(recipe_id) = update.recipe_id {
            self.get_recipe(recipe_id)?;
        }
        let rows = self.conn.execute(
            "UPDATE meal_plan SET date = ?1, meal_type = ?2, recipe_id = ?3
             WHERE id = ?4 AND is_cooked = 0",
            params![date_to_sql(update.date), meal_type, update.recipe_id, id],
        )?;
        if rows == 0 {
            let existing = self.get_meal_plan_entry(id)?;
            if existing.is_cooked {
                return Err(Error::conflict(format!(
                    "Meal plan entry {id} has already been cooked"
                )));
            }
        }
        self.get_meal_plan_entry(id)
    }

    pub fn delete_meal_plan_entry(&self, id: i64) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM meal_plan WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::not_found("meal plan entry", id));
        }
        Ok(())
    }

    // --- Reconciliation ---

    /// Required quantity per ingredient id over the selected part of the schedule.
    pub fn required_quantities(
        &self,
        options: AggregationOptions,
        today: NaiveDate,
    ) -> Result<HashMap<i64, f64>> {
        let tx = self.conn.unchecked_transaction()?;
        let schedule = load_schedule(&tx)?;
        let graph = load_recipe_graph(&tx)?;
        tx.commit()?;
        Ok(reconcile::aggregate_requirements(
            &schedule, &graph, options, today,
        ))
    }

    /// Compute the shopping list from one consistent snapshot of the store.
    pub fn shopping_list(
        &self,
        mode: ShortageMode,
        options: AggregationOptions,
        today: NaiveDate,
    ) -> Result<Vec<ShoppingItem>> {
        let tx = self.conn.unchecked_transaction()?;
        let ledger = load_ingredients(&tx)?;
        let required = match mode {
            ShortageMode::Demand => reconcile::aggregate_requirements(
                &load_schedule(&tx)?,
                &load_recipe_graph(&tx)?,
                options,
                today,
            ),
            ShortageMode::Threshold { .. } => HashMap::new(),
        };
        tx.commit()?;

        let items = reconcile::compute_shortage(mode, &ledger, &required);
        debug!(?mode, items = items.len(), "shopping list computed");
        Ok(items)
    }

    /// Open an exclusive write scope for a cook transition. The write lock is
    /// taken immediately, so concurrent cooks queue behind each other.
    pub fn begin_consumption(&mut self) -> Result<SqliteScope<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(SqliteScope { tx })
    }

    pub fn cook_meal(&mut self, entry_id: i64) -> Result<CookReceipt> {
        let scope = self.begin_consumption()?;
        reconcile::commit_consumption(scope, entry_id)
    }
}

/// [`ConsumptionScope`] over an immediate `SQLite` transaction. Dropping it
/// without committing rolls back.
pub struct SqliteScope<'a> {
    tx: Transaction<'a>,
}

impl ConsumptionScope for SqliteScope<'_> {
    fn lock_entry(&mut self, entry_id: i64) -> Result<Option<MealPlanEntry>> {
        fetch_meal_plan_entry(&self.tx, entry_id)
    }

    fn recipe_consumption(&mut self, recipe_id: i64) -> Result<Vec<Consumption>> {
        let mut stmt = self.tx.prepare(
            "SELECT ri.ingredient_id, i.name, ri.quantity, i.is_tracked
             FROM recipe_ingredients ri
             JOIN ingredients i ON ri.ingredient_id = i.id
             WHERE ri.recipe_id = ?1
             ORDER BY ri.ingredient_id",
        )?;
        let lines = stmt
            .query_map(params![recipe_id], |row| {
                Ok(Consumption {
                    ingredient_id: row.get(0)?,
                    name: row.get(1)?,
                    quantity: row.get(2)?,
                    is_tracked: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }

    fn mark_cooked(&mut self, entry_id: i64) -> Result<()> {
        let now = Local::now().to_rfc3339();
        let rows = self.tx.execute(
            "UPDATE meal_plan SET is_cooked = 1, cooked_at = ?1 WHERE id = ?2 AND is_cooked = 0",
            params![now, entry_id],
        )?;
        if rows != 1 {
            return Err(Error::conflict(format!(
                "Meal plan entry {entry_id} has already been cooked"
            )));
        }
        Ok(())
    }

    fn decrement_stock(&mut self, ingredient_id: i64, quantity: f64) -> Result<f64> {
        let now = Local::now().to_rfc3339();
        self.tx
            .query_row(
                "UPDATE ingredients SET current_stock = current_stock - ?1, updated_at = ?2
                 WHERE id = ?3 RETURNING current_stock",
                params![quantity, now, ingredient_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("ingredient", ingredient_id))
    }

    fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

// --- Row mapping helpers ---

fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn date_from_sql(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// Expects INGREDIENT_COLUMNS order.
fn ingredient_from_row(row: &rusqlite::Row) -> rusqlite::Result<Ingredient> {
    let expiry: Option<String> = row.get(7)?;
    Ok(Ingredient {
        id: row.get(0)?,
        name: row.get(1)?,
        current_stock: row.get(2)?,
        unit: row.get(3)?,
        price: row.get(4)?,
        category: row.get(5)?,
        is_tracked: row.get(6)?,
        expiry_date: expiry.as_deref().map(|s| date_from_sql(7, s)).transpose()?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn recipe_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recipe> {
    Ok(Recipe {
        id: row.get(0)?,
        name: row.get(1)?,
        instructions: row.get(2)?,
        notes: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

// Expects MEAL_PLAN_SELECT columns:
// 0: mp.id, 1: mp.date, 2: mp.meal_type, 3: mp.recipe_id, 4: r.name,
// 5: mp.is_cooked, 6: mp.cooked_at, 7: mp.created_at
fn meal_plan_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealPlanEntry> {
    let date: String = row.get(1)?;
    Ok(MealPlanEntry {
        id: row.get(0)?,
        date: date_from_sql(1, &date)?,
        meal_type: row.get(2)?,
        recipe_id: row.get(3)?,
        recipe_name: row.get(4)?,
        is_cooked: row.get(5)?,
        cooked_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn recipe_line_from_row(row: &rusqlite::Row) -> rusqlite::Result<RecipeIngredient> {
    Ok(RecipeIngredient {
        recipe_id: row.get(0)?,
        ingredient_id: row.get(1)?,
        name: row.get(2)?,
        quantity: row.get(3)?,
        unit: row.get(4)?,
        price: row.get(5)?,
        is_tracked: row.get(6)?,
    })
}

// --- Queries shared by plain connections and transactions ---

fn insert_ingredient_row(conn: &Connection, ingredient: &NewIngredient) -> Result<i64> {
    let name = ingredient.name.trim();
    let now = Local::now().to_rfc3339();
    conn.execute(
        "INSERT INTO ingredients (name, name_key, current_stock, unit, price, category, is_tracked, expiry_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            name,
            name_key(name),
            ingredient.current_stock,
            ingredient.unit.trim(),
            ingredient.price,
            normalize_category(&ingredient.category),
            ingredient.is_tracked,
            ingredient.expiry_date.map(date_to_sql),
            now,
            now,
        ],
    )
    .map_err(|e| duplicate_name(e, name))?;
    Ok(conn.last_insert_rowid())
}

/// Unique key for names: trimmed and lowercased with full Unicode folding,
/// which SQLite's `NOCASE` and `LOWER()` do not do.
fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn duplicate_name(err: rusqlite::Error, name: &str) -> Error {
    match Error::from(err) {
        Error::Conflict(_) => Error::conflict(format!("Ingredient '{name}' already exists")),
        other => other,
    }
}

fn fetch_ingredient(conn: &Connection, id: i64) -> Result<Option<Ingredient>> {
    let ingredient = conn
        .query_row(
            &format!("SELECT {INGREDIENT_COLUMNS} FROM ingredients WHERE id = ?1"),
            params![id],
            ingredient_from_row,
        )
        .optional()?;
    Ok(ingredient)
}

fn find_ingredient_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM ingredients WHERE name_key = ?1",
            params![name_key(name)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Turn a recipe line's ingredient reference into an id, creating the
/// ingredient when it is named but unknown.
fn resolve_ingredient(conn: &Connection, reference: &IngredientRef) -> Result<i64> {
    match reference {
        IngredientRef::Id(id) => {
            if fetch_ingredient(conn, *id)?.is_none() {
                return Err(Error::not_found("ingredient", id));
            }
            Ok(*id)
        }
        IngredientRef::Name { name, is_tracked } => {
            if let Some(id) = find_ingredient_id(conn, name)? {
                return Ok(id);
            }
            let new = NewIngredient::named(name.trim(), is_tracked.unwrap_or(true));
            let id = insert_ingredient_row(conn, &new)?;
            info!(ingredient_id = id, name = %new.name, "ingredient created from recipe");
            Ok(id)
        }
    }
}

fn upsert_recipe_line(
    conn: &Connection,
    recipe_id: i64,
    ingredient_id: i64,
    quantity: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO recipe_ingredients (recipe_id, ingredient_id, quantity)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (recipe_id, ingredient_id) DO UPDATE SET quantity = excluded.quantity",
        params![recipe_id, ingredient_id, quantity],
    )?;
    touch_recipe(conn, recipe_id)
}

fn touch_recipe(conn: &Connection, recipe_id: i64) -> Result<()> {
    let now = Local::now().to_rfc3339();
    conn.execute(
        "UPDATE recipes SET updated_at = ?1 WHERE id = ?2",
        params![now, recipe_id],
    )?;
    Ok(())
}

fn recipe_line_not_found(recipe_id: i64, ingredient_id: i64) -> Error {
    Error::not_found(
        "recipe ingredient",
        format!("{ingredient_id} in recipe {recipe_id}"),
    )
}

fn fetch_recipe(conn: &Connection, id: i64) -> Result<Option<Recipe>> {
    let recipe = conn
        .query_row(
            "SELECT id, name, instructions, notes, created_at, updated_at FROM recipes WHERE id = ?1",
            params![id],
            recipe_from_row,
        )
        .optional()?;
    Ok(recipe)
}

fn fetch_recipe_line(
    conn: &Connection,
    recipe_id: i64,
    ingredient_id: i64,
) -> Result<Option<RecipeIngredient>> {
    let line = conn
        .query_row(
            "SELECT ri.recipe_id, ri.ingredient_id, i.name, ri.quantity, i.unit, i.price, i.is_tracked
             FROM recipe_ingredients ri
             JOIN ingredients i ON ri.ingredient_id = i.id
             WHERE ri.recipe_id = ?1 AND ri.ingredient_id = ?2",
            params![recipe_id, ingredient_id],
            recipe_line_from_row,
        )
        .optional()?;
    Ok(line)
}

fn load_recipe_lines(conn: &Connection, recipe_id: i64) -> Result<Vec<RecipeIngredient>> {
    let mut stmt = conn.prepare(
        "SELECT ri.recipe_id, ri.ingredient_id, i.name, ri.quantity, i.unit, i.price, i.is_tracked
         FROM recipe_ingredients ri
         JOIN ingredients i ON ri.ingredient_id = i.id
         WHERE ri.recipe_id = ?1
         ORDER BY i.name_key",
    )?;
    let lines = stmt
        .query_map(params![recipe_id], recipe_line_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lines)
}

fn fetch_meal_plan_entry(conn: &Connection, id: i64) -> Result<Option<MealPlanEntry>> {
    let entry = conn
        .query_row(
            &format!("{MEAL_PLAN_SELECT} WHERE mp.id = ?1"),
            params![id],
            meal_plan_entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

fn load_ingredients(conn: &Connection) -> Result<Vec<Ingredient>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INGREDIENT_COLUMNS} FROM ingredients ORDER BY name_key, id"
    ))?;
    let ingredients = stmt
        .query_map([], ingredient_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ingredients)
}

fn load_schedule(conn: &Connection) -> Result<Vec<MealPlanEntry>> {
    let mut stmt = conn.prepare(&format!(
        "{MEAL_PLAN_SELECT} ORDER BY mp.date, mp.meal_type, mp.id"
    ))?;
    let entries = stmt
        .query_map([], meal_plan_entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

fn load_recipe_graph(conn: &Connection) -> Result<RecipeGraph> {
    let mut stmt =
        conn.prepare("SELECT recipe_id, ingredient_id, quantity FROM recipe_ingredients")?;
    let mut rows = stmt.query([])?;
    let mut graph = RecipeGraph::new();
    while let Some(row) = rows.next()? {
        let recipe_id: i64 = row.get(0)?;
        graph.entry(recipe_id).or_default().push(Requirement {
            ingredient_id: row.get(1)?,
            quantity: row.get(2)?,
        });
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Barrier;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    fn sample_ingredient(name: &str, stock: f64) -> NewIngredient {
        NewIngredient {
            name: name.to_string(),
            current_stock: stock,
            unit: "kg".to_string(),
            price: Some(2.5),
            category: String::new(),
            is_tracked: true,
            expiry_date: None,
        }
    }

    fn line(ingredient_id: i64, quantity: f64) -> NewRecipeIngredient {
        NewRecipeIngredient {
            ingredient: IngredientRef::Id(ingredient_id),
            quantity,
        }
    }

    fn named_line(name: &str, quantity: f64) -> NewRecipeIngredient {
        NewRecipeIngredient {
            ingredient: IngredientRef::Name {
                name: name.to_string(),
                is_tracked: None,
            },
            quantity,
        }
    }

    fn recipe(name: &str, ingredients: Vec<NewRecipeIngredient>) -> NewRecipe {
        NewRecipe {
            name: name.to_string(),
            instructions: String::new(),
            notes: String::new(),
            ingredients,
        }
    }

    fn dinner(date: NaiveDate, recipe_id: Option<i64>) -> NewMealPlanEntry {
        NewMealPlanEntry {
            date,
            meal_type: "dinner".to_string(),
            recipe_id,
        }
    }

    /// flour (stock 2, tracked), bread needing 3 flour, bread scheduled for dinner today.
    fn bread_scenario(db: &mut Database) -> (Ingredient, RecipeDetail, MealPlanEntry) {
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let bread = db.create_recipe(&recipe("bread", vec![line(flour.id, 3.0)])).unwrap();
        let entry = db
            .schedule_meal(&dinner(today(), Some(bread.recipe.id)))
            .unwrap();
        (flour, bread, entry)
    }

    #[test]
    fn test_insert_and_get_ingredient() {
        let db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient(" Flour ", 2.0)).unwrap();

        assert_eq!(flour.name, "Flour");
        assert_eq!(flour.category, "food");
        assert_eq!(flour.price, Some(2.5));
        assert!(flour.is_tracked);

        let fetched = db.get_ingredient(flour.id).unwrap();
        assert_eq!(fetched, flour);
        assert_eq!(
            db.get_ingredient(999).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_duplicate_ingredient_name_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.insert_ingredient(&sample_ingredient("Rice", 1.0)).unwrap();
        let err = db
            .insert_ingredient(&sample_ingredient("rice", 1.0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_ingredient_expiry_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let mut milk = sample_ingredient("Milk", 1.0);
        milk.expiry_date = NaiveDate::from_ymd_opt(2024, 7, 1);
        let milk = db.insert_ingredient(&milk).unwrap();
        assert_eq!(milk.expiry_date, NaiveDate::from_ymd_opt(2024, 7, 1));
    }

    #[test]
    fn test_update_ingredient_full_replace() {
        let db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();

        let updated = db
            .update_ingredient(
                flour.id,
                &UpdateIngredient {
                    name: "Bread flour".to_string(),
                    current_stock: 5.0,
                    unit: "g".to_string(),
                    price: None,
                    category: "baking".to_string(),
                    is_tracked: false,
                    expiry_date: None,
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Bread flour");
        assert_eq!(updated.current_stock, 5.0);
        assert_eq!(updated.price, None);
        assert_eq!(updated.category, "baking");
        assert!(!updated.is_tracked);

        let missing = db.update_ingredient(
            404,
            &UpdateIngredient {
                name: "x".to_string(),
                current_stock: 0.0,
                unit: String::new(),
                price: None,
                category: String::new(),
                is_tracked: true,
                expiry_date: None,
            },
        );
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_set_stock_allows_negative() {
        let db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let updated = db.set_stock(flour.id, -1.5).unwrap();
        assert_eq!(updated.current_stock, -1.5);
        assert_eq!(db.set_stock(77, 1.0).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_delete_ingredient_cascades_to_recipes() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let salt = db.insert_ingredient(&sample_ingredient("salt", 1.0)).unwrap();
        let bread = db
            .create_recipe(&recipe("bread", vec![line(flour.id, 3.0), line(salt.id, 0.1)]))
            .unwrap();

        db.delete_ingredient(flour.id).unwrap();
        let lines = db.get_recipe_ingredients(bread.recipe.id).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].name, "salt");
        assert_eq!(
            db.delete_ingredient(flour.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_create_recipe_with_ingredients() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let detail = db
            .create_recipe(&recipe(
                "Pancakes",
                vec![line(flour.id, 0.25), named_line("Eggs", 2.0)],
            ))
            .unwrap();

        assert_eq!(detail.recipe.name, "Pancakes");
        assert_eq!(detail.ingredients.len(), 2);
        // 0.25 kg flour at 2.5, eggs unpriced
        assert!((detail.estimated_cost - 0.625).abs() < 1e-9);

        let eggs = db.find_ingredient_by_name("eggs").unwrap().unwrap();
        assert_eq!(eggs.current_stock, 0.0);
        assert_eq!(eggs.price, None);
        assert!(eggs.is_tracked);
    }

    #[test]
    fn test_create_recipe_is_atomic() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .create_recipe(&recipe(
                "Broken",
                vec![named_line("Butter", 1.0), line(9999, 1.0)],
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(db.list_recipes().unwrap().is_empty());
        // The auto-created ingredient was rolled back with the recipe.
        assert!(db.find_ingredient_by_name("Butter").unwrap().is_none());
    }

    #[test]
    fn test_create_recipe_validates_before_writing() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .create_recipe(&recipe("Soup", vec![named_line("Leek", 0.0)]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(db.create_recipe(&recipe("  ", vec![])).is_err());
        assert!(db.list_recipes().unwrap().is_empty());
    }

    #[test]
    fn test_add_recipe_ingredient_by_name_reuses_ingredient() {
        let mut db = Database::open_in_memory().unwrap();
        let soup = db.create_recipe(&recipe("Soup", vec![])).unwrap();
        let stew = db.create_recipe(&recipe("Stew", vec![])).unwrap();

        let first = db
            .add_recipe_ingredient(soup.recipe.id, &named_line("Carrot", 2.0))
            .unwrap();
        assert_eq!(db.list_ingredients().unwrap().len(), 1);

        let second = db
            .add_recipe_ingredient(stew.recipe.id, &named_line("CARROT", 1.0))
            .unwrap();
        assert_eq!(first.ingredient_id, second.ingredient_id);
        assert_eq!(db.list_ingredients().unwrap().len(), 1);
    }

    #[test]
    fn test_add_recipe_ingredient_by_name_folds_non_ascii_case() {
        let mut db = Database::open_in_memory().unwrap();
        let tart = db.create_recipe(&recipe("Tart", vec![])).unwrap();

        let first = db
            .add_recipe_ingredient(tart.recipe.id, &named_line("Crème", 1.0))
            .unwrap();
        let second = db
            .add_recipe_ingredient(tart.recipe.id, &named_line("CRÈME", 2.0))
            .unwrap();
        assert_eq!(first.ingredient_id, second.ingredient_id);
        assert_eq!(db.list_ingredients().unwrap().len(), 1);
        assert_eq!(db.get_recipe_ingredients(tart.recipe.id).unwrap().len(), 1);
        assert_eq!(db.find_ingredient_by_name("crème").unwrap().unwrap().name, "Crème");
    }

    #[test]
    fn test_non_ascii_duplicate_ingredient_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.insert_ingredient(&sample_ingredient("Ñame", 1.0)).unwrap();
        let err = db.insert_ingredient(&sample_ingredient("ñAME", 1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_add_recipe_ingredient_untracked_by_name() {
        let mut db = Database::open_in_memory().unwrap();
        let tea = db.create_recipe(&recipe("Tea", vec![])).unwrap();
        let saved = db
            .add_recipe_ingredient(
                tea.recipe.id,
                &NewRecipeIngredient {
                    ingredient: IngredientRef::Name {
                        name: "Water".to_string(),
                        is_tracked: Some(false),
                    },
                    quantity: 0.3,
                },
            )
            .unwrap();
        assert!(!saved.is_tracked);
    }

    #[test]
    fn test_add_recipe_ingredient_upserts_quantity() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let bread = db.create_recipe(&recipe("bread", vec![line(flour.id, 3.0)])).unwrap();

        let saved = db
            .add_recipe_ingredient(bread.recipe.id, &line(flour.id, 4.5))
            .unwrap();
        assert_eq!(saved.quantity, 4.5);
        let lines = db.get_recipe_ingredients(bread.recipe.id).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 4.5);
    }

    #[test]
    fn test_add_recipe_ingredient_unknown_recipe() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .add_recipe_ingredient(42, &named_line("Basil", 1.0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(db.find_ingredient_by_name("Basil").unwrap().is_none());
    }

    #[test]
    fn test_update_and_remove_recipe_ingredient() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let bread = db.create_recipe(&recipe("bread", vec![line(flour.id, 3.0)])).unwrap();
        let id = bread.recipe.id;

        let updated = db.update_recipe_ingredient_quantity(id, flour.id, 2.0).unwrap();
        assert_eq!(updated.quantity, 2.0);
        assert_eq!(
            db.update_recipe_ingredient_quantity(id, flour.id, -1.0)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            db.update_recipe_ingredient_quantity(id, 999, 1.0)
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );

        db.remove_recipe_ingredient(id, flour.id).unwrap();
        assert!(db.get_recipe_ingredients(id).unwrap().is_empty());
        assert_eq!(
            db.remove_recipe_ingredient(id, flour.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_update_recipe() {
        let mut db = Database::open_in_memory().unwrap();
        let soup = db.create_recipe(&recipe("Soup", vec![])).unwrap();
        let updated = db
            .update_recipe(
                soup.recipe.id,
                &UpdateRecipe {
                    name: "Leek soup".to_string(),
                    instructions: "Simmer.".to_string(),
                    notes: "Freezes well".to_string(),
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Leek soup");
        assert_eq!(updated.notes, "Freezes well");

        let found = db.find_recipe_by_name("LEEK SOUP").unwrap().unwrap();
        assert_eq!(found.id, soup.recipe.id);
        assert!(db.find_recipe_by_name("Soup").unwrap().is_none());
    }

    #[test]
    fn test_delete_recipe_unschedules_meals() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, bread, entry) = bread_scenario(&mut db);

        db.delete_recipe(bread.recipe.id).unwrap();
        let entry = db.get_meal_plan_entry(entry.id).unwrap();
        assert_eq!(entry.recipe_id, None);
        assert_eq!(entry.recipe_name, None);
        assert_eq!(
            db.delete_recipe(bread.recipe.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_schedule_meal() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, bread, entry) = bread_scenario(&mut db);

        assert_eq!(entry.recipe_id, Some(bread.recipe.id));
        assert_eq!(entry.recipe_name.as_deref(), Some("bread"));
        assert!(!entry.is_cooked);

        let err = db.schedule_meal(&dinner(today(), Some(500))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = db
            .schedule_meal(&NewMealPlanEntry {
                date: today(),
                meal_type: " ".to_string(),
                recipe_id: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_meal_plan_ordering_and_range() {
        let db = Database::open_in_memory().unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        for (date, meal) in [(d(3), "lunch"), (d(1), "lunch"), (d(1), "dinner"), (d(2), "lunch")] {
            db.schedule_meal(&NewMealPlanEntry {
                date,
                meal_type: meal.to_string(),
                recipe_id: None,
            })
            .unwrap();
        }

        let all = db.list_meal_plan(None, None).unwrap();
        let order: Vec<(NaiveDate, &str)> =
            all.iter().map(|e| (e.date, e.meal_type.as_str())).collect();
        assert_eq!(
            order,
            vec![(d(1), "dinner"), (d(1), "lunch"), (d(2), "lunch"), (d(3), "lunch")]
        );

        let middle = db.list_meal_plan(Some(d(2)), Some(d(2))).unwrap();
        assert_eq!(middle.len(), 1);
        let from_two = db.list_meal_plan(Some(d(2)), None).unwrap();
        assert_eq!(from_two.len(), 2);
    }

    #[test]
    fn test_update_and_delete_meal_plan_entry() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, _, entry) = bread_scenario(&mut db);
        let moved = db
            .update_meal_plan_entry(
                entry.id,
                &UpdateMealPlanEntry {
                    date: today().succ_opt().unwrap(),
                    meal_type: "Lunch".to_string(),
                    recipe_id: None,
                },
            )
            .unwrap();
        assert_eq!(moved.meal_type, "Lunch");
        assert_eq!(moved.recipe_id, None);

        db.delete_meal_plan_entry(entry.id).unwrap();
        assert_eq!(
            db.delete_meal_plan_entry(entry.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_cooked_entry_cannot_be_rescheduled() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, bread, entry) = bread_scenario(&mut db);
        db.cook_meal(entry.id).unwrap();

        let err = db
            .update_meal_plan_entry(
                entry.id,
                &UpdateMealPlanEntry {
                    date: today(),
                    meal_type: "dinner".to_string(),
                    recipe_id: Some(bread.recipe.id),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_uncook_is_rejected_by_schema() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, _, entry) = bread_scenario(&mut db);
        db.cook_meal(entry.id).unwrap();

        let result = db.conn.execute(
            "UPDATE meal_plan SET is_cooked = 0 WHERE id = ?1",
            params![entry.id],
        );
        assert!(result.is_err());
        assert!(db.get_meal_plan_entry(entry.id).unwrap().is_cooked);
    }

    #[test]
    fn test_bread_scenario() {
        let mut db = Database::open_in_memory().unwrap();
        let (flour, _, entry) = bread_scenario(&mut db);

        let list = db
            .shopping_list(ShortageMode::Demand, AggregationOptions::default(), today())
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "flour");
        assert!((list[0].quantity_needed - 1.0).abs() < 1e-9);
        assert!((list[0].estimated_cost - 2.5).abs() < 1e-9);

        let receipt = db.cook_meal(entry.id).unwrap();
        assert_eq!(receipt.consumed.len(), 1);
        assert_eq!(receipt.consumed[0].remaining_stock, -1.0);
        assert_eq!(db.get_ingredient(flour.id).unwrap().current_stock, -1.0);
        let cooked = db.get_meal_plan_entry(entry.id).unwrap();
        assert!(cooked.is_cooked);
        assert!(cooked.cooked_at.is_some());

        let err = db.cook_meal(entry.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(db.get_ingredient(flour.id).unwrap().current_stock, -1.0);
    }

    #[test]
    fn test_cook_without_recipe_is_invalid_state() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 2.0)).unwrap();
        let entry = db.schedule_meal(&dinner(today(), None)).unwrap();

        let err = db.cook_meal(entry.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!db.get_meal_plan_entry(entry.id).unwrap().is_cooked);
        assert_eq!(db.get_ingredient(flour.id).unwrap().current_stock, 2.0);

        assert_eq!(db.cook_meal(31337).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_cook_leaves_untracked_stock_alone() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 5.0)).unwrap();
        let mut water = sample_ingredient("water", 1.0);
        water.is_tracked = false;
        let water = db.insert_ingredient(&water).unwrap();
        let bread = db
            .create_recipe(&recipe("bread", vec![line(flour.id, 3.0), line(water.id, 0.5)]))
            .unwrap();
        let entry = db
            .schedule_meal(&dinner(today(), Some(bread.recipe.id)))
            .unwrap();

        let receipt = db.cook_meal(entry.id).unwrap();
        assert_eq!(receipt.consumed.len(), 1);
        assert_eq!(db.get_ingredient(flour.id).unwrap().current_stock, 2.0);
        assert_eq!(db.get_ingredient(water.id).unwrap().current_stock, 1.0);
    }

    /// Wraps the real scope and fails on the n-th stock decrement.
    struct FailingScope<'a> {
        inner: SqliteScope<'a>,
        fail_on: usize,
        decrements: usize,
    }

    impl ConsumptionScope for FailingScope<'_> {
        fn lock_entry(&mut self, entry_id: i64) -> Result<Option<MealPlanEntry>> {
            self.inner.lock_entry(entry_id)
        }

        fn recipe_consumption(&mut self, recipe_id: i64) -> Result<Vec<Consumption>> {
            self.inner.recipe_consumption(recipe_id)
        }

        fn mark_cooked(&mut self, entry_id: i64) -> Result<()> {
            self.inner.mark_cooked(entry_id)
        }

        fn decrement_stock(&mut self, ingredient_id: i64, quantity: f64) -> Result<f64> {
            self.decrements += 1;
            if self.decrements == self.fail_on {
                return Err(Error::Storage(rusqlite::Error::InvalidQuery));
            }
            self.inner.decrement_stock(ingredient_id, quantity)
        }

        fn commit(self) -> Result<()> {
            self.inner.commit()
        }
    }

    #[test]
    fn test_cook_rolls_back_on_failure() {
        let mut db = Database::open_in_memory().unwrap();
        let flour = db.insert_ingredient(&sample_ingredient("flour", 5.0)).unwrap();
        let salt = db.insert_ingredient(&sample_ingredient("salt", 1.0)).unwrap();
        let yeast = db.insert_ingredient(&sample_ingredient("yeast", 1.0)).unwrap();
        let bread = db
            .create_recipe(&recipe(
                "bread",
                vec![line(flour.id, 3.0), line(salt.id, 0.1), line(yeast.id, 0.2)],
            ))
            .unwrap();
        let entry = db
            .schedule_meal(&dinner(today(), Some(bread.recipe.id)))
            .unwrap();

        {
            let scope = FailingScope {
                inner: db.begin_consumption().unwrap(),
                fail_on: 3,
                decrements: 0,
            };
            let err = reconcile::commit_consumption(scope, entry.id).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Internal);
        }

        assert!(!db.get_meal_plan_entry(entry.id).unwrap().is_cooked);
        assert_eq!(db.get_ingredient(flour.id).unwrap().current_stock, 5.0);
        assert_eq!(db.get_ingredient(salt.id).unwrap().current_stock, 1.0);
        assert_eq!(db.get_ingredient(yeast.id).unwrap().current_stock, 1.0);

        // The entry can still be cooked afterwards.
        db.cook_meal(entry.id).unwrap();
        assert_eq!(db.get_ingredient(flour.id).unwrap().current_stock, 2.0);
    }

    #[test]
    fn test_concurrent_cooks_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pantry.db");
        let (flour_id, entry_id) = {
            let mut db = Database::open(&path).unwrap();
            let (flour, _, entry) = bread_scenario(&mut db);
            (flour.id, entry.id)
        };

        let barrier = Barrier::new(2);
        let results: Vec<Result<CookReceipt>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let mut db = Database::open(&path).unwrap();
                        barrier.wait();
                        db.cook_meal(entry_id)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Conflict))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 1);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_ingredient(flour_id).unwrap().current_stock, -1.0);
    }

    #[test]
    fn test_shopping_list_skips_cooked_and_past_meals() {
        let mut db = Database::open_in_memory().unwrap();
        let (flour, bread, entry) = bread_scenario(&mut db);
        let yesterday = today().pred_opt().unwrap();
        db.schedule_meal(&dinner(yesterday, Some(bread.recipe.id)))
            .unwrap();

        // Upcoming: only today's bread (3) against stock 2.
        let upcoming = db
            .shopping_list(ShortageMode::Demand, AggregationOptions::upcoming(), today())
            .unwrap();
        assert!((upcoming[0].quantity_needed - 1.0).abs() < 1e-9);

        // Whole schedule: both breads (6) against stock 2.
        let all = db
            .shopping_list(
                ShortageMode::Demand,
                AggregationOptions::whole_schedule(),
                today(),
            )
            .unwrap();
        assert!((all[0].quantity_needed - 4.0).abs() < 1e-9);

        // After cooking today's bread stock is -1 and only yesterday's is pending.
        db.cook_meal(entry.id).unwrap();
        let all = db
            .shopping_list(
                ShortageMode::Demand,
                AggregationOptions::whole_schedule(),
                today(),
            )
            .unwrap();
        assert!((all[0].quantity_needed - 4.0).abs() < 1e-9);
        assert_eq!(all[0].ingredient_id, flour.id);
    }

    #[test]
    fn test_threshold_shopping_list() {
        let db = Database::open_in_memory().unwrap();
        db.insert_ingredient(&sample_ingredient("flour", 0.5)).unwrap();
        db.insert_ingredient(&sample_ingredient("sugar", 3.0)).unwrap();
        let mut soap = sample_ingredient("soap", 0.0);
        soap.is_tracked = false;
        db.insert_ingredient(&soap).unwrap();

        let list = db
            .shopping_list(
                ShortageMode::Threshold { threshold: 1.0 },
                AggregationOptions::default(),
                today(),
            )
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "flour");
        assert!((list[0].quantity_needed - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_inventory_planned_consumption() {
        let mut db = Database::open_in_memory().unwrap();
        let (flour, bread, _) = bread_scenario(&mut db);
        let sugar = db.insert_ingredient(&sample_ingredient("sugar", 1.0)).unwrap();
        let last_week = today().checked_sub_days(chrono::Days::new(7)).unwrap();
        db.schedule_meal(&dinner(last_week, Some(bread.recipe.id)))
            .unwrap();

        let inventory = db
            .list_inventory(AggregationOptions::whole_schedule(), today())
            .unwrap();
        let planned = |id| {
            inventory
                .iter()
                .find(|i| i.ingredient.id == id)
                .unwrap()
                .planned_consumption
        };
        assert_eq!(planned(flour.id), 6.0);
        assert_eq!(planned(sugar.id), 0.0);

        let required = db
            .required_quantities(AggregationOptions::upcoming(), today())
            .unwrap();
        assert_eq!(required.get(&flour.id), Some(&3.0));
    }
}
