mod commands;
mod config;
mod line;
mod server;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::process;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{
    IngredientArgs, PlanEdit, ShoppingArgs, cmd_inventory_add, cmd_inventory_delete,
    cmd_inventory_edit, cmd_inventory_list, cmd_inventory_show, cmd_inventory_stock, cmd_plan_add,
    cmd_plan_cook, cmd_plan_delete, cmd_plan_edit, cmd_plan_list, cmd_recipe_add_ingredient,
    cmd_recipe_create, cmd_recipe_delete, cmd_recipe_edit, cmd_recipe_list,
    cmd_recipe_remove_ingredient, cmd_recipe_set_quantity, cmd_recipe_show, cmd_shopping_list,
    cmd_shopping_send,
};
use crate::config::Config;
use crate::line::LineClient;
use pantry_core::ErrorKind;
use pantry_core::db::Database;
use pantry_core::reconcile::DemandHorizon;

#[derive(Parser)]
#[command(
    name = "pantry",
    version,
    about = "Household pantry, recipes and meal plan",
    long_about = "Track what is in the pantry, plan meals from recipes, and get a shopping \
                  list of exactly what the plan is missing."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage pantry stock
    Inventory {
        #[command(subcommand)]
        command: InventoryCommands,
    },
    /// Manage recipes and their ingredients
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Schedule, edit and cook planned meals
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Show or send what needs buying
    Shopping {
        #[command(subcommand)]
        command: ShoppingCommands,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },
}

#[derive(Args)]
struct IngredientFields {
    /// Quantity currently on hand
    #[arg(long)]
    stock: Option<f64>,
    /// Display unit (e.g. kg, pcs)
    #[arg(long)]
    unit: Option<String>,
    /// Unit price
    #[arg(long)]
    price: Option<f64>,
    /// Category (default: food)
    #[arg(long)]
    category: Option<String>,
    /// Exclude from shopping lists and stock consumption
    #[arg(long, conflicts_with = "tracked")]
    untracked: bool,
    /// Include in shopping lists and stock consumption
    #[arg(long)]
    tracked: bool,
    /// Expiry date (YYYY-MM-DD)
    #[arg(long)]
    expires: Option<String>,
}

impl IngredientFields {
    fn into_args(self, name: Option<String>, clear_price: bool, clear_expiry: bool) -> IngredientArgs {
        let tracked = match (self.tracked, self.untracked) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        IngredientArgs {
            name,
            stock: self.stock,
            unit: self.unit,
            price: self.price,
            clear_price,
            category: self.category,
            tracked,
            expires: self.expires,
            clear_expiry,
        }
    }
}

#[derive(Subcommand)]
enum InventoryCommands {
    /// List ingredients with stock and planned consumption
    List {
        /// Only show tracked ingredients the meal plan will run out of
        #[arg(long)]
        low: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add an ingredient
    Add {
        /// Ingredient name
        name: String,
        #[command(flatten)]
        fields: IngredientFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one ingredient (by id or name)
    Show {
        ingredient: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change an ingredient's fields
    Edit {
        /// Ingredient id or name
        ingredient: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        fields: IngredientFields,
        /// Remove the price
        #[arg(long, conflicts_with = "price")]
        clear_price: bool,
        /// Remove the expiry date
        #[arg(long, conflicts_with = "expires")]
        clear_expiry: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the stock level (negative values record a shortfall)
    Stock {
        /// Ingredient id or name
        ingredient: String,
        /// New stock level
        #[arg(allow_hyphen_values = true)]
        quantity: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an ingredient (removes it from every recipe)
    Delete {
        /// Ingredient id or name
        ingredient: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// Create a new recipe
    Create {
        /// Recipe name
        name: String,
        /// Ingredient as NAME=QUANTITY (repeatable); unknown names are added to the pantry
        #[arg(short, long = "ingredient", value_name = "NAME=QTY")]
        ingredients: Vec<String>,
        /// Cooking instructions
        #[arg(long)]
        instructions: Option<String>,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all recipes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recipe details (by id or name)
    Show {
        recipe: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rename a recipe or change its instructions/notes
    Edit {
        /// Recipe id or name
        recipe: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        instructions: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a recipe (planned meals keep their slot without a recipe)
    Delete {
        /// Recipe id or name
        recipe: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add an ingredient to a recipe, or replace its quantity
    AddIngredient {
        /// Recipe id or name
        recipe: String,
        /// Ingredient name (created if new)
        ingredient: String,
        /// Quantity per batch, in the ingredient's unit
        quantity: f64,
        /// Create the ingredient as untracked
        #[arg(long)]
        untracked: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change the quantity of an ingredient already on a recipe
    SetQuantity {
        /// Recipe id or name
        recipe: String,
        /// Ingredient id or name
        ingredient: String,
        quantity: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an ingredient from a recipe
    RemoveIngredient {
        /// Recipe id or name
        recipe: String,
        /// Ingredient id or name
        ingredient: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Schedule a meal
    Add {
        /// Recipe id or name (omit to reserve the slot)
        recipe: Option<String>,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Meal type, e.g. breakfast, lunch, dinner
        #[arg(short, long, default_value = "dinner")]
        meal: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List planned meals
    List {
        /// First date to include (YYYY-MM-DD)
        #[arg(long, conflicts_with = "days")]
        start: Option<String>,
        /// Last date to include (YYYY-MM-DD)
        #[arg(long, conflicts_with = "days")]
        end: Option<String>,
        /// Show the next N days starting today
        #[arg(short, long)]
        days: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a planned meal
    Edit {
        /// Plan entry ID
        id: i64,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        meal: Option<String>,
        /// Recipe id or name
        #[arg(long, conflicts_with = "clear_recipe")]
        recipe: Option<String>,
        /// Leave the slot without a recipe
        #[arg(long)]
        clear_recipe: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a planned meal
    Delete {
        /// Plan entry ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cook a planned meal: mark it done and take its ingredients out of stock
    Cook {
        /// Plan entry ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct ShoppingFlags {
    /// Shortage mode: demand (plan minus stock) or threshold (stock below a level)
    #[arg(long)]
    mode: Option<String>,
    /// Low-stock level for threshold mode (implies --mode threshold)
    #[arg(long)]
    threshold: Option<f64>,
    /// Which meals count as demand: upcoming or all
    #[arg(long)]
    horizon: Option<DemandHorizon>,
    /// Count meals that were already cooked
    #[arg(long)]
    include_cooked: bool,
}

impl From<ShoppingFlags> for ShoppingArgs {
    fn from(f: ShoppingFlags) -> Self {
        Self {
            mode: f.mode,
            threshold: f.threshold,
            horizon: f.horizon,
            include_cooked: f.include_cooked,
        }
    }
}

#[derive(Subcommand)]
enum ShoppingCommands {
    /// Show the shopping list
    List {
        #[command(flatten)]
        flags: ShoppingFlags,
        /// Print the list as the broadcast message text
        #[arg(long)]
        text: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Broadcast the shopping list through LINE (needs LINE_CHANNEL_ACCESS_TOKEN)
    Send {
        #[command(flatten)]
        flags: ShoppingFlags,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let serving = matches!(cli.command, Commands::Serve { .. });
    init_tracing(if serving { "info" } else { "warn" });

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        let expected = e
            .chain()
            .filter_map(|c| c.downcast_ref::<pantry_core::Error>())
            .any(|c| {
                matches!(
                    c.kind(),
                    ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::InvalidState
                )
            });
        process::exit(if expected { 2 } else { 1 });
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let mut db = Database::open(&config.db_path).map_err(|e| {
        anyhow::Error::new(e).context(format!(
            "Failed to open database at {}",
            config.db_path.display()
        ))
    })?;

    match cli.command {
        Commands::Inventory { command } => match command {
            InventoryCommands::List { low, json } => cmd_inventory_list(&db, low, json),
            InventoryCommands::Add { name, fields, json } => {
                cmd_inventory_add(&db, &name, fields.into_args(None, false, false), json)
            }
            InventoryCommands::Show { ingredient, json } => {
                cmd_inventory_show(&db, &ingredient, json)
            }
            InventoryCommands::Edit {
                ingredient,
                name,
                fields,
                clear_price,
                clear_expiry,
                json,
            } => cmd_inventory_edit(
                &db,
                &ingredient,
                fields.into_args(name, clear_price, clear_expiry),
                json,
            ),
            InventoryCommands::Stock {
                ingredient,
                quantity,
                json,
            } => cmd_inventory_stock(&db, &ingredient, quantity, json),
            InventoryCommands::Delete { ingredient, json } => {
                cmd_inventory_delete(&db, &ingredient, json)
            }
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::Create {
                name,
                ingredients,
                instructions,
                notes,
                json,
            } => cmd_recipe_create(&mut db, &name, instructions, notes, &ingredients, json),
            RecipeCommands::List { json } => cmd_recipe_list(&db, json),
            RecipeCommands::Show { recipe, json } => cmd_recipe_show(&db, &recipe, json),
            RecipeCommands::Edit {
                recipe,
                name,
                instructions,
                notes,
                json,
            } => cmd_recipe_edit(&db, &recipe, name, instructions, notes, json),
            RecipeCommands::Delete { recipe, json } => cmd_recipe_delete(&db, &recipe, json),
            RecipeCommands::AddIngredient {
                recipe,
                ingredient,
                quantity,
                untracked,
                json,
            } => cmd_recipe_add_ingredient(&mut db, &recipe, &ingredient, quantity, untracked, json),
            RecipeCommands::SetQuantity {
                recipe,
                ingredient,
                quantity,
                json,
            } => cmd_recipe_set_quantity(&db, &recipe, &ingredient, quantity, json),
            RecipeCommands::RemoveIngredient {
                recipe,
                ingredient,
                json,
            } => cmd_recipe_remove_ingredient(&db, &recipe, &ingredient, json),
        },
        Commands::Plan { command } => match command {
            PlanCommands::Add {
                recipe,
                date,
                meal,
                json,
            } => cmd_plan_add(
                &db,
                &config,
                recipe.as_deref(),
                date.as_deref(),
                &meal,
                json,
            ),
            PlanCommands::List {
                start,
                end,
                days,
                json,
            } => cmd_plan_list(&db, start.as_deref(), end.as_deref(), days, json),
            PlanCommands::Edit {
                id,
                date,
                meal,
                recipe,
                clear_recipe,
                json,
            } => {
                let edit = PlanEdit {
                    date: date.as_deref(),
                    meal: meal.as_deref(),
                    recipe: recipe.as_deref(),
                    clear_recipe,
                };
                cmd_plan_edit(&db, &config, id, &edit, json)
            }
            PlanCommands::Delete { id, json } => cmd_plan_delete(&db, id, json),
            PlanCommands::Cook { id, json } => cmd_plan_cook(&mut db, id, json),
        },
        Commands::Shopping { command } => match command {
            ShoppingCommands::List { flags, text, json } => {
                cmd_shopping_list(&db, &config, &flags.into(), text, json)
            }
            ShoppingCommands::Send { flags, json } => {
                let line = LineClient::from_env()?;
                cmd_shopping_send(&db, &config, &line, &flags.into(), json).await
            }
        },
        Commands::Serve { port, bind } => {
            let line = LineClient::from_env()?;
            server::start_server(db, config, line, port, &bind).await
        }
    }
}
