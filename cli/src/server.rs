use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::config::Config;
use crate::line::LineClient;
use pantry_core::broadcast::{ListLine, SendOutcome};
use pantry_core::db::Database;
use pantry_core::models::{
    CookReceipt, Ingredient, IngredientRef, InventoryItem, MealPlanEntry, NewIngredient,
    NewMealPlanEntry, NewRecipe, NewRecipeIngredient, Recipe, RecipeDetail, RecipeIngredient,
    ShoppingItem, UpdateIngredient, UpdateMealPlanEntry, UpdateRecipe, parse_date,
};
use pantry_core::reconcile::{AggregationOptions, DemandHorizon, ShortageMode};
use pantry_core::{Error, ErrorKind};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    line: Arc<LineClient>,
    config: Arc<Config>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

fn default_true() -> bool {
    true
}

/// Body for creating or fully replacing an ingredient.
#[derive(Deserialize)]
struct IngredientRequest {
    name: String,
    #[serde(default)]
    current_stock: f64,
    #[serde(default)]
    unit: String,
    price: Option<f64>,
    #[serde(default)]
    category: String,
    #[serde(default = "default_true")]
    is_tracked: bool,
    expiry_date: Option<String>,
}

impl IngredientRequest {
    fn into_new(self) -> Result<NewIngredient, Error> {
        Ok(NewIngredient {
            expiry_date: self.expiry_date.as_deref().map(parse_date).transpose()?,
            name: self.name,
            current_stock: self.current_stock,
            unit: self.unit,
            price: self.price,
            category: self.category,
            is_tracked: self.is_tracked,
        })
    }

    fn into_update(self) -> Result<UpdateIngredient, Error> {
        let new = self.into_new()?;
        Ok(UpdateIngredient {
            name: new.name,
            current_stock: new.current_stock,
            unit: new.unit,
            price: new.price,
            category: new.category,
            is_tracked: new.is_tracked,
            expiry_date: new.expiry_date,
        })
    }
}

#[derive(Deserialize)]
struct SetStockRequest {
    current_stock: f64,
}

#[derive(Deserialize)]
struct RecipeIngredientRequest {
    ingredient_id: Option<i64>,
    ingredient_name: Option<String>,
    quantity: f64,
    is_tracked: Option<bool>,
}

impl TryFrom<RecipeIngredientRequest> for NewRecipeIngredient {
    type Error = Error;

    fn try_from(req: RecipeIngredientRequest) -> Result<Self, Error> {
        let ingredient = match (req.ingredient_id, req.ingredient_name) {
            (Some(id), _) => IngredientRef::Id(id),
            (None, Some(name)) => IngredientRef::Name {
                name,
                is_tracked: req.is_tracked,
            },
            (None, None) => {
                return Err(Error::invalid("ingredient_id or ingredient_name required"));
            }
        };
        Ok(Self {
            ingredient,
            quantity: req.quantity,
        })
    }
}

#[derive(Deserialize)]
struct CreateRecipeRequest {
    name: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    ingredients: Vec<RecipeIngredientRequest>,
}

#[derive(Deserialize)]
struct UpdateRecipeRequest {
    name: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
struct QuantityRequest {
    quantity: f64,
}

#[derive(Deserialize)]
struct MealPlanRequest {
    date: String,
    meal_type: String,
    recipe_id: Option<i64>,
}

#[derive(Deserialize)]
struct DateRangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Deserialize)]
struct ShoppingQuery {
    mode: Option<String>,
    threshold: Option<f64>,
    horizon: Option<String>,
    include_cooked: Option<bool>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidState => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "internal server error");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

// --- Middleware ---

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Inventory handlers ---

async fn list_inventory(State(state): State<AppState>) -> ApiResult<Json<Vec<InventoryItem>>> {
    let today = Local::now().date_naive();
    let items = state
        .db()
        .list_inventory(AggregationOptions::whole_schedule(), today)?;
    Ok(Json(items))
}

async fn create_ingredient(
    State(state): State<AppState>,
    Json(req): Json<IngredientRequest>,
) -> ApiResult<(StatusCode, Json<Ingredient>)> {
    let new = req.into_new()?;
    let ingredient = state.db().insert_ingredient(&new)?;
    Ok((StatusCode::CREATED, Json(ingredient)))
}

async fn get_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Ingredient>> {
    Ok(Json(state.db().get_ingredient(id)?))
}

async fn update_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<IngredientRequest>,
) -> ApiResult<Json<Ingredient>> {
    let update = req.into_update()?;
    Ok(Json(state.db().update_ingredient(id, &update)?))
}

async fn set_stock(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SetStockRequest>,
) -> ApiResult<Json<Ingredient>> {
    Ok(Json(state.db().set_stock(id, req.current_stock)?))
}

async fn delete_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.db().delete_ingredient(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Recipe handlers ---

async fn list_recipes(State(state): State<AppState>) -> ApiResult<Json<Vec<RecipeDetail>>> {
    let db = state.db();
    let details = db
        .list_recipes()?
        .iter()
        .map(|r| db.get_recipe_detail(r.id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(details))
}

async fn create_recipe(
    State(state): State<AppState>,
    Json(req): Json<CreateRecipeRequest>,
) -> ApiResult<(StatusCode, Json<RecipeDetail>)> {
    let ingredients = req
        .ingredients
        .into_iter()
        .map(NewRecipeIngredient::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let recipe = NewRecipe {
        name: req.name,
        instructions: req.instructions,
        notes: req.notes,
        ingredients,
    };
    let detail = state.db().create_recipe(&recipe)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RecipeDetail>> {
    Ok(Json(state.db().get_recipe_detail(id)?))
}

async fn update_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRecipeRequest>,
) -> ApiResult<Json<Recipe>> {
    let update = UpdateRecipe {
        name: req.name,
        instructions: req.instructions,
        notes: req.notes,
    };
    Ok(Json(state.db().update_recipe(id, &update)?))
}

async fn delete_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.db().delete_recipe(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_recipe_ingredients(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<RecipeIngredient>>> {
    Ok(Json(state.db().get_recipe_ingredients(id)?))
}

async fn add_recipe_ingredient(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RecipeIngredientRequest>,
) -> ApiResult<(StatusCode, Json<RecipeIngredient>)> {
    let line = NewRecipeIngredient::try_from(req)?;
    let saved = state.db().add_recipe_ingredient(id, &line)?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn update_recipe_ingredient(
    State(state): State<AppState>,
    Path((id, ingredient_id)): Path<(i64, i64)>,
    Json(req): Json<QuantityRequest>,
) -> ApiResult<Json<RecipeIngredient>> {
    let saved = state
        .db()
        .update_recipe_ingredient_quantity(id, ingredient_id, req.quantity)?;
    Ok(Json(saved))
}

async fn remove_recipe_ingredient(
    State(state): State<AppState>,
    Path((id, ingredient_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.db().remove_recipe_ingredient(id, ingredient_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Meal plan handlers ---

async fn list_meal_plan(
    State(state): State<AppState>,
    Query(q): Query<DateRangeQuery>,
) -> ApiResult<Json<Vec<MealPlanEntry>>> {
    let start = q.start.as_deref().map(parse_date).transpose()?;
    let end = q.end.as_deref().map(parse_date).transpose()?;
    Ok(Json(state.db().list_meal_plan(start, end)?))
}

async fn create_meal_plan_entry(
    State(state): State<AppState>,
    Json(req): Json<MealPlanRequest>,
) -> ApiResult<(StatusCode, Json<MealPlanEntry>)> {
    let entry = NewMealPlanEntry {
        date: parse_date(&req.date)?,
        meal_type: state.config.check_meal_type(&req.meal_type)?,
        recipe_id: req.recipe_id,
    };
    let saved = state.db().schedule_meal(&entry)?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn get_meal_plan_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<MealPlanEntry>> {
    Ok(Json(state.db().get_meal_plan_entry(id)?))
}

async fn update_meal_plan_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<MealPlanRequest>,
) -> ApiResult<Json<MealPlanEntry>> {
    let update = UpdateMealPlanEntry {
        date: parse_date(&req.date)?,
        meal_type: state.config.check_meal_type(&req.meal_type)?,
        recipe_id: req.recipe_id,
    };
    Ok(Json(state.db().update_meal_plan_entry(id, &update)?))
}

async fn delete_meal_plan_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.db().delete_meal_plan_entry(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cook_meal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<CookReceipt>> {
    Ok(Json(state.db().cook_meal(id)?))
}

// --- Shopping list handlers ---

impl ShoppingQuery {
    fn resolve(&self, config: &Config) -> Result<(ShortageMode, AggregationOptions), Error> {
        let mode = match (&self.mode, self.threshold) {
            (Some(mode), threshold) => ShortageMode::parse(mode, threshold)?,
            (None, Some(threshold)) => ShortageMode::parse("threshold", Some(threshold))?,
            (None, None) => config.shortage_mode,
        };
        let mut options = config.aggregation;
        if let Some(horizon) = &self.horizon {
            options.horizon = horizon.parse::<DemandHorizon>()?;
        }
        if let Some(include_cooked) = self.include_cooked {
            options.include_cooked = include_cooked;
        }
        Ok((mode, options))
    }
}

async fn get_shopping_list(
    State(state): State<AppState>,
    Query(q): Query<ShoppingQuery>,
) -> ApiResult<Json<Vec<ShoppingItem>>> {
    let (mode, options) = q.resolve(&state.config)?;
    let today = Local::now().date_naive();
    Ok(Json(state.db().shopping_list(mode, options, today)?))
}

/// Broadcast either the posted list or, with no body, the computed shortage.
async fn send_shopping_list(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<SendOutcome>> {
    let lines: Vec<ListLine> = if body.iter().all(u8::is_ascii_whitespace) {
        let today = Local::now().date_naive();
        let items = state.db().shopping_list(
            state.config.shortage_mode,
            state.config.aggregation,
            today,
        )?;
        items.iter().map(ListLine::from).collect()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| Error::invalid(format!("Invalid request body: {e}")))?
    };

    let outcome = state.line.broadcast(&lines).await?;
    Ok(Json(outcome))
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/api/inventory", get(list_inventory).post(create_ingredient))
        .route(
            "/api/inventory/{id}",
            get(get_ingredient)
                .put(update_ingredient)
                .delete(delete_ingredient),
        )
        .route("/api/inventory/{id}/stock", put(set_stock))
        .route("/api/recipes", get(list_recipes).post(create_recipe))
        .route(
            "/api/recipes/{id}",
            get(get_recipe).put(update_recipe).delete(delete_recipe),
        )
        .route(
            "/api/recipes/{id}/ingredients",
            get(list_recipe_ingredients).post(add_recipe_ingredient),
        )
        .route(
            "/api/recipes/{id}/ingredients/{ingredient_id}",
            put(update_recipe_ingredient).delete(remove_recipe_ingredient),
        )
        .route(
            "/api/mealplan",
            get(list_meal_plan).post(create_meal_plan_entry),
        )
        .route(
            "/api/mealplan/{id}",
            get(get_meal_plan_entry)
                .put(update_meal_plan_entry)
                .delete(delete_meal_plan_entry),
        )
        .route("/api/mealplan/{id}/cook", post(cook_meal))
        .route("/api/shopping-list", get(get_shopping_list))
        .route("/api/shopping-list/send", post(send_shopping_list))
        // Older clients post here.
        .route("/api/line/send-shopping-list", post(send_shopping_list))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    config: Config,
    line: LineClient,
    port: u16,
    bind: &str,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        line: Arc::new(line),
        config: Arc::new(config),
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
