mod helpers;
mod inventory;
mod plan;
mod recipe;
mod shopping;

pub(crate) use inventory::{
    IngredientArgs, cmd_inventory_add, cmd_inventory_delete, cmd_inventory_edit,
    cmd_inventory_list, cmd_inventory_show, cmd_inventory_stock,
};
pub(crate) use plan::{
    PlanEdit, cmd_plan_add, cmd_plan_cook, cmd_plan_delete, cmd_plan_edit, cmd_plan_list,
};
pub(crate) use recipe::{
    cmd_recipe_add_ingredient, cmd_recipe_create, cmd_recipe_delete, cmd_recipe_edit,
    cmd_recipe_list, cmd_recipe_remove_ingredient, cmd_recipe_set_quantity, cmd_recipe_show,
};
pub(crate) use shopping::{ShoppingArgs, cmd_shopping_list, cmd_shopping_send};
