// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::api::ApiError;
use crate::context::AppContext;
use axum::{
    extract::{Path, State},
    Json,
};
use routerbox_core::{ModelConfig, ModelEntry, ModelList};

fn entry(model: &ModelConfig) -> ModelEntry {
    ModelEntry {
        id: model.full_id.clone(),
        object: "model".to_string(),
        created: model.loaded_at.timestamp(),
        owned_by: model.provider.as_str().to_string(),
    }
}

/// GET /models - enabled models, sorted by id
pub async fn list_models(State(ctx): State<AppContext>) -> Json<ModelList> {
    let data = ctx.store.get_all_models().iter().map(|m| entry(m)).collect();
    Json(ModelList::new(data))
}

/// GET /models/:provider/:id
pub async fn get_model(
    State(ctx): State<AppContext>,
    Path((provider, id)): Path<(String, String)>,
) -> Result<Json<ModelEntry>, ApiError> {
    let model = ctx.router.resolve_model(&format!("{}/{}", provider, id))?;
    Ok(Json(entry(&model)))
}
