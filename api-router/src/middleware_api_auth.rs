use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use common::storage::types::user::User;

use crate::{api_state::ApiState, error::ApiError};

/// Caller identity resolved from the request headers. Anonymous callers carry `None`.
#[derive(Clone, Debug, Default)]
pub struct Identity(pub Option<User>);

impl Identity {
    pub fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }

    pub fn required(self) -> Result<User, ApiError> {
        self.0
            .ok_or_else(|| ApiError::Unauthorized("You have to be authenticated".to_string()))
    }
}

/// Resolves an optional API key. A key that matches no user is rejected.
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = match extract_api_key(&request) {
        Some(api_key) => {
            let user = User::find_by_api_key(&api_key, &state.db)
                .await?
                .ok_or_else(|| ApiError::Unauthorized("Invalid API key".to_string()))?;
            User::touch_last_used(Arc::clone(&state.db), user.id.clone());
            Identity(Some(user))
        }
        None => Identity(None),
    };

    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        })
        .filter(|key| !key.is_empty())
        .map(String::from)
}
