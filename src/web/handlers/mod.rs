use axum::Router;
use std::sync::Arc;

use crate::AppContext;

pub mod tasks;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new().nest("/image", tasks::task_router(ctx))
}
