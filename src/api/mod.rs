pub mod helpers;
pub mod info;
pub mod lfs;
pub mod likes;
pub mod repos;
pub mod resolve;
pub mod tree;
pub mod upload;

use axum::Router;

use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(crate::auth::router::router())
        .merge(repos::router())
        .merge(info::router())
        .merge(tree::router())
        .merge(upload::router())
        .merge(likes::router())
        .merge(resolve::router())
        .merge(lfs::router())
        .merge(crate::git::smart_http::router())
}
