use std::sync::Arc;

use bridge_core::Bridge;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) bridge: Arc<Bridge>,
    pub(crate) shared_secret: String,
}
