use std::sync::Arc;

use crate::engine::OpsEngine;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OpsEngine>,
}
