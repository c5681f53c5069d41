//! Application state shared across routes

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::game::MatchRegistry;
use crate::matchmaking::MatchService;
use crate::store::{HttpRatingReporter, LogRatingReporter, MatchResultSink};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub match_registry: Arc<MatchRegistry>,
    pub match_service: MatchService,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let reporter: Arc<dyn MatchResultSink> = match &config.rating_service_url {
            Some(url) => {
                info!(url = %url, "Match outcomes will be posted to rating service");
                Arc::new(HttpRatingReporter::new(url.clone()))
            }
            None => Arc::new(LogRatingReporter),
        };

        let match_registry = Arc::new(MatchRegistry::new());
        let match_service = MatchService::new(match_registry.clone(), reporter, config.match_config.clone());

        Self {
            config,
            match_registry,
            match_service,
        }
    }
}
