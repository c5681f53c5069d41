//! Match service - turns matchmaking handoffs into running matches

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::MatchConfig;
use crate::game::delta::DeltaStateManager;
use crate::game::{GameMatch, MatchRegistry};
use crate::store::MatchResultSink;

use super::handoff::{HandoffError, MatchHandoff};

/// Creates, registers, spawns and finally removes matches
#[derive(Clone)]
pub struct MatchService {
    registry: Arc<MatchRegistry>,
    deltas: Arc<DeltaStateManager>,
    reporter: Arc<dyn MatchResultSink>,
    config: MatchConfig,
}

impl MatchService {
    pub fn new(
        registry: Arc<MatchRegistry>,
        reporter: Arc<dyn MatchResultSink>,
        config: MatchConfig,
    ) -> Self {
        let deltas = Arc::new(DeltaStateManager::new(config.full_sync_interval_ms));
        Self {
            registry,
            deltas,
            reporter,
            config,
        }
    }

    /// Validate a handoff and start its match loop
    pub fn start_match(&self, handoff: MatchHandoff) -> Result<Uuid, HandoffError> {
        handoff.validate()?;

        let match_id = handoff.match_id.unwrap_or_else(Uuid::new_v4);
        if self.registry.contains(&match_id) {
            return Err(HandoffError::DuplicateMatch(match_id));
        }

        let seed = rand::random::<u64>();
        let (game_match, handle) = GameMatch::new(
            match_id,
            handoff.players(),
            handoff.map,
            self.config.clone(),
            self.deltas.clone(),
            self.reporter.clone(),
            seed,
        );

        // Lost race against a concurrent handoff with the same id
        if !self.registry.insert(handle) {
            return Err(HandoffError::DuplicateMatch(match_id));
        }

        info!(
            match_id = %match_id,
            player1 = %handoff.player1.player_id,
            player2 = %handoff.player2.player_id,
            seed,
            "Created new match"
        );

        let registry = self.registry.clone();
        let deltas = self.deltas.clone();
        tokio::spawn(async move {
            game_match.run().await;

            registry.remove(&match_id);
            deltas.remove_match(&match_id);

            info!(match_id = %match_id, "Match removed from registry");
        });

        Ok(match_id)
    }

    pub fn registry(&self) -> &Arc<MatchRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::collision::{ArenaBounds, MapData};
    use crate::store::LogRatingReporter;
    use crate::ws::protocol::{ClassType, PlayerInfo};

    fn handoff(match_id: Option<Uuid>) -> MatchHandoff {
        let player = |name: &str| PlayerInfo {
            player_id: Uuid::new_v4(),
            username: name.to_string(),
            class_type: ClassType::Archer,
            rating: 1000,
        };
        MatchHandoff {
            match_id,
            player1: player("p1"),
            player2: player("p2"),
            map: MapData {
                walls: vec![],
                bounds: ArenaBounds::new(0.0, 0.0, 20.0, 20.0),
                spawn_points: None,
            },
        }
    }

    fn service() -> MatchService {
        MatchService::new(
            Arc::new(MatchRegistry::new()),
            Arc::new(LogRatingReporter),
            MatchConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_and_stop_match() {
        let service = service();
        let match_id = service.start_match(handoff(None)).unwrap();
        let handle = service.registry().get(&match_id).unwrap();
        assert!(handle.is_active());

        handle.stop();
        for _ in 0..50 {
            if !service.registry().contains(&match_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!service.registry().contains(&match_id));
    }

    #[tokio::test]
    async fn test_duplicate_match_id_rejected() {
        let service = service();
        let id = Uuid::new_v4();
        service.start_match(handoff(Some(id))).unwrap();
        let second = service.start_match(handoff(Some(id)));
        assert!(matches!(second, Err(HandoffError::DuplicateMatch(dup)) if dup == id));
        assert_eq!(service.registry().active_matches(), 1);
        if let Some(handle) = service.registry().get(&id) {
            handle.stop();
        }
    }
}
