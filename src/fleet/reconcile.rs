//! Answers to the `need-*` polls of node agents.
//!
//! Level polls report a cookie without touching it. Edge polls consume the
//! cookie they report, so an action is handed to exactly one poll.

use data_model::{EdgeCookie, LevelCookie, NodeKind};
use tracing::debug;

use super::{
    error::{FleetError, Result},
    Cluster,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedQuery {
    Level(LevelCookie),
    Edge(EdgeCookie),
}

impl NeedQuery {
    /// Parses the last path segment of a poll, e.g. `need-config-change`.
    pub fn from_path(segment: &str) -> Result<Self> {
        let query = match segment.strip_prefix("need-") {
            Some("restart") => NeedQuery::Level(LevelCookie::Restart),
            Some("reprov") => NeedQuery::Level(LevelCookie::Reprovision),
            Some("prov") => NeedQuery::Level(LevelCookie::Provision),
            Some("unprov") => NeedQuery::Level(LevelCookie::Unprovision),
            Some("start") => NeedQuery::Edge(EdgeCookie::WaitStart),
            Some("stop") => NeedQuery::Edge(EdgeCookie::WaitStop),
            Some("config-change") => NeedQuery::Edge(EdgeCookie::ConfigChange),
            _ => {
                return Err(FleetError::InvalidRequest(format!(
                    "unknown reconciliation poll: {}",
                    segment
                )))
            }
        };
        Ok(query)
    }

    pub fn action(&self) -> &'static str {
        match self {
            NeedQuery::Level(cookie) => cookie.action(),
            NeedQuery::Edge(cookie) => cookie.action(),
        }
    }
}

/// Cluster-wide polls used to sequence rolling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingQuery {
    Reprov,
    Restart,
}

impl RollingQuery {
    pub fn cookie(&self) -> LevelCookie {
        match self {
            RollingQuery::Reprov => LevelCookie::Reprovision,
            RollingQuery::Restart => LevelCookie::Restart,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            RollingQuery::Reprov => "rolling reprov",
            RollingQuery::Restart => "rolling restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub needs_action: bool,
    pub action: &'static str,
}

impl Reconciliation {
    pub fn message(&self) -> String {
        if self.needs_action {
            format!("Need {}!", self.action)
        } else {
            format!("No {} needed!", self.action)
        }
    }
}

impl Cluster {
    /// Answers a node poll. Servers and proxies are looked up the same way;
    /// `kind` only narrows which registry entries are eligible.
    pub fn poll(&self, kind: NodeKind, node: &str, query: NeedQuery) -> Result<Reconciliation> {
        let target = self.node(node)?;
        if target.kind != kind {
            return Err(FleetError::node_not_found(&self.name, node));
        }
        let needs_action = match query {
            NeedQuery::Level(cookie) => {
                if target.is_down() {
                    return Err(FleetError::NodeUnavailable(target.id.to_string()));
                }
                self.has_cookie(target.id.get(), cookie)?
            }
            NeedQuery::Edge(cookie) => self.consume_edge_cookie(target.id.get(), cookie)?,
        };
        debug!(
            cluster = %self.name,
            node = %target.id,
            action = query.action(),
            needs_action = needs_action,
            "reconciliation poll"
        );
        self.metrics.poll(query.action(), needs_action);
        Ok(Reconciliation {
            needs_action,
            action: query.action(),
        })
    }

    pub fn poll_rolling(&self, query: RollingQuery) -> Reconciliation {
        let needs_action = self.rolling_requested(query.cookie());
        self.metrics.poll(query.action(), needs_action);
        Reconciliation {
            needs_action,
            action: query.action(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use data_model::test_objects::tests::{TEST_CLUSTER, TEST_MASTER, TEST_PROXY, TEST_SLAVE};

    use super::*;
    use crate::fleet::tests::test_cluster;

    #[test]
    fn test_poll_segments() {
        assert_eq!(
            NeedQuery::from_path("need-config-change").unwrap(),
            NeedQuery::Edge(EdgeCookie::ConfigChange)
        );
        assert_eq!(
            NeedQuery::from_path("need-prov").unwrap().action(),
            "provisioning"
        );
        assert!(NeedQuery::from_path("need-coffee").is_err());
        assert!(NeedQuery::from_path("restart").is_err());
    }

    #[test]
    fn test_restart_and_start_polls() {
        let cluster = test_cluster();

        cluster.set_cookie(TEST_MASTER, LevelCookie::Restart).unwrap();
        for _ in 0..3 {
            let reply = cluster
                .poll(
                    NodeKind::Server,
                    TEST_MASTER,
                    NeedQuery::Level(LevelCookie::Restart),
                )
                .unwrap();
            assert!(reply.needs_action);
            assert_eq!(reply.message(), "Need restart!");
        }

        cluster.set_cookie(TEST_MASTER, EdgeCookie::WaitStart).unwrap();
        let start = NeedQuery::Edge(EdgeCookie::WaitStart);
        let first = cluster.poll(NodeKind::Server, TEST_MASTER, start).unwrap();
        assert!(first.needs_action);
        assert_eq!(first.message(), "Need start!");
        let second = cluster.poll(NodeKind::Server, TEST_MASTER, start).unwrap();
        assert!(!second.needs_action);
        assert_eq!(second.message(), "No start needed!");

        cluster
            .clear_level_cookie(TEST_MASTER, LevelCookie::Restart)
            .unwrap();
        let reply = cluster
            .poll(
                NodeKind::Server,
                TEST_MASTER,
                NeedQuery::Level(LevelCookie::Restart),
            )
            .unwrap();
        assert_eq!(reply.message(), "No restart needed!");
    }

    #[test]
    fn test_level_poll_on_down_node() {
        let cluster = test_cluster();
        cluster.set_cookie(TEST_SLAVE, LevelCookie::Reprovision).unwrap();
        cluster.node(TEST_SLAVE).unwrap().set_down(true);

        let err = cluster
            .poll(
                NodeKind::Server,
                TEST_SLAVE,
                NeedQuery::Level(LevelCookie::Reprovision),
            )
            .unwrap_err();
        assert!(matches!(err, FleetError::NodeUnavailable(_)));
        assert!(cluster
            .has_cookie(TEST_SLAVE, LevelCookie::Reprovision)
            .unwrap());
    }

    #[test]
    fn test_proxy_polls() {
        let cluster = test_cluster();
        cluster.set_cookie(TEST_PROXY, EdgeCookie::WaitStop).unwrap();

        let stop = NeedQuery::Edge(EdgeCookie::WaitStop);
        // a proxy is not reachable through the server routes
        assert!(cluster.poll(NodeKind::Server, TEST_PROXY, stop).is_err());
        assert!(cluster.poll(NodeKind::Proxy, TEST_PROXY, stop).unwrap().needs_action);
        assert!(!cluster.poll(NodeKind::Proxy, TEST_PROXY, stop).unwrap().needs_action);
    }

    #[test]
    fn test_rolling_aggregate() {
        let cluster = test_cluster();
        let reply = cluster.poll_rolling(RollingQuery::Reprov);
        assert_eq!(reply.message(), "No rolling reprov needed!");

        cluster.set_cookie(TEST_SLAVE, LevelCookie::Reprovision).unwrap();
        assert!(cluster.poll_rolling(RollingQuery::Reprov).needs_action);
        assert!(!cluster.poll_rolling(RollingQuery::Restart).needs_action);
        // polling is not a mutation
        assert!(cluster.poll_rolling(RollingQuery::Reprov).needs_action);

        cluster
            .clear_level_cookie(TEST_SLAVE, LevelCookie::Reprovision)
            .unwrap();
        assert!(!cluster.poll_rolling(RollingQuery::Reprov).needs_action);
    }

    #[test]
    fn test_concurrent_start_polls_hand_out_one_start() {
        let cluster = Arc::new(test_cluster());
        cluster.set_cookie(TEST_MASTER, EdgeCookie::WaitStart).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cluster = cluster.clone();
                std::thread::spawn(move || {
                    cluster
                        .poll(
                            NodeKind::Server,
                            TEST_MASTER,
                            NeedQuery::Edge(EdgeCookie::WaitStart),
                        )
                        .unwrap()
                        .needs_action
                })
            })
            .collect();
        let started = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|needs| *needs)
            .count();
        assert_eq!(started, 1);
    }

    #[test]
    fn test_unknown_node_and_cluster() {
        let cluster = test_cluster();
        let err = cluster
            .poll(
                NodeKind::Server,
                "db9:3306",
                NeedQuery::Edge(EdgeCookie::WaitStart),
            )
            .unwrap_err();
        match err {
            FleetError::NodeNotFound { cluster, node } => {
                assert_eq!(cluster, TEST_CLUSTER);
                assert_eq!(node, "db9:3306");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
