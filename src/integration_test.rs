#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use data_model::{
        test_objects::tests::{
            test_node_id,
            TEST_CLUSTER,
            TEST_MASTER,
            TEST_PROXY,
            TEST_SLAVE,
        },
        EdgeCookie,
        JobCategory,
        JobState,
        LevelCookie,
        NodeId,
        NodeKind,
        NodeRole,
    };

    use crate::{
        config::{JobsConfig, ServerConfig},
        fleet::{
            error::FleetError,
            job_plan::{CommandStep, JobAction},
            log_relay::{LogRelay, Sha256KeyDerivation},
            node::{NodeSecret, NodeSpec},
            reconcile::{NeedQuery, RollingQuery},
            switchover::{InterlockState, StaticTopology, TopologyMonitor},
            Cluster,
            ClusterSettings,
            Fleet,
        },
        metrics::FleetMetrics,
        service::Service,
        testing::{self, TestService},
    };

    #[tokio::test]
    async fn test_cookies_survive_restart() -> Result<()> {
        let test_srv = TestService::new().await?;
        let cluster = test_srv.service.fleet.cluster(TEST_CLUSTER)?;
        cluster.set_cookie(TEST_MASTER, LevelCookie::Reprovision)?;
        cluster.set_cookie(TEST_SLAVE, EdgeCookie::WaitStart)?;
        cluster.set_cookie(TEST_SLAVE, EdgeCookie::ConfigChange)?;
        assert!(cluster.consume_edge_cookie(TEST_SLAVE, EdgeCookie::ConfigChange)?);

        let restarted = Service::new(test_srv.service.config.clone()).await?;
        let cluster = restarted.fleet.cluster(TEST_CLUSTER)?;
        assert!(cluster.has_cookie(TEST_MASTER, LevelCookie::Reprovision)?);
        assert!(cluster.consume_edge_cookie(TEST_SLAVE, EdgeCookie::WaitStart)?);
        assert!(!cluster.consume_edge_cookie(TEST_SLAVE, EdgeCookie::ConfigChange)?);
        assert!(cluster.node(TEST_PROXY)?.cookies.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_log_relay() -> Result<()> {
        let test_srv = TestService::new().await?;
        let fleet = &test_srv.service.fleet;

        let fragment = testing::agent_log_fragment("copying ./ibdata1\n\ncompleted OK!\n");
        assert_eq!(
            fleet.submit_log(TEST_CLUSTER, TEST_MASTER, "xtrabackup", &fragment)?,
            2
        );
        let fragment = testing::agent_log_fragment("optimizing table t1");
        fleet.submit_log(TEST_CLUSTER, TEST_MASTER, "optimize", &fragment)?;

        let cluster = fleet.cluster(TEST_CLUSTER)?;
        let backup = cluster.read_log(TEST_MASTER, JobCategory::BackupStream, 10)?;
        let lines: Vec<_> = backup.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["copying ./ibdata1", "completed OK!"]);
        assert!(backup.iter().all(|l| l.task == "xtrabackup"));
        assert_eq!(cluster.read_log(TEST_MASTER, JobCategory::Task, 10)?.len(), 1);

        let err = fleet
            .submit_log(TEST_CLUSTER, TEST_MASTER, "sqlinjection", &fragment)
            .unwrap_err();
        assert!(matches!(err, FleetError::UnregisteredTask(_)));

        let mut tampered = testing::agent_log_fragment("forged");
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let err = fleet
            .submit_log(TEST_CLUSTER, TEST_MASTER, "optimize", &tampered)
            .unwrap_err();
        assert!(matches!(err, FleetError::DecryptionFailed { .. }));
        assert_eq!(cluster.read_log(TEST_MASTER, JobCategory::Task, 10)?.len(), 1);

        // logs are relayed for database servers only
        let err = fleet
            .submit_log(TEST_CLUSTER, TEST_PROXY, "optimize", &fragment)
            .unwrap_err();
        assert!(err.is_lookup_failure());
        Ok(())
    }

    #[tokio::test]
    async fn test_rolling_restart() -> Result<()> {
        let test_srv = TestService::new().await?;
        let cluster = test_srv.service.fleet.cluster(TEST_CLUSTER)?;
        assert!(!cluster.poll_rolling(RollingQuery::Restart).needs_action);

        cluster.set_cookie_on_all(LevelCookie::Restart);
        for (kind, node) in [
            (NodeKind::Server, TEST_SLAVE),
            (NodeKind::Proxy, TEST_PROXY),
            (NodeKind::Server, TEST_MASTER),
        ] {
            assert!(cluster.poll_rolling(RollingQuery::Restart).needs_action);
            let reply = cluster.poll(kind, node, NeedQuery::Level(LevelCookie::Restart))?;
            assert_eq!(reply.message(), "Need restart!");
            // the agent restarted the node, the operator confirms it
            cluster.clear_level_cookie(node, LevelCookie::Restart)?;
            let reply = cluster.poll(kind, node, NeedQuery::Level(LevelCookie::Restart))?;
            assert_eq!(reply.message(), "No restart needed!");
        }
        let reply = cluster.poll_rolling(RollingQuery::Restart);
        assert!(!reply.needs_action);
        assert_eq!(reply.message(), "No rolling restart needed!");
        Ok(())
    }

    #[tokio::test]
    async fn test_switchover_then_failover() -> Result<()> {
        let test_srv = TestService::new().await?;
        let cluster = test_srv.service.fleet.cluster(TEST_CLUSTER)?;
        assert_eq!(cluster.master(), Some(test_node_id(TEST_MASTER)));

        let master = cluster.switchover(None).await?;
        assert_eq!(master, test_node_id(TEST_SLAVE));
        assert_eq!(cluster.server(TEST_MASTER)?.role(), NodeRole::Slave);
        assert_eq!(cluster.preferred_masters(), vec![test_node_id(TEST_SLAVE)]);
        assert_eq!(cluster.interlock_state(), InterlockState::Stable);

        // the new master goes away, a switchover is refused
        cluster.server(TEST_SLAVE)?.set_down(true);
        let err = cluster.switchover(Some(TEST_MASTER)).await.unwrap_err();
        assert!(matches!(err, FleetError::MasterAlreadyFailed(_)));

        let master = cluster.failover().await?;
        assert_eq!(master, test_node_id(TEST_MASTER));
        assert_eq!(cluster.server(TEST_SLAVE)?.role(), NodeRole::Failed);
        assert_eq!(cluster.master(), Some(test_node_id(TEST_MASTER)));
        Ok(())
    }

    /// Topology whose promotions are always refused by the candidate.
    struct RefusingTopology {
        inner: StaticTopology,
        preferred_during_failover: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl TopologyMonitor for RefusingTopology {
        fn is_master_failed(&self) -> bool {
            self.inner.is_master_failed()
        }

        fn master(&self) -> Option<NodeId> {
            self.inner.master()
        }

        fn preferred_masters(&self) -> Vec<NodeId> {
            self.inner.preferred_masters()
        }

        fn set_preferred_masters(&self, nodes: Vec<NodeId>) {
            self.inner.set_preferred_masters(nodes)
        }

        async fn master_failover(&self, _forced: bool) -> anyhow::Result<NodeId> {
            *self.preferred_during_failover.lock().unwrap() = self.preferred_masters();
            Err(anyhow!("replication is lagging, promotion refused"))
        }
    }

    #[tokio::test]
    async fn test_failed_switchover_restores_preferred_masters() -> Result<()> {
        let metrics = Arc::new(FleetMetrics::new());
        let fleet = Fleet::new(LogRelay::new(Arc::new(Sha256KeyDerivation), metrics.clone()));
        let cluster = Cluster::new(
            TEST_CLUSTER,
            vec![],
            ClusterSettings {
                log_capacity: 10,
                ..Default::default()
            },
            metrics,
        );
        let topology = Arc::new(RefusingTopology {
            inner: StaticTopology::new(cluster.nodes.clone(), vec![test_node_id(TEST_MASTER)]),
            preferred_during_failover: Mutex::new(vec![]),
        });
        let cluster = cluster.with_topology(topology.clone());
        for (url, role) in [(TEST_MASTER, NodeRole::Master), (TEST_SLAVE, NodeRole::Slave)] {
            cluster.add_node(
                NodeKind::Server,
                &NodeSpec {
                    url: url.to_string(),
                    name: None,
                    role,
                    secret: NodeSecret::new("pw"),
                },
            )?;
        }
        let cluster = fleet.add_cluster(cluster)?;

        let err = cluster.switchover(Some(TEST_SLAVE)).await.unwrap_err();
        assert!(matches!(err, FleetError::Failover(_)));
        assert_eq!(
            *topology.preferred_during_failover.lock().unwrap(),
            vec![test_node_id(TEST_SLAVE)]
        );
        assert_eq!(cluster.preferred_masters(), vec![test_node_id(TEST_MASTER)]);
        assert_eq!(cluster.interlock_state(), InterlockState::Stable);
        assert_eq!(cluster.master(), Some(test_node_id(TEST_MASTER)));
        Ok(())
    }

    async fn wait_for_job(cluster: &Cluster, node: &str, task: &str) -> JobState {
        for _ in 0..500 {
            if let Some(job) = cluster.server(node).unwrap().jobs.status(task) {
                if job.state.is_terminal() {
                    return job.state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", task);
    }

    #[tokio::test]
    async fn test_job_lifecycle() -> Result<()> {
        let cfg = ServerConfig {
            jobs: JobsConfig {
                plans: HashMap::from([(
                    "optimize".to_string(),
                    vec![CommandStep {
                        program: "sleep".to_string(),
                        args: vec!["30".to_string()],
                    }],
                )]),
                ..Default::default()
            },
            ..Default::default()
        };
        let test_srv = TestService::with_config(cfg).await?;
        let cluster = test_srv.service.fleet.cluster(TEST_CLUSTER)?;

        let job = cluster.start_job(TEST_MASTER, JobAction::Optimize)?;
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.category, JobCategory::Task);
        let err = cluster
            .start_job(TEST_MASTER, JobAction::Optimize)
            .unwrap_err();
        assert!(matches!(err, FleetError::DuplicateJob { .. }));

        // no local plan: the job completes once delegated to the agent
        cluster.start_job(TEST_MASTER, JobAction::BackupErrorLog)?;
        assert_eq!(
            wait_for_job(&cluster, TEST_MASTER, "error").await,
            JobState::Completed
        );

        cluster.kill_job(TEST_MASTER, "optimize")?;
        assert_eq!(
            wait_for_job(&cluster, TEST_MASTER, "optimize").await,
            JobState::Failed
        );
        let master = cluster.server(TEST_MASTER)?;
        assert!(master.jobs.drain("optimize").is_some());
        assert!(master.jobs.status("optimize").is_none());
        assert!(matches!(
            cluster.start_job(TEST_PROXY, JobAction::Optimize),
            Err(FleetError::NodeNotFound { .. })
        ));
        Ok(())
    }
}
