//! Engine router and builder
//!
//! The engine is the unified entry point: a thin router that owns an
//! ordered vector of partitions and a routing strategy. It never touches
//! business state itself; `submit` hashes the command's routing key to a
//! partition and publishes into that partition's ring queue.
//!
//! Construction goes through the [`Builder`], which validates that the
//! three required collaborators (processor, persister, bootstrap) are
//! present before any thread or file is created.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::api::{Bootstrap, Persister, Processor};
use crate::codec::CommandCodec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyFilter;
use crate::metrics::Metrics;
use crate::partition::{Partition, PartitionContext, PartitionStatus};
use crate::routing::RoutingStrategy;
use crate::types::{Command, CommandHandle, Completion, Entity, State};

/// Partitioned single-writer ledger engine.
///
/// Same-key commands always land on the same partition and are therefore
/// totally ordered; commands for different keys may interleave arbitrarily.
pub struct Engine<S: State, C: Command, E: Entity> {
    config: Config,
    routing: RoutingStrategy,
    partitions: Vec<Partition<S, C, E>>,
    ctx: PartitionContext<S, C, E>,
    bootstrap: Arc<dyn Bootstrap<S, C>>,
    started: bool,
}

impl<S: State, C: Command, E: Entity> Engine<S, C, E> {
    /// Start all partitions, running recovery serially.
    ///
    /// Fails if any partition cannot recover; a partially-replayed engine
    /// must not serve traffic.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        info!(
            engine = %self.config.engine_name,
            partitions = self.config.partitions,
            routing = self.routing.name(),
            filter = self.ctx.filter_prototype.name(),
            "starting engine"
        );
        for index in 0..self.config.partitions {
            match Partition::start(index, &self.config, &self.ctx, self.bootstrap.initial_state())
            {
                Ok(partition) => self.partitions.push(partition),
                Err(e) => {
                    error!(
                        engine = %self.config.engine_name,
                        partition = index,
                        error = %e,
                        "partition failed to start, stopping the rest"
                    );
                    self.shutdown_partitions();
                    return Err(e);
                }
            }
        }
        self.started = true;
        info!(engine = %self.config.engine_name, "engine started, all partitions ready");
        Ok(())
    }

    /// Route and submit a command, returning a completion handle.
    ///
    /// Blocks while the target partition's ring queue is full. The handle
    /// resolves once the partition has durably logged and applied the
    /// command, or rejected it.
    pub fn submit(&self, command: C) -> Result<CommandHandle> {
        let (completion, handle) = Completion::pair();
        self.dispatch(command, Some(completion))?;
        Ok(handle)
    }

    /// Fire-and-forget submit: maximum throughput, failures are logged
    /// instead of reported.
    pub fn submit_forget(&self, command: C) -> Result<()> {
        self.dispatch(command, None)
    }

    fn dispatch(&self, command: C, completion: Option<Completion>) -> Result<()> {
        if !self.started {
            return Err(Error::Closed("engine not started".to_string()));
        }
        let key = command.routing_key().to_string();

        // Cluster-level self-check: an external router should never have
        // sent us a key another node owns
        let cluster = &self.config.cluster;
        if cluster.total_nodes > 1 {
            let target = self.routing.partition_of(&key, cluster.total_nodes);
            if target != cluster.node_id {
                return Err(Error::Routing(format!(
                    "key '{}' belongs to node {} but this is node {}",
                    key, target, cluster.node_id
                )));
            }
        }

        let index = self.routing.partition_of(&key, self.partitions.len());
        self.partitions[index].submit(command, completion)
    }

    /// Run `f` against the state owned by `routing_key`'s partition.
    ///
    /// The view is point-in-time consistent for that partition only;
    /// cross-partition reads have no transactional consistency.
    pub fn query_with<R>(&self, routing_key: &str, f: impl FnOnce(&S) -> R) -> Result<R> {
        if !self.started {
            return Err(Error::Closed("engine not started".to_string()));
        }
        let index = self.routing.partition_of(routing_key, self.partitions.len());
        Ok(self.partitions[index].query_with(f))
    }

    /// Partition index `routing_key` maps to.
    #[must_use]
    pub fn partition_of(&self, routing_key: &str) -> usize {
        self.routing.partition_of(routing_key, self.config.partitions)
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.config.partitions
    }

    /// Lifecycle state of partition `index`.
    pub fn partition_status(&self, index: usize) -> Option<PartitionStatus> {
        self.partitions.get(index).map(|p| p.status())
    }

    /// Metrics registry for exposition by the host.
    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Graceful shutdown: partitions stop serially so data lands safely
    /// and logs stay readable; a failing partition is logged and the rest
    /// still stop.
    pub fn shutdown(&mut self) {
        if self.partitions.is_empty() {
            return;
        }
        info!(engine = %self.config.engine_name, "stopping engine");
        self.shutdown_partitions();
        self.started = false;
        info!(engine = %self.config.engine_name, "engine stopped");
    }

    fn shutdown_partitions(&mut self) {
        for partition in &mut self.partitions {
            if let Err(e) = partition.shutdown() {
                error!(partition = partition.name(), error = %e, "partition shutdown failed");
            }
        }
        self.partitions.clear();
    }
}

impl<S: State, C: Command, E: Entity> Drop for Engine<S, C, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Validated, explicit wiring for an [`Engine`].
///
/// ```no_run
/// # use ledger_engine::{Builder, CommandCodec, Config, Result};
/// # use ledger_engine::support::KeyedLongState;
/// # use serde::{Deserialize, Serialize};
/// #[derive(Serialize, Deserialize)]
/// struct Credit { tx: String, account: String, amount: i64 }
///
/// impl ledger_engine::Command for Credit {
///     fn tx_id(&self) -> &str { &self.tx }
///     fn routing_key(&self) -> &str { &self.account }
///     fn type_key(&self) -> &str { "credit" }
/// }
///
/// # fn main() -> Result<()> {
/// let mut engine = Builder::new(Config::default())
///     .processor(|state: &mut KeyedLongState, cmd: &Credit| -> Result<Option<i64>> {
///         state.add(&cmd.account, cmd.amount);
///         Ok(Some(cmd.amount))
///     })
///     .persister(|_batch: &[i64]| -> Result<()> { Ok(()) })
///     .bootstrap(KeyedLongState::default, || CommandCodec::bincode("credit"))
///     .build()?;
/// engine.start()?;
/// # Ok(())
/// # }
/// ```
pub struct Builder<S: State, C: Command, E: Entity> {
    config: Config,
    processor: Option<Arc<dyn Processor<S, C, E>>>,
    persister: Option<Arc<dyn Persister<E>>>,
    bootstrap: Option<Arc<dyn Bootstrap<S, C>>>,
    filter: Option<IdempotencyFilter>,
    routing: Option<RoutingStrategy>,
}

impl<S: State, C: Command, E: Entity> Builder<S, C, E> {
    /// Builder over `config`.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            processor: None,
            persister: None,
            bootstrap: None,
            filter: None,
            routing: None,
        }
    }

    /// Business logic processor (required).
    pub fn processor(mut self, processor: impl Processor<S, C, E>) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Persistence sink (required).
    pub fn persister(mut self, persister: impl Persister<E>) -> Self {
        self.persister = Some(Arc::new(persister));
        self
    }

    /// Cold-start state factory and WAL codec (required).
    ///
    /// For full control implement [`Bootstrap`] and use
    /// [`bootstrap_with`](Self::bootstrap_with).
    pub fn bootstrap(
        self,
        initial_state: impl Fn() -> S + Send + Sync + 'static,
        codec: impl Fn() -> CommandCodec<C> + Send + Sync + 'static,
    ) -> Self {
        self.bootstrap_with(FnBootstrap {
            initial_state,
            codec,
        })
    }

    /// Cold-start wiring via a [`Bootstrap`] implementation (required
    /// unless [`bootstrap`](Self::bootstrap) is used).
    pub fn bootstrap_with(mut self, bootstrap: impl Bootstrap<S, C>) -> Self {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    /// Override the configured idempotency filter with a pre-built
    /// prototype (cloned into each partition).
    pub fn idempotency(mut self, filter: IdempotencyFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Override the configured routing strategy.
    pub fn routing(mut self, strategy: RoutingStrategy) -> Self {
        self.routing = Some(strategy);
        self
    }

    /// Validate the wiring and assemble the engine. No partition starts
    /// until [`Engine::start`] is called.
    pub fn build(self) -> Result<Engine<S, C, E>> {
        self.config.validate()?;
        let processor = self.processor.ok_or_else(|| {
            Error::Initialization("processor is required".to_string())
        })?;
        let persister = self.persister.ok_or_else(|| {
            Error::Initialization("persister is required".to_string())
        })?;
        let bootstrap = self.bootstrap.ok_or_else(|| {
            Error::Initialization("bootstrap is required".to_string())
        })?;

        let routing = self
            .routing
            .unwrap_or_else(|| RoutingStrategy::from(self.config.routing));
        let filter_prototype = self.filter.unwrap_or_else(|| {
            IdempotencyFilter::from_config(self.config.idempotency, &self.config.filter)
        });

        if self.config.cluster.total_nodes > 1 && routing == RoutingStrategy::Modulo {
            warn!(
                "cluster mode with modulo routing: resizing the cluster will migrate \
                 almost every key; rendezvous is strongly recommended"
            );
        }

        let metrics = Metrics::new(&self.config.metrics_prefix)?;
        let codec = Arc::new(bootstrap.codec());

        Ok(Engine {
            config: self.config,
            routing,
            partitions: Vec::new(),
            ctx: PartitionContext {
                processor,
                persister,
                codec,
                filter_prototype,
                metrics,
            },
            bootstrap,
            started: false,
        })
    }
}

struct FnBootstrap<FS, FC> {
    initial_state: FS,
    codec: FC,
}

impl<S, C, FS, FC> Bootstrap<S, C> for FnBootstrap<FS, FC>
where
    S: State,
    C: Command,
    FS: Fn() -> S + Send + Sync + 'static,
    FC: Fn() -> CommandCodec<C> + Send + Sync + 'static,
{
    fn initial_state(&self) -> S {
        (self.initial_state)()
    }

    fn codec(&self) -> CommandCodec<C> {
        (self.codec)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::KeyedLongState;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credit {
        tx: String,
        account: String,
        amount: i64,
    }

    impl Command for Credit {
        fn tx_id(&self) -> &str {
            &self.tx
        }
        fn routing_key(&self) -> &str {
            &self.account
        }
        fn type_key(&self) -> &str {
            "credit"
        }
    }

    fn builder(config: Config) -> Builder<KeyedLongState, Credit, i64> {
        Builder::new(config)
            .processor(
                |state: &mut KeyedLongState, cmd: &Credit| -> Result<Option<i64>> {
                    state.add(&cmd.account, cmd.amount);
                    Ok(Some(cmd.amount))
                },
            )
            .persister(|_batch: &[i64]| -> Result<()> { Ok(()) })
            .bootstrap(KeyedLongState::default, || CommandCodec::bincode("credit"))
    }

    #[test]
    fn test_build_requires_processor() {
        let result: Result<Engine<KeyedLongState, Credit, i64>> = Builder::new(Config::default())
            .persister(|_batch: &[i64]| -> Result<()> { Ok(()) })
            .bootstrap(KeyedLongState::default, || CommandCodec::bincode("credit"))
            .build();
        assert!(matches!(result, Err(Error::Initialization(_))));
    }

    #[test]
    fn test_build_requires_persister() {
        let result: Result<Engine<KeyedLongState, Credit, i64>> = Builder::new(Config::default())
            .processor(
                |state: &mut KeyedLongState, cmd: &Credit| -> Result<Option<i64>> {
                    state.add(&cmd.account, cmd.amount);
                    Ok(None)
                },
            )
            .bootstrap(KeyedLongState::default, || CommandCodec::bincode("credit"))
            .build();
        assert!(matches!(result, Err(Error::Initialization(_))));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.partitions = 0;
        assert!(matches!(
            builder(config).build(),
            Err(Error::Initialization(_))
        ));
    }

    #[test]
    fn test_submit_before_start_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        let engine = builder(config).build().unwrap();
        let result = engine.submit(Credit {
            tx: "tx-1".into(),
            account: "u1".into(),
            amount: 1,
        });
        assert!(matches!(result, Err(Error::Closed(_))));
    }

    #[test]
    fn test_cluster_routing_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        config.cluster.total_nodes = 4;
        config.cluster.node_id = 0;
        let mut engine = builder(config).build().unwrap();
        engine.start().unwrap();

        // Find a key another node owns and verify the submit is rejected
        let routing = RoutingStrategy::Rendezvous;
        let foreign = (0..1000)
            .map(|i| format!("user-{}", i))
            .find(|k| routing.partition_of(k, 4) != 0)
            .unwrap();
        let result = engine.submit(Credit {
            tx: "tx-1".into(),
            account: foreign,
            amount: 1,
        });
        assert!(matches!(result, Err(Error::Routing(_))));
        engine.shutdown();
    }
}
