/// Ordered query pipeline
///
/// A query flows through a fixed chain of stages before it reaches the
/// executor (the connection pool). Each stage receives a [`Next`] handle for
/// the remainder of the chain and decides whether, and how often, to call it.
pub mod stages;

pub use stages::{BreakerStage, ChaosStage, RetryStage, TracingStage};

use crate::core::{QueryParam, Rows};
use crate::error::PuenteResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// One query on its way to a logical connection
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub connection_id: String,
    pub sql: String,
    pub params: Vec<QueryParam>,
    /// Failover group the connection was resolved from, if any
    pub group_id: Option<String>,
}

impl QueryContext {
    pub fn new(connection_id: impl Into<String>, sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            connection_id: connection_id.into(),
            sql: sql.into(),
            params,
            group_id: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// Terminal step that actually runs a query
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &QueryContext) -> PuenteResult<Rows>;
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &QueryContext, next: Next<'_>) -> PuenteResult<Rows>;
}

/// The rest of the chain after the current stage
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    executor: &'a dyn Executor,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: &'a QueryContext) -> BoxFuture<'a, PuenteResult<Rows>> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(
                ctx,
                Next {
                    stages: rest,
                    executor: self.executor,
                },
            ),
            None => self.executor.execute(ctx),
        }
    }
}

#[derive(Default, Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; stages run in the order they are added
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, executor: &dyn Executor, ctx: &QueryContext) -> PuenteResult<Rows> {
        Next {
            stages: &self.stages,
            executor,
        }
        .run(ctx)
        .await
    }
}
