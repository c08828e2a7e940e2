//! Agent runtime: one [`AgentPipe`] per configured gateway.

use crate::config::AgentConfig;
use crate::pipe::AgentPipe;
use std::future::Future;
use std::sync::Arc;
use tgram_core::TgramResult;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

pub struct Agent {
    pipes: Vec<Arc<AgentPipe>>,
}

impl Agent {
    /// Bind an endpoint for every configured pipe.
    pub async fn bind(config: AgentConfig) -> TgramResult<Self> {
        let mut pipes = Vec::with_capacity(config.pipes.len());
        for pipe_config in config.pipes {
            pipes.push(Arc::new(AgentPipe::bind(pipe_config).await?));
        }
        Ok(Self { pipes })
    }

    /// The agent's pipes, for inspection while it runs.
    pub fn pipes(&self) -> &[Arc<AgentPipe>] {
        &self.pipes
    }

    /// Run every pipe until `shutdown` completes or one of them fails.
    pub async fn run<F>(self, shutdown: F) -> TgramResult<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = JoinSet::new();
        for pipe in &self.pipes {
            tasks.spawn(pipe.clone().run(shutdown_tx.subscribe()));
        }
        info!(pipes = self.pipes.len(), "agent running");

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "pipe failed");
                        break Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "pipe task ended abnormally");
                        continue;
                    }
                    None => break Ok(()),
                },
            }
        };

        let _ = shutdown_tx.send(());
        while tasks.join_next().await.is_some() {}
        result
    }
}
