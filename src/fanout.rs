//! Bounded-concurrency fan-out.
//!
//! Every call runs one task per item with at most `limit` of them active.
//! A failing item does not stop its siblings: the call waits for all of
//! them and then reports what failed.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use log::debug;
use tokio::sync::Semaphore;

use crate::error::{Error, Failure, Result};
use crate::state::BuildState;
use crate::types::{Node, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    /// Failures are build errors.
    Error,
    /// Failures are recorded as warnings only.
    Warning,
}

#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    limit: usize,
}

impl FanOut {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn for_each_node<F, Fut>(
        &self,
        state: &Arc<BuildState>,
        what: &str,
        nodes: &[Node],
        f: F,
    ) -> Result<()>
    where
        F: Fn(Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.for_each(state, what, nodes.to_vec(), f).await
    }

    pub async fn for_each_server<F, Fut>(
        &self,
        state: &Arc<BuildState>,
        what: &str,
        servers: &[Server],
        f: F,
    ) -> Result<()>
    where
        F: Fn(Server) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.for_each(state, what, servers.to_vec(), f).await
    }

    /// Runs `f` once per item. Failures are reported to `state` and returned
    /// together as [`Error::FanOut`] once every item has finished.
    pub async fn for_each<T, F, Fut>(
        &self,
        state: &Arc<BuildState>,
        what: &str,
        items: Vec<T>,
        f: F,
    ) -> Result<()>
    where
        T: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let failures = self.run(state, items, f, Severity::Error).await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::FanOut {
                what: what.to_string(),
                failures,
            })
        }
    }

    /// Like [`FanOut::for_each`] for steps that must not fail the build:
    /// failures become warnings and are handed back.
    pub async fn for_each_best_effort<T, F, Fut>(
        &self,
        state: &Arc<BuildState>,
        what: &str,
        items: Vec<T>,
        f: F,
    ) -> Vec<Failure>
    where
        T: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        debug!("best-effort fan-out: {}", what);
        self.run(state, items, f, Severity::Warning).await
    }

    async fn run<T, F, Fut>(
        &self,
        state: &Arc<BuildState>,
        items: Vec<T>,
        f: F,
        severity: Severity,
    ) -> Vec<Failure>
    where
        T: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let f = Arc::new(f);

        let mut labels = Vec::with_capacity(items.len());
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            labels.push(item.to_string());
            let semaphore = Arc::clone(&semaphore);
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                (*f)(item).await
            }));
        }

        let mut failures = Vec::new();
        for (label, joined) in labels.into_iter().zip(join_all(handles).await) {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => Error::Internal(format!("worker panicked: {}", join_err)),
            };
            let failure = Failure {
                target: label.clone(),
                message: err.to_string(),
            };
            match severity {
                Severity::Error => {
                    state.report_error(Error::Target {
                        target: label,
                        source: Box::new(err),
                    });
                }
                Severity::Warning => state.report_warning(failure.to_string()),
            }
            failures.push(failure);
        }
        failures
    }
}
