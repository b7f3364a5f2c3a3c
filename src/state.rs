//! Per-session build state.
//!
//! One [`BuildState`] lives for one build, add-nodes or destroy call and is
//! shared by every fan-out worker of that call. Errors, warnings, deferred
//! actions and the scratch store sit behind a single mutex; progress
//! counters are atomics.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

type Deferred = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Values passed between build phases.
pub type Scratch = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Scratch entries that can outlive the process: every entry holding a
/// [`serde_json::Value`], in key order.
pub fn portable(scratch: &Scratch) -> BTreeMap<String, Value> {
    scratch
        .iter()
        .filter_map(|(key, value)| {
            value
                .downcast_ref::<Value>()
                .map(|value| (key.clone(), value.clone()))
        })
        .collect()
}

/// Scratch store rebuilt from [`portable`] entries.
pub fn from_portable(values: &BTreeMap<String, Value>) -> Scratch {
    values
        .iter()
        .map(|(key, value)| {
            let value: Arc<dyn Any + Send + Sync> = Arc::new(value.clone());
            (key.clone(), value)
        })
        .collect()
}

/// Compile-time name and type of a scratch entry.
#[derive(Debug)]
pub struct Key<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Default)]
struct Inner {
    stage: String,
    errors: Vec<Arc<Error>>,
    warnings: Vec<String>,
    deferred: Vec<Deferred>,
    scratch: Scratch,
    finalized: bool,
}

pub struct BuildState {
    id: Uuid,
    total: AtomicUsize,
    done: AtomicUsize,
    inner: Mutex<Inner>,
    files: TempDir,
    cancel: CancellationToken,
}

impl BuildState {
    pub fn new(cancel: CancellationToken) -> Result<Arc<Self>> {
        let id = Uuid::new_v4();
        let files = tempfile::Builder::new()
            .prefix(&format!("shipyard-{}-", id))
            .tempdir()?;
        Ok(Arc::new(Self {
            id,
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            inner: Mutex::new(Inner::default()),
            files,
            cancel,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_steps(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Counts one finished step. Never passes the total.
    pub fn increment_progress(&self) {
        let total = self.total.load(Ordering::SeqCst);
        let _ = self
            .done
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |done| {
                (done < total).then_some(done + 1)
            });
    }

    /// `(done, total)`
    pub fn progress(&self) -> (usize, usize) {
        (
            self.done.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        info!("[{}] {}", self.id, stage);
        self.inner().stage = stage;
    }

    pub fn stage(&self) -> String {
        self.inner().stage.clone()
    }

    /// Records an error. The first one decides the outcome of the build;
    /// later ones are kept for the log.
    pub fn report_error(&self, err: Error) -> Arc<Error> {
        error!("[{}] {}", self.id, err);
        let err = Arc::new(err);
        self.inner().errors.push(Arc::clone(&err));
        err
    }

    pub fn report_warning(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("[{}] {}", self.id, msg);
        self.inner().warnings.push(msg);
    }

    pub fn is_error_free(&self) -> bool {
        self.inner().errors.is_empty()
    }

    pub fn get_error(&self) -> Option<Arc<Error>> {
        self.inner().errors.first().cloned()
    }

    pub fn errors(&self) -> Vec<Arc<Error>> {
        self.inner().errors.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.inner().warnings.clone()
    }

    /// Registers a cleanup action for the end of the session.
    pub fn defer<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner();
        if inner.finalized {
            drop(inner);
            warn!("[{}] deferred action registered after finalize, running now", self.id);
            tokio::spawn(action());
            return;
        }
        inner.deferred.push(Box::new(move || action().boxed()));
    }

    /// Runs every deferred action once, in registration order.
    pub async fn finalize(&self) {
        let deferred = {
            let mut inner = self.inner();
            inner.finalized = true;
            std::mem::take(&mut inner.deferred)
        };
        if !deferred.is_empty() {
            debug!("[{}] running {} deferred actions", self.id, deferred.len());
        }
        for action in deferred {
            action().await;
        }
    }

    /// Runs `task` in the background. Its error is reported, its completion
    /// is not awaited by the build.
    pub fn spawn_detached<F>(self: &Arc<Self>, what: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let what = what.into();
        let state = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = task.await {
                state.report_error(Error::Internal(format!("{}: {}", what, err)));
            }
        })
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner().scratch.insert(key.into(), Arc::new(value));
    }

    /// `None` when the key was never stored or holds another type.
    pub fn get<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        let value = self.inner().scratch.get(key).cloned()?;
        value.downcast_ref::<T>().cloned()
    }

    /// Like [`BuildState::get`] for phases that cannot continue without the value.
    pub fn require<T: Any + Clone + Send + Sync>(&self, key: &str) -> Result<T> {
        let value = self
            .inner()
            .scratch
            .get(key)
            .cloned()
            .ok_or_else(|| Error::MissingKey(key.to_string()))?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::ScratchType(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner().scratch.contains_key(key)
    }

    pub fn put<T: Any + Send + Sync>(&self, key: &Key<T>, value: T) {
        self.set(key.name, value);
    }

    pub fn fetch<T: Any + Clone + Send + Sync>(&self, key: &Key<T>) -> Option<T> {
        self.get(key.name)
    }

    pub fn need<T: Any + Clone + Send + Sync>(&self, key: &Key<T>) -> Result<T> {
        self.require(key.name)
    }

    /// Copy of the scratch store, for sessions that continue this one.
    pub fn scratch(&self) -> Scratch {
        self.inner().scratch.clone()
    }

    /// Seeds this session with values from an earlier one. Existing keys win.
    pub fn inherit_scratch(&self, scratch: &Scratch) {
        let mut inner = self.inner();
        for (key, value) in scratch {
            inner
                .scratch
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(value));
        }
    }

    /// Writes `bytes` into the session's temporary directory. The directory
    /// goes away with the session.
    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !plain {
            return Err(Error::validation(format!("invalid temporary file name {:?}", name)));
        }
        let path = self.files.path().join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

impl Drop for BuildState {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !inner.deferred.is_empty() {
            warn!(
                "[{}] dropped with {} deferred actions that never ran",
                self.id,
                inner.deferred.len()
            );
        }
    }
}
