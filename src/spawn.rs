//! Detached task spawning over any executor

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use executor_core::{Executor, Task};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Spawns independent, detached tasks
///
/// Wraps an [`Executor`] so the bridge can be embedded in a tokio host as
/// well as a smol one. Every spawned task runs to completion on its own.
#[derive(Clone)]
pub struct Spawner {
    spawn: Arc<dyn Fn(BoxFuture) + Send + Sync>,
}

impl Spawner {
    /// Spawn onto the given executor
    pub fn new<E: Executor + Send + Sync + 'static>(executor: E) -> Self {
        Self {
            spawn: Arc::new(move |future| executor.spawn(future).detach()),
        }
    }

    /// Spawn onto smol's global executor
    pub fn global() -> Self {
        Self {
            spawn: Arc::new(|future| smol::spawn(future).detach()),
        }
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        (self.spawn)(Box::pin(future));
    }
}

impl Default for Spawner {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for Spawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawner").finish_non_exhaustive()
    }
}
