// Copyright 2026 cowspace Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    future::Future,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use tokio::{runtime::Handle, task::JoinHandle};

use crate::error::{Error, ErrorKind, Result};

/// A wrapper around [`tokio::runtime::Runtime`] that shuts down the runtime in the background when dropped.
///
/// This is necessary because directly dropping a nested runtime is not allowed in a parent runtime.
pub struct BackgroundShutdownRuntime(ManuallyDrop<tokio::runtime::Runtime>);

impl Debug for BackgroundShutdownRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackgroundShutdownRuntime").finish()
    }
}

impl Drop for BackgroundShutdownRuntime {
    fn drop(&mut self) {
        // Safety: The runtime is only dropped once here.
        let runtime = unsafe { ManuallyDrop::take(&mut self.0) };
        runtime.shutdown_background();
    }
}

impl Deref for BackgroundShutdownRuntime {
    type Target = tokio::runtime::Runtime;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BackgroundShutdownRuntime {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<tokio::runtime::Runtime> for BackgroundShutdownRuntime {
    fn from(runtime: tokio::runtime::Runtime) -> Self {
        Self(ManuallyDrop::new(runtime))
    }
}

/// A non-clonable runtime handle.
#[derive(Debug)]
pub struct SingletonHandle(Handle);

impl From<Handle> for SingletonHandle {
    fn from(handle: Handle) -> Self {
        Self(handle)
    }
}

impl SingletonHandle {
    /// Spawns a future onto the Tokio runtime.
    ///
    /// The provided future will start running in the background immediately when `spawn` is called, even if you
    /// don't await the returned `JoinHandle`.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.0.spawn(future)
    }
}

#[derive(Debug)]
struct RuntimeInner {
    _background_runtime: Option<Arc<BackgroundShutdownRuntime>>,

    background_runtime_handle: SingletonHandle,
}

/// [`Runtime`] holds the runtime reference and non-cloneable handles to prevent handle usage after runtime shutdown.
///
/// Background work (free space caching, reclaim) runs on the background handle. It is either a dedicated runtime or
/// the runtime the space manager is built on.
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a new runtime with a dedicated background runtime if given, or background work on `handle` otherwise.
    pub fn new(background_runtime: Option<Arc<BackgroundShutdownRuntime>>, handle: Handle) -> Self {
        let background_runtime_handle = background_runtime
            .as_ref()
            .map(|rt| rt.handle().clone())
            .unwrap_or(handle);
        Self {
            inner: Arc::new(RuntimeInner {
                _background_runtime: background_runtime,
                background_runtime_handle: background_runtime_handle.into(),
            }),
        }
    }

    /// Create a new runtime with current runtime env only.
    pub fn current() -> Self {
        Self::new(None, Handle::current())
    }

    /// Create a new runtime with a dedicated multi-thread background runtime.
    pub fn with_background_workers(worker_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("cowspace-background")
            .enable_all()
            .build()
            .map_err(|e| Error::new(ErrorKind::Config, "failed to build background runtime").with_source(e))?;
        let handle = runtime.handle().clone();
        Ok(Self::new(Some(Arc::new(BackgroundShutdownRuntime::from(runtime))), handle))
    }

    /// Get the non-cloneable background runtime handle.
    pub fn background(&self) -> &SingletonHandle {
        &self.inner.background_runtime_handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_current_runtime_spawn() {
        let runtime = Runtime::current();
        let v = runtime.background().spawn(async { 42 }).await.unwrap();
        assert_eq!(v, 42);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_dedicated_background_runtime() {
        let runtime = Runtime::with_background_workers(2).unwrap();
        let name = runtime
            .background()
            .spawn(async { std::thread::current().name().map(|s| s.to_string()) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("cowspace-background"));
        drop(runtime);
    }
}
