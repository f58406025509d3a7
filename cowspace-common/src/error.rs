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
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of cowspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No group of the content class, including newly allocatable ones, can satisfy a reservation.
    NoSpace,
    /// A structural operation conflicts with in-flight use of a block group.
    Busy,
    /// The device layout cannot satisfy the minimum device count of a redundancy profile.
    ///
    /// Distinct from [`ErrorKind::NoSpace`]: the remedy is adding devices, not freeing space.
    InsufficientDevices,
    /// Free-space caching of a block group failed. The group is excluded from allocation.
    CacheError,
    /// Independently derived layout disagrees with persisted records.
    InconsistentMetadata,
    /// The key already exists.
    AlreadyExists,
    /// The key or record is not found.
    NotFound,
    /// The enclosing transaction has been aborted.
    Aborted,
    /// I/O error.
    Io,
    /// External error.
    External,
    /// Config error.
    Config,
    /// The arguments of a call are inconsistent.
    InvalidArgument,
    /// Closed.
    Closed,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::NoSpace => "No space",
            ErrorKind::Busy => "Busy",
            ErrorKind::InsufficientDevices => "Insufficient devices",
            ErrorKind::CacheError => "Cache error",
            ErrorKind::InconsistentMetadata => "Inconsistent metadata",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::NotFound => "Not found",
            ErrorKind::Aborted => "Transaction aborted",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::Io => "I/O error",
            ErrorKind::External => "External error",
            ErrorKind::Config => "Config error",
            ErrorKind::Closed => "Closed",
        }
    }
}

/// Error is the error struct returned by all cowspace functions.
///
/// ## Display
///
/// - Via `Display`, like `err.to_string()`, the error is printed in a single line:
///
/// ```shell
/// No space, context: { class: data, required: 1048576, available: 0 } => not enough space left in content class
/// ```
///
/// - Via `Debug`, like `format!("{err:?}")`, the error is printed in multi lines with context, source and
///   backtrace (if captured).
///
/// - Via `format!("{err:#?}")` for the conventional struct-style Debug representation.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // If alternate has been specified, we will print like Debug.
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

/// Cloning an [`Error`] with large message and context can be expensive.
///
/// Tickets fail in batches with a cloned error, which is fine outside the allocation fast path.
impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    ///
    /// ```rust
    /// # use cowspace_common::error::{Error, ErrorKind};
    /// let io_error = std::io::Error::other("an I/O error occurred");
    /// Error::new(ErrorKind::Io, "failed to persist block group record").with_source(io_error);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Result type for cowspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Io`] error from [`std::io::Error`].
    pub fn io_error(source: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, "persistence error").with_source(source)
    }

    /// Helper for creating a [`ErrorKind::NoSpace`] error with context.
    pub fn no_space(class: impl ToString, required: u64, available: u64) -> Self {
        Error::new(ErrorKind::NoSpace, "not enough space left in content class")
            .with_context("class", class)
            .with_context("required", required)
            .with_context("available", available)
    }

    /// Helper for creating a [`ErrorKind::Busy`] error with the conflicting reason.
    pub fn busy(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::Busy, reason)
    }

    /// Helper for creating a [`ErrorKind::InsufficientDevices`] error with context.
    pub fn insufficient_devices(profile: impl ToString, required: usize, available: usize) -> Self {
        Error::new(ErrorKind::InsufficientDevices, "not enough writable devices for profile")
            .with_context("profile", profile)
            .with_context("required", required)
            .with_context("available", available)
    }

    /// Helper for creating a [`ErrorKind::CacheError`] error for a block group.
    pub fn cache_error(start: u64) -> Self {
        Error::new(ErrorKind::CacheError, "free space caching failed for block group").with_context("start", start)
    }

    /// Helper for creating a [`ErrorKind::InconsistentMetadata`] error.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InconsistentMetadata, message)
    }

}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn test_error_display() {
        let io_error = std::io::Error::other("disk gone");
        let err = Error::new(ErrorKind::Io, "failed to persist")
            .with_source(io_error)
            .with_context("start", 1024)
            .with_context("length", 4096);

        assert_eq!(
            "I/O error, context: { start: 1024, length: 4096 } => failed to persist, source: disk gone",
            err.to_string()
        );
    }

    #[test]
    fn test_no_space_display() {
        let err = Error::no_space("data", 100, 0);
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert_eq!(
            "No space, context: { class: data, required: 100, available: 0 } => not enough space left in content class",
            err.to_string()
        );
    }

    #[test]
    fn test_error_downcast() {
        let inner = TestError("corrupted extent record".to_string());
        let err = Error::new(ErrorKind::CacheError, "").with_source(inner.clone());

        let downcasted = err.downcast_ref::<TestError>().unwrap();
        assert_eq!(downcasted, &inner);
    }

    #[test]
    fn test_error_format() {
        let e = Error::inconsistent("chunk mapping has no block group")
            .with_context("start", 1 << 20)
            .with_source(TestError("missing record".into()));

        println!("{e}");
        println!("{e:?}");
        println!("{e:#?}");
    }
}
