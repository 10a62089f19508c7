/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! External collaborators handed to a service at `init()`.
//!
//! A [`ServiceContext`] bundles the dictionary provider, the scheduled-task
//! executor, the transport and the workspace directory. Contexts are cheap to
//! clone; several services may share one.

use ironsim_core::ServiceError;
use ironsim_session::{Dictionary, TaskExecutor, TokioTaskExecutor};
use ironsim_transport::{TokioTransport, Transport};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves dictionary names referenced by settings.
pub trait DictionaryProvider: Send + Sync + fmt::Debug {
    /// Returns the dictionary called `name`, if known.
    fn resolve(&self, name: &str) -> Option<Dictionary>;
}

/// Dictionary provider backed by an in-memory registry.
#[derive(Debug, Clone, Default)]
pub struct StaticDictionaryProvider {
    dictionaries: HashMap<String, Dictionary>,
}

impl StaticDictionaryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider knowing the standard FIX versions.
    #[must_use]
    pub fn with_fix_versions() -> Self {
        [
            ("FIX40", "FIX.4.0"),
            ("FIX41", "FIX.4.1"),
            ("FIX42", "FIX.4.2"),
            ("FIX43", "FIX.4.3"),
            ("FIX44", "FIX.4.4"),
            ("FIX50", "FIXT.1.1"),
            ("FIX50SP1", "FIXT.1.1"),
            ("FIX50SP2", "FIXT.1.1"),
            ("FIXT11", "FIXT.1.1"),
        ]
        .into_iter()
        .fold(Self::new(), |provider, (name, begin_string)| {
            provider.with_dictionary(Dictionary::new(name, begin_string))
        })
    }

    /// Adds or replaces a dictionary.
    #[must_use]
    pub fn with_dictionary(mut self, dictionary: Dictionary) -> Self {
        self.dictionaries.insert(dictionary.name.clone(), dictionary);
        self
    }
}

impl DictionaryProvider for StaticDictionaryProvider {
    fn resolve(&self, name: &str) -> Option<Dictionary> {
        self.dictionaries.get(name).cloned()
    }
}

/// Collaborators a service resolves during `init()`.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    dictionaries: Arc<dyn DictionaryProvider>,
    executor: Arc<dyn TaskExecutor>,
    transport: Arc<dyn Transport>,
    workspace: PathBuf,
}

impl ServiceContext {
    /// Creates a context from explicit collaborators.
    #[must_use]
    pub fn new(
        dictionaries: Arc<dyn DictionaryProvider>,
        executor: Arc<dyn TaskExecutor>,
        transport: Arc<dyn Transport>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dictionaries,
            executor,
            transport,
            workspace: workspace.into(),
        }
    }

    /// Creates a context with the FIX dictionaries, a dedicated scheduler
    /// thread, the tokio transport and the system temp directory.
    ///
    /// # Errors
    /// Returns [`ServiceError::Runtime`] if the scheduler cannot be started.
    pub fn with_defaults() -> Result<Self, ServiceError> {
        let executor =
            TokioTaskExecutor::new().map_err(|err| ServiceError::Runtime(err.to_string()))?;
        Ok(Self::new(
            Arc::new(StaticDictionaryProvider::with_fix_versions()),
            Arc::new(executor),
            Arc::new(TokioTransport::new()),
            std::env::temp_dir(),
        ))
    }

    /// Replaces the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Replaces the task executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the dictionary provider.
    #[must_use]
    pub fn with_dictionaries(mut self, dictionaries: Arc<dyn DictionaryProvider>) -> Self {
        self.dictionaries = dictionaries;
        self
    }

    /// Replaces the workspace directory.
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Returns the dictionary provider.
    #[must_use]
    pub fn dictionaries(&self) -> &Arc<dyn DictionaryProvider> {
        &self.dictionaries
    }

    /// Returns the task executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    /// Returns the transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Returns the workspace directory.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_versions() {
        let provider = StaticDictionaryProvider::with_fix_versions();
        assert_eq!(
            provider.resolve("FIX44"),
            Some(Dictionary::new("FIX44", "FIX.4.4"))
        );
        assert_eq!(
            provider.resolve("FIX50SP2").map(|d| d.begin_string),
            Some("FIXT.1.1".to_string())
        );
        assert_eq!(provider.resolve("FIX99"), None);
    }

    #[test]
    fn test_custom_dictionary() {
        let provider =
            StaticDictionaryProvider::new().with_dictionary(Dictionary::new("VENUE", "FIX.4.2"));
        assert!(provider.resolve("VENUE").is_some());
        assert!(provider.resolve("FIX44").is_none());
    }

    #[test]
    fn test_default_context() {
        let context = ServiceContext::with_defaults().unwrap();
        assert!(context.workspace().is_dir());
        assert!(context.dictionaries().resolve("FIX42").is_some());

        let context = context.with_workspace("/definitely/not/here");
        assert!(!context.workspace().is_dir());
    }
}
