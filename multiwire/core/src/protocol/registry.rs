//! Protocol Registry
//!
//! Maps protocol ids to constructors and declared throttle intervals. The
//! registry is filled once during setup and then shared read-only behind an
//! `Arc`, so lookups need no synchronization.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{Protocol, ProtocolError, ProtocolType};

/// Constructor for a fresh, empty protocol instance
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn Protocol> + Send + Sync>;

/// One registered protocol type
#[derive(Clone)]
pub struct ProtocolEntry {
    id: u32,
    factory: ProtocolFactory,
    min_interval: Duration,
}

impl ProtocolEntry {
    /// Registered id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Declared minimum interval (`Duration::ZERO` when unthrottled)
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Construct a fresh instance
    #[must_use]
    pub fn create(&self) -> Box<dyn Protocol> {
        (self.factory)()
    }
}

impl fmt::Debug for ProtocolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEntry")
            .field("id", &self.id)
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

/// Id to constructor mapping for every known protocol type
#[derive(Clone, Debug, Default)]
pub struct ProtocolRegistry {
    entries: HashMap<u32, ProtocolEntry>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `id`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateProtocol`] if `id` is taken.
    pub fn register<F>(
        &mut self,
        id: u32,
        factory: F,
        min_interval: Duration,
    ) -> Result<(), ProtocolError>
    where
        F: Fn() -> Box<dyn Protocol> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateProtocol { id });
        }

        self.entries.insert(
            id,
            ProtocolEntry {
                id,
                factory: Arc::new(factory),
                min_interval,
            },
        );
        tracing::debug!(protocol_id = id, ?min_interval, "Registered protocol");
        Ok(())
    }

    /// Register a type that declares its id and interval statically
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateProtocol`] if `P::ID` is taken.
    pub fn register_type<P: ProtocolType>(&mut self) -> Result<(), ProtocolError> {
        self.register(
            P::ID,
            || Box::new(P::default()) as Box<dyn Protocol>,
            P::MIN_INTERVAL,
        )
    }

    /// Builder form of [`register_type`](Self::register_type)
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateProtocol`] if `P::ID` is taken.
    pub fn with_type<P: ProtocolType>(mut self) -> Result<Self, ProtocolError> {
        self.register_type::<P>()?;
        Ok(self)
    }

    /// Construct a fresh instance of the type registered under `id`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownProtocol`] if nothing is registered.
    pub fn create(&self, id: u32) -> Result<Box<dyn Protocol>, ProtocolError> {
        self.entries
            .get(&id)
            .map(ProtocolEntry::create)
            .ok_or(ProtocolError::UnknownProtocol { id })
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&ProtocolEntry> {
        self.entries.get(&id)
    }

    /// Declared minimum interval for `id`
    #[must_use]
    pub fn min_interval(&self, id: u32) -> Option<Duration> {
        self.entries.get(&id).map(ProtocolEntry::min_interval)
    }

    /// Whether `id` is registered
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Iterate over all entries (unordered)
    pub fn entries(&self) -> impl Iterator<Item = &ProtocolEntry> {
        self.entries.values()
    }

    /// Number of registered types
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registry for sharing across connections
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
