//! Typed properties bound to device queries and commands.
//!
//! A [`PropertySlot`] is a named, typed attribute with a cached value, a
//! domain (range or allowed set), an access mode, and optionally a pair of
//! async closures: a query run on get and a command run on set. Slots live in
//! a [`PropertyTable`], which is the name-keyed dispatch table every adapter
//! builds once at construction.
//!
//! # Get/set contract
//!
//! - Set validates the value against the slot's type and domain before any
//!   I/O. A rejected value leaves the cache untouched.
//! - The cache is only updated after the device accepted the command (set) or
//!   answered the query (get). On error the previous value stays.
//! - Pre-init slots (port, address, channel) can be set only while the adapter
//!   is uninitialized; afterwards they fail with `PortChangeForbidden`.
//!
//! # Example
//!
//! ```rust,ignore
//! let slot = PropertySlot::float("Rate (uL/min)", 0.0)
//!     .with_range(0.0, 10_000.0)
//!     .with_unit("uL/min")
//!     .on_get(bind_query(pump.clone(), |pump| async move { pump.read_rate().await }))
//!     .on_set(bind_command(pump, |pump, v| async move { pump.write_rate(v).await }));
//! table.register(slot)?;
//! ```

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::adapter::{AdapterState, Lifecycle};
use crate::error::{AdapterError, AdapterResult};
use crate::protocol::MalformedPolicy;

// =============================================================================
// Values
// =============================================================================

/// Semantic type of a property or parsed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// Signed integer.
    Integer,
    /// Floating point.
    Float,
    /// Text, usually one of an enumerated set.
    Text,
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PropertyType::Integer => "integer",
            PropertyType::Float => "float",
            PropertyType::Text => "text",
        };
        write!(f, "{}", label)
    }
}

/// A property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Text value.
    Text(String),
}

impl PropertyValue {
    /// Type of this value.
    pub fn kind(&self) -> PropertyType {
        match self {
            PropertyValue::Integer(_) => PropertyType::Integer,
            PropertyValue::Float(_) => PropertyType::Float,
            PropertyValue::Text(_) => PropertyType::Text,
        }
    }

    /// Numeric view (integers widen to float).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(v) => Some(*v as f64),
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Text(_) => None,
        }
    }

    /// Integer view.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric view, or `InvalidArgument` for text.
    pub fn require_f64(&self) -> AdapterResult<f64> {
        self.as_f64()
            .ok_or_else(|| AdapterError::InvalidArgument(format!("expected a number, got '{}'", self)))
    }

    /// Integer view, or `InvalidArgument`.
    pub fn require_i64(&self) -> AdapterResult<i64> {
        self.as_i64()
            .ok_or_else(|| AdapterError::InvalidArgument(format!("expected an integer, got '{}'", self)))
    }

    /// Text view, or `InvalidArgument`.
    pub fn require_str(&self) -> AdapterResult<&str> {
        self.as_str()
            .ok_or_else(|| AdapterError::InvalidArgument(format!("expected text, got '{}'", self)))
    }

    /// Parse host-supplied text into a value of `kind`.
    pub fn parse(kind: PropertyType, text: &str) -> AdapterResult<Self> {
        let text = text.trim();
        match kind {
            PropertyType::Integer => text.parse::<i64>().map(PropertyValue::Integer).map_err(|_| {
                AdapterError::InvalidArgument(format!("'{}' is not an integer", text))
            }),
            PropertyType::Float => text.parse::<f64>().map(PropertyValue::Float).map_err(|_| {
                AdapterError::InvalidArgument(format!("'{}' is not a number", text))
            }),
            PropertyType::Text => Ok(PropertyValue::Text(text.to_string())),
        }
    }

    /// Convert to `kind` where that loses nothing.
    pub fn coerce(self, kind: PropertyType) -> AdapterResult<Self> {
        match (self, kind) {
            (v @ PropertyValue::Integer(_), PropertyType::Integer) => Ok(v),
            (v @ PropertyValue::Float(_), PropertyType::Float) => Ok(v),
            (v @ PropertyValue::Text(_), PropertyType::Text) => Ok(v),
            (PropertyValue::Integer(v), PropertyType::Float) => Ok(PropertyValue::Float(v as f64)),
            (PropertyValue::Float(v), PropertyType::Integer)
                if v.fract() == 0.0 && v.abs() < i64::MAX as f64 =>
            {
                Ok(PropertyValue::Integer(v as i64))
            }
            (PropertyValue::Text(t), kind) => PropertyValue::parse(kind, &t),
            (v, kind) => Err(AdapterError::InvalidArgument(format!(
                "expected {} value, got {}",
                kind, v
            ))),
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Integer(i64::from(v))
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

// =============================================================================
// Slots
// =============================================================================

/// When a property may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Only before initialize() (port, address, channel).
    PreInit,
    /// Read and write while initialized.
    ReadWrite,
    /// Read only.
    ReadOnly,
}

/// Declared set of acceptable values.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// Any value of the right type.
    Unbounded,
    /// Inclusive numeric range.
    Range {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Explicit list.
    Allowed(Vec<PropertyValue>),
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Unbounded => write!(f, "any"),
            Domain::Range { min, max } => write!(f, "{}..={}", min, max),
            Domain::Allowed(values) => {
                let list: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{{{}}}", list.join(", "))
            }
        }
    }
}

/// Query closure run on get.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, AdapterResult<PropertyValue>> + Send + Sync>;
/// Command closure run on set with the validated value.
pub type CommandFn = Arc<dyn Fn(PropertyValue) -> BoxFuture<'static, AdapterResult<()>> + Send + Sync>;
/// Extra validation beyond the domain.
pub type ValidatorFn = Arc<dyn Fn(&PropertyValue) -> Result<(), String> + Send + Sync>;
/// Called after a property's cached value changes through a set or notify.
pub type ChangeListener = Arc<dyn Fn(&str, &PropertyValue) + Send + Sync>;

/// Build a [`QueryFn`] from a context and an async function of it.
pub fn bind_query<C, F, Fut>(ctx: C, f: F) -> QueryFn
where
    C: Clone + Send + Sync + 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AdapterResult<PropertyValue>> + Send + 'static,
{
    Arc::new(move || f(ctx.clone()).boxed())
}

/// Build a [`CommandFn`] from a context and an async function of it.
pub fn bind_command<C, F, Fut>(ctx: C, f: F) -> CommandFn
where
    C: Clone + Send + Sync + 'static,
    F: Fn(C, PropertyValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AdapterResult<()>> + Send + 'static,
{
    Arc::new(move |value| f(ctx.clone(), value).boxed())
}

/// A named, typed, host-visible attribute.
pub struct PropertySlot {
    name: String,
    kind: PropertyType,
    access: Access,
    domain: Domain,
    description: Option<String>,
    unit: Option<String>,
    value: RwLock<PropertyValue>,
    query: Option<QueryFn>,
    command: Option<CommandFn>,
    validator: Option<ValidatorFn>,
    policy: MalformedPolicy,
}

impl std::fmt::Debug for PropertySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertySlot")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("access", &self.access)
            .field("domain", &self.domain)
            .field("value", &*self.value.read())
            .finish_non_exhaustive()
    }
}

impl PropertySlot {
    fn new(name: impl Into<String>, initial: PropertyValue) -> Self {
        Self {
            name: name.into(),
            kind: initial.kind(),
            access: Access::ReadWrite,
            domain: Domain::Unbounded,
            description: None,
            unit: None,
            value: RwLock::new(initial),
            query: None,
            command: None,
            validator: None,
            policy: MalformedPolicy::default(),
        }
    }

    /// Integer property.
    pub fn integer(name: impl Into<String>, initial: i64) -> Self {
        Self::new(name, PropertyValue::Integer(initial))
    }

    /// Float property.
    pub fn float(name: impl Into<String>, initial: f64) -> Self {
        Self::new(name, PropertyValue::Float(initial))
    }

    /// Text property.
    pub fn text(name: impl Into<String>, initial: impl Into<String>) -> Self {
        Self::new(name, PropertyValue::Text(initial.into()))
    }

    /// Integer property restricted to 0 and 1.
    pub fn switch(name: impl Into<String>, initial: bool) -> Self {
        Self::integer(name, i64::from(initial)).with_allowed([0i64, 1])
    }

    /// Writable only before initialization.
    pub fn pre_init(mut self) -> Self {
        self.access = Access::PreInit;
        self
    }

    /// Not writable.
    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    /// Inclusive numeric range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.domain = Domain::Range { min, max };
        self
    }

    /// Explicit allowed values.
    pub fn with_allowed<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<PropertyValue>,
    {
        self.domain = Domain::Allowed(values.into_iter().map(Into::into).collect());
        self
    }

    /// Extra validation run after the domain check.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&PropertyValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Human readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Physical unit label.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Malformed-number handling for this slot's query.
    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Query run on get.
    pub fn on_get(mut self, query: QueryFn) -> Self {
        self.query = Some(query);
        self
    }

    /// Command run on set.
    pub fn on_set(mut self, command: CommandFn) -> Self {
        self.command = Some(command);
        self
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Property type.
    pub fn kind(&self) -> PropertyType {
        self.kind
    }

    /// Access mode.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Declared domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Unit label, if any.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Cached value.
    pub fn cached(&self) -> PropertyValue {
        self.value.read().clone()
    }

    fn store(&self, value: PropertyValue) {
        *self.value.write() = value;
    }

    /// Check a candidate value and return it converted to the slot type.
    pub fn validate(&self, value: PropertyValue) -> AdapterResult<PropertyValue> {
        let value = value.coerce(self.kind).map_err(|e| match e {
            AdapterError::InvalidArgument(msg) => {
                AdapterError::InvalidArgument(format!("{}: {}", self.name, msg))
            }
            other => other,
        })?;

        match &self.domain {
            Domain::Unbounded => {}
            Domain::Range { min, max } => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                if !(v >= *min && v <= *max) {
                    return Err(AdapterError::InvalidArgument(format!(
                        "{}: {} outside range {}..={}",
                        self.name, value, min, max
                    )));
                }
            }
            Domain::Allowed(allowed) => {
                if !allowed.contains(&value) {
                    return Err(AdapterError::InvalidArgument(format!(
                        "{}: {} not in {}",
                        self.name, value, self.domain
                    )));
                }
            }
        }

        if let Some(validator) = &self.validator {
            validator(&value).map_err(|msg| {
                AdapterError::InvalidArgument(format!("{}: {}", self.name, msg))
            })?;
        }

        Ok(value)
    }
}

/// Snapshot of a slot's metadata for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// Value type.
    pub kind: PropertyType,
    /// Access mode.
    pub access: Access,
    /// Domain.
    pub domain: Domain,
    /// Unit label.
    pub unit: Option<String>,
    /// Cached value.
    pub value: PropertyValue,
}

// =============================================================================
// Table
// =============================================================================

struct TableInner {
    slots: RwLock<Vec<Arc<PropertySlot>>>,
    listeners: RwLock<Vec<ChangeListener>>,
    lifecycle: Lifecycle,
}

/// Name-keyed dispatch table of property slots, shared by an adapter and its
/// handlers.
#[derive(Clone)]
pub struct PropertyTable {
    inner: Arc<TableInner>,
}

/// Non-owning table handle for closures registered inside the table.
#[derive(Clone)]
pub struct WeakPropertyTable {
    inner: Weak<TableInner>,
}

impl WeakPropertyTable {
    /// Upgrade back to a table, if the adapter is still alive.
    pub fn upgrade(&self) -> Option<PropertyTable> {
        self.inner.upgrade().map(|inner| PropertyTable { inner })
    }
}

impl Default for PropertyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PropertyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyTable")
            .field("state", &self.inner.lifecycle.state())
            .field("slots", &self.names())
            .finish()
    }
}

impl PropertyTable {
    /// Empty table for an uninitialized adapter.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                slots: RwLock::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    /// Adapter lifecycle owned by this table.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    /// Weak handle for use inside slot closures.
    pub fn downgrade(&self) -> WeakPropertyTable {
        WeakPropertyTable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Add a slot. Names must be unique.
    pub fn register(&self, slot: PropertySlot) -> AdapterResult<()> {
        let mut slots = self.inner.slots.write();
        if slots.iter().any(|s| s.name == slot.name) {
            return Err(AdapterError::Configuration(format!(
                "duplicate property '{}'",
                slot.name
            )));
        }
        slots.push(Arc::new(slot));
        Ok(())
    }

    /// Whether a slot exists.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.slots.read().iter().any(|s| s.name == name)
    }

    /// Slot by name.
    pub fn slot(&self, name: &str) -> AdapterResult<Arc<PropertySlot>> {
        self.inner
            .slots
            .read()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownProperty(name.to_string()))
    }

    /// Property names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .slots
            .read()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Metadata for every slot.
    pub fn info(&self) -> Vec<PropertyInfo> {
        self.inner
            .slots
            .read()
            .iter()
            .map(|s| PropertyInfo {
                name: s.name.clone(),
                kind: s.kind,
                access: s.access,
                domain: s.domain.clone(),
                unit: s.unit.clone(),
                value: s.cached(),
            })
            .collect()
    }

    /// Cached value without touching the device.
    pub fn cached(&self, name: &str) -> AdapterResult<PropertyValue> {
        Ok(self.slot(name)?.cached())
    }

    /// Register a change listener.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &PropertyValue) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    fn fire(&self, name: &str, value: &PropertyValue) {
        let listeners: Vec<ChangeListener> = self.inner.listeners.read().clone();
        for listener in listeners {
            listener(name, value);
        }
    }

    /// Update a slot's cached value from inside the adapter (for example when
    /// one command changes another property on the device) and notify.
    pub fn notify_changed(&self, name: &str, value: impl Into<PropertyValue>) -> AdapterResult<()> {
        let slot = self.slot(name)?;
        let value = value.into().coerce(slot.kind)?;
        slot.store(value.clone());
        self.fire(name, &value);
        Ok(())
    }

    /// A shut-down adapter serves neither cached nor local values.
    fn reject_after_shutdown(&self, verb: &str, name: &str) -> AdapterResult<()> {
        match self.lifecycle().state() {
            AdapterState::ShutDown => Err(AdapterError::InvalidState {
                operation: format!("{} '{}'", verb, name),
                state: AdapterState::ShutDown,
            }),
            _ => Ok(()),
        }
    }

    /// Read a property, querying the device if the slot has a query.
    pub async fn get(&self, name: &str) -> AdapterResult<PropertyValue> {
        let slot = self.slot(name)?;
        self.reject_after_shutdown("read", name)?;
        let Some(query) = slot.query.clone() else {
            return Ok(slot.cached());
        };

        let state = self.lifecycle().state();
        if state != AdapterState::Initialized {
            return Err(AdapterError::InvalidState {
                operation: format!("read '{}'", name),
                state,
            });
        }

        match query().await {
            Ok(value) => {
                let value = value.coerce(slot.kind)?;
                slot.store(value.clone());
                Ok(value)
            }
            Err(AdapterError::UnrecognizedResponse(msg))
                if slot.policy == MalformedPolicy::KeepPrevious =>
            {
                let previous = slot.cached();
                warn!(property = name, reason = %msg, value = %previous, "keeping previous value");
                Ok(previous)
            }
            Err(e) => {
                debug!(property = name, error = %e, "get failed, cache unchanged");
                Err(e)
            }
        }
    }

    /// Write a property: validate, send the command, then update the cache.
    pub async fn set(&self, name: &str, value: impl Into<PropertyValue>) -> AdapterResult<()> {
        let slot = self.slot(name)?;
        self.reject_after_shutdown("write", name)?;
        let state = self.lifecycle().state();

        match slot.access {
            Access::ReadOnly => return Err(AdapterError::ReadOnlyProperty(name.to_string())),
            Access::PreInit if state != AdapterState::Uninitialized => {
                return Err(AdapterError::PortChangeForbidden {
                    property: name.to_string(),
                });
            }
            Access::PreInit | Access::ReadWrite => {}
        }

        let value = slot.validate(value.into())?;

        if let Some(command) = slot.command.clone() {
            if state != AdapterState::Initialized {
                return Err(AdapterError::InvalidState {
                    operation: format!("write '{}'", name),
                    state,
                });
            }
            if let Err(e) = command(value.clone()).await {
                debug!(property = name, error = %e, "set failed, cache unchanged");
                return Err(e);
            }
        }

        slot.store(value.clone());
        self.fire(name, &value);
        Ok(())
    }
}
