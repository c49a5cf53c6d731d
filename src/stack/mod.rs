//! Navigation stacks: ordered or tagged collections of visual units.
//!
//! A [`NavStack`] is either a classic LIFO history ([`NavStack::Single`]) or
//! a set of independent parallel histories sharing one display region
//! ([`NavStack::Table`]), where switching hides rather than destroys the
//! inactive histories so their state is preserved.
//!
//! Stack transitions are expressed as [`RouteEffect`](crate::effect::RouteEffect)s
//! over a host's [`StackHostState`]; see [`route`] for the operations and
//! [`transaction`] for the batched-commit discipline they run under.

mod memory;
pub mod route;
pub mod transaction;

pub use memory::{MemoryBackend, MemoryUnit};
pub use route::{
    attach_host, await_reply, create_unit, escalate_finish, expect_reply, finish_unit,
    host_state_lens, push_host_container, push_unit, run_on_host, switch_tag, FinishResult,
    FinishTarget, STACK_BINDING_KEY,
};
pub use transaction::{StackTransaction, StackTxnState, TransactionBackend, TxnOp};

use crate::containers::NavIdentity;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Key identifying one of several parallel histories within a Table stack.
pub type TableTag = String;

/// Declared payload type of a unit, resolved through a [`UnitRegistry`].
pub type UnitKind = String;

/// Request code value meaning "no reply expected".
pub const NO_REQUEST: i32 = -1;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Mutable sidecar every unit carries: its assigned identity, committed
/// visibility, and the request/reply slots used for result relay.
///
/// All fields use interior mutability because units are shared behind `Arc`
/// while the surrounding stack state is an immutable value.
#[derive(Debug)]
pub struct UnitController {
    identity: Mutex<Option<NavIdentity>>,
    visible: AtomicBool,
    request_code: AtomicI32,
    reply: Mutex<Option<(i32, Option<Value>)>>,
}

impl Default for UnitController {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitController {
    pub fn new() -> Self {
        Self {
            identity: Mutex::new(None),
            visible: AtomicBool::new(false),
            request_code: AtomicI32::new(NO_REQUEST),
            reply: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Option<NavIdentity> {
        *relock(&self.identity)
    }

    pub(crate) fn bind_identity(&self, identity: NavIdentity) {
        *relock(&self.identity) = Some(identity);
    }

    /// Committed visibility; transaction ops only take effect here after
    /// their batch is acknowledged.
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub(crate) fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn request_code(&self) -> i32 {
        self.request_code.load(Ordering::SeqCst)
    }

    pub fn set_request_code(&self, code: i32) {
        self.request_code.store(code, Ordering::SeqCst);
    }

    /// Records the reply this unit wants relayed to its predecessor when it
    /// finishes.
    pub fn set_reply(&self, result_code: i32, payload: Option<Value>) {
        *relock(&self.reply) = Some((result_code, payload));
    }

    pub fn take_reply(&self) -> Option<(i32, Option<Value>)> {
        relock(&self.reply).take()
    }
}

/// An addressable visual sub-component placed within a container.
pub trait NavUnit: Send + Sync + fmt::Debug {
    fn controller(&self) -> &UnitController;

    fn is_visible(&self) -> bool {
        self.controller().is_visible()
    }

    /// Invoked when a finishing successor relays its reply to this unit.
    fn on_unit_result(&self, _request_code: i32, _result_code: i32, _payload: Option<&Value>) {}
}

pub type UnitHandle = Arc<dyn NavUnit>;

/// One entry in a stack: the unit plus its durable identity and optional
/// caller-assigned tag.
#[derive(Clone, Debug)]
pub struct StackItem {
    pub unit: UnitHandle,
    pub identity: NavIdentity,
    pub tag: Option<String>,
}

impl StackItem {
    /// Wraps a freshly constructed unit, allocating its identity.
    pub fn new(unit: UnitHandle, tag: Option<String>) -> Self {
        let identity = NavIdentity::next();
        unit.controller().bind_identity(identity);
        Self {
            unit,
            identity,
            tag,
        }
    }
}

// Items are compared by identity, never by unit reference.
impl PartialEq for StackItem {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

/// A single LIFO history. List order is z-order: the last element is
/// visible, all others hidden.
#[derive(Clone, Debug, Default)]
pub struct SingleStack {
    pub items: Vec<StackItem>,
}

impl SingleStack {
    pub fn top(&self) -> Option<&StackItem> {
        self.items.last()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parallel tagged histories sharing one display region. At most one tag is
/// current; within any tag's list only the last element is visible.
#[derive(Clone, Debug)]
pub struct TableStack {
    /// Default unit kind constructed when switching to an empty tag.
    pub defaults: HashMap<TableTag, UnitKind>,
    /// Tag used when a push resolves neither an explicit nor a current tag.
    pub default_tag: TableTag,
    pub table: HashMap<TableTag, Vec<StackItem>>,
    /// The current tag and its visible item; the item is absent when the
    /// current tag's history is empty.
    pub current: Option<(TableTag, Option<StackItem>)>,
}

impl TableStack {
    pub fn new(defaults: HashMap<TableTag, UnitKind>, default_tag: impl Into<TableTag>) -> Self {
        Self {
            defaults,
            default_tag: default_tag.into(),
            table: HashMap::new(),
            current: None,
        }
    }

    pub fn current_tag(&self) -> Option<&str> {
        self.current.as_ref().map(|(tag, _)| tag.as_str())
    }

    pub fn list(&self, tag: &str) -> &[StackItem] {
        self.table.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The navigation-stack state machine: a tagged sum dispatched exhaustively
/// by the stack routes, never subclassed.
#[derive(Clone, Debug)]
pub enum NavStack {
    Single(SingleStack),
    Table(TableStack),
}

impl NavStack {
    pub fn single() -> Self {
        Self::Single(SingleStack::default())
    }

    pub fn table(defaults: HashMap<TableTag, UnitKind>, default_tag: impl Into<TableTag>) -> Self {
        Self::Table(TableStack::new(defaults, default_tag))
    }
}

/// Display region within a container that stack units are added to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RegionId(pub u32);

/// A top-level container's stack configuration: the display region, the
/// initial stack shape, and a durable identity slot bound when the host is
/// attached to a tracked container.
#[derive(Debug)]
pub struct StackHost {
    region: RegionId,
    init_stack: NavStack,
    identity: Mutex<Option<NavIdentity>>,
}

impl StackHost {
    pub fn new(region: RegionId, init_stack: NavStack) -> Arc<Self> {
        Arc::new(Self {
            region,
            init_stack,
            identity: Mutex::new(None),
        })
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn init_stack(&self) -> &NavStack {
        &self.init_stack
    }

    pub fn identity(&self) -> Option<NavIdentity> {
        *relock(&self.identity)
    }

    pub(crate) fn bind_identity(&self, identity: NavIdentity) {
        *relock(&self.identity) = Some(identity);
    }
}

/// Binds a host to its live stack and the transaction backend used to apply
/// mutations. This is the state every stack route runs against.
#[derive(Clone, Debug)]
pub struct StackHostState {
    pub host: Arc<StackHost>,
    pub stack: NavStack,
    pub backend: Arc<dyn TransactionBackend>,
}

/// Why a unit construction failed.
#[derive(Debug, thiserror::Error)]
pub enum ConstructError {
    #[error("no unit kind registered under '{0}'")]
    KindNotFound(String),

    #[error("constructor for unit kind '{kind}' failed: {reason}")]
    Instantiation { kind: String, reason: String },

    #[error("access to unit kind '{0}' was denied")]
    AccessDenied(String),

    #[error("constructed unit does not satisfy the declared kind '{0}'")]
    TypeMismatch(String),
}

type Constructor = Arc<dyn Fn(&Value) -> Result<UnitHandle, ConstructError> + Send + Sync>;

/// The construction service: builds units of a declared kind with given
/// arguments.
#[derive(Default)]
pub struct UnitRegistry {
    constructors: HashMap<UnitKind, Constructor>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        kind: impl Into<UnitKind>,
        constructor: impl Fn(&Value) -> Result<UnitHandle, ConstructError> + Send + Sync + 'static,
    ) -> Self {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    pub fn construct(&self, kind: &str, args: &Value) -> Result<UnitHandle, ConstructError> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| ConstructError::KindNotFound(kind.to_string()))?;
        constructor(args)
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("kinds", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Recipe for pushing a unit: declared kind, constructor arguments, the
/// Table tag to push onto (absent means current, then the configured
/// default), and an optional caller tag carried on the item.
#[derive(Clone, Debug)]
pub struct UnitBuilder {
    kind: UnitKind,
    args: Value,
    stack_tag: Option<TableTag>,
    unit_tag: Option<String>,
}

impl UnitBuilder {
    pub fn new(kind: impl Into<UnitKind>) -> Self {
        Self {
            kind: kind.into(),
            args: Value::Null,
            stack_tag: None,
            unit_tag: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_stack_tag(mut self, tag: impl Into<TableTag>) -> Self {
        self.stack_tag = Some(tag.into());
        self
    }

    pub fn with_unit_tag(mut self, tag: impl Into<String>) -> Self {
        self.unit_tag = Some(tag.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn stack_tag(&self) -> Option<&str> {
        self.stack_tag.as_deref()
    }

    pub fn unit_tag(&self) -> Option<&str> {
        self.unit_tag.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_constructs_registered_kinds() {
        let registry = UnitRegistry::new().register("home", |_args| Ok(MemoryUnit::new("home")));
        let unit = registry.construct("home", &Value::Null).unwrap();
        assert!(!unit.is_visible());
    }

    #[test]
    fn registry_reports_missing_kind() {
        let registry = UnitRegistry::new();
        let error = registry.construct("absent", &Value::Null).unwrap_err();
        assert!(matches!(error, ConstructError::KindNotFound(_)));
    }

    #[test]
    fn registry_propagates_constructor_faults() {
        let registry = UnitRegistry::new().register("broken", |_args| {
            Err(ConstructError::Instantiation {
                kind: "broken".into(),
                reason: "missing argument".into(),
            })
        });
        let error = registry.construct("broken", &Value::Null).unwrap_err();
        assert!(matches!(error, ConstructError::Instantiation { .. }));
    }

    #[test]
    fn stack_item_binds_identity_to_controller() {
        let unit = MemoryUnit::new("a");
        let item = StackItem::new(unit, None);
        assert_eq!(item.unit.controller().identity(), Some(item.identity));
    }

    #[test]
    fn controller_reply_round_trip() {
        let controller = UnitController::new();
        assert_eq!(controller.request_code(), NO_REQUEST);
        controller.set_request_code(9);
        controller.set_reply(0, Some(Value::from("done")));
        assert_eq!(controller.take_reply(), Some((0, Some(Value::from("done")))));
        assert_eq!(controller.take_reply(), None);
    }

    #[test]
    fn table_stack_tracks_current_tag() {
        let mut stack = TableStack::new(HashMap::new(), "main");
        assert_eq!(stack.current_tag(), None);
        assert!(stack.list("main").is_empty());
        let item = StackItem::new(MemoryUnit::new("a"), None);
        stack.table.insert("main".into(), vec![item.clone()]);
        stack.current = Some(("main".into(), Some(item)));
        assert_eq!(stack.current_tag(), Some("main"));
        assert_eq!(stack.list("main").len(), 1);
    }
}
