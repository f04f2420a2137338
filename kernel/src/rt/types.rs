//! Type descriptors, virtual dispatch and interface dispatch.
//!
//! Slot assignment happens at type definition: an overriding method takes
//! its base's slot, each new virtual appends a fresh one. Every
//! (concrete type, interface) pair gets its own dispatch table; a slot the
//! type does not override points at the interface's default body, and a
//! diamond of unrelated default bodies with no most-derived override is a
//! construction-time failure, not a call-time one.
//!
//! Descriptors are immortal: object headers point straight at them.

use core::sync::atomic::{AtomicU32, AtomicU64};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::jit::il::{MethodId, ValueKind};

/// Identifies a registered type.
pub type TypeId = u32;

/// What flavor of type a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    ValueType,
    Interface,
}

/// One instance field; fields occupy pointer-width slots in declaration
/// order, inherited fields first.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: ValueKind,
}

impl FieldDef {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        Self {
            name: String::from(name),
            kind,
        }
    }
}

/// A method slot declared by an interface.
#[derive(Debug)]
pub struct InterfaceMethodDecl {
    pub name: String,
    /// Body used when no implementing type overrides the slot.
    pub default_body: Option<MethodId>,
    /// Set when this declaration is itself a default-method override of a
    /// base interface's slot.
    pub overrides: Option<(TypeId, u16)>,
}

/// Dispatch table for one (concrete type, interface) pair.
#[derive(Debug)]
pub struct InterfaceTable {
    pub interface: TypeId,
    /// Interface slot → concrete method.
    pub methods: Vec<MethodId>,
}

/// Sentinel states of the one-shot type initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeInitState {
    NotRun = 0,
    Running = 1,
    Completed = 2,
    Faulted = 3,
}

/// Per-type runtime descriptor.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub supertype: Option<TypeId>,
    /// Interfaces an interface type extends.
    pub extends: Vec<TypeId>,
    /// Dispatch tables of a concrete type, one per implemented interface
    /// (transitively closed).
    pub interfaces: Vec<InterfaceTable>,
    /// Virtual dispatch table; index is the virtual slot.
    pub vtable: Vec<MethodId>,
    /// Instance fields, inherited first.
    pub fields: Vec<FieldDef>,
    /// Payload bytes following the object header.
    pub instance_size: usize,
    /// Slot declarations of an interface type.
    pub iface_methods: Vec<InterfaceMethodDecl>,
    /// Sealed types permit compile-time devirtualization.
    pub sealed: bool,

    // Type-initializer protocol (§ typeinit).
    pub before_field_init: bool,
    /// Initializer method, encoded as id + 1 (0 = none). Settable after
    /// definition because the initializer's body names this type.
    initializer: AtomicU32,
    pub init_state: AtomicU32,
    /// Thread token of the initializing thread while Running.
    pub init_owner: AtomicU64,
    /// Static field declarations and their current raw slot values.
    pub static_fields: Vec<FieldDef>,
    pub statics: Mutex<Vec<u64>>,
}

impl PartialEq for TypeDescriptor {
    /// Descriptors are immortal and one-per-id, so id equality is identity.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl TypeDescriptor {
    /// The type initializer, when one is declared.
    pub fn initializer(&self) -> Option<MethodId> {
        let raw = self.initializer.load(core::sync::atomic::Ordering::Acquire);
        (raw != 0).then(|| MethodId(raw - 1))
    }

    /// Attach the initializer. Runs during type-system construction,
    /// before any use of the type; the body of an initializer names its
    /// own type, which forces this two-step wiring.
    pub fn set_initializer(&self, method: MethodId) {
        self.initializer
            .store(method.0 + 1, core::sync::atomic::Ordering::Release);
    }
}

static REGISTRY: RwLock<Vec<&'static TypeDescriptor>> = RwLock::new(Vec::new());

/// Look up a registered type.
pub fn get(id: TypeId) -> &'static TypeDescriptor {
    REGISTRY.read()[id as usize]
}

/// Walk the supertype chain; reflexive.
pub fn is_subtype(sub: TypeId, sup: TypeId) -> bool {
    let mut cur = Some(sub);
    while let Some(id) = cur {
        if id == sup {
            return true;
        }
        cur = get(id).supertype;
    }
    false
}

/// Whether a concrete type has a dispatch table for `iface`.
pub fn implements(ty: TypeId, iface: TypeId) -> bool {
    get(ty).interfaces.iter().any(|t| t.interface == iface)
}

/// The (type, interface) dispatch table.
pub fn interface_table(ty: TypeId, iface: TypeId) -> Option<&'static [MethodId]> {
    get(ty)
        .interfaces
        .iter()
        .find(|t| t.interface == iface)
        .map(|t| t.methods.as_slice())
}

/// Resolve a virtual slot against the receiver's dynamic type.
pub fn resolve_virtual(ty: TypeId, slot: u16) -> Option<MethodId> {
    get(ty).vtable.get(slot as usize).copied()
}

/// Cast-to-interface: non-null iff the table exists. `is`/`as` follow.
pub fn cast_to_interface(ty: TypeId, iface: TypeId) -> Option<TypeId> {
    implements(ty, iface).then_some(iface)
}

/// `is` semantics over classes and interfaces.
pub fn is_instance(ty: TypeId, target: TypeId) -> bool {
    match get(target).kind {
        TypeKind::Interface => implements(ty, target),
        _ => is_subtype(ty, target),
    }
}

/// A virtual method declaration on a concrete type.
pub struct VirtualDef {
    pub method: MethodId,
    /// Base slot this method overrides; `None` introduces a new slot.
    pub overrides: Option<u16>,
}

/// Implementations a type provides for one interface. Explicit and
/// implicit implementations are simply different methods wired to
/// different interfaces' slots.
pub struct InterfaceImpl {
    pub interface: TypeId,
    pub slots: Vec<(u16, MethodId)>,
}

/// Everything needed to define a type.
pub struct TypeBuilder {
    name: String,
    kind: TypeKind,
    supertype: Option<TypeId>,
    extends: Vec<TypeId>,
    fields: Vec<FieldDef>,
    static_fields: Vec<FieldDef>,
    virtuals: Vec<VirtualDef>,
    implements: Vec<InterfaceImpl>,
    iface_methods: Vec<InterfaceMethodDecl>,
    before_field_init: bool,
    initializer: Option<MethodId>,
    sealed: bool,
}

impl TypeBuilder {
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: String::from(name),
            kind,
            supertype: None,
            extends: Vec::new(),
            fields: Vec::new(),
            static_fields: Vec::new(),
            virtuals: Vec::new(),
            implements: Vec::new(),
            iface_methods: Vec::new(),
            before_field_init: false,
            initializer: None,
            sealed: false,
        }
    }

    pub fn supertype(mut self, sup: TypeId) -> Self {
        self.supertype = Some(sup);
        self
    }

    pub fn extends(mut self, iface: TypeId) -> Self {
        self.extends.push(iface);
        self
    }

    pub fn field(mut self, name: &str, kind: ValueKind) -> Self {
        self.fields.push(FieldDef::new(name, kind));
        self
    }

    pub fn static_field(mut self, name: &str, kind: ValueKind) -> Self {
        self.static_fields.push(FieldDef::new(name, kind));
        self
    }

    pub fn virtual_method(mut self, method: MethodId) -> Self {
        self.virtuals.push(VirtualDef {
            method,
            overrides: None,
        });
        self
    }

    pub fn override_method(mut self, slot: u16, method: MethodId) -> Self {
        self.virtuals.push(VirtualDef {
            method,
            overrides: Some(slot),
        });
        self
    }

    pub fn implement(mut self, interface: TypeId, slots: Vec<(u16, MethodId)>) -> Self {
        self.implements.push(InterfaceImpl { interface, slots });
        self
    }

    pub fn interface_method(mut self, name: &str, default_body: Option<MethodId>) -> Self {
        self.iface_methods.push(InterfaceMethodDecl {
            name: String::from(name),
            default_body,
            overrides: None,
        });
        self
    }

    /// Declare an interface method that overrides a base interface's slot
    /// with a default body (default-interface-method override).
    pub fn interface_override(
        mut self,
        name: &str,
        base: TypeId,
        slot: u16,
        body: MethodId,
    ) -> Self {
        self.iface_methods.push(InterfaceMethodDecl {
            name: String::from(name),
            default_body: Some(body),
            overrides: Some((base, slot)),
        });
        self
    }

    pub fn before_field_init(mut self) -> Self {
        self.before_field_init = true;
        self
    }

    pub fn initializer(mut self, method: MethodId) -> Self {
        self.initializer = Some(method);
        self
    }

    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    /// Register the type: assign virtual slots, build every interface
    /// table, and fail on unimplementable or ambiguous slots.
    pub fn define(self) -> KernelResult<TypeId> {
        define(self)
    }
}

/// Transitive closure of an interface and everything it extends.
fn interface_closure(iface: TypeId, out: &mut Vec<TypeId>) {
    if out.contains(&iface) {
        return;
    }
    out.push(iface);
    for &base in &get(iface).extends {
        interface_closure(base, out);
    }
}

fn define(b: TypeBuilder) -> KernelResult<TypeId> {
    let mut registry = REGISTRY.write();
    let id = registry.len() as TypeId;

    // Inherited state from the supertype.
    let (mut vtable, mut fields) = match b.supertype {
        Some(sup) => {
            let sup = registry
                .get(sup as usize)
                .ok_or(KernelError::TypeConstruction {
                    reason: "unknown supertype",
                })?;
            (sup.vtable.clone(), sup.fields.clone())
        }
        None => (Vec::new(), Vec::new()),
    };

    // Virtual slot assignment: overrides reuse the base slot, new
    // virtuals append.
    for v in &b.virtuals {
        match v.overrides {
            Some(slot) => {
                let slot = slot as usize;
                if slot >= vtable.len() {
                    return Err(KernelError::TypeConstruction {
                        reason: "override of nonexistent slot",
                    });
                }
                vtable[slot] = v.method;
            }
            None => vtable.push(v.method),
        }
    }

    fields.extend(b.fields.iter().cloned());

    // Interface tables for the transitive closure of everything the type
    // implements, plus whatever the supertype already carried.
    let mut interfaces: Vec<InterfaceTable> = Vec::new();
    if b.kind != TypeKind::Interface {
        let mut closure: Vec<TypeId> = Vec::new();
        for imp in &b.implements {
            if imp.interface as usize >= registry.len() {
                return Err(KernelError::TypeConstruction {
                    reason: "unknown interface",
                });
            }
            interface_closure_in(&registry, imp.interface, &mut closure);
        }
        if let Some(sup) = b.supertype {
            for table in &registry[sup as usize].interfaces {
                interface_closure_in(&registry, table.interface, &mut closure);
            }
        }

        for &iface in &closure {
            let decls = &registry[iface as usize].iface_methods;
            let mut methods = Vec::with_capacity(decls.len());
            for slot in 0..decls.len() as u16 {
                let resolved = resolve_interface_slot(&registry, &b, iface, slot, &closure)?;
                methods.push(resolved);
            }
            interfaces.push(InterfaceTable {
                interface: iface,
                methods,
            });
        }
    }

    let instance_size = fields.len() * core::mem::size_of::<u64>();
    let statics_len = b.static_fields.len();
    let desc = Box::leak(Box::new(TypeDescriptor {
        id,
        name: b.name,
        kind: b.kind,
        supertype: b.supertype,
        extends: b.extends,
        interfaces,
        vtable,
        fields,
        instance_size,
        iface_methods: b.iface_methods,
        sealed: b.sealed,
        before_field_init: b.before_field_init,
        initializer: AtomicU32::new(b.initializer.map_or(0, |m| m.0 + 1)),
        init_state: AtomicU32::new(TypeInitState::NotRun as u32),
        init_owner: AtomicU64::new(0),
        static_fields: b.static_fields,
        statics: Mutex::new(alloc::vec![0u64; statics_len]),
    }));
    registry.push(desc);
    Ok(id)
}

fn interface_closure_in(
    registry: &[&'static TypeDescriptor],
    iface: TypeId,
    out: &mut Vec<TypeId>,
) {
    if out.contains(&iface) {
        return;
    }
    out.push(iface);
    for &base in &registry[iface as usize].extends {
        interface_closure_in(registry, base, out);
    }
}

/// Pick the concrete method behind `(iface, slot)` for the type being
/// defined. Resolution order: the type's own provided implementation, the
/// supertype's choice, the most-derived default-method override among the
/// implemented interfaces, then the declaring interface's own default.
fn resolve_interface_slot(
    registry: &[&'static TypeDescriptor],
    b: &TypeBuilder,
    iface: TypeId,
    slot: u16,
    closure: &[TypeId],
) -> KernelResult<MethodId> {
    // 1. Implementation provided by the type itself (explicit or implicit,
    //    they are simply different methods wired here).
    for imp in &b.implements {
        if imp.interface == iface {
            if let Some(&(_, m)) = imp.slots.iter().find(|&&(s, _)| s == slot) {
                return Ok(m);
            }
        }
    }

    // 2. Whatever the supertype resolved for this slot.
    if let Some(sup) = b.supertype {
        let sup = registry[sup as usize];
        if let Some(table) = sup.interfaces.iter().find(|t| t.interface == iface) {
            if let Some(&m) = table.methods.get(slot as usize) {
                return Ok(m);
            }
        }
    }

    // 3. Default-method overrides declared by other implemented
    //    interfaces. The most derived wins; two unrelated providers with
    //    no tiebreaker is a construction-time failure.
    let mut candidates: Vec<TypeId> = Vec::new();
    for &j in closure {
        if j == iface {
            continue;
        }
        let decls = &registry[j as usize].iface_methods;
        if decls
            .iter()
            .any(|d| d.overrides == Some((iface, slot)) && d.default_body.is_some())
        {
            candidates.push(j);
        }
    }
    // Drop candidates that a more derived candidate extends.
    let most_derived: Vec<TypeId> = candidates
        .iter()
        .copied()
        .filter(|&j1| {
            !candidates
                .iter()
                .any(|&j2| j2 != j1 && interface_extends(registry, j2, j1))
        })
        .collect();
    match most_derived.len() {
        0 => {}
        1 => {
            let j = most_derived[0];
            let decl = registry[j as usize]
                .iface_methods
                .iter()
                .find(|d| d.overrides == Some((iface, slot)))
                .expect("candidate checked above");
            return Ok(decl.default_body.expect("candidate has body"));
        }
        _ => {
            return Err(KernelError::TypeConstruction {
                reason: "ambiguous default interface method",
            })
        }
    }

    // 4. The declaring interface's own default body.
    if let Some(decl) = registry[iface as usize].iface_methods.get(slot as usize) {
        if let Some(body) = decl.default_body {
            return Ok(body);
        }
    }

    Err(KernelError::TypeConstruction {
        reason: "missing interface implementation",
    })
}

/// Whether interface `derived` (transitively) extends `base`.
fn interface_extends(registry: &[&'static TypeDescriptor], derived: TypeId, base: TypeId) -> bool {
    let mut stack = alloc::vec![derived];
    while let Some(i) = stack.pop() {
        if i == base && i != derived {
            return true;
        }
        for &e in &registry[i as usize].extends {
            if e == base {
                return true;
            }
            stack.push(e);
        }
    }
    false
}

/// Convenience used by diagnostics and tests.
pub fn interface_closure_of(iface: TypeId) -> Vec<TypeId> {
    let mut out = Vec::new();
    interface_closure(iface, &mut out);
    out
}
