//! Declarative register descriptions and the register-file builder
//!
//! A front-end describes its registers as a graph of [`RegisterDesc`] nodes:
//! independent registers, sub-registers at explicit bit offsets, hardwired
//! expressions, bidirectional aliases, update-on-write bindings, and pseudo
//! condition-flag bindings. [`build`] lowers the description into a concrete
//! [`RegisterFile`]: a packed record of storage cells plus a per-name lookup
//! the JIT loads and stores through.

mod builder;

pub use builder::{
    build, FieldKind, FieldRef, RegField, RegUnit, RegisterFile, SlotRef, StorageCell,
};

use std::fmt;

/// A bit-width bearing register type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegType {
    pub bits: u32,
}

impl RegType {
    pub fn new(bits: u32) -> Self {
        RegType { bits }
    }
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.bits)
    }
}

/// Condition flags bindable from pseudo registers (`%C` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondFlag {
    C,
    N,
    P,
    V,
    Z,
}

impl CondFlag {
    /// Parse the flag family name without its `%` prefix.
    pub fn from_name(name: &str) -> Option<CondFlag> {
        match name {
            "C" => Some(CondFlag::C),
            "N" => Some(CondFlag::N),
            "P" => Some(CondFlag::P),
            "V" => Some(CondFlag::V),
            "Z" => Some(CondFlag::Z),
            _ => None,
        }
    }
}

/// Pure expression over other registers, used by hardwired fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(u64),
    Reg(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Xor(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Shl(Box<Expr>, u32),
    Shr(Box<Expr>, u32),
}

impl Expr {
    /// Evaluate against a register lookup. Hardwired fields are read-only,
    /// so host-side evaluation is all a front-end needs outside lifted code.
    pub fn eval(
        &self,
        lookup: &dyn Fn(&str) -> Option<u64>,
    ) -> Result<u64, RegisterBuildError> {
        Ok(match self {
            Expr::Const(v) => *v,
            Expr::Reg(name) => {
                lookup(name).ok_or_else(|| RegisterBuildError::UnknownBinding {
                    field: String::from("<expr>"),
                    target: name.clone(),
                })?
            }
            Expr::Not(a) => !a.eval(lookup)?,
            Expr::And(a, b) => a.eval(lookup)? & b.eval(lookup)?,
            Expr::Or(a, b) => a.eval(lookup)? | b.eval(lookup)?,
            Expr::Xor(a, b) => a.eval(lookup)? ^ b.eval(lookup)?,
            Expr::Add(a, b) => a.eval(lookup)?.wrapping_add(b.eval(lookup)?),
            Expr::Sub(a, b) => a.eval(lookup)?.wrapping_sub(b.eval(lookup)?),
            Expr::Shl(a, n) => a.eval(lookup)? << n,
            Expr::Shr(a, n) => a.eval(lookup)? >> n,
        })
    }
}

/// One node of a register description graph.
///
/// Top-level nodes are candidate independent registers; nodes in `subs` are
/// bitfields of their parent at `bit_start`. Bindings refer to other nodes
/// by name.
#[derive(Debug, Clone)]
pub struct RegisterDesc {
    pub name: String,
    pub ty: RegType,
    /// Offset of this field within its parent. Zero for top-level nodes.
    pub bit_start: u32,
    /// Pure expression this field evaluates to; such a field has no storage.
    pub hardwired: Option<Expr>,
    /// Name of the register this field is bound to.
    pub binding: Option<String>,
    /// The binding is a bidirectional alias rather than update-on-write.
    pub bidi: bool,
    /// Copy-flavored binding. Not supported by the builder.
    pub bind_copy: bool,
    /// This field has a custom evaluator; size validation is skipped and no
    /// storage or expression is recorded.
    pub special_eval: bool,
    pub subs: Vec<RegisterDesc>,
}

impl RegisterDesc {
    pub fn new(name: &str, bits: u32) -> Self {
        RegisterDesc {
            name: name.to_string(),
            ty: RegType::new(bits),
            bit_start: 0,
            hardwired: None,
            binding: None,
            bidi: false,
            bind_copy: false,
            special_eval: false,
            subs: Vec::new(),
        }
    }

    /// A sub-register field at `bit_start` within its parent.
    pub fn field(name: &str, bits: u32, bit_start: u32) -> Self {
        let mut desc = RegisterDesc::new(name, bits);
        desc.bit_start = bit_start;
        desc
    }

    pub fn with_sub(mut self, sub: RegisterDesc) -> Self {
        self.subs.push(sub);
        self
    }

    pub fn hardwired_to(mut self, expr: Expr) -> Self {
        self.hardwired = Some(expr);
        self
    }

    pub fn bound_to(mut self, target: &str) -> Self {
        self.binding = Some(target.to_string());
        self
    }

    pub fn bidi_bound_to(mut self, target: &str) -> Self {
        self.binding = Some(target.to_string());
        self.bidi = true;
        self
    }

    pub fn special(mut self) -> Self {
        self.special_eval = true;
        self
    }

    /// Pseudo registers are builder-internal placeholders: a leading `%` is
    /// the condition-flag family, a leading `$` or trailing `?` an auxiliary
    /// marker. They never become storage.
    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with('%') || self.name.starts_with('$') || self.name.ends_with('?')
    }
}

/// Failure while lowering a register description.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterBuildError {
    /// The declared type cannot be realized as a storage width.
    TypeConversion { name: String, bits: u32 },
    /// Bidirectional binding between fields of different sizes.
    SizeMismatch {
        owner: String,
        field: String,
        field_bits: u32,
        target: String,
        target_bits: u32,
    },
    /// A register aliased or bound to itself.
    SelfAlias { name: String },
    /// Pseudo binding outside the condition-flag family.
    IllegalPseudo { name: String },
    /// Condition-flag binding on a field wider than one bit.
    FlagWidth { name: String, bits: u32 },
    /// Binding target that names no known register.
    UnknownBinding { field: String, target: String },
    /// Copy-flavored bidirectional binding.
    BindingCopyUnsupported { field: String },
    /// Sub-register range escaping or overlapping within its parent.
    SubRange { owner: String, field: String },
}

impl fmt::Display for RegisterBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterBuildError::TypeConversion { name, bits } => {
                write!(f, "register '{name}': cannot realize a {bits}-bit type")
            }
            RegisterBuildError::SizeMismatch {
                owner,
                field,
                field_bits,
                target,
                target_bits,
            } => write!(
                f,
                "bidirectional binding '{owner}' requires that the bitfield '{field}' \
                 size ({field_bits}) matches the aliased register ({target}) size \
                 ({target_bits}) and type"
            ),
            RegisterBuildError::SelfAlias { name } => {
                write!(f, "register '{name}' binds to itself")
            }
            RegisterBuildError::IllegalPseudo { name } => write!(
                f,
                "only conditional pseudo registers may be aliased in bitfields, not '{name}'"
            ),
            RegisterBuildError::FlagWidth { name, bits } => write!(
                f,
                "bound conditional bit flag '{name}' is {bits} bits in size, it shall be one"
            ),
            RegisterBuildError::UnknownBinding { field, target } => {
                write!(f, "field '{field}' binds to unknown register '{target}'")
            }
            RegisterBuildError::BindingCopyUnsupported { field } => {
                write!(f, "field '{field}': copy bindings are not supported")
            }
            RegisterBuildError::SubRange { owner, field } => {
                write!(f, "sub-register '{field}' escapes or overlaps within '{owner}'")
            }
        }
    }
}

impl std::error::Error for RegisterBuildError {}
