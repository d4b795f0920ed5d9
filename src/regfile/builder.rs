//! Lowering of register descriptions into a concrete register file
//!
//! The builder runs in four stages: resolve the independent registers,
//! group them into naturally ordered register sets, lift each set, then
//! synthesize sub-register fields. Update-on-write edges are wired in a
//! final pass once every field exists, so binding order in the description
//! never matters.

use std::cmp::Ordering;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

use super::{CondFlag, Expr, RegType, RegisterBuildError, RegisterDesc};

/// A contiguous storage cell of the register record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCell {
    /// Byte offset within the record.
    pub offset: usize,
    /// Rounded storage width in bits.
    pub bits: u32,
}

/// A bit range within a storage cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub cell: usize,
    pub bit_start: u32,
    pub bits: u32,
}

/// How a field is realized.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Plain storage within the owning cell.
    Storage(SlotRef),
    /// Anonymous filler keeping the record a packed union of cells.
    Padding(SlotRef),
    /// Read-only expression over other registers; no storage.
    Hardwired(Expr),
    /// Bidirectional view of another register's storage.
    Alias(SlotRef),
    /// Own storage; writes propagate to the named register.
    UpdateOnWrite { slot: SlotRef, target: String },
    /// Reference to a condition flag.
    Flag(CondFlag),
    /// Custom-evaluated field; reads invoke the front-end evaluator.
    Computed,
}

/// One realized register field, possibly with sub-fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RegField {
    pub name: String,
    pub decl_bits: u32,
    pub store_bits: u32,
    /// Absolute bit offset within the owning cell.
    pub bit_start: u32,
    pub kind: FieldKind,
    pub subs: Vec<RegField>,
}

/// A lifted independent register or register set.
#[derive(Debug, Clone, PartialEq)]
pub enum RegUnit {
    Scalar(RegField),
    /// Naturally numbered same-typed family collapsed into an indexed
    /// group; elements keep their own names and cells.
    Set {
        name: String,
        ty: RegType,
        regs: Vec<RegField>,
    },
}

impl RegUnit {
    pub fn name(&self) -> &str {
        match self {
            RegUnit::Scalar(field) => &field.name,
            RegUnit::Set { name, .. } => name,
        }
    }
}

/// Per-name lookup result.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    Slot(SlotRef),
    Hardwired,
    Flag(CondFlag),
    Computed,
}

/// The concrete typed record the JIT loads and stores through.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub units: Vec<RegUnit>,
    pub cells: Vec<StorageCell>,
    /// Total record size in bytes.
    pub size_bytes: usize,
    index: FxHashMap<String, FieldRef>,
}

impl RegisterFile {
    /// Resolve a register or field name.
    pub fn field_ref(&self, name: &str) -> Option<&FieldRef> {
        self.index.get(name)
    }

    /// Storage bit range of a name, when it has one. Aliased names resolve
    /// to the storage they share.
    pub fn slot(&self, name: &str) -> Option<SlotRef> {
        match self.index.get(name)? {
            FieldRef::Slot(slot) => Some(*slot),
            _ => None,
        }
    }

    /// Byte offset and bit range of a name within the record.
    pub fn locate(&self, name: &str) -> Option<(usize, u32, u32)> {
        let slot = self.slot(name)?;
        let cell = self.cells.get(slot.cell)?;
        Some((cell.offset, slot.bit_start, slot.bits))
    }
}

/// Build a register file from a description graph.
pub fn build(regs: &[RegisterDesc]) -> Result<RegisterFile, RegisterBuildError> {
    let mut builder = Builder::new(regs);

    // Stage 1: independent registers are the non-pseudo tops nobody aliases.
    let bidi_targets = collect_bidi_targets(regs);
    let mut indep: Vec<&RegisterDesc> = regs
        .iter()
        .filter(|r| !r.is_pseudo() && !bidi_targets.contains(r.name.as_str()))
        .collect();
    indep.sort_by(|a, b| natural_cmp(&a.name, &b.name));

    // Stage 2: collapse consecutive same-stem same-type runs into sets.
    let sets = make_regsets(&indep);

    // Stage 3 and 4: lift each set and synthesize its sub-registers.
    let mut units = Vec::with_capacity(sets.len());
    for set in sets {
        debug!(
            set = %set.name,
            ty = %set.ty,
            count = set.members.len(),
            "lifting register set"
        );
        if set.members.len() == 1 {
            units.push(RegUnit::Scalar(builder.build_top(set.members[0])?));
        } else {
            let mut fields = Vec::with_capacity(set.members.len());
            for member in &set.members {
                fields.push(builder.build_top(*member)?);
            }
            units.push(RegUnit::Set {
                name: set.name,
                ty: set.ty,
                regs: fields,
            });
        }
    }

    let file = RegisterFile {
        units,
        cells: builder.cells,
        size_bytes: builder.size_bytes,
        index: builder.index,
    };

    // Final pass: wire update-on-write edges now that every field exists.
    wire_update_on_write(&file)?;

    Ok(file)
}

struct RegSet<'a> {
    name: String,
    stem: String,
    ty: RegType,
    members: SmallVec<[&'a RegisterDesc; 8]>,
}

fn collect_bidi_targets(regs: &[RegisterDesc]) -> FxHashSet<&str> {
    fn visit<'a>(desc: &'a RegisterDesc, out: &mut FxHashSet<&'a str>) {
        if desc.bidi {
            if let Some(target) = &desc.binding {
                out.insert(target.as_str());
            }
        }
        for sub in &desc.subs {
            visit(sub, out);
        }
    }
    let mut out = FxHashSet::default();
    for reg in regs {
        visit(reg, &mut out);
    }
    out
}

fn make_regsets<'a>(sorted: &[&'a RegisterDesc]) -> Vec<RegSet<'a>> {
    let mut taken = FxHashSet::default();
    let mut sets: Vec<RegSet<'a>> = Vec::new();

    let mut flush = |set: Option<RegSet<'a>>, sets: &mut Vec<RegSet<'a>>| {
        if let Some(mut set) = set {
            while taken.contains(&set.name) {
                set.name = inc_name(&set.name);
            }
            taken.insert(set.name.clone());
            sets.push(set);
        }
    };

    let mut current: Option<RegSet<'a>> = None;
    for reg in sorted {
        let stem = drop_digits(&reg.name).to_string();
        match current.as_mut() {
            Some(set) if set.stem == stem && set.ty == reg.ty => set.members.push(*reg),
            _ => {
                flush(current.take(), &mut sets);
                current = Some(RegSet {
                    name: stem.clone(),
                    stem,
                    ty: reg.ty,
                    members: SmallVec::from_slice(&[*reg]),
                });
            }
        }
    }
    flush(current, &mut sets);
    sets
}

struct Builder<'a> {
    /// Declared top-level registers by name, the preferred binding targets.
    tops: FxHashMap<&'a str, &'a RegisterDesc>,
    /// Every node by name, for binding targets declared as sub-registers.
    all: FxHashMap<&'a str, &'a RegisterDesc>,
    cells: Vec<StorageCell>,
    size_bytes: usize,
    index: FxHashMap<String, FieldRef>,
}

impl<'a> Builder<'a> {
    fn new(regs: &'a [RegisterDesc]) -> Self {
        fn visit<'a>(desc: &'a RegisterDesc, all: &mut FxHashMap<&'a str, &'a RegisterDesc>) {
            all.entry(desc.name.as_str()).or_insert(desc);
            for sub in &desc.subs {
                visit(sub, all);
            }
        }
        let mut tops = FxHashMap::default();
        let mut all = FxHashMap::default();
        for reg in regs {
            tops.entry(reg.name.as_str()).or_insert(reg);
            visit(reg, &mut all);
        }
        Builder {
            tops,
            all,
            cells: Vec::new(),
            size_bytes: 0,
            index: FxHashMap::default(),
        }
    }

    fn resolve(&self, name: &str) -> Option<&'a RegisterDesc> {
        self.tops.get(name).or_else(|| self.all.get(name)).copied()
    }

    fn check_type(desc: &RegisterDesc) -> Result<u32, RegisterBuildError> {
        let bits = desc.ty.bits;
        if bits == 0 || bits > 4096 {
            return Err(RegisterBuildError::TypeConversion {
                name: desc.name.clone(),
                bits,
            });
        }
        Ok(bits)
    }

    fn alloc_cell(&mut self, bits: u32) -> usize {
        let bytes = (bits / 8) as usize;
        let align = bytes.min(8);
        let offset = (self.size_bytes + align - 1) / align * align;
        self.size_bytes = offset + bytes;
        self.cells.push(StorageCell { offset, bits });
        self.cells.len() - 1
    }

    fn register(&mut self, name: &str, fref: FieldRef) {
        self.index.entry(name.to_string()).or_insert(fref);
    }

    fn build_top(&mut self, desc: &'a RegisterDesc) -> Result<RegField, RegisterBuildError> {
        let decl_bits = Self::check_type(desc)?;
        let store_bits = round_bits(decl_bits);
        let cell = self.alloc_cell(store_bits);
        let slot = SlotRef {
            cell,
            bit_start: 0,
            bits: decl_bits,
        };
        self.register(&desc.name, FieldRef::Slot(slot));

        validate_sub_ranges(desc)?;

        let mut subs = Vec::with_capacity(desc.subs.len());
        for sub in &desc.subs {
            subs.push(self.build_sub(desc, cell, 0, sub)?);
        }

        // A narrow leaf register shares its cell with an anonymous filler so
        // the record stays a packed union of whole storage cells.
        if subs.is_empty() && decl_bits < store_bits && store_bits <= 64 {
            subs.push(RegField {
                name: format!("__unused_{}", desc.name),
                decl_bits: store_bits - decl_bits,
                store_bits,
                bit_start: decl_bits,
                kind: FieldKind::Padding(SlotRef {
                    cell,
                    bit_start: decl_bits,
                    bits: store_bits - decl_bits,
                }),
                subs: Vec::new(),
            });
        }

        Ok(RegField {
            name: desc.name.clone(),
            decl_bits,
            store_bits,
            bit_start: 0,
            kind: FieldKind::Storage(slot),
            subs,
        })
    }

    fn build_sub(
        &mut self,
        owner: &RegisterDesc,
        cell: usize,
        base_bit: u32,
        desc: &'a RegisterDesc,
    ) -> Result<RegField, RegisterBuildError> {
        let bits = Self::check_type(desc)?;
        let bit_start = base_bit + desc.bit_start;

        let (name, kind) = if let Some(expr) = &desc.hardwired {
            // Hardwired fields evaluate an expression and carry no state.
            self.register(&desc.name, FieldRef::Hardwired);
            (desc.name.clone(), FieldKind::Hardwired(expr.clone()))
        } else if desc.bidi {
            return self.build_aliased_sub(owner, cell, bit_start, desc);
        } else if let Some(target) = &desc.binding {
            if let Some(pseudo) = target.strip_prefix('%') {
                // Only the condition-flag family may be bound at sub level.
                let flag = CondFlag::from_name(pseudo).ok_or_else(|| {
                    RegisterBuildError::IllegalPseudo {
                        name: target.clone(),
                    }
                })?;
                if bits != 1 {
                    return Err(RegisterBuildError::FlagWidth {
                        name: desc.name.clone(),
                        bits,
                    });
                }
                self.register(&desc.name, FieldRef::Flag(flag));
                (desc.name.clone(), FieldKind::Flag(flag))
            } else {
                // Update-on-write: own storage, writes propagate to the
                // bound register. The edge is validated once all fields
                // exist.
                let slot = SlotRef {
                    cell,
                    bit_start,
                    bits,
                };
                self.register(&desc.name, FieldRef::Slot(slot));
                (
                    desc.name.clone(),
                    FieldKind::UpdateOnWrite {
                        slot,
                        target: target.clone(),
                    },
                )
            }
        } else if desc.special_eval {
            self.register(&desc.name, FieldRef::Computed);
            (desc.name.clone(), FieldKind::Computed)
        } else {
            let slot = SlotRef {
                cell,
                bit_start,
                bits,
            };
            self.register(&desc.name, FieldRef::Slot(slot));
            (desc.name.clone(), FieldKind::Storage(slot))
        };

        if !desc.special_eval {
            validate_sub_ranges(desc)?;
        }

        let mut subs = Vec::with_capacity(desc.subs.len());
        for sub in &desc.subs {
            subs.push(self.build_sub(desc, cell, bit_start, sub)?);
        }

        Ok(RegField {
            name,
            decl_bits: bits,
            store_bits: round_bits(bits),
            bit_start,
            kind,
            subs,
        })
    }

    /// A bidirectionally bound field is a renamed view: the bound register
    /// is rebuilt under this parent with its aliasing range narrowed to the
    /// field's bits, and both names resolve to the same storage.
    fn build_aliased_sub(
        &mut self,
        owner: &RegisterDesc,
        cell: usize,
        bit_start: u32,
        desc: &'a RegisterDesc,
    ) -> Result<RegField, RegisterBuildError> {
        if desc.bind_copy {
            return Err(RegisterBuildError::BindingCopyUnsupported {
                field: desc.name.clone(),
            });
        }
        let target_name = desc.binding.as_deref().unwrap_or_default();
        let target = self.resolve(target_name).ok_or_else(|| {
            RegisterBuildError::UnknownBinding {
                field: desc.name.clone(),
                target: target_name.to_string(),
            }
        })?;
        if std::ptr::eq(target, desc) {
            return Err(RegisterBuildError::SelfAlias {
                name: desc.name.clone(),
            });
        }
        let bits = Self::check_type(desc)?;
        let target_bits = Self::check_type(target)?;
        if target_bits != bits {
            return Err(RegisterBuildError::SizeMismatch {
                owner: owner.name.clone(),
                field: desc.name.clone(),
                field_bits: bits,
                target: target.name.clone(),
                target_bits,
            });
        }

        let slot = SlotRef {
            cell,
            bit_start,
            bits,
        };
        self.register(&desc.name, FieldRef::Slot(slot));
        self.register(&target.name, FieldRef::Slot(slot));

        let mut subs = Vec::with_capacity(target.subs.len());
        for sub in &target.subs {
            subs.push(self.build_sub(target, cell, bit_start, sub)?);
        }

        Ok(RegField {
            name: target.name.clone(),
            decl_bits: bits,
            store_bits: round_bits(bits),
            bit_start,
            kind: FieldKind::Alias(slot),
            subs,
        })
    }
}

/// Sub-registers must sit inside their parent's declared range, and
/// storage-bearing siblings must not overlap. Parents with a custom
/// evaluator skip the check, their subtree size is decoupled by design.
fn validate_sub_ranges(desc: &RegisterDesc) -> Result<(), RegisterBuildError> {
    if desc.special_eval {
        return Ok(());
    }
    let mut occupied: SmallVec<[(u32, u32); 8]> = SmallVec::new();
    for sub in &desc.subs {
        let end = sub.bit_start + sub.ty.bits;
        if end > desc.ty.bits {
            return Err(RegisterBuildError::SubRange {
                owner: desc.name.clone(),
                field: sub.name.clone(),
            });
        }
        let has_storage =
            sub.hardwired.is_none() && !sub.bidi && !sub.special_eval && {
                match &sub.binding {
                    Some(target) => !target.starts_with('%'),
                    None => true,
                }
            };
        if has_storage {
            for &(start, stop) in &occupied {
                if sub.bit_start < stop && start < end {
                    return Err(RegisterBuildError::SubRange {
                        owner: desc.name.clone(),
                        field: sub.name.clone(),
                    });
                }
            }
            occupied.push((sub.bit_start, end));
        }
    }
    Ok(())
}

/// Validate update-on-write edges: targets exist (siblings of the same top
/// take precedence over the global namespace), nothing binds to itself, and
/// chains terminate.
fn wire_update_on_write(file: &RegisterFile) -> Result<(), RegisterBuildError> {
    fn subtree_contains(field: &RegField, name: &str) -> bool {
        field.name == name || field.subs.iter().any(|sub| subtree_contains(sub, name))
    }

    fn collect<'f>(field: &'f RegField, out: &mut Vec<(&'f RegField, &'f str)>) {
        if let FieldKind::UpdateOnWrite { target, .. } = &field.kind {
            out.push((field, target.as_str()));
        }
        for sub in &field.subs {
            collect(sub, out);
        }
    }

    let mut edges: FxHashMap<&str, &str> = FxHashMap::default();
    for unit in &file.units {
        let tops: &[RegField] = match unit {
            RegUnit::Scalar(field) => std::slice::from_ref(field),
            RegUnit::Set { regs, .. } => regs,
        };
        for top in tops {
            let mut uows = Vec::new();
            collect(top, &mut uows);
            for (field, target) in uows {
                if field.name == target {
                    return Err(RegisterBuildError::SelfAlias {
                        name: field.name.clone(),
                    });
                }
                if !subtree_contains(top, target) && !file.index.contains_key(target) {
                    return Err(RegisterBuildError::UnknownBinding {
                        field: field.name.clone(),
                        target: target.to_string(),
                    });
                }
                edges.insert(field.name.as_str(), target);
            }
        }
    }

    // Write-through chains must be acyclic.
    for start in edges.keys() {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut cursor = *start;
        while let Some(next) = edges.get(cursor) {
            if !seen.insert(cursor) {
                return Err(RegisterBuildError::SelfAlias {
                    name: start.to_string(),
                });
            }
            cursor = *next;
        }
    }

    Ok(())
}

fn round_bits(bits: u32) -> u32 {
    match bits {
        0..=8 => 8,
        9..=16 => 16,
        17..=32 => 32,
        33..=64 => 64,
        _ => bits.div_ceil(64) * 64,
    }
}

/// Strip the trailing digit run, the stem shared by a register family.
fn drop_digits(name: &str) -> &str {
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Produce the next free name for a colliding register set.
fn inc_name(name: &str) -> String {
    let stem = drop_digits(name);
    let index = name[stem.len()..].parse::<u64>().map_or(1, |n| n + 1);
    format!("{stem}{index}")
}

/// Natural-order comparison: digit runs compare numerically, everything
/// else bytewise, so `R2` sorts before `R10`.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let ia = i;
            let jb = j;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            let run_a = trim_zeros(&a[ia..i]);
            let run_b = trim_zeros(&b[jb..j]);
            let ord = run_a.len().cmp(&run_b.len()).then_with(|| run_a.cmp(run_b));
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ord = a[i].cmp(&b[j]);
            if ord != Ordering::Equal {
                return ord;
            }
            i += 1;
            j += 1;
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let mut start = 0;
    while start + 1 < digits.len() && digits[start] == b'0' {
        start += 1;
    }
    &digits[start..]
}
