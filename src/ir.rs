// SPDX-License-Identifier: BSD-3-Clause
//! Arena representation of the program under analysis.
//!
//! Everything is owned by [`Program`] and addressed by `u32` handles. Values
//! carry adjacency lists of their uses, which are not serialized;
//! [`Program::finish`] validates the arena and rebuilds them.
//! The format stays close to LLVM IR, so `llvm::load` is a mostly
//! mechanical translation. Nothing outside that module depends on `llvm-ir`.

use std::fmt::Display;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

mod error;
pub use error::*;
mod name;
pub use name::*;
#[cfg(feature = "llvm")]
pub mod llvm;

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Type {
    Void,
    Int { bits: u32 },
    Float,
    /// `pointee` is `None` for opaque pointers
    Pointer { pointee: Option<TypeId> },
    Struct { fields: Vec<TypeId> },
    Named { name: String },
    Array { element: TypeId, len: u64 },
    Vector { element: TypeId, len: u64 },
    Function,
    Other,
}

impl Type {
    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct { .. } | Type::Named { .. })
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DebugLoc {
    #[serde(default)]
    pub directory: Option<String>,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub col: Option<u32>,
}

impl Display for DebugLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(dir) = &self.directory {
            if !dir.is_empty() {
                write!(f, "{}/", dir)?;
            }
        }
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(col) = self.col {
            write!(f, ":{}", col)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValueKind {
    Param {
        function: FunctionId,
        index: usize,
    },
    Result {
        op: OpId,
    },
    Global {
        name: String,
    },
    Function {
        function: FunctionId,
    },
    Int {
        bits: u32,
        value: i64,
    },
    Null,
    Undef,
    /// Constant cast expression
    ConstCast {
        operand: ValueId,
    },
    /// Constant `getelementptr` expression
    ConstGep {
        base: ValueId,
        source: Option<TypeId>,
        indices: Vec<ValueId>,
    },
    Other,
}

/// A single use of a value: operand number `operand` of operation `op`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Use {
    pub op: OpId,
    pub operand: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    #[serde(flatten)]
    pub kind: ValueKind,
    #[serde(default)]
    pub ty: Option<TypeId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(skip)]
    pub(crate) uses: Vec<Use>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Callee {
    Direct(FunctionId),
    Indirect(ValueId),
    Asm,
}

/// Operand conventions follow LLVM, e.g. `store` is `[value, pointer]`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Opcode {
    Alloca,
    /// `[pointer]`
    Load,
    /// `[value, pointer]`
    Store,
    /// `[base, index...]`; `source` is the source element type
    GetElementPtr {
        source: Option<TypeId>,
    },
    /// `[operand]`
    Cast,
    /// `[aggregate]`
    ExtractValue {
        indices: Vec<u32>,
    },
    /// `[aggregate, element]`
    InsertValue {
        indices: Vec<u32>,
    },
    Phi,
    /// `[condition, true, false]`
    Select,
    /// Operands are the arguments
    Call {
        callee: Callee,
    },
    /// `memcpy`/`memmove`: `[dst, src, len, ...]`
    MemTransfer,
    /// `[dst, byte, len, ...]`
    MemSet,
    /// `[]` or `[value]`
    Return,
    Branch,
    Unreachable,
    Other,
}

impl Opcode {
    pub fn is_call(&self) -> bool {
        matches!(self, Opcode::Call { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub block: BlockId,
    #[serde(flatten)]
    pub opcode: Opcode,
    #[serde(default)]
    pub operands: Vec<ValueId>,
    #[serde(default)]
    pub result: Option<ValueId>,
    #[serde(default)]
    pub debug_loc: Option<DebugLoc>,
    #[serde(skip)]
    pub(crate) index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub function: FunctionId,
    #[serde(default)]
    pub name: Option<String>,
    pub ops: Vec<OpId>,
    #[serde(default)]
    pub successors: Vec<BlockId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ValueId>,
    /// Entry block first. Empty for declarations.
    #[serde(default)]
    pub blocks: Vec<BlockId>,
    #[serde(default)]
    pub return_type: Option<TypeId>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// Uniform view of instruction and constant-expression GEPs.
#[derive(Clone, Copy, Debug)]
pub struct Gep<'p> {
    pub base: ValueId,
    pub source: Option<TypeId>,
    pub indices: &'p [ValueId],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub types: Vec<Type>,
    pub values: Vec<Value>,
    pub functions: Vec<Function>,
    pub blocks: Vec<Block>,
    pub ops: Vec<Operation>,
}

// Bound on cast/GEP chains walked by `strip_casts` and `underlying_object`
const MAX_LOOKUP: usize = 64;

impl Program {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        let p: Program = serde_json::from_str(s)?;
        p.finish()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate handles and rebuild use lists and operation indices.
    pub fn finish(mut self) -> Result<Self, Error> {
        self.validate()?;
        for v in &mut self.values {
            v.uses.clear();
        }
        for (i, op) in self.ops.iter().enumerate() {
            for (n, v) in op.operands.iter().enumerate() {
                self.values[v.index()].uses.push(Use {
                    op: OpId::from_index(i),
                    operand: n,
                });
            }
        }
        for b in &self.blocks {
            for (i, op) in b.ops.iter().enumerate() {
                self.ops[op.index()].index = i as u32;
            }
        }
        Ok(self)
    }

    fn validate(&self) -> Result<(), Error> {
        let ty_ok = |t: &TypeId| t.index() < self.types.len();
        let val_ok = |v: &ValueId| v.index() < self.values.len();
        let fn_ok = |f: &FunctionId| f.index() < self.functions.len();
        let blk_ok = |b: &BlockId| b.index() < self.blocks.len();
        let op_ok = |o: &OpId| o.index() < self.ops.len();

        for (i, t) in self.types.iter().enumerate() {
            let ok = match t {
                Type::Pointer { pointee } => pointee.iter().all(ty_ok),
                Type::Struct { fields } => fields.iter().all(ty_ok),
                Type::Array { element, .. } | Type::Vector { element, .. } => ty_ok(element),
                Type::Void
                | Type::Int { .. }
                | Type::Float
                | Type::Named { .. }
                | Type::Function
                | Type::Other => true,
            };
            if !ok {
                return Err(Error(format!("type {} refers to a missing type", i)));
            }
        }

        for (i, v) in self.values.iter().enumerate() {
            let id = ValueId::from_index(i);
            if !v.ty.iter().all(ty_ok) {
                return Err(Error(format!("value {} has a missing type", id)));
            }
            let ok = match &v.kind {
                ValueKind::Param { function, index } => {
                    fn_ok(function) && self.functions[function.index()].params.get(*index) == Some(&id)
                }
                ValueKind::Result { op } => op_ok(op) && self.ops[op.index()].result == Some(id),
                ValueKind::Function { function } => fn_ok(function),
                ValueKind::ConstCast { operand } => val_ok(operand),
                ValueKind::ConstGep {
                    base,
                    source,
                    indices,
                } => val_ok(base) && source.iter().all(ty_ok) && indices.iter().all(val_ok),
                ValueKind::Global { .. }
                | ValueKind::Int { .. }
                | ValueKind::Null
                | ValueKind::Undef
                | ValueKind::Other => true,
            };
            if !ok {
                return Err(Error(format!("value {} is inconsistent", id)));
            }
        }

        for (i, f) in self.functions.iter().enumerate() {
            let id = FunctionId::from_index(i);
            if !f.params.iter().all(val_ok) || !f.return_type.iter().all(ty_ok) {
                return Err(Error(format!("function {} ({}) is inconsistent", id, f.name)));
            }
            for b in &f.blocks {
                if !blk_ok(b) || self.blocks[b.index()].function != id {
                    return Err(Error(format!(
                        "function {} ({}) lists foreign block {}",
                        id, f.name, b
                    )));
                }
            }
        }

        for (i, b) in self.blocks.iter().enumerate() {
            let id = BlockId::from_index(i);
            if !fn_ok(&b.function) {
                return Err(Error(format!("block {} has a missing function", id)));
            }
            for o in &b.ops {
                if !op_ok(o) || self.ops[o.index()].block != id {
                    return Err(Error(format!("block {} lists foreign operation {}", id, o)));
                }
            }
            for s in &b.successors {
                if !blk_ok(s) || self.blocks[s.index()].function != b.function {
                    return Err(Error(format!("block {} has a bad successor {}", id, s)));
                }
            }
        }

        for (i, o) in self.ops.iter().enumerate() {
            let id = OpId::from_index(i);
            let callee_ok = match &o.opcode {
                Opcode::Call {
                    callee: Callee::Direct(f),
                } => fn_ok(f),
                Opcode::Call {
                    callee: Callee::Indirect(v),
                } => val_ok(v),
                Opcode::GetElementPtr { source } => source.iter().all(ty_ok),
                _ => true,
            };
            if !blk_ok(&o.block)
                || !o.operands.iter().all(val_ok)
                || !o.result.iter().all(val_ok)
                || !callee_ok
            {
                return Err(Error(format!("operation {} is inconsistent", id)));
            }
            if let Some(r) = o.result {
                if self.values[r.index()].kind != (ValueKind::Result { op: id }) {
                    return Err(Error(format!("result of {} is not defined by it", id)));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups

    #[inline]
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.index()]
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.index()]
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    #[inline]
    pub fn ty(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FunctionId::from_index(i), f))
    }

    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Operation)> {
        self.ops
            .iter()
            .enumerate()
            .map(|(i, o)| (OpId::from_index(i), o))
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    pub fn uses(&self, v: ValueId) -> &[Use] {
        &self.value(v).uses
    }

    pub fn function_of_op(&self, op: OpId) -> FunctionId {
        self.block(self.op(op).block).function
    }

    /// Position of `op` within its block.
    pub fn index_in_block(&self, op: OpId) -> usize {
        self.op(op).index as usize
    }

    /// The function a value is local to, if any.
    pub fn function_of_value(&self, v: ValueId) -> Option<FunctionId> {
        match &self.value(v).kind {
            ValueKind::Param { function, .. } => Some(*function),
            ValueKind::Result { op } => Some(self.function_of_op(*op)),
            _ => None,
        }
    }

    pub fn debug_loc(&self, op: OpId) -> Option<&DebugLoc> {
        self.op(op).debug_loc.as_ref()
    }

    pub fn value_type(&self, v: ValueId) -> Option<&Type> {
        self.value(v).ty.map(|t| self.ty(t))
    }

    /// The statically known target of a call, looking through constant casts
    /// of function addresses.
    pub fn callee(&self, op: OpId) -> Option<FunctionId> {
        match &self.op(op).opcode {
            Opcode::Call {
                callee: Callee::Direct(f),
            } => Some(*f),
            Opcode::Call {
                callee: Callee::Indirect(v),
            } => match self.value(self.strip_casts(*v)).kind {
                ValueKind::Function { function } => Some(function),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn callee_name(&self, op: OpId) -> Option<&str> {
        self.callee(op).map(|f| self.function(f).name.as_str())
    }

    pub fn const_int(&self, v: ValueId) -> Option<i64> {
        match self.value(v).kind {
            ValueKind::Int { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn gep(&self, v: ValueId) -> Option<Gep<'_>> {
        match &self.value(v).kind {
            ValueKind::Result { op } => {
                let o = self.op(*op);
                match (&o.opcode, o.operands.split_first()) {
                    (Opcode::GetElementPtr { source }, Some((base, indices))) => Some(Gep {
                        base: *base,
                        source: *source,
                        indices,
                    }),
                    _ => None,
                }
            }
            ValueKind::ConstGep {
                base,
                source,
                indices,
            } => Some(Gep {
                base: *base,
                source: *source,
                indices,
            }),
            _ => None,
        }
    }

    /// The operand of a cast, if `v` is one.
    pub fn cast_operand(&self, v: ValueId) -> Option<ValueId> {
        match &self.value(v).kind {
            ValueKind::Result { op } => {
                let o = self.op(*op);
                match (&o.opcode, o.operands.first()) {
                    (Opcode::Cast, Some(x)) => Some(*x),
                    _ => None,
                }
            }
            ValueKind::ConstCast { operand } => Some(*operand),
            _ => None,
        }
    }

    pub fn strip_casts(&self, mut v: ValueId) -> ValueId {
        for _ in 0..MAX_LOOKUP {
            match self.cast_operand(v) {
                Some(x) => v = x,
                None => break,
            }
        }
        v
    }

    /// Strip casts and GEPs, in the manner of LLVM's `getUnderlyingObject`.
    pub fn underlying_object(&self, mut v: ValueId) -> ValueId {
        for _ in 0..MAX_LOOKUP {
            if let Some(x) = self.cast_operand(v) {
                v = x;
            } else if let Some(g) = self.gep(v) {
                v = g.base;
            } else {
                break;
            }
        }
        v
    }

    // ------------------------------------------------------------------
    // Printing

    pub fn value_name(&self, v: ValueId) -> String {
        let value = self.value(v);
        if let Some(n) = &value.name {
            return format!("%{}", n);
        }
        match &value.kind {
            ValueKind::Global { name } => format!("@{}", name),
            ValueKind::Function { function } => format!("@{}", self.function(*function).name),
            ValueKind::Int { value, .. } => value.to_string(),
            ValueKind::Null => "null".to_string(),
            ValueKind::Undef => "undef".to_string(),
            ValueKind::ConstCast { operand } => format!("cast ({})", self.value_name(*operand)),
            ValueKind::ConstGep { base, indices, .. } => format!(
                "gep ({}, {})",
                self.value_name(*base),
                indices
                    .iter()
                    .map(|i| self.value_name(*i))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ValueKind::Param { .. } | ValueKind::Result { .. } | ValueKind::Other => {
                v.to_string()
            }
        }
    }

    pub fn type_name(&self, t: TypeId) -> String {
        match self.ty(t) {
            Type::Void => "void".to_string(),
            Type::Int { bits } => format!("i{}", bits),
            Type::Float => "float".to_string(),
            Type::Pointer { pointee: Some(p) } => format!("{}*", self.type_name(*p)),
            Type::Pointer { pointee: None } => "ptr".to_string(),
            Type::Struct { fields } => format!(
                "{{ {} }}",
                fields
                    .iter()
                    .map(|f| self.type_name(*f))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Type::Named { name } => format!("%{}", name),
            Type::Array { element, len } => format!("[{} x {}]", len, self.type_name(*element)),
            Type::Vector { element, len } => format!("<{} x {}>", len, self.type_name(*element)),
            Type::Function => "fn".to_string(),
            Type::Other => "?".to_string(),
        }
    }
}

// ----------------------------------------------------------------------
// Builder

/// Incremental construction of a [`Program`], used by the loaders and by
/// tests. Types, integer constants, globals and function addresses are
/// interned.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    type_ids: FxHashMap<Type, TypeId>,
    ints: FxHashMap<(u32, i64), ValueId>,
    globals: FxHashMap<String, ValueId>,
    function_values: FxHashMap<FunctionId, ValueId>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ty(&mut self, t: Type) -> TypeId {
        if let Some(id) = self.type_ids.get(&t) {
            return *id;
        }
        let id = TypeId::from_index(self.program.types.len());
        self.program.types.push(t.clone());
        self.type_ids.insert(t, id);
        id
    }

    pub fn pointer_to(&mut self, t: TypeId) -> TypeId {
        self.ty(Type::Pointer { pointee: Some(t) })
    }

    fn value(&mut self, kind: ValueKind, ty: Option<TypeId>) -> ValueId {
        let id = ValueId::from_index(self.program.values.len());
        self.program.values.push(Value {
            kind,
            ty,
            name: None,
            uses: Vec::new(),
        });
        id
    }

    pub fn name_value(&mut self, v: ValueId, name: &str) {
        self.program.values[v.index()].name = Some(name.to_string());
    }

    /// Declare a function. It becomes a definition once a block is added.
    pub fn function(&mut self, name: &str, params: &[TypeId], ret: Option<TypeId>) -> FunctionId {
        let id = FunctionId::from_index(self.program.functions.len());
        let params = params
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                self.value(
                    ValueKind::Param {
                        function: id,
                        index,
                    },
                    Some(*ty),
                )
            })
            .collect();
        self.program.functions.push(Function {
            name: name.to_string(),
            params,
            blocks: Vec::new(),
            return_type: ret,
        });
        id
    }

    pub fn param(&self, f: FunctionId, index: usize) -> ValueId {
        self.program.functions[f.index()].params[index]
    }

    pub fn block(&mut self, f: FunctionId) -> BlockId {
        let id = BlockId::from_index(self.program.blocks.len());
        self.program.blocks.push(Block {
            function: f,
            name: None,
            ops: Vec::new(),
            successors: Vec::new(),
        });
        self.program.functions[f.index()].blocks.push(id);
        id
    }

    pub fn name_block(&mut self, b: BlockId, name: &str) {
        self.program.blocks[b.index()].name = Some(name.to_string());
    }

    pub fn successors(&mut self, b: BlockId, succs: &[BlockId]) {
        self.program.blocks[b.index()]
            .successors
            .extend_from_slice(succs);
    }

    // ------------------------------------------------------------------
    // Constants

    pub fn global(&mut self, name: &str, ty: TypeId) -> ValueId {
        if let Some(v) = self.globals.get(name) {
            return *v;
        }
        let v = self.value(
            ValueKind::Global {
                name: name.to_string(),
            },
            Some(ty),
        );
        self.globals.insert(name.to_string(), v);
        v
    }

    pub fn int(&mut self, bits: u32, value: i64) -> ValueId {
        if let Some(v) = self.ints.get(&(bits, value)) {
            return *v;
        }
        let ty = self.ty(Type::Int { bits });
        let v = self.value(ValueKind::Int { bits, value }, Some(ty));
        self.ints.insert((bits, value), v);
        v
    }

    pub fn null(&mut self, ty: TypeId) -> ValueId {
        self.value(ValueKind::Null, Some(ty))
    }

    pub fn undef(&mut self, ty: Option<TypeId>) -> ValueId {
        self.value(ValueKind::Undef, ty)
    }

    pub fn opaque(&mut self, ty: Option<TypeId>) -> ValueId {
        self.value(ValueKind::Other, ty)
    }

    pub fn function_value(&mut self, f: FunctionId) -> ValueId {
        if let Some(v) = self.function_values.get(&f) {
            return *v;
        }
        let ty = self.ty(Type::Function);
        let ptr = self.pointer_to(ty);
        let v = self.value(ValueKind::Function { function: f }, Some(ptr));
        self.function_values.insert(f, v);
        v
    }

    pub fn const_cast(&mut self, operand: ValueId, ty: TypeId) -> ValueId {
        self.value(ValueKind::ConstCast { operand }, Some(ty))
    }

    pub fn const_gep(
        &mut self,
        base: ValueId,
        source: TypeId,
        indices: &[i64],
        ty: TypeId,
    ) -> ValueId {
        let indices = indices.iter().map(|i| self.int(64, *i)).collect();
        self.value(
            ValueKind::ConstGep {
                base,
                source: Some(source),
                indices,
            },
            Some(ty),
        )
    }

    pub fn const_gep_values(
        &mut self,
        base: ValueId,
        source: Option<TypeId>,
        indices: Vec<ValueId>,
        ty: Option<TypeId>,
    ) -> ValueId {
        self.value(
            ValueKind::ConstGep {
                base,
                source,
                indices,
            },
            ty,
        )
    }

    // ------------------------------------------------------------------
    // Operations

    /// Append a placeholder operation, to be completed with [`Self::fill`].
    /// Loaders use this to create results before their uses are translated.
    pub fn reserve(&mut self, block: BlockId, result: Option<TypeId>) -> (OpId, Option<ValueId>) {
        let op = OpId::from_index(self.program.ops.len());
        let result = result.map(|ty| self.value(ValueKind::Result { op }, Some(ty)));
        self.program.ops.push(Operation {
            block,
            opcode: Opcode::Other,
            operands: Vec::new(),
            result,
            debug_loc: None,
            index: 0,
        });
        self.program.blocks[block.index()].ops.push(op);
        (op, result)
    }

    pub fn fill(&mut self, op: OpId, opcode: Opcode, operands: Vec<ValueId>) {
        let o = &mut self.program.ops[op.index()];
        o.opcode = opcode;
        o.operands = operands;
    }

    pub fn push(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        operands: &[ValueId],
        result: Option<TypeId>,
    ) -> (OpId, Option<ValueId>) {
        let (op, result) = self.reserve(block, result);
        self.fill(op, opcode, operands.to_vec());
        (op, result)
    }

    fn push_value(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        operands: &[ValueId],
        ty: TypeId,
    ) -> ValueId {
        let op = OpId::from_index(self.program.ops.len());
        let v = self.value(ValueKind::Result { op }, Some(ty));
        self.program.ops.push(Operation {
            block,
            opcode,
            operands: operands.to_vec(),
            result: Some(v),
            debug_loc: None,
            index: 0,
        });
        self.program.blocks[block.index()].ops.push(op);
        v
    }

    pub fn set_debug_loc(&mut self, op: OpId, loc: DebugLoc) {
        self.program.ops[op.index()].debug_loc = Some(loc);
    }

    /// Direct call. The call has a result unless the callee returns `void`.
    pub fn call(
        &mut self,
        block: BlockId,
        callee: FunctionId,
        args: &[ValueId],
    ) -> (OpId, Option<ValueId>) {
        let ret = self.program.functions[callee.index()]
            .return_type
            .filter(|t| self.program.types[t.index()] != Type::Void);
        self.push(
            block,
            Opcode::Call {
                callee: Callee::Direct(callee),
            },
            args,
            ret,
        )
    }

    pub fn call_indirect(
        &mut self,
        block: BlockId,
        target: ValueId,
        args: &[ValueId],
        ret: Option<TypeId>,
    ) -> (OpId, Option<ValueId>) {
        self.push(
            block,
            Opcode::Call {
                callee: Callee::Indirect(target),
            },
            args,
            ret,
        )
    }

    /// Stack slot holding a `ty`
    pub fn alloca(&mut self, block: BlockId, ty: TypeId) -> ValueId {
        let ptr = self.pointer_to(ty);
        self.push_value(block, Opcode::Alloca, &[], ptr)
    }

    pub fn load(&mut self, block: BlockId, ptr: ValueId, ty: TypeId) -> ValueId {
        self.push_value(block, Opcode::Load, &[ptr], ty)
    }

    pub fn store(&mut self, block: BlockId, value: ValueId, ptr: ValueId) -> OpId {
        self.push(block, Opcode::Store, &[value, ptr], None).0
    }

    pub fn cast(&mut self, block: BlockId, v: ValueId, ty: TypeId) -> ValueId {
        self.push_value(block, Opcode::Cast, &[v], ty)
    }

    pub fn gep(
        &mut self,
        block: BlockId,
        source: TypeId,
        base: ValueId,
        indices: &[i64],
        ty: TypeId,
    ) -> ValueId {
        let mut operands = vec![base];
        operands.extend(indices.iter().map(|i| self.int(32, *i)));
        self.push_value(
            block,
            Opcode::GetElementPtr {
                source: Some(source),
            },
            &operands,
            ty,
        )
    }

    pub fn memcpy(&mut self, block: BlockId, dst: ValueId, src: ValueId, len: i64) -> OpId {
        let len = self.int(64, len);
        self.push(block, Opcode::MemTransfer, &[dst, src, len], None).0
    }

    pub fn ret(&mut self, block: BlockId, value: Option<ValueId>) -> OpId {
        let operands: Vec<ValueId> = value.into_iter().collect();
        self.push(block, Opcode::Return, &operands, None).0
    }

    /// Terminate `block` with a branch to `targets`.
    pub fn br(&mut self, block: BlockId, targets: &[BlockId]) -> OpId {
        self.successors(block, targets);
        self.push(block, Opcode::Branch, &[], None).0
    }

    pub fn finish(self) -> Result<Program, Error> {
        self.program.finish()
    }
}
