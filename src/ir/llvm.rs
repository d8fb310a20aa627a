// SPDX-License-Identifier: BSD-3-Clause
//! Lowering of an `llvm_ir` module into a [`Program`].
//!
//! Only what the analysis looks at is kept: calls (with `invoke` split into
//! a call plus successors), memory operations, casts, address computations
//! and control flow. Other instructions become [`Opcode::Other`] without
//! operands. Debug-info and lifetime intrinsics are dropped.

use std::collections::HashMap;

use either::Either;
use llvm_ir::{types::Typed, HasDebugLoc, Name};

use super::{
    BlockId, Callee, DebugLoc, Error, FunctionId, OpId, Opcode, Program, ProgramBuilder, Type,
    TypeId, ValueId,
};

struct Loader<'m> {
    m: &'m llvm_ir::Module,
    b: ProgramBuilder,
    types: HashMap<llvm_ir::TypeRef, TypeId>,
    functions: HashMap<&'m str, FunctionId>,
    globals: HashMap<&'m str, ValueId>,
}

fn callee_name(op: &llvm_ir::Operand) -> Option<&str> {
    match op {
        llvm_ir::Operand::ConstantOperand(c) => match &**c {
            llvm_ir::Constant::GlobalReference { name, .. } => Some(name.as_ref()),
            _ => None,
        },
        _ => None,
    }
}

fn is_skipped(i: &llvm_ir::Instruction) -> bool {
    match i {
        llvm_ir::Instruction::Call(c) => c
            .function
            .as_ref()
            .right()
            .and_then(|op| callee_name(op))
            .is_some_and(|n| n.starts_with("llvm.dbg.") || n.starts_with("llvm.lifetime.")),
        _ => false,
    }
}

fn debug_loc(loc: &Option<llvm_ir::DebugLoc>) -> Option<DebugLoc> {
    loc.as_ref().map(|l| DebugLoc {
        directory: l.directory.clone(),
        file: l.filename.clone(),
        line: l.line,
        col: l.col,
    })
}

enum Pending<'m> {
    Instruction(&'m llvm_ir::Instruction),
    Terminator(&'m llvm_ir::Terminator),
}

impl<'m> Loader<'m> {
    fn ty(&mut self, t: &llvm_ir::TypeRef) -> TypeId {
        if let Some(id) = self.types.get(t) {
            return *id;
        }
        let ty = match &**t {
            llvm_ir::Type::VoidType => Type::Void,
            llvm_ir::Type::IntegerType { bits } => Type::Int { bits: *bits },
            llvm_ir::Type::FPType(_) => Type::Float,
            llvm_ir::Type::PointerType { pointee_type, .. } => Type::Pointer {
                pointee: Some(self.ty(pointee_type)),
            },
            llvm_ir::Type::StructType { element_types, .. } => Type::Struct {
                fields: element_types.iter().map(|e| self.ty(e)).collect(),
            },
            llvm_ir::Type::NamedStructType { name } => Type::Named { name: name.clone() },
            llvm_ir::Type::ArrayType {
                element_type,
                num_elements,
            } => Type::Array {
                element: self.ty(element_type),
                len: *num_elements as u64,
            },
            llvm_ir::Type::VectorType {
                element_type,
                num_elements,
                ..
            } => Type::Vector {
                element: self.ty(element_type),
                len: *num_elements as u64,
            },
            llvm_ir::Type::FuncType { .. } => Type::Function,
            _ => Type::Other,
        };
        let id = self.b.ty(ty);
        self.types.insert(t.clone(), id);
        id
    }

    fn pointee(&mut self, t: &llvm_ir::TypeRef) -> Option<TypeId> {
        match &**t {
            llvm_ir::Type::PointerType { pointee_type, .. } => Some(self.ty(pointee_type)),
            _ => None,
        }
    }

    fn global(&mut self, name: &str) -> Result<ValueId, Error> {
        if let Some(f) = self.functions.get(name) {
            return Ok(self.b.function_value(*f));
        }
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| Error(format!("Couldn't find global {}", name)))
    }

    fn constant(&mut self, c: &llvm_ir::ConstantRef) -> Result<ValueId, Error> {
        let ty = self.ty(&c.get_type(&self.m.types));
        Ok(match &**c {
            llvm_ir::Constant::GlobalReference { name, .. } => self.global(name.as_ref())?,
            llvm_ir::Constant::Int { bits, value } => self.b.int(*bits, *value as i64),
            llvm_ir::Constant::Null(_) => self.b.null(ty),
            llvm_ir::Constant::Undef(_) | llvm_ir::Constant::Poison(_) => self.b.undef(Some(ty)),
            llvm_ir::Constant::BitCast(bc) => {
                let operand = self.constant(&bc.operand)?;
                self.b.const_cast(operand, ty)
            }
            llvm_ir::Constant::AddrSpaceCast(ac) => {
                let operand = self.constant(&ac.operand)?;
                self.b.const_cast(operand, ty)
            }
            llvm_ir::Constant::GetElementPtr(gep) => {
                let base = self.constant(&gep.address)?;
                let source = self.pointee(&gep.address.get_type(&self.m.types));
                let mut indices = Vec::with_capacity(gep.indices.len());
                for i in &gep.indices {
                    indices.push(self.constant(i)?);
                }
                self.b.const_gep_values(base, source, indices, Some(ty))
            }
            _ => self.b.opaque(Some(ty)),
        })
    }

    fn operand(
        &mut self,
        locals: &HashMap<&'m Name, ValueId>,
        op: &llvm_ir::Operand,
    ) -> Result<ValueId, Error> {
        match op {
            llvm_ir::Operand::LocalOperand { name, .. } => locals
                .get(name)
                .copied()
                .ok_or_else(|| Error(format!("Bad local: {}", name))),
            llvm_ir::Operand::ConstantOperand(c) => self.constant(c),
            llvm_ir::Operand::MetadataOperand => Ok(self.b.opaque(None)),
        }
    }

    fn operands<'o>(
        &mut self,
        locals: &HashMap<&'m Name, ValueId>,
        ops: impl IntoIterator<Item = &'o llvm_ir::Operand>,
    ) -> Result<Vec<ValueId>, Error> {
        let mut out = Vec::new();
        for op in ops {
            out.push(self.operand(locals, op)?);
        }
        Ok(out)
    }

    fn call<Asm, Attrs>(
        &mut self,
        locals: &HashMap<&'m Name, ValueId>,
        function: &Either<Asm, llvm_ir::Operand>,
        arguments: &[(llvm_ir::Operand, Attrs)],
    ) -> Result<(Opcode, Vec<ValueId>), Error> {
        let args = self.operands(locals, arguments.iter().map(|(a, _)| a))?;
        let callee = match function {
            Either::Left(_asm) => Callee::Asm,
            Either::Right(op) => match callee_name(op) {
                Some(n) if n.starts_with("llvm.memcpy") || n.starts_with("llvm.memmove") => {
                    return Ok((Opcode::MemTransfer, args))
                }
                Some(n) if n.starts_with("llvm.memset") => return Ok((Opcode::MemSet, args)),
                Some(n) if self.functions.contains_key(n) => Callee::Direct(self.functions[n]),
                _ => Callee::Indirect(self.operand(locals, op)?),
            },
        };
        Ok((Opcode::Call { callee }, args))
    }

    fn instruction(
        &mut self,
        locals: &HashMap<&'m Name, ValueId>,
        op: OpId,
        i: &llvm_ir::Instruction,
    ) -> Result<(), Error> {
        use llvm_ir::Instruction as I;
        let (opcode, operands) = match i {
            I::Alloca(_) => (Opcode::Alloca, Vec::new()),
            I::Load(l) => (Opcode::Load, self.operands(locals, [&l.address])?),
            I::Store(s) => (Opcode::Store, self.operands(locals, [&s.value, &s.address])?),
            I::GetElementPtr(g) => {
                let source = self.pointee(&g.address.get_type(&self.m.types));
                let operands =
                    self.operands(locals, std::iter::once(&g.address).chain(&g.indices))?;
                (Opcode::GetElementPtr { source }, operands)
            }
            I::BitCast(c) => (Opcode::Cast, self.operands(locals, [&c.operand])?),
            I::AddrSpaceCast(c) => (Opcode::Cast, self.operands(locals, [&c.operand])?),
            I::ExtractValue(e) => (
                Opcode::ExtractValue {
                    indices: e.indices.clone(),
                },
                self.operands(locals, [&e.aggregate])?,
            ),
            I::InsertValue(e) => (
                Opcode::InsertValue {
                    indices: e.indices.clone(),
                },
                self.operands(locals, [&e.aggregate, &e.element])?,
            ),
            I::Phi(p) => (
                Opcode::Phi,
                self.operands(locals, p.incoming_values.iter().map(|(v, _)| v))?,
            ),
            I::Select(s) => (
                Opcode::Select,
                self.operands(locals, [&s.condition, &s.true_value, &s.false_value])?,
            ),
            I::Call(c) => self.call(locals, &c.function, &c.arguments)?,
            _ => (Opcode::Other, Vec::new()),
        };
        self.b.fill(op, opcode, operands);
        Ok(())
    }

    fn terminator(
        &mut self,
        locals: &HashMap<&'m Name, ValueId>,
        blocks: &HashMap<&'m Name, BlockId>,
        block: BlockId,
        op: OpId,
        t: &llvm_ir::Terminator,
    ) -> Result<(), Error> {
        use llvm_ir::Terminator as T;
        let target = |n: &Name| {
            blocks
                .get(n)
                .copied()
                .ok_or_else(|| Error(format!("Bad block: {}", n)))
        };
        let (opcode, operands, successors) = match t {
            T::Ret(r) => (
                Opcode::Return,
                self.operands(locals, r.return_operand.iter())?,
                Vec::new(),
            ),
            T::Br(b) => (Opcode::Branch, Vec::new(), vec![target(&b.dest)?]),
            T::CondBr(b) => (
                Opcode::Branch,
                Vec::new(),
                vec![target(&b.true_dest)?, target(&b.false_dest)?],
            ),
            T::Switch(s) => {
                let mut successors = vec![target(&s.default_dest)?];
                for (_, d) in &s.dests {
                    successors.push(target(d)?);
                }
                (Opcode::Branch, Vec::new(), successors)
            }
            T::IndirectBr(b) => {
                let mut successors = Vec::with_capacity(b.possible_dests.len());
                for d in &b.possible_dests {
                    successors.push(target(d)?);
                }
                (Opcode::Branch, Vec::new(), successors)
            }
            T::Invoke(i) => {
                let (opcode, operands) = self.call(locals, &i.function, &i.arguments)?;
                let successors = vec![target(&i.return_label)?, target(&i.exception_label)?];
                (opcode, operands, successors)
            }
            T::Unreachable(_) => (Opcode::Unreachable, Vec::new(), Vec::new()),
            _ => (Opcode::Other, Vec::new(), Vec::new()),
        };
        self.b.fill(op, opcode, operands);
        self.b.successors(block, &successors);
        Ok(())
    }

    fn function(&mut self, f: &'m llvm_ir::Function) -> Result<(), Error> {
        let id = self
            .functions
            .get(f.name.as_str())
            .copied()
            .ok_or_else(|| Error(format!("Couldn't find function {}", f.name)))?;
        let mut locals: HashMap<&'m Name, ValueId> = HashMap::new();
        for (n, p) in f.parameters.iter().enumerate() {
            let v = self.b.param(id, n);
            if let Name::Name(s) = &p.name {
                self.b.name_value(v, s);
            }
            locals.insert(&p.name, v);
        }
        let mut blocks: HashMap<&'m Name, BlockId> = HashMap::with_capacity(f.basic_blocks.len());
        for bb in &f.basic_blocks {
            let b = self.b.block(id);
            if let Name::Name(s) = &bb.name {
                self.b.name_block(b, s);
            }
            blocks.insert(&bb.name, b);
        }

        // LLVM sometimes references values before their definitions, so every
        // operation is created before any is filled in
        let mut pending: Vec<(BlockId, OpId, Pending<'m>)> = Vec::new();
        for bb in &f.basic_blocks {
            let b = blocks[&bb.name];
            for i in &bb.instrs {
                if is_skipped(i) {
                    continue;
                }
                let ty = match i.try_get_result() {
                    Some(_) => Some(self.ty(&i.get_type(&self.m.types))),
                    None => None,
                };
                let (op, result) = self.b.reserve(b, ty);
                if let (Some(n), Some(v)) = (i.try_get_result(), result) {
                    if let Name::Name(s) = n {
                        self.b.name_value(v, s);
                    }
                    locals.insert(n, v);
                }
                if let Some(loc) = debug_loc(i.get_debug_loc()) {
                    self.b.set_debug_loc(op, loc);
                }
                pending.push((b, op, Pending::Instruction(i)));
            }
            let ty = match bb.term.try_get_result() {
                Some(_) => Some(self.ty(&bb.term.get_type(&self.m.types))),
                None => None,
            };
            let (op, result) = self.b.reserve(b, ty);
            if let (Some(n), Some(v)) = (bb.term.try_get_result(), result) {
                locals.insert(n, v);
            }
            if let Some(loc) = debug_loc(bb.term.get_debug_loc()) {
                self.b.set_debug_loc(op, loc);
            }
            pending.push((b, op, Pending::Terminator(&bb.term)));
        }

        for (b, op, p) in pending {
            match p {
                Pending::Instruction(i) => self.instruction(&locals, op, i)?,
                Pending::Terminator(t) => self.terminator(&locals, &blocks, b, op, t)?,
            }
        }
        Ok(())
    }
}

/// Lower `m`. Fails on references to undefined locals, globals or blocks.
#[tracing::instrument(name = "load", level = "debug", skip_all)]
pub fn load(m: &llvm_ir::Module) -> Result<Program, Error> {
    let mut loader = Loader {
        m,
        b: ProgramBuilder::new(),
        types: HashMap::new(),
        functions: HashMap::with_capacity(m.functions.len() + m.func_declarations.len()),
        globals: HashMap::with_capacity(m.global_vars.len() + m.global_aliases.len()),
    };
    for f in &m.functions {
        let params: Vec<TypeId> = f.parameters.iter().map(|p| loader.ty(&p.ty)).collect();
        let ret = loader.ty(&f.return_type);
        let id = loader.b.function(&f.name, &params, Some(ret));
        loader.functions.insert(f.name.as_str(), id);
    }
    for d in &m.func_declarations {
        let params: Vec<TypeId> = d.parameters.iter().map(|p| loader.ty(&p.ty)).collect();
        let ret = loader.ty(&d.return_type);
        let id = loader.b.function(&d.name, &params, Some(ret));
        loader.functions.insert(d.name.as_str(), id);
    }
    for g in &m.global_vars {
        let ty = loader.ty(&g.ty);
        let v = loader.b.global(&g.name, ty);
        loader.globals.insert(g.name.as_str(), v);
    }
    for a in &m.global_aliases {
        let ty = loader.ty(&a.ty);
        let v = loader.b.global(&a.name, ty);
        loader.globals.insert(a.name.as_str(), v);
    }
    for f in &m.functions {
        loader.function(f)?;
    }
    tracing::debug!(
        functions = m.functions.len(),
        declarations = m.func_declarations.len(),
        "loaded module"
    );
    loader.b.finish()
}
