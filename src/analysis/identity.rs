// SPDX-License-Identifier: BSD-3-Clause
//! Resource identities, used to match locks across functions.
//!
//! Two field identities are equal when they name the same field path of the
//! same struct type, whatever the base object. Programs usually keep one lock
//! per field of a type, so this matches `self.lock` in one method with
//! `self.lock` in another. It also matches the same field of two unrelated
//! instances, which can cause false positives.

use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::ir::{Program, TypeId, ValueId};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceIdentity {
    Direct {
        value: ValueId,
    },
    Field {
        ty: TypeId,
        path: Vec<i64>,
        base: ValueId,
    },
}

impl PartialEq for ResourceIdentity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ResourceIdentity::Direct { value: a },
                ResourceIdentity::Direct { value: b },
            ) => a == b,
            (
                ResourceIdentity::Field {
                    ty: t1, path: p1, ..
                },
                ResourceIdentity::Field {
                    ty: t2, path: p2, ..
                },
            ) => t1 == t2 && p1 == p2,
            _ => false,
        }
    }
}

impl Eq for ResourceIdentity {}

impl Hash for ResourceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ResourceIdentity::Direct { value } => {
                0u8.hash(state);
                value.hash(state);
            }
            ResourceIdentity::Field { ty, path, .. } => {
                1u8.hash(state);
                ty.hash(state);
                path.hash(state);
            }
        }
    }
}

/// Look through casts for a constant-index field access into a struct.
pub fn resolve(program: &Program, resource: ValueId) -> ResourceIdentity {
    let v = program.strip_casts(resource);
    if let Some(gep) = program.gep(v) {
        if let Some(ty) = gep.source.filter(|t| program.ty(*t).is_struct()) {
            let path: Option<Vec<i64>> =
                gep.indices.iter().map(|i| program.const_int(*i)).collect();
            if let Some(path) = path {
                return ResourceIdentity::Field {
                    ty,
                    path,
                    base: gep.base,
                };
            }
        }
    }
    ResourceIdentity::Direct { value: v }
}
