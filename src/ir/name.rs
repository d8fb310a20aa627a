// SPDX-License-Identifier: BSD-3-Clause
//! Arena handles. Each is an index into the corresponding [`Program`] table.
//!
//! [`Program`]: super::Program

use std::fmt::Display;

use serde::{Deserialize, Serialize};

macro_rules! handle {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub(crate) fn from_index(idx: usize) -> Self {
                debug_assert!(idx <= u32::MAX as usize);
                $name(idx as u32)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

handle!(FunctionId, "fn");
handle!(BlockId, "bb");
handle!(OpId, "op");
handle!(ValueId, "%v");
handle!(TypeId, "ty");
