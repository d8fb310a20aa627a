// SPDX-License-Identifier: BSD-3-Clause
//! Lock and library-API patterns.
//!
//! Call sites are classified purely by the (mangled) name of their callee.
//! Every table is a list of regexes, so a user-supplied JSON file can add
//! support for other lock crates without touching the analysis.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShareMode {
    Exclusive,
    Shared,
}

impl std::fmt::Display for ShareMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareMode::Exclusive => write!(f, "exclusive"),
            ShareMode::Shared => write!(f, "shared"),
        }
    }
}

/// Where a lock call puts its guard (or `Result` wrapping the guard).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardSlot {
    /// The call's return value
    Result,
    /// An out-parameter (e.g., an `sret` pointer)
    Arg(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockPattern {
    pub name: String,
    pub pattern: String,
    /// Argument holding the lock itself
    pub resource: usize,
    pub guard: GuardSlot,
    pub share: ShareMode,
    /// Guard is wrapped in a `Result` (e.g., `LockResult`) and must be
    /// unwrapped before use
    #[serde(default)]
    pub wrapped: bool,
}

/// Serialized form of [`Patterns`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PatternFile {
    #[serde(default)]
    pub locks: Vec<LockPattern>,
    #[serde(default)]
    pub unwrap: Vec<String>,
    #[serde(default)]
    pub result_passthrough: Vec<String>,
    #[serde(default)]
    pub auto_drop: Vec<String>,
    #[serde(default)]
    pub manual_drop: Vec<String>,
    #[serde(default)]
    pub deref: Vec<String>,
}

/// Library calls with a fixed meaning for guard lifetimes.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKind {
    /// `Result::{unwrap, expect, unwrap_or, ..}`
    Unwrap,
    /// `Result::map_err`, `Try::into_result`
    ResultPassthrough,
    /// `core::ptr::drop_in_place`
    AutoDrop,
    /// `core::mem::drop`
    ManualDrop,
    /// `Deref::deref`, `DerefMut::deref_mut` on a guard
    Deref,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("Couldn't deserialize patterns: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct Patterns {
    file: PatternFile,
    locks: RegexSet,
    apis: Vec<(ApiKind, RegexSet)>,
}

impl Patterns {
    /// std, `lock_api` and `parking_lot` locks with their guard APIs
    pub fn builtin() -> Result<Self, regex::Error> {
        Patterns::new(PatternFile::builtin())
    }

    pub fn new(file: PatternFile) -> Result<Self, regex::Error> {
        let locks = RegexSet::new(file.locks.iter().map(|l| &l.pattern))?;
        let apis = vec![
            (ApiKind::Unwrap, RegexSet::new(&file.unwrap)?),
            (
                ApiKind::ResultPassthrough,
                RegexSet::new(&file.result_passthrough)?,
            ),
            (ApiKind::AutoDrop, RegexSet::new(&file.auto_drop)?),
            (ApiKind::ManualDrop, RegexSet::new(&file.manual_drop)?),
            (ApiKind::Deref, RegexSet::new(&file.deref)?),
        ];
        Ok(Patterns { file, locks, apis })
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        Ok(Patterns::new(serde_json::from_str(s)?)?)
    }

    /// Add the entries of `other` after the current ones. Lock patterns are
    /// tried in order, so existing entries take precedence.
    pub fn extend(&mut self, other: PatternFile) -> Result<(), regex::Error> {
        let mut file = self.file.clone();
        file.locks.extend(other.locks);
        file.unwrap.extend(other.unwrap);
        file.result_passthrough.extend(other.result_passthrough);
        file.auto_drop.extend(other.auto_drop);
        file.manual_drop.extend(other.manual_drop);
        file.deref.extend(other.deref);
        *self = Patterns::new(file)?;
        Ok(())
    }

    pub fn file(&self) -> &PatternFile {
        &self.file
    }

    /// The first lock pattern matching `func`.
    pub fn lock_pattern(&self, func: &str) -> Option<&LockPattern> {
        self.locks
            .matches(func)
            .into_iter()
            .next()
            .map(|i| &self.file.locks[i])
    }

    pub fn api_kind(&self, func: &str) -> Option<ApiKind> {
        self.apis
            .iter()
            .find(|(_, set)| set.is_match(func))
            .map(|(kind, _)| *kind)
    }

    /// Locks and known APIs are summarized by the tables and never entered.
    pub fn is_modeled(&self, func: &str) -> bool {
        self.locks.is_match(func) || self.api_kind(func).is_some()
    }
}

fn lock(
    name: &str,
    pattern: &str,
    resource: usize,
    guard: GuardSlot,
    share: ShareMode,
    wrapped: bool,
) -> LockPattern {
    LockPattern {
        name: name.to_string(),
        pattern: pattern.to_string(),
        resource,
        guard,
        share,
        wrapped,
    }
}

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

impl PatternFile {
    /// `std`, `lock_api`/`parking_lot` and a few crate-specific locks, as
    /// mangled by rustc's legacy scheme.
    pub fn builtin() -> Self {
        use GuardSlot::{Arg, Result};
        use ShareMode::{Exclusive, Shared};
        PatternFile {
            locks: vec![
                lock(
                    "std::sync::Mutex::lock",
                    r"^_ZN3std4sync5mutex14Mutex\$LT\$T\$GT\$4lock17h",
                    1,
                    Arg(0),
                    Exclusive,
                    true,
                ),
                lock(
                    "std::sync::RwLock::read",
                    r"^_ZN3std4sync6rwlock15RwLock\$LT\$T\$GT\$4read17h",
                    0,
                    Result,
                    Shared,
                    true,
                ),
                lock(
                    "std::sync::RwLock::write",
                    r"^_ZN3std4sync6rwlock15RwLock\$LT\$T\$GT\$5write17h",
                    1,
                    Arg(0),
                    Exclusive,
                    true,
                ),
                lock(
                    "lock_api::Mutex::lock",
                    r"^_ZN8lock_api5mutex18Mutex\$LT\$R\$C\$T\$GT\$4lock17h",
                    0,
                    Result,
                    Exclusive,
                    false,
                ),
                lock(
                    "lock_api::RwLock::read",
                    r"^_ZN8lock_api6rwlock19RwLock\$LT\$R\$C\$T\$GT\$4read17h",
                    0,
                    Result,
                    Shared,
                    false,
                ),
                lock(
                    "lock_api::RwLock::write",
                    r"^_ZN8lock_api6rwlock19RwLock\$LT\$R\$C\$T\$GT\$5write17h",
                    0,
                    Result,
                    Exclusive,
                    false,
                ),
                lock(
                    "parking_lot::RwLock::read",
                    r"^_ZN11parking_lot6rwlock15RwLock\$LT\$T\$GT\$4read17h",
                    0,
                    Result,
                    Shared,
                    false,
                ),
                lock(
                    "parking_lot::RwLock::write",
                    r"^_ZN11parking_lot6rwlock15RwLock\$LT\$T\$GT\$5write17h",
                    0,
                    Result,
                    Exclusive,
                    false,
                ),
                lock(
                    "tikv_util::HandyRwLock::wl",
                    r"HandyRwLock\$LT\$T\$GT\$\$GT\$2wl17h",
                    1,
                    Arg(0),
                    Exclusive,
                    false,
                ),
                lock(
                    "tikv_util::HandyRwLock::rl",
                    r"HandyRwLock\$LT\$T\$GT\$\$GT\$2rl17h",
                    0,
                    Result,
                    Shared,
                    false,
                ),
                lock(
                    "tokio_net::sharded_rwlock::RwLock::read",
                    r"_ZN9tokio_net6driver14sharded_rwlock15RwLock\$LT\$T\$GT\$4read17h",
                    0,
                    Result,
                    Shared,
                    false,
                ),
                lock(
                    "tokio_net::sharded_rwlock::RwLock::write",
                    r"_ZN9tokio_net6driver14sharded_rwlock15RwLock\$LT\$T\$GT\$5write17h",
                    1,
                    Arg(0),
                    Exclusive,
                    false,
                ),
                lock(
                    "crossbeam_channel::Spinlock::lock",
                    r"_ZN17crossbeam_channel5utils17Spinlock\$LT\$T\$GT\$4lock17h",
                    0,
                    Result,
                    Exclusive,
                    false,
                ),
                lock(
                    "len_caching_lock::LenCachingMutex::lock",
                    r"_ZN16len_caching_lock5mutex24LenCachingMutex\$LT\$T\$GT\$4lock17h",
                    0,
                    Result,
                    Exclusive,
                    false,
                ),
            ],
            unwrap: strings(&[
                r"^_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$6unwrap17h",
                r"^_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$6expect17h",
                r"^_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$9unwrap_or17h",
                r"^_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$14unwrap_or_else17h",
                r"^_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$17unwrap_or_default17h",
            ]),
            result_passthrough: strings(&[
                r"^_ZN4core6result19Result\$LT\$T\$C\$E\$GT\$7map_err17h",
                r"^_ZN73_\$LT\$core\.\.result\.\.Result\$LT\$T\$C\$E\$GT\$\$u20\$as\$u20\$core\.\.ops\.\.try\.\.Try\$GT\$11into_result17h",
            ]),
            auto_drop: strings(&[
                r"^_ZN4core3ptr18real_drop_in_place17h",
                // Newer rustc: `core::ptr::drop_in_place<T>`
                r"^_ZN4core3ptr[0-9]+drop_in_place\$LT\$",
            ]),
            manual_drop: strings(&[r"^_ZN4core3mem4drop17h"]),
            deref: strings(&[
                r"^_ZN[0-9]+_\$LT\$(std\.\.sync\.\.mutex\.\.MutexGuard|std\.\.sync\.\.rwlock\.\.RwLock(Read|Write)Guard)\$LT\$T\$GT\$\$u20\$as\$u20\$core\.\.ops\.\.deref\.\.Deref(Mut)?\$GT\$[0-9]+deref(_mut)?17h",
                r"^_ZN[0-9]+_\$LT\$lock_api\.\.(mutex\.\.MutexGuard|rwlock\.\.RwLock(Read|Write)Guard)\$LT\$R\$C\$T\$GT\$\$u20\$as\$u20\$core\.\.ops\.\.deref\.\.Deref(Mut)?\$GT\$[0-9]+deref(_mut)?17h",
            ]),
        }
    }
}
