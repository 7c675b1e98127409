//! Classification of external calls into instrumentation sites.

use super::{ExternalCall, SiteLocation};
use crate::ir::Operand;
use anyhow::{Result, bail};
use smallvec::SmallVec;
use std::collections::HashSet;
use tracing::debug;

/// Library functions that take pointer-to-pointer arguments which are not
/// arrays of pointers (out-parameters, mostly).
const DEFAULT_ALLOW_LIST: &[&str] = &[
    "strtol",
    "strtoll",
    "strtod",
    "strtold",
    "strtoul",
    "strtoull",
    "strtok_r",
    "strtoimax",
    "strtoumax",
    "getpwnam_r",
    "getpwuid_r",
    "getifaddrs",
    "iconv",
    "posix_memalign",
    "pthread_join",
    "asprintf",
    "vasprintf",
];

/// Heap management functions with a known signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownCallee {
    /// `malloc(size)`
    Malloc,
    /// `calloc(count, size)`
    Calloc,
    /// `realloc(ptr, size)`
    Realloc,
    /// `reallocarray(ptr, count, size)`
    ReallocArray,
    /// `free(ptr)`
    Free,
}

impl KnownCallee {
    pub fn from_name(name: &str) -> Option<Self> {
        let callee = match name {
            "malloc" => KnownCallee::Malloc,
            "calloc" => KnownCallee::Calloc,
            "realloc" => KnownCallee::Realloc,
            "reallocarray" => KnownCallee::ReallocArray,
            "free" => KnownCallee::Free,
            _ => return None,
        };
        Some(callee)
    }

    pub fn name(self) -> &'static str {
        match self {
            KnownCallee::Malloc => "malloc",
            KnownCallee::Calloc => "calloc",
            KnownCallee::Realloc => "realloc",
            KnownCallee::ReallocArray => "reallocarray",
            KnownCallee::Free => "free",
        }
    }

    fn arity(self) -> usize {
        match self {
            KnownCallee::Malloc | KnownCallee::Free => 1,
            KnownCallee::Calloc | KnownCallee::Realloc => 2,
            KnownCallee::ReallocArray => 3,
        }
    }

    /// Binds the call's operands to a site kind.
    fn bind(self, args: &[Operand]) -> SiteKind {
        let arg = |idx: usize| args[idx].clone();
        match self {
            KnownCallee::Malloc => SiteKind::Allocation {
                size: SizeExpr::Single(arg(0)),
            },
            KnownCallee::Calloc => SiteKind::Allocation {
                size: SizeExpr::Product(arg(0), arg(1)),
            },
            KnownCallee::Realloc => SiteKind::Reallocation {
                old_ptr: arg(0),
                size: SizeExpr::Single(arg(1)),
            },
            KnownCallee::ReallocArray => SiteKind::Reallocation {
                old_ptr: arg(0),
                size: SizeExpr::Product(arg(1), arg(2)),
            },
            KnownCallee::Free => SiteKind::Deallocation { ptr: arg(0) },
        }
    }
}

/// Size in bytes of an allocation, as operands of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeExpr {
    Single(Operand),
    /// `count * element_size`
    Product(Operand, Operand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    /// The call's result is a new heap object of `size` bytes
    Allocation { size: SizeExpr },
    /// The call's result replaces `old_ptr` with `size` bytes
    Reallocation { old_ptr: Operand, size: SizeExpr },
    /// `ptr` is released
    Deallocation { ptr: Operand },
    /// Argument `arg_index` is an array of pointers shared with a library
    PointerArrayConsumer { arg_index: usize, ptr: Operand },
}

impl SiteKind {
    pub fn name(&self) -> &'static str {
        match self {
            SiteKind::Allocation { .. } => "allocation",
            SiteKind::Reallocation { .. } => "reallocation",
            SiteKind::Deallocation { .. } => "deallocation",
            SiteKind::PointerArrayConsumer { .. } => "pointer-array",
        }
    }
}

/// An instrumentation site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub location: SiteLocation,
    pub callee: String,
    pub kind: SiteKind,
}

/// Library functions never reported as pointer array consumers.
#[derive(Debug, Clone)]
pub struct AllowList(HashSet<String>);

impl Default for AllowList {
    fn default() -> Self {
        Self(DEFAULT_ALLOW_LIST.iter().map(|name| name.to_string()).collect())
    }
}

impl AllowList {
    pub fn empty() -> Self {
        Self(HashSet::new())
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }
}

impl<S: Into<String>> Extend<S> for AllowList {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    allow_list: AllowList,
}

impl Classifier {
    pub fn new(allow_list: AllowList) -> Self {
        Self { allow_list }
    }

    /// Classifies one external call.
    ///
    /// # Returns
    /// * `Ok(sites)` - Zero or more sites. A heap management call yields one
    ///   site; any other call yields one site per pointer-to-pointer argument
    /// * `Err(anyhow::Error)` - If a heap management function is called with
    ///   too few arguments
    pub fn classify(&self, call: &ExternalCall<'_>) -> Result<SmallVec<[CallSite; 2]>> {
        let name = call.callee.name.as_str();
        let site = |kind| CallSite {
            location: call.location,
            callee: name.to_string(),
            kind,
        };

        if let Some(known) = KnownCallee::from_name(name) {
            if call.args.len() < known.arity() {
                bail!(
                    "Call {} to '{}' has {} arguments, expected {}",
                    call.location.inst,
                    name,
                    call.args.len(),
                    known.arity()
                );
            }
            let kind = known.bind(call.args);
            debug!("Found {} site at {:?}", kind.name(), call.location);
            return Ok(SmallVec::from_iter([site(kind)]));
        }

        if self.allow_list.contains(name) {
            return Ok(SmallVec::new());
        }

        let sites: SmallVec<[CallSite; 2]> = call
            .args
            .iter()
            .zip(&call.arg_types)
            .enumerate()
            .filter(|(_, (_, ty))| ty.is_some_and(|ty| ty.is_pointer_to_pointer()))
            .map(|(arg_index, (arg, _))| {
                site(SiteKind::PointerArrayConsumer {
                    arg_index,
                    ptr: arg.clone(),
                })
            })
            .collect();
        if !sites.is_empty() {
            debug!(
                "Call to {} at {:?} shares {} pointer arrays",
                name,
                call.location,
                sites.len()
            );
        }
        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, InstId, Type};

    fn location() -> SiteLocation {
        SiteLocation {
            function: 0,
            block: 0,
            inst: InstId(7),
        }
    }

    fn classify(callee: &Function, args: &[Operand]) -> Result<SmallVec<[CallSite; 2]>> {
        let arg_types = args
            .iter()
            .enumerate()
            .map(|(idx, arg)| match arg {
                Operand::Const { ty, .. } | Operand::Null(ty) => Some(ty),
                _ => callee.params.get(idx),
            })
            .collect();
        let call = ExternalCall {
            location: location(),
            callee,
            args,
            arg_types,
        };
        Classifier::default().classify(&call)
    }

    fn argv() -> Type {
        Type::address().pointer_to()
    }

    #[test]
    fn test_calloc_binds_product() {
        let calloc = Function::declare(
            "calloc",
            vec![Type::size_type(), Type::size_type()],
            Type::address(),
        );
        let sites = classify(&calloc, &[Operand::int(300, 64), Operand::int(8, 64)]).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(
            sites[0].kind,
            SiteKind::Allocation {
                size: SizeExpr::Product(Operand::int(300, 64), Operand::int(8, 64))
            }
        );
    }

    #[test]
    fn test_reallocarray_binds_old_pointer() {
        let func = Function::declare(
            "reallocarray",
            vec![Type::address(), Type::size_type(), Type::size_type()],
            Type::address(),
        );
        let args = [Operand::Arg(0), Operand::int(4, 64), Operand::int(16, 64)];
        let sites = classify(&func, &args).unwrap();
        assert_eq!(
            sites[0].kind,
            SiteKind::Reallocation {
                old_ptr: Operand::Arg(0),
                size: SizeExpr::Product(Operand::int(4, 64), Operand::int(16, 64))
            }
        );
    }

    #[test]
    fn test_free_binds_pointer() {
        let free = Function::declare("free", vec![Type::address()], Type::Void);
        let sites = classify(&free, &[Operand::Inst(InstId(2))]).unwrap();
        assert_eq!(
            sites[0].kind,
            SiteKind::Deallocation {
                ptr: Operand::Inst(InstId(2))
            }
        );
        assert_eq!(sites[0].callee, "free");
    }

    #[test]
    fn test_missing_arguments_fail() {
        let realloc = Function::declare("realloc", vec![Type::address()], Type::address());
        let err = classify(&realloc, &[Operand::Arg(0)]).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_one_site_per_pointer_array() {
        let execve = Function::declare(
            "execve",
            vec![Type::address(), argv(), argv()],
            Type::Int(32),
        );
        let args = [Operand::Arg(0), Operand::Arg(1), Operand::Arg(2)];
        let sites = classify(&execve, &args).unwrap();
        let indices: Vec<_> = sites
            .iter()
            .map(|site| match site.kind {
                SiteKind::PointerArrayConsumer { arg_index, .. } => arg_index,
                _ => usize::MAX,
            })
            .collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_allow_list_suppresses() {
        let strtol = Function::declare(
            "strtol",
            vec![Type::address(), argv(), Type::Int(32)],
            Type::Int(64),
        );
        let args = [Operand::Arg(0), Operand::Arg(1), Operand::int(10, 32)];
        assert!(classify(&strtol, &args).unwrap().is_empty());
    }

    #[test]
    fn test_custom_allow_list() {
        let mut allow_list = AllowList::empty();
        allow_list.extend(["qsort"]);
        assert!(allow_list.contains("qsort"));
        assert!(!allow_list.contains("strtol"));
    }

    #[test]
    fn test_known_callee_names() {
        for known in [
            KnownCallee::Malloc,
            KnownCallee::Calloc,
            KnownCallee::Realloc,
            KnownCallee::ReallocArray,
            KnownCallee::Free,
        ] {
            assert_eq!(KnownCallee::from_name(known.name()), Some(known));
        }
        assert_eq!(KnownCallee::from_name("mmap"), None);
    }
}
