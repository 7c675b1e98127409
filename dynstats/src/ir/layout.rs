//! Type layout under a fixed 64-bit data layout.
//!
//! Used to report the largest struct of a program, which bounds how big a
//! single non-array heap object is expected to be.

use super::{Module, Type};
use anyhow::{Result, bail};
use std::collections::HashSet;
use tracing::debug;

/// Size of a pointer in bytes.
pub const POINTER_SIZE: u64 = 8;

/// Largest alignment an integer is given.
const MAX_INT_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
}

/// Computes type layouts against the struct definitions of a module.
pub struct LayoutCx<'a> {
    module: &'a Module,
}

impl<'a> LayoutCx<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    /// Returns the layout of `ty`, or `None` if it has no size.
    ///
    /// `void` and opaque structs are unsized. A struct that contains itself by
    /// value is an error.
    pub fn layout_of(&self, ty: &Type) -> Result<Option<Layout>> {
        self.layout_with(ty, &mut HashSet::new())
    }

    fn layout_with(&self, ty: &Type, visiting: &mut HashSet<String>) -> Result<Option<Layout>> {
        let layout = match ty {
            Type::Void => return Ok(None),
            Type::Int(bits) => {
                let size = u64::from(bits.div_ceil(8)).max(1).next_power_of_two();
                Layout {
                    size,
                    align: size.min(MAX_INT_ALIGN),
                }
            }
            Type::Ptr(_) => Layout {
                size: POINTER_SIZE,
                align: POINTER_SIZE,
            },
            Type::Array { elem, len } => {
                let Some(elem) = self.layout_with(elem, visiting)? else {
                    return Ok(None);
                };
                let Some(size) = elem.size.checked_mul(*len) else {
                    bail!("Array of {} elements of {} bytes is too large", len, elem.size);
                };
                Layout {
                    size,
                    align: elem.align,
                }
            }
            Type::Struct(name) => return self.struct_layout(name, visiting),
        };
        Ok(Some(layout))
    }

    fn struct_layout(&self, name: &str, visiting: &mut HashSet<String>) -> Result<Option<Layout>> {
        let Some(def) = self.module.struct_def(name) else {
            bail!("Struct '{}' is not defined", name);
        };
        let Some(fields) = &def.fields else {
            return Ok(None);
        };
        if !visiting.insert(name.to_string()) {
            bail!("Struct '{}' contains itself by value", name);
        }

        let mut offset = 0u64;
        let mut align = 1u64;
        for field in fields {
            let Some(layout) = self.layout_with(field, visiting)? else {
                visiting.remove(name);
                return Ok(None);
            };
            let end = align_to(offset, layout.align)
                .and_then(|start| start.checked_add(layout.size));
            let Some(end) = end else {
                bail!("Struct '{}' is too large", name);
            };
            offset = end;
            align = align.max(layout.align);
        }
        visiting.remove(name);

        let Some(size) = align_to(offset, align) else {
            bail!("Struct '{}' is too large", name);
        };
        Ok(Some(Layout { size, align }))
    }

    /// Finds the sized struct with the largest allocation size.
    pub fn largest_struct(&self) -> Result<Option<(&'a str, u64)>> {
        let mut largest: Option<(&'a str, u64)> = None;
        for def in &self.module.structs {
            let Some(layout) = self.struct_layout(&def.name, &mut HashSet::new())? else {
                continue;
            };
            debug!("Struct {} has size {}", def.name, layout.size);
            if largest.is_none_or(|(_, size)| layout.size > size) {
                largest = Some((def.name.as_str(), layout.size));
            }
        }
        Ok(largest)
    }
}

/// Rounds `offset` up to `align`, which is a power of 2.
fn align_to(offset: u64, align: u64) -> Option<u64> {
    offset.checked_add(align - 1).map(|end| end & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::StructDef;

    fn module_with(structs: Vec<(&str, Option<Vec<Type>>)>) -> Module {
        let mut module = Module::new("layout");
        module.structs = structs
            .into_iter()
            .map(|(name, fields)| StructDef {
                name: name.to_string(),
                fields,
            })
            .collect();
        module
    }

    #[test]
    fn test_primitive_layouts() {
        let module = Module::new("empty");
        let cx = LayoutCx::new(&module);
        let size = |ty: Type| cx.layout_of(&ty).unwrap().map(|l| l.size);
        assert_eq!(size(Type::Int(1)), Some(1));
        assert_eq!(size(Type::Int(24)), Some(4));
        assert_eq!(size(Type::Int(64)), Some(8));
        assert_eq!(size(Type::address()), Some(8));
        assert_eq!(size(Type::Void), None);
    }

    #[test]
    fn test_struct_padding() {
        // { i8, i64, i16 } -> 1 + 7 pad + 8 + 2 + 6 tail pad
        let module = module_with(vec![(
            "padded",
            Some(vec![Type::Int(8), Type::Int(64), Type::Int(16)]),
        )]);
        let cx = LayoutCx::new(&module);
        let layout = cx.layout_of(&Type::Struct("padded".into())).unwrap();
        assert_eq!(layout, Some(Layout { size: 24, align: 8 }));
    }

    #[test]
    fn test_largest_struct() {
        let module = module_with(vec![
            ("small", Some(vec![Type::Int(32)])),
            (
                "big",
                Some(vec![
                    Type::Array {
                        elem: Box::new(Type::Struct("small".into())),
                        len: 10,
                    },
                    Type::address(),
                ]),
            ),
            ("opaque", None),
        ]);
        let cx = LayoutCx::new(&module);
        assert_eq!(cx.largest_struct().unwrap(), Some(("big", 48)));
    }

    #[test]
    fn test_self_referencing_by_pointer_is_sized() {
        let module = module_with(vec![(
            "node",
            Some(vec![Type::Int(32), Type::Struct("node".into()).pointer_to()]),
        )]);
        let cx = LayoutCx::new(&module);
        assert_eq!(cx.largest_struct().unwrap(), Some(("node", 16)));
    }

    #[test]
    fn test_oversized_array_fails() {
        let module = module_with(vec![(
            "huge",
            Some(vec![Type::Array {
                elem: Box::new(Type::Int(64)),
                len: u64::MAX,
            }]),
        )]);
        let err = LayoutCx::new(&module).largest_struct().unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_oversized_struct_fails() {
        // Each field fits on its own, their sum does not.
        let half = Type::Array {
            elem: Box::new(Type::Int(8)),
            len: u64::MAX / 2 + 1,
        };
        let module = module_with(vec![("huge", Some(vec![half.clone(), half]))]);
        let err = LayoutCx::new(&module).largest_struct().unwrap_err();
        assert!(err.to_string().contains("Struct 'huge' is too large"));
    }

    #[test]
    fn test_recursive_by_value_fails() {
        let module = module_with(vec![("loop", Some(vec![Type::Struct("loop".into())]))]);
        let cx = LayoutCx::new(&module);
        let err = cx.largest_struct().unwrap_err();
        assert!(err.to_string().contains("contains itself"));
    }
}
