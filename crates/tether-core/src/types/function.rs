//! Declared function signatures.

use std::collections::HashMap;

use tracing::warn;

use super::ffi::FfiType;
use crate::error::{Result, TetherError};

/// One named parameter of a declared function.
///
/// ```text
/// void Function(int x);
/// --------------^^^^^
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiParameter
{
    pub name: String,
    pub ty: FfiType,
}

/// An immutable declared signature.
///
/// Signatures normally come from a C header parser; here they are built
/// directly.
///
/// ```rust
/// use tether_core::types::{FfiFunction, FfiType};
///
/// let f = FfiFunction::new("RtlInitUnicodeString", FfiType::Void)
///     .param("DestinationString", FfiType::Pointer)
///     .param("SourceString", FfiType::Pointer);
/// assert_eq!(f.parameters.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiFunction
{
    pub name: String,
    pub return_type: FfiType,
    pub parameters: Vec<FfiParameter>,
}

impl FfiFunction
{
    #[must_use]
    pub fn new(name: impl Into<String>, return_type: FfiType) -> Self
    {
        Self {
            name: name.into(),
            return_type,
            parameters: Vec::new(),
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, ty: FfiType) -> Self
    {
        self.parameters.push(FfiParameter { name: name.into(), ty });
        self
    }
}

/// Declarations keyed by `(module, function)`.
#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry
{
    modules: HashMap<String, HashMap<String, FfiFunction>>,
}

impl FunctionRegistry
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Declare (or redeclare) a function under `module`.
    pub fn set(&mut self, module: &str, function: FfiFunction)
    {
        let functions = self.modules.entry(module.to_string()).or_default();
        let name = function.name.clone();
        if functions.insert(name.clone(), function).is_some() {
            warn!("Updated declaration of {module}!{name}");
        }
    }

    /// Look up a declaration.
    ///
    /// ## Errors
    ///
    /// `UndeclaredFunction` if nothing was declared under that name.
    pub fn get(&self, module: &str, function: &str) -> Result<&FfiFunction>
    {
        self.modules
            .get(module)
            .and_then(|functions| functions.get(function))
            .ok_or_else(|| TetherError::UndeclaredFunction {
                module: module.to_string(),
                function: function.to_string(),
            })
    }

    #[must_use]
    pub fn exists(&self, module: &str, function: &str) -> bool
    {
        self.get(module, function).is_ok()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_redeclaration_replaces()
    {
        let mut registry = FunctionRegistry::new();
        registry.set("ntoskrnl", FfiFunction::new("Foo", FfiType::Void));
        registry.set("ntoskrnl", FfiFunction::new("Foo", FfiType::SInt).param("x", FfiType::SInt));

        let foo = registry.get("ntoskrnl", "Foo").unwrap();
        assert_eq!(foo.return_type, FfiType::SInt);
        assert_eq!(foo.parameters.len(), 1);
    }

    #[test]
    fn test_missing_declaration()
    {
        let registry = FunctionRegistry::new();
        assert!(!registry.exists("ntoskrnl", "Foo"));
        let err = registry.get("ntoskrnl", "Foo").unwrap_err();
        assert!(err.to_string().contains("ntoskrnl!Foo"));
    }
}
