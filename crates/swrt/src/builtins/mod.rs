//! Host-provided modules
//!
//! This module provides the [`BuiltinModule`] trait for exposing native
//! functionality to scripts and the [`BuiltinRegistry`] that `require` consults
//! before touching the filesystem.
//!
//! # Custom Modules
//!
//! ```rust
//! use swrt::BuiltinModule;
//! use swrt::rquickjs::{Ctx, Object};
//!
//! struct Greeter;
//!
//! impl BuiltinModule for Greeter {
//!     fn name(&self) -> &str {
//!         "greeter"
//!     }
//!
//!     fn exports<'js>(&self, ctx: &Ctx<'js>) -> swrt::rquickjs::Result<Object<'js>> {
//!         let obj = Object::new(ctx.clone())?;
//!         obj.set("greeting", "hello")?;
//!         Ok(obj)
//!     }
//! }
//! ```
//!
//! Register via [`RuntimeBuilder::builtin`](crate::RuntimeBuilder::builtin).

pub mod http;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use rquickjs::{Ctx, Object, Persistent};

/// Names resolved to host objects at run time. The bundler keeps these
/// external; `require` of any of them never touches the filesystem.
pub const BUILTIN_MODULE_NAMES: &[&str] = &[
    "server",
    "sqlite",
    "websocket",
    "ws",
    "fs",
    "crypto",
    "zlib",
    "compression",
    "http",
    "redis",
    "exec",
    "child_process",
    "path",
    "httpserver",
];

/// Whether `specifier` names a built-in module or one of its sub-modules
/// (`http/client`).
pub fn is_builtin_specifier(specifier: &str) -> bool {
    let head = specifier.split('/').next().unwrap_or(specifier);
    BUILTIN_MODULE_NAMES.contains(&head)
}

/// A module implemented by the host.
///
/// Exports are built lazily on first `require` and cached for the lifetime of
/// the runtime.
pub trait BuiltinModule {
    /// Name under which scripts `require` the module.
    fn name(&self) -> &str;

    /// Build the exports object.
    fn exports<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>>;

    /// Named sub-module, for `require("<name>/<sub>")`.
    fn sub_module(&self, _name: &str) -> Option<&dyn BuiltinModule> {
        None
    }

    /// Drop every engine handle the module holds. Called before the engine
    /// context is torn down.
    fn shutdown(&self) {}
}

/// Registered built-in modules plus their cached exports.
#[derive(Default)]
pub struct BuiltinRegistry {
    modules: BTreeMap<String, Box<dyn BuiltinModule>>,
    cache: RefCell<HashMap<String, Persistent<Object<'static>>>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, replacing any previous one with the same name.
    pub fn register(&mut self, module: Box<dyn BuiltinModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Names of the registered modules, sorted.
    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn contains(&self, specifier: &str) -> bool {
        self.lookup(specifier).is_some()
    }

    fn lookup(&self, specifier: &str) -> Option<&dyn BuiltinModule> {
        let mut parts = specifier.split('/');
        let head = parts.next()?;
        let mut module: &dyn BuiltinModule = self.modules.get(head)?.as_ref();
        for part in parts {
            module = module.sub_module(part)?;
        }
        Some(module)
    }

    /// Exports for `specifier`, or `None` when no such module is registered.
    pub fn exports<'js>(
        &self,
        ctx: &Ctx<'js>,
        specifier: &str,
    ) -> rquickjs::Result<Option<Object<'js>>> {
        if let Some(cached) = self.cache.borrow().get(specifier) {
            return cached.clone().restore(ctx).map(Some);
        }
        let Some(module) = self.lookup(specifier) else {
            return Ok(None);
        };
        let exports = module.exports(ctx)?;
        self.cache
            .borrow_mut()
            .insert(specifier.to_string(), Persistent::save(ctx, exports.clone()));
        Ok(Some(exports))
    }

    /// Release cached exports and module-held handles.
    pub fn shutdown(&self) {
        self.cache.borrow_mut().clear();
        for module in self.modules.values() {
            module.shutdown();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    struct Leaf(&'static str);

    impl BuiltinModule for Leaf {
        fn name(&self) -> &str {
            self.0
        }

        fn exports<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
            let obj = Object::new(ctx.clone())?;
            obj.set("kind", self.0)?;
            Ok(obj)
        }
    }

    struct Namespace {
        child: Leaf,
    }

    impl BuiltinModule for Namespace {
        fn name(&self) -> &str {
            "ns"
        }

        fn exports<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
            let obj = Object::new(ctx.clone())?;
            obj.set("child", self.child.exports(ctx)?)?;
            Ok(obj)
        }

        fn sub_module(&self, name: &str) -> Option<&dyn BuiltinModule> {
            (name == self.child.0).then_some(&self.child as &dyn BuiltinModule)
        }
    }

    #[test]
    fn builtin_specifiers() {
        assert!(is_builtin_specifier("fs"));
        assert!(is_builtin_specifier("http/client"));
        assert!(is_builtin_specifier("child_process"));
        assert!(!is_builtin_specifier("./fs"));
        assert!(!is_builtin_specifier("lodash"));
        assert!(!is_builtin_specifier("fsx"));
    }

    #[test]
    fn lookup_and_sub_modules() {
        let mut registry = BuiltinRegistry::new();
        registry.register(Box::new(Namespace {
            child: Leaf("client"),
        }));
        assert!(registry.contains("ns"));
        assert!(registry.contains("ns/client"));
        assert!(!registry.contains("ns/server"));
        assert!(!registry.contains("other"));
        assert_eq!(registry.names(), vec!["ns".to_string()]);
    }

    #[test]
    fn exports_are_cached() {
        let rt = Runtime::new().unwrap();
        let context = Context::full(&rt).unwrap();
        let mut registry = BuiltinRegistry::new();
        registry.register(Box::new(Leaf("leaf")));

        context.with(|ctx| {
            let a = registry.exports(&ctx, "leaf").unwrap().unwrap();
            let b = registry.exports(&ctx, "leaf").unwrap().unwrap();
            a.set("marker", 7).unwrap();
            assert_eq!(b.get::<_, i32>("marker").unwrap(), 7);
            assert_eq!(b.get::<_, String>("kind").unwrap(), "leaf");
            assert!(registry.exports(&ctx, "missing").unwrap().is_none());
        });
        registry.shutdown();
    }
}
