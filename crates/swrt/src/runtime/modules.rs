//! CommonJS module loader.
//!
//! `require(specifier)` checks the built-in registry first, then resolves a
//! file through [`ModuleResolver`]. File modules are wrapped in a function
//! taking `(exports, require, module, __filename, __dirname)` and cached by
//! absolute path before they execute, so a cycle sees the partially filled
//! `exports` of the module still loading.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rquickjs::convert::Coerced;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Object, Persistent, Value};
use tracing::debug;

use super::js::throw;
use crate::builtins::BuiltinRegistry;
use crate::resolver::ModuleResolver;
use crate::transpiler::transpile_module;

const WRAPPER_HEAD: &str = "(function (exports, require, module, __filename, __dirname) {";
const WRAPPER_TAIL: &str = "\n})";

pub(crate) struct ModuleLoader {
    resolver: ModuleResolver,
    builtins: Rc<BuiltinRegistry>,
    cache: RefCell<HashMap<PathBuf, Persistent<Object<'static>>>>,
}

impl ModuleLoader {
    pub(crate) fn new(resolver: ModuleResolver, builtins: Rc<BuiltinRegistry>) -> Self {
        Self {
            resolver,
            builtins,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn clear_cache(&self) {
        let count = self.cache.borrow().len();
        self.cache.borrow_mut().clear();
        debug!(modules = count, "module cache cleared");
    }

    pub(crate) fn cached_modules(&self) -> usize {
        self.cache.borrow().len()
    }

    /// `require(specifier)` as seen from the file `importer`.
    pub(crate) fn require<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        specifier: &str,
        importer: &Path,
    ) -> rquickjs::Result<Value<'js>> {
        if let Some(exports) = self.builtins.exports(ctx, specifier)? {
            return Ok(exports.into_value());
        }
        let path = self
            .resolver
            .resolve(specifier, importer)
            .map_err(|_| throw(ctx, format!("Cannot find module '{specifier}'")))?;
        self.load_file(ctx, &path)
    }

    /// Load the file module at `path` (absolute), returning its exports.
    pub(crate) fn load_file<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        path: &Path,
    ) -> rquickjs::Result<Value<'js>> {
        let cached = self.cache.borrow().get(path).cloned();
        if let Some(module) = cached {
            return module.restore(ctx)?.get("exports");
        }

        let source = std::fs::read_to_string(path)
            .map_err(|e| throw(ctx, format!("Cannot load module '{}': {e}", path.display())))?;
        debug!(path = %path.display(), "loading module");

        let module = new_module(ctx, path)?;
        self.cache
            .borrow_mut()
            .insert(path.to_path_buf(), Persistent::save(ctx, module.clone()));

        let result = if path.extension().is_some_and(|e| e == "json") {
            ctx.json_parse(source)
                .and_then(|exports| module.set("exports", exports))
        } else {
            self.execute(ctx, &module, &source, path)
        };
        if let Err(err) = result {
            self.cache.borrow_mut().remove(path);
            return Err(err);
        }
        module.set("loaded", true)?;
        module.get("exports")
    }

    /// Run `source` as the body of `module`. `path` becomes `__filename` and
    /// anchors relative `require` calls.
    pub(crate) fn execute<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        module: &Object<'js>,
        source: &str,
        path: &Path,
    ) -> rquickjs::Result<()> {
        let code = transpile_module(source, path).map_err(|e| throw(ctx, e))?;
        let wrapped = format!("{WRAPPER_HEAD}{code}{WRAPPER_TAIL}");

        let mut options = rquickjs::context::EvalOptions::default();
        // Direct `eval` in encrypted bundles must see the module scope.
        options.strict = false;
        let wrapper: Function = ctx.eval_with_options(wrapped, options)?;

        let require = self.require_function(ctx, path.to_path_buf())?;
        let exports: Value = module.get("exports")?;
        let dirname = path
            .parent()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        wrapper.call::<_, Value>((
            exports,
            require,
            module.clone(),
            path.display().to_string(),
            dirname,
        ))?;
        Ok(())
    }

    /// The `require` function handed to the module at `importer`.
    pub(crate) fn require_function<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        importer: PathBuf,
    ) -> rquickjs::Result<Function<'js>> {
        let loader = self.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, specifier: Opt<Coerced<String>>| {
                let Some(Coerced(specifier)) = specifier.0 else {
                    return Err(throw(&ctx, "require: module name required"));
                };
                loader.require(&ctx, &specifier, &importer)
            },
        )
    }
}

/// A fresh `module` object for `path`.
pub(crate) fn new_module<'js>(ctx: &Ctx<'js>, path: &Path) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;
    module.set("exports", Object::new(ctx.clone())?)?;
    module.set("id", path.display().to_string())?;
    module.set("filename", path.display().to_string())?;
    module.set("loaded", false)?;
    Ok(module)
}
