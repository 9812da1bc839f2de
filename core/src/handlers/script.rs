//! Rhai 脚本回调：脚本里定义了哪些函数，就只安装哪些槽位。
//!
//! ```text
//! fn read(path)        -> blob | string
//! fn write(path, data) -> ()          // data 为 blob
//! fn list(path)        -> array
//! fn exists(path)      -> bool
//! fn size(path)        -> int
//! ```
//!
//! - `Engine` 只初始化一次；每次调用使用新的 `Scope`，脚本之间不共享变量
//! - 脚本运行错误即回调错误，在分发边界转换为 `HandlerFault`
//! - `print`/`debug` 输出重定向到 tracing

use std::path::Path;
use std::sync::Arc;

use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope, AST};

use crate::error::{HandlerError, HandlerResult, VdError, VdResult};

use super::{HandlerSet, OpKind};

pub struct ScriptHandlers {
    engine: Engine,
    ast: AST,
    source_name: String,
}

impl ScriptHandlers {
    pub fn compile(source_name: &str, script: &str) -> VdResult<Self> {
        let mut engine = Engine::new();
        {
            let name = source_name.to_string();
            engine.on_print(move |s: &str| {
                tracing::info!(target: "quarkdrive::script", script = %name, "{s}");
            });
        }
        {
            let name = source_name.to_string();
            engine.on_debug(move |s: &str, _src: Option<&str>, pos: Position| {
                tracing::debug!(target: "quarkdrive::script", script = %name, "{pos:?} > {s}");
            });
        }
        let ast = engine
            .compile(script)
            .map_err(|e| VdError::Script(format!("{}: {}", source_name, e)))?;
        Ok(Self {
            engine,
            ast,
            source_name: source_name.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> VdResult<Self> {
        let script = std::fs::read_to_string(path)
            .map_err(|e| VdError::Script(format!("读取脚本失败 {}: {}", path.display(), e)))?;
        Self::compile(&path.display().to_string(), &script)
    }

    /// 脚本是否定义了某个操作（按函数名 + 参数个数匹配）
    pub fn defines(&self, kind: OpKind) -> bool {
        let arity = match kind {
            OpKind::Write => 2,
            _ => 1,
        };
        self.ast
            .iter_functions()
            .any(|f| f.name == kind.as_str() && f.params.len() == arity)
    }

    /// 只为脚本中定义了的函数生成槽位
    pub fn handler_set(self: Arc<Self>) -> HandlerSet {
        let mut set = HandlerSet::new();
        if self.defines(OpKind::Read) {
            let s = Arc::clone(&self);
            set = set.with_read(move |p: &str| s.read(p));
        }
        if self.defines(OpKind::Write) {
            let s = Arc::clone(&self);
            set = set.with_write(move |p: &str, d: &[u8]| s.write(p, d));
        }
        if self.defines(OpKind::List) {
            let s = Arc::clone(&self);
            set = set.with_list(move |p: &str| s.list(p));
        }
        if self.defines(OpKind::Exists) {
            let s = Arc::clone(&self);
            set = set.with_exists(move |p: &str| s.exists(p));
        }
        if self.defines(OpKind::Size) {
            let s = Arc::clone(&self);
            set = set.with_size(move |p: &str| s.size(p));
        }
        set
    }

    fn call(&self, kind: OpKind, args: impl rhai::FuncArgs) -> HandlerResult<Dynamic> {
        let mut scope = Scope::new();
        self.engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, kind.as_str(), args)
            .map_err(|e| script_error(&self.source_name, kind, &e))
    }

    pub fn read(&self, path: &str) -> HandlerResult<Vec<u8>> {
        let value = self.call(OpKind::Read, (path.to_string(),))?;
        if value.is::<Blob>() {
            return value
                .try_cast::<Blob>()
                .ok_or_else(|| HandlerError::new("read() 返回值不是 blob"));
        }
        if value.is::<ImmutableString>() {
            return value
                .try_cast::<ImmutableString>()
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| HandlerError::new("read() 返回值不是字符串"));
        }
        if value.is_unit() {
            return Ok(Vec::new());
        }
        Err(HandlerError::new(format!(
            "read() 应返回 blob 或字符串，实际为 {}",
            value.type_name()
        )))
    }

    pub fn write(&self, path: &str, data: &[u8]) -> HandlerResult<()> {
        let blob: Blob = data.to_vec();
        self.call(OpKind::Write, (path.to_string(), blob))?;
        Ok(())
    }

    pub fn list(&self, path: &str) -> HandlerResult<Vec<String>> {
        let value = self.call(OpKind::List, (path.to_string(),))?;
        let type_name = value.type_name();
        let items = value
            .try_cast::<Array>()
            .ok_or_else(|| HandlerError::new(format!("list() 应返回数组，实际为 {}", type_name)))?;
        items
            .into_iter()
            .map(|item| {
                let t = item.type_name();
                item.try_cast::<ImmutableString>()
                    .map(|s| s.to_string())
                    .ok_or_else(|| HandlerError::new(format!("list() 元素应为字符串，实际为 {}", t)))
            })
            .collect()
    }

    pub fn exists(&self, path: &str) -> HandlerResult<bool> {
        let value = self.call(OpKind::Exists, (path.to_string(),))?;
        value
            .as_bool()
            .map_err(|t| HandlerError::new(format!("exists() 应返回 bool，实际为 {}", t)))
    }

    pub fn size(&self, path: &str) -> HandlerResult<u64> {
        let value = self.call(OpKind::Size, (path.to_string(),))?;
        let n = value
            .as_int()
            .map_err(|t| HandlerError::new(format!("size() 应返回整数，实际为 {}", t)))?;
        u64::try_from(n).map_err(|_| HandlerError::new(format!("size() 返回了负数: {}", n)))
    }
}

fn script_error(source: &str, kind: OpKind, err: &EvalAltResult) -> HandlerError {
    HandlerError::new(format!("{} {}(): {}", source, kind, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
        fn read(path) {
            if path == "/boom" { throw "kaboom"; }
            "content of " + path
        }
        fn list(path) { ["b.txt", "a.txt"] }
        fn size(path) { 42 }
    "#;

    #[test]
    fn test_only_defined_functions_are_installed() {
        let script = Arc::new(ScriptHandlers::compile("test.rhai", SCRIPT).unwrap());
        let set = Arc::clone(&script).handler_set();
        assert_eq!(set.installed(), vec![OpKind::Read, OpKind::List, OpKind::Size]);
        assert!(!script.defines(OpKind::Write));
    }

    #[test]
    fn test_calls_convert_values() {
        let script = ScriptHandlers::compile("test.rhai", SCRIPT).unwrap();
        assert_eq!(script.read("/x").unwrap(), b"content of /x".to_vec());
        assert_eq!(
            script.list("/").unwrap(),
            vec!["b.txt".to_string(), "a.txt".to_string()]
        );
        assert_eq!(script.size("/x").unwrap(), 42);
    }

    #[test]
    fn test_throw_becomes_handler_error() {
        let script = ScriptHandlers::compile("test.rhai", SCRIPT).unwrap();
        let err = script.read("/boom").unwrap_err();
        assert!(err.0.contains("kaboom"), "unexpected message: {}", err);
    }

    #[test]
    fn test_demo_script() {
        let script = ScriptHandlers::compile(
            "handlers.rhai",
            include_str!("../../../demos/handlers.rhai"),
        )
        .unwrap();
        assert!(!script.defines(OpKind::Write));
        assert_eq!(
            script.list("/").unwrap(),
            vec!["hello.txt".to_string(), "docs/".to_string()]
        );
        let readme = script.read("/docs/readme.md").unwrap();
        assert_eq!(script.size("/docs/readme.md").unwrap(), readme.len() as u64);
        assert!(script.exists("/docs").unwrap());
        assert!(!script.exists("/nope").unwrap());
        assert!(script.read("/nope").is_err());
    }

    #[test]
    fn test_compile_error_is_script_error() {
        let err = ScriptHandlers::compile("bad.rhai", "fn read(path) {").err();
        assert!(matches!(err, Some(VdError::Script(_))));
    }
}
