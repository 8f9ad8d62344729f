//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 表达式变量作用域

use serde_json::{Map, Value};
use std::collections::HashMap;

/// 变量作用域
///
/// 根变量名（不含 `#`）到 JSON 值的映射，例如 `request`、`context`、`token`。
/// 作用域按请求构建，不在请求间共享。
#[derive(Debug, Clone, Default)]
pub struct EvaluationScope {
    variables: HashMap<String, Value>,
}

impl EvaluationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定根变量，已存在时覆盖
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// 把字符串映射转换为 JSON 对象
pub(crate) fn string_map<'a, I>(entries: I) -> Value
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let map: Map<String, Value> = entries
        .into_iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map)
}
