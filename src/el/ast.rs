//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 条件表达式语法树与求值

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

use super::scope::EvaluationScope;
use super::EvaluationError;

/// 表达式
#[derive(Debug, Clone)]
pub enum Expr {
    /// 字面量
    Literal(Value),
    /// 变量引用，例如 `#request.headers['x-a']`
    Variable { root: String, path: Vec<Accessor> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// 右侧为字面量时预编译的正则匹配
    Matches { left: Box<Expr>, pattern: Regex },
}

/// 属性访问
#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    /// `.name`
    Field(String),
    /// `['name']` 或 `[0]`
    Index(Value),
}

/// 比较操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
    Contains,
    StartsWith,
    EndsWith,
}

/// 编译 `matches` 的正则（整串匹配）
pub(crate) fn compile_matches(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl Expr {
    /// 求值为布尔结果
    ///
    /// `null` 视为 false；其它非布尔结果是类型错误。
    pub fn evaluate(&self, scope: &EvaluationScope) -> Result<bool, EvaluationError> {
        match self.value(scope)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(EvaluationError::Type(format!(
                "表达式结果不是布尔值: {}",
                other
            ))),
        }
    }

    fn value(&self, scope: &EvaluationScope) -> Result<Value, EvaluationError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Variable { root, path } => Ok(resolve(scope, root, path)),
            Expr::Not(inner) => Ok(Value::Bool(!inner.evaluate(scope)?)),
            Expr::And(l, r) => Ok(Value::Bool(l.evaluate(scope)? && r.evaluate(scope)?)),
            Expr::Or(l, r) => Ok(Value::Bool(l.evaluate(scope)? || r.evaluate(scope)?)),
            Expr::Compare { op, left, right } => {
                let l = left.value(scope)?;
                let r = right.value(scope)?;
                compare(*op, &l, &r).map(Value::Bool)
            }
            Expr::Matches { left, pattern } => match left.value(scope)? {
                Value::String(s) => Ok(Value::Bool(pattern.is_match(&s))),
                Value::Null => Ok(Value::Bool(false)),
                other => Err(EvaluationError::Type(format!(
                    "matches 需要字符串操作数: {}",
                    other
                ))),
            },
        }
    }
}

fn resolve(scope: &EvaluationScope, root: &str, path: &[Accessor]) -> Value {
    let mut current = match scope.get(root) {
        Some(v) => v,
        None => return Value::Null,
    };

    for accessor in path {
        let next = match (accessor, current) {
            (Accessor::Field(name), Value::Object(map)) => lookup(map, name),
            (Accessor::Index(Value::String(name)), Value::Object(map)) => lookup(map, name),
            (Accessor::Index(Value::Number(n)), Value::Array(items)) => {
                n.as_u64().and_then(|i| items.get(i as usize))
            }
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }

    current.clone()
}

/// 先精确查找，再按小写键查找（请求头以小写存储）
fn lookup<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| map.get(&key.to_ascii_lowercase()))
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvaluationError> {
    match op {
        CompareOp::Eq => Ok(loose_eq(left, right)),
        CompareOp::Ne => Ok(!loose_eq(left, right)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match order(left, right) {
                Some(o) => o,
                None if left.is_null() || right.is_null() => return Ok(false),
                None => {
                    return Err(EvaluationError::Type(format!(
                        "无法比较 {} 和 {}",
                        left, right
                    )))
                }
            };
            Ok(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
        CompareOp::Matches => match (left, right) {
            (Value::String(s), Value::String(p)) => compile_matches(p)
                .map(|re| re.is_match(s))
                .map_err(|e| EvaluationError::Type(format!("无效的正则: {}", e))),
            (Value::Null, _) => Ok(false),
            _ => Err(EvaluationError::Type("matches 需要字符串操作数".to_string())),
        },
        CompareOp::Contains => match (left, right) {
            (Value::String(s), Value::String(needle)) => Ok(s.contains(needle.as_str())),
            (Value::Array(items), needle) => Ok(items.iter().any(|i| loose_eq(i, needle))),
            (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
            (Value::Null, _) => Ok(false),
            _ => Err(EvaluationError::Type("contains 操作数类型不匹配".to_string())),
        },
        CompareOp::StartsWith | CompareOp::EndsWith => match (left, right) {
            (Value::String(s), Value::String(affix)) => Ok(if op == CompareOp::StartsWith {
                s.starts_with(affix.as_str())
            } else {
                s.ends_with(affix.as_str())
            }),
            (Value::Null, _) => Ok(false),
            _ => Err(EvaluationError::Type(
                "startsWith/endsWith 需要字符串操作数".to_string(),
            )),
        },
    }
}

/// 相等比较：数字按数值比较，数字字符串可与数字比较
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) if left.is_number() || right.is_number() => a == b,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            let a = as_number(left)?;
            let b = as_number(right)?;
            a.partial_cmp(&b)
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> EvaluationScope {
        EvaluationScope::new().with_variable(
            "request",
            json!({
                "method": "GET",
                "headers": {"x-count": "7", "x-tags": "a,b"},
                "list": ["a", "b"]
            }),
        )
    }

    fn var(root: &str, path: Vec<Accessor>) -> Box<Expr> {
        Box::new(Expr::Variable {
            root: root.to_string(),
            path,
        })
    }

    #[test]
    fn test_resolve_case_insensitive_header() {
        let expr = Expr::Compare {
            op: CompareOp::Eq,
            left: var(
                "request",
                vec![
                    Accessor::Field("headers".into()),
                    Accessor::Index(json!("X-Count")),
                ],
            ),
            right: Box::new(Expr::Literal(json!(7))),
        };
        assert!(expr.evaluate(&scope()).unwrap());
    }

    #[test]
    fn test_missing_path_is_null() {
        let expr = Expr::Compare {
            op: CompareOp::Eq,
            left: var("token", vec![Accessor::Field("sub".into())]),
            right: Box::new(Expr::Literal(Value::Null)),
        };
        assert!(expr.evaluate(&scope()).unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        let expr = Expr::Variable {
            root: "request".into(),
            path: vec![Accessor::Field("method".into())],
        };
        assert!(expr.evaluate(&scope()).is_err());
    }

    #[test]
    fn test_ordering_and_contains() {
        assert!(compare(CompareOp::Lt, &json!("5"), &json!(7)).unwrap());
        assert!(compare(CompareOp::Ge, &json!("b"), &json!("a")).unwrap());
        assert!(!compare(CompareOp::Gt, &Value::Null, &json!(1)).unwrap());
        assert!(compare(CompareOp::Gt, &json!(true), &json!(1)).is_err());
        assert!(compare(CompareOp::Contains, &json!(["a", "b"]), &json!("b")).unwrap());
        assert!(compare(CompareOp::StartsWith, &json!("/v1/x"), &json!("/v1")).unwrap());
    }

    #[test]
    fn test_loose_eq() {
        assert!(loose_eq(&json!("10"), &json!(10)));
        assert!(!loose_eq(&json!("10"), &json!("10.0")));
        assert!(loose_eq(&Value::Null, &Value::Null));
    }
}
