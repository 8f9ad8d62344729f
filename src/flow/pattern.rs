//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 路径模式
//!
//! 模板中的 `:name` 段编译为正则 `[^/]+`，其余按字面匹配。
//! 所有比较都在规范化路径上进行（合并重复斜杠并补齐结尾 `/`），
//! 因此 `/products` 能匹配 `/products/1` 却不会匹配 `/products1`。

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

use crate::definition::PathOperator;
use crate::error::GatewayError;

lazy_static! {
    static ref PARAM_SEGMENT: Regex = Regex::new(r"^:[A-Za-z0-9_\-]*$").unwrap();
    static ref DUPLICATE_SLASHES: Regex = Regex::new(r"/{2,}").unwrap();
}

/// 规范化路径：以 `/` 开头、合并重复斜杠、以 `/` 结尾
pub fn normalize_path(path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let collapsed: Cow<'_, str> = DUPLICATE_SLASHES.replace_all(path, "/");

    let mut normalized = String::with_capacity(collapsed.len() + 2);
    if !collapsed.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(&collapsed);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Regex(Regex),
}

/// 编译后的路径模式
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    operator: PathOperator,
    params: usize,
    matcher: Matcher,
}

impl PathPattern {
    /// 编译路径模板
    ///
    /// # 参数
    /// - `template`: 路径模板，例如 `/products/:id/reviews`
    /// - `operator`: `StartsWith` 前缀匹配，`Equals` 完全匹配
    pub fn compile(template: &str, operator: PathOperator) -> Result<Self, GatewayError> {
        let normalized = normalize_path(template);
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        let params = segments
            .iter()
            .filter(|s| PARAM_SEGMENT.is_match(s))
            .count();

        let matcher = if params == 0 {
            Matcher::Literal(normalized)
        } else {
            let mut pattern = String::from("^/");
            for segment in &segments {
                if PARAM_SEGMENT.is_match(segment) {
                    pattern.push_str("[^/]+");
                } else {
                    pattern.push_str(&regex::escape(segment));
                }
                pattern.push('/');
            }
            if operator == PathOperator::Equals {
                pattern.push('$');
            }
            let regex = Regex::new(&pattern).map_err(|e| {
                GatewayError::ConfigError(format!("无效的路径模板 {}: {}", template, e))
            })?;
            Matcher::Regex(regex)
        };

        Ok(Self {
            template: template.to_string(),
            operator,
            params,
            matcher,
        })
    }

    /// 匹配规范化后的请求路径
    pub fn matches(&self, normalized_path: &str) -> bool {
        match (&self.matcher, self.operator) {
            (Matcher::Literal(prefix), PathOperator::StartsWith) => {
                normalized_path.starts_with(prefix.as_str())
            }
            (Matcher::Literal(exact), PathOperator::Equals) => normalized_path == exact,
            (Matcher::Regex(regex), _) => regex.is_match(normalized_path),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// 参数段数量
    pub fn params(&self) -> usize {
        self.params
    }
}

/// 选出最具体的路径映射
///
/// 多个模板匹配时，参数段最少者胜出；仍相同时取更长的模板，再按字典序。
pub fn most_specific<'a>(
    mappings: &'a [PathPattern],
    normalized_path: &str,
) -> Option<&'a PathPattern> {
    mappings
        .iter()
        .filter(|m| m.matches(normalized_path))
        .min_by(|a, b| {
            a.params
                .cmp(&b.params)
                .then_with(|| b.template.len().cmp(&a.template.len()))
                .then_with(|| a.template.cmp(&b.template))
        })
}
