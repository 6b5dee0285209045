// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 输入快照模块
//!
//! 在请求开始时一次性捕获环境请求数据（查询参数、表单正文、Cookie、服务器元数据），
//! 对所有键和值进行清洗，之后快照保持只读。
//!
//! ## 清洗规则
//! 1. 键只允许 `[A-Za-z0-9:_/|-]`。查询与正文的非法键会中止捕获（致命模式），
//!    Cookie 与元数据的非法键被直接丢弃（非致命模式）。
//! 2. 值丢弃非法 UTF-8 序列并移除不可见控制字符；元数据保留传输层的原始编码形式，
//!    因此额外移除百分号编码的控制字符。
//! 3. 嵌套映射递归清洗。

use crate::{
    config::WebConfig,
    exception::Exception,
    security,
    utf8::{clean_string, remove_invisible_characters},
};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use std::collections::BTreeMap;

lazy_static! {
    static ref KEY_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9:_/|-]+$").unwrap();
    static ref TAG_PATTERN: Regex = Regex::new(r"<[^>]*>").unwrap();
}

/// 旧式 Cookie 规范遗留的保留键，捕获前移除
const CONFLICTING_COOKIES: [&str; 3] = ["$Version", "$Path", "$Domain"];

pub type RawMap = BTreeMap<String, RawInput>;
pub type InputMap = BTreeMap<String, InputValue>;

/// 传输层提供的未清洗值
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Value(Vec<u8>),
    Nested(RawMap),
}

impl From<&str> for RawInput {
    fn from(value: &str) -> Self {
        RawInput::Value(value.as_bytes().to_vec())
    }
}

impl From<String> for RawInput {
    fn from(value: String) -> Self {
        RawInput::Value(value.into_bytes())
    }
}

impl From<Vec<u8>> for RawInput {
    fn from(value: Vec<u8>) -> Self {
        RawInput::Value(value)
    }
}

/// 环境请求数据包。
///
/// 由传输层填充后交给 `InputSnapshot::capture`；
/// 若配置要求，捕获后它会被清空，并在关闭阶段由 `restore_ambient` 写回。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmbientRequest {
    pub query: RawMap,
    pub body: RawMap,
    pub cookies: RawMap,
    pub meta: RawMap,
}

impl AmbientRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, key: &str, value: impl Into<RawInput>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, key: &str, value: impl Into<RawInput>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn with_cookie(mut self, key: &str, value: impl Into<RawInput>) -> Self {
        self.cookies.insert(key.to_string(), value.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<RawInput>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty() && self.body.is_empty() && self.cookies.is_empty() && self.meta.is_empty()
    }
}

/// 清洗后的输入值
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Text(String),
    Map(InputMap),
}

impl InputValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            InputValue::Text(text) => Some(text),
            InputValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&InputMap> {
        match self {
            InputValue::Map(map) => Some(map),
            InputValue::Text(_) => None,
        }
    }
}

/// 快照中的四个命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Query,
    Body,
    Cookie,
    Meta,
}

#[derive(Debug, Clone)]
pub struct InputSnapshot {
    query: InputMap,
    body: InputMap,
    cookie: InputMap,
    meta: InputMap,
    /// 捕获时的原始数据，仅供 `restore_ambient` 使用
    original: AmbientRequest,
    xss_filtering: bool,
}

impl InputSnapshot {
    /// 从环境请求数据捕获快照。
    ///
    /// 所有清洗都在修改 `ambient` 之前完成，捕获失败时环境数据保持原样。
    pub fn capture(
        ambient: &mut AmbientRequest,
        config: &WebConfig,
        id: u128,
    ) -> Result<Self, Exception> {
        let query = if config.allow_query_input() {
            clean_map(&ambient.query, true, false)?
        } else {
            debug!("[ID{}]查询参数输入已被禁用，忽略{}个查询参数", id, ambient.query.len());
            InputMap::new()
        };
        let body = clean_map(&ambient.body, true, false)?;

        let mut cookies = ambient.cookies.clone();
        for conflicting in CONFLICTING_COOKIES {
            cookies.remove(conflicting);
        }
        let cookie = clean_map(&cookies, false, false)?;

        let mut meta = clean_map(&ambient.meta, false, true)?;
        if let Some(InputValue::Text(script)) = meta.get_mut("SCRIPT_NAME") {
            *script = TAG_PATTERN.replace_all(script, "").into_owned();
        }

        let original = if config.empty_ambient_on_capture() {
            debug!("[ID{}]清空环境请求数据", id);
            std::mem::take(ambient)
        } else {
            ambient.clone()
        };

        info!("[ID{}]请求输入已捕获并清洗", id);
        Ok(Self {
            query,
            body,
            cookie,
            meta,
            original,
            xss_filtering: config.xss_clean(),
        })
    }

    /// 把捕获时的原始数据写回环境数据包，供框架之外的错误处理代码读取。
    pub fn restore_ambient(&self, ambient: &mut AmbientRequest) {
        info!("正在恢复环境请求数据（query, body, cookie, meta）");
        *ambient = self.original.clone();
    }

    fn space(&self, space: Space) -> &InputMap {
        match space {
            Space::Query => &self.query,
            Space::Body => &self.body,
            Space::Cookie => &self.cookie,
            Space::Meta => &self.meta,
        }
    }

    /// 配置关闭 XSS 过滤时，调用方的请求被忽略；开启时调用方可以选择不过滤。
    fn should_clean(&self, xss_clean: bool) -> bool {
        self.xss_filtering && xss_clean
    }

    fn finish(&self, value: &InputValue, xss_clean: bool) -> InputValue {
        if self.should_clean(xss_clean) {
            security::xss_clean_value(value)
        } else {
            value.clone()
        }
    }

    /// 读取单个键，缺失时返回 `None` 而不是默认值。
    pub fn get(&self, space: Space, key: &str, xss_clean: bool) -> Option<InputValue> {
        self.space(space)
            .get(key)
            .map(|value| self.finish(value, xss_clean))
    }

    /// 读取一组键，每个键都保留在结果中，缺失的键对应 `None`。
    pub fn get_many(
        &self,
        space: Space,
        keys: &[&str],
        xss_clean: bool,
    ) -> BTreeMap<String, Option<InputValue>> {
        keys.iter()
            .map(|key| (key.to_string(), self.get(space, key, xss_clean)))
            .collect()
    }

    /// 读取整个命名空间
    pub fn get_all(&self, space: Space, xss_clean: bool) -> InputMap {
        self.space(space)
            .iter()
            .map(|(key, value)| (key.clone(), self.finish(value, xss_clean)))
            .collect()
    }

    pub fn query(&self, key: &str) -> Option<InputValue> {
        self.get(Space::Query, key, true)
    }

    pub fn body(&self, key: &str) -> Option<InputValue> {
        self.get(Space::Body, key, true)
    }

    pub fn cookie(&self, key: &str) -> Option<InputValue> {
        self.get(Space::Cookie, key, true)
    }

    pub fn meta(&self, key: &str) -> Option<InputValue> {
        self.get(Space::Meta, key, true)
    }

    /// 先查正文，再查查询参数
    pub fn body_or_query(&self, key: &str, xss_clean: bool) -> Option<InputValue> {
        if self.body.contains_key(key) {
            self.get(Space::Body, key, xss_clean)
        } else {
            self.get(Space::Query, key, xss_clean)
        }
    }

    /// 先查查询参数，再查正文
    pub fn query_or_body(&self, key: &str, xss_clean: bool) -> Option<InputValue> {
        if self.query.contains_key(key) {
            self.get(Space::Query, key, xss_clean)
        } else {
            self.get(Space::Body, key, xss_clean)
        }
    }

    /// 管线内部读取元数据时使用，不经过 XSS 过滤
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(InputValue::as_str)
    }

    pub(crate) fn raw_str(&self, space: Space, key: &str) -> Option<&str> {
        self.space(space).get(key).and_then(InputValue::as_str)
    }

    pub fn user_agent(&self) -> Option<String> {
        self.meta("HTTP_USER_AGENT")
            .and_then(|value| value.as_str().map(str::to_string))
    }

    pub fn method(&self) -> Option<String> {
        self.meta_str("REQUEST_METHOD").map(str::to_uppercase)
    }

    /// 判断请求是否经由加密连接（HTTPS）到达
    pub fn is_https(&self) -> bool {
        let not_off = |key: &str| {
            self.meta_str(key)
                .map_or(false, |value| !value.is_empty() && !value.eq_ignore_ascii_case("off"))
        };
        not_off("HTTPS")
            || self.meta_str("HTTP_X_FORWARDED_PROTO") == Some("https")
            || not_off("HTTP_FRONT_END_HTTPS")
    }
}

/// 校验输入键。
///
/// 致命模式下非法键返回 `InvalidKey`；非致命模式下返回 `Ok(None)`，调用方丢弃该条目。
pub fn clean_key(key: &str, fatal: bool) -> Result<Option<String>, Exception> {
    if !KEY_PATTERN.is_match(key) {
        if fatal {
            return Err(Exception::InvalidKey(key.to_string()));
        }
        warn!("丢弃包含非法字符的输入键：{:?}", key);
        return Ok(None);
    }
    Ok(Some(key.to_string()))
}

/// 清洗单个值：规整字符集并移除不可见字符
pub fn clean_value(value: &[u8], url_encoded: bool) -> String {
    remove_invisible_characters(&clean_string(value), url_encoded)
}

fn clean_map(raw: &RawMap, fatal: bool, url_encoded: bool) -> Result<InputMap, Exception> {
    let mut cleaned = InputMap::new();
    for (key, value) in raw {
        let Some(key) = clean_key(key, fatal)? else {
            continue;
        };
        let value = match value {
            RawInput::Value(bytes) => InputValue::Text(clean_value(bytes, url_encoded)),
            RawInput::Nested(nested) => InputValue::Map(clean_map(nested, fatal, url_encoded)?),
        };
        cleaned.insert(key, value);
    }
    Ok(cleaned)
}
