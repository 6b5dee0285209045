// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 安全模块
//!
//! - `SecurityGate`：跨站请求伪造（CSRF）令牌的签发、校验与 Cookie 下发。
//! - `xss_clean`：读取输入时使用的 XSS 过滤器。

use crate::{
    config::WebConfig,
    exception::Exception,
    input::{InputMap, InputSnapshot, InputValue, Space},
    output::ResponseBuffer,
    param::HttpRequestMethod,
    uri::UriIdentity,
    utf8::remove_invisible_characters,
};

use chrono::{Duration, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

lazy_static! {
    static ref TOKEN_PATTERN: Regex = Regex::new(r"^[0-9a-f]{32}$").unwrap();
    static ref SCRIPT_BLOCK: Regex =
        Regex::new(r"(?is)<\s*script[^>]*>.*?<\s*/\s*script\s*>").unwrap();
    static ref SCRIPT_TAG: Regex = Regex::new(r"(?i)<\s*/?\s*script[^>]*>").unwrap();
    static ref PSEUDO_PROTOCOL: Regex = Regex::new(r"(?i)(java|vb)\s*script\s*:").unwrap();
    static ref EVENT_HANDLER: Regex = Regex::new(
        r#"(?i)(<[^>]*?)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]*)"#
    )
    .unwrap();
}

/// 单个请求的 CSRF 守卫
pub struct SecurityGate<'a> {
    config: &'a WebConfig,
    token: String,
}

impl<'a> SecurityGate<'a> {
    /// 复用 Cookie 中格式正确的令牌，否则生成新令牌。
    pub fn new(config: &'a WebConfig, input: &InputSnapshot) -> Self {
        let token = match input.raw_str(Space::Cookie, &cookie_name(config)) {
            Some(existing) if TOKEN_PATTERN.is_match(existing) => existing.to_string(),
            _ => generate_token(),
        };
        Self { config, token }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_name(&self) -> &str {
        self.config.csrf_token_name()
    }

    /// 校验提交的令牌。
    ///
    /// 仅对会改变服务端状态的方法生效；排除列表中的 URI 以不区分大小写的
    /// 整串正则匹配跳过。
    pub fn verify(
        &mut self,
        input: &InputSnapshot,
        uri: &UriIdentity,
        id: u128,
    ) -> Result<(), Exception> {
        if !self.config.csrf_protection() {
            return Ok(());
        }
        let method = input
            .method()
            .and_then(|method| HttpRequestMethod::parse(&method))
            .unwrap_or(HttpRequestMethod::Get);
        if method.is_safe() {
            return Ok(());
        }
        let uri_string = uri.uri_string();
        if self.is_excluded(&uri_string, id) {
            debug!("[ID{}]URI {} 位于CSRF排除列表中，跳过校验", id, uri_string);
            return Ok(());
        }

        let submitted = input.raw_str(Space::Body, self.config.csrf_token_name());
        let cookie_name = cookie_name(self.config);
        let cookie = input.raw_str(Space::Cookie, &cookie_name);
        match (submitted, cookie) {
            (Some(submitted), Some(cookie))
                if !submitted.is_empty() && tokens_match(submitted, cookie) =>
            {
                info!("[ID{}]CSRF令牌校验通过", id);
                if self.config.csrf_regenerate() {
                    self.token = generate_token();
                }
                Ok(())
            }
            _ => {
                warn!("[ID{}]CSRF令牌缺失或不匹配", id);
                Err(Exception::CsrfMismatch)
            }
        }
    }

    fn is_excluded(&self, uri_string: &str, id: u128) -> bool {
        self.config.csrf_exclude_uris().iter().any(|pattern| {
            match Regex::new(&format!("(?i)^(?:{})$", pattern)) {
                Ok(re) => re.is_match(uri_string),
                Err(e) => {
                    warn!("[ID{}]CSRF排除规则{}无法编译：{}", id, pattern, e);
                    false
                }
            }
        })
    }

    /// 通过 `Set-Cookie` 下发当前令牌
    pub fn set_cookie(&self, output: &mut ResponseBuffer) {
        let expire = self.config.csrf_expire();
        let expires_at = Utc::now() + Duration::seconds(expire as i64);
        let mut cookie = format!(
            "Set-Cookie: {}={}; Expires={}; Max-Age={}; Path={}",
            cookie_name(self.config),
            self.token,
            expires_at.format("%a, %d %b %Y %H:%M:%S GMT"),
            expire,
            self.config.cookie_path(),
        );
        if !self.config.cookie_domain().is_empty() {
            cookie.push_str(&format!("; Domain={}", self.config.cookie_domain()));
        }
        if self.config.cookie_secure() {
            cookie.push_str("; Secure");
        }
        if self.config.cookie_httponly() {
            cookie.push_str("; HttpOnly");
        }
        output.set_header(&cookie, false);
    }
}

/// 带前缀的 CSRF Cookie 名称
fn cookie_name(config: &WebConfig) -> String {
    format!("{}{}", config.cookie_prefix(), config.csrf_cookie_name())
}

/// 常数时间比较，耗时只取决于长度
fn tokens_match(submitted: &str, cookie: &str) -> bool {
    let (a, b) = (submitted.as_bytes(), cookie.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_token() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// 过滤字符串中的 XSS 载荷。
///
/// 依次移除不可见字符、`<script>` 块、`javascript:`/`vbscript:` 伪协议以及
/// 标签内的 `on*=` 事件处理器，最后转义剩余的尖括号。
pub fn xss_clean(input: &str) -> String {
    let mut text = remove_invisible_characters(input, true);
    text = SCRIPT_BLOCK.replace_all(&text, "[removed]").into_owned();
    text = SCRIPT_TAG.replace_all(&text, "[removed]").into_owned();
    text = PSEUDO_PROTOCOL.replace_all(&text, "[removed]").into_owned();
    loop {
        let next = EVENT_HANDLER.replace_all(&text, "$1").into_owned();
        if next == text {
            break;
        }
        text = next;
    }
    text.replace('<', "&lt;").replace('>', "&gt;")
}

/// 对输入值递归执行 `xss_clean`
pub fn xss_clean_value(value: &InputValue) -> InputValue {
    match value {
        InputValue::Text(text) => InputValue::Text(xss_clean(text)),
        InputValue::Map(map) => InputValue::Map(
            map.iter()
                .map(|(key, value)| (key.clone(), xss_clean_value(value)))
                .collect::<InputMap>(),
        ),
    }
}
