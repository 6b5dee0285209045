// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求报文解析模块
//!
//! 传输层使用的解析器：把 TCP 流中读取的原始字节解析为 `Request`，
//! 再转换为管线需要的 `AmbientRequest`：
//! 1. 请求行（方法、目标、版本）。
//! 2. 头部，按 CGI 习惯映射为 `HTTP_*` 元数据。
//! 3. 查询字符串与 `application/x-www-form-urlencoded` 正文，支持 `a[b][]=` 嵌套写法。
//! 4. `Cookie` 头部。

use crate::{
    exception::Exception,
    input::{AmbientRequest, RawInput, RawMap},
    param::*,
    utf8::{clean_string, url_decode},
};
use log::{debug, error};

use std::net::SocketAddr;

const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone)]
pub struct Request {
    method: HttpRequestMethod,
    /// 请求目标，包含查询字符串
    target: String,
    version: HttpVersion,
    /// 按出现顺序保存的头部，名称保持原样
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    /// 从原始字节缓冲区构建 `Request`。
    ///
    /// 头部必须是合法的 UTF-8；正文按字节原样保留。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let (head, body) = match find(buffer, HEAD_END) {
            Some(pos) => (&buffer[..pos], &buffer[pos + HEAD_END.len()..]),
            None => (buffer, &buffer[buffer.len()..]),
        };
        let head = match std::str::from_utf8(head) {
            Ok(head) => head,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut lines = head.split(CRLF);
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').collect();
        if parts.len() < 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::UnSupportedRequestMethod);
        }

        let method = match HttpRequestMethod::parse(parts[0]) {
            Some(method) => method,
            None => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, parts[0]);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version_str = parts[parts.len() - 1].to_uppercase();
        let version = match version_str.as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            _ => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, &version_str);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 路径中夹带空格虽不规范，仍尝试拼接恢复
        let target = parts[1..parts.len() - 1].join(" ");

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        debug!("[ID{}]请求行解析完成：{} {} {}", id, method, target, version);
        Ok(Self {
            method,
            target,
            version,
            headers,
            body: body.to_vec(),
        })
    }

    /// 头部读完后，返回整个请求应有的字节数（头部 + 正文）。
    ///
    /// 超出 `usize` 的 `Content-Length` 饱和为 `usize::MAX`，由调用方按超限处理。
    pub fn expected_length(buffer: &[u8]) -> Option<usize> {
        let pos = find(buffer, HEAD_END)?;
        let head = String::from_utf8_lossy(&buffer[..pos]);
        let content_length = head
            .split(CRLF)
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| parse_content_length(value.trim()))
            .unwrap_or(0);
        Some((pos + HEAD_END.len()).saturating_add(content_length))
    }

    /// 转换为管线的环境请求数据
    pub fn into_ambient(self, local: SocketAddr, remote: SocketAddr) -> AmbientRequest {
        let (path, query_string) = match self.target.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (self.target.clone(), String::new()),
        };
        let query_string = query_string
            .split_once('#')
            .map_or(query_string.clone(), |(query, _)| query.to_string());
        debug!("请求路径：{}，查询字符串：{}", path, query_string);

        let mut ambient = AmbientRequest::new()
            .with_meta("REQUEST_METHOD", self.method.to_string())
            .with_meta("REQUEST_URI", self.target.clone())
            .with_meta("QUERY_STRING", query_string.clone())
            .with_meta("SCRIPT_NAME", "")
            .with_meta("SERVER_PROTOCOL", self.version.to_string())
            .with_meta("SERVER_ADDR", local.ip().to_string())
            .with_meta("SERVER_PORT", local.port().to_string())
            .with_meta("REMOTE_ADDR", remote.ip().to_string())
            .with_meta("REMOTE_PORT", remote.port().to_string());

        for (name, value) in &self.headers {
            let key = name.to_uppercase().replace('-', "_");
            let key = match key.as_str() {
                "CONTENT_TYPE" | "CONTENT_LENGTH" => key,
                _ => format!("HTTP_{}", key),
            };
            ambient.meta.insert(key, RawInput::from(value.as_str()));
        }

        ambient.query = parse_query(&query_string);
        if let Some(cookie) = self.header("Cookie") {
            ambient.cookies = parse_cookies(cookie);
        }
        let is_form = self.header("Content-Type").map_or(false, |value| {
            value
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        });
        if is_form {
            ambient.body = parse_query(&String::from_utf8_lossy(&self.body));
        }
        ambient
    }
}

impl Request {
    pub fn version(&self) -> &HttpVersion {
        &self.version
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 按名称（不区分大小写）查找第一个头部
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.header("User-Agent").unwrap_or_default()
    }
}

/// 解析 `a=1&b[]=2&c[x][y]=3` 形式的编码串
pub fn parse_query(query: &str) -> RawMap {
    let mut map = RawMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = clean_string(&url_decode(key, true));
        if key.is_empty() {
            continue;
        }
        insert_nested(&mut map, &key, url_decode(value, true));
    }
    map
}

fn insert_nested(map: &mut RawMap, key: &str, value: Vec<u8>) {
    let (base, rest) = match key.find('[') {
        Some(pos) if pos > 0 && key.ends_with(']') => (&key[..pos], &key[pos..]),
        _ => {
            map.insert(key.to_string(), RawInput::Value(value));
            return;
        }
    };

    let mut current = map;
    let mut name = base.to_string();
    for sub in rest[1..rest.len() - 1].split("][") {
        let entry = current
            .entry(name)
            .or_insert_with(|| RawInput::Nested(RawMap::new()));
        if let RawInput::Value(_) = entry {
            *entry = RawInput::Nested(RawMap::new());
        }
        let nested = match entry {
            RawInput::Nested(nested) => nested,
            RawInput::Value(_) => return,
        };
        name = if sub.is_empty() {
            nested.len().to_string()
        } else {
            sub.to_string()
        };
        current = nested;
    }
    current.insert(name, RawInput::Value(value));
}

/// 解析 `Cookie: a=1; b=2`
pub fn parse_cookies(header: &str) -> RawMap {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(name, value)| {
            let value = value.trim().trim_matches('"');
            (name.trim().to_string(), RawInput::Value(url_decode(value, false)))
        })
        .collect()
}

/// 非数字的值视为 0；数字过大无法表示时视为 `usize::MAX`
fn parse_content_length(value: &str) -> usize {
    match value.parse::<usize>() {
        Ok(length) => length,
        Err(_) if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => usize::MAX,
        Err(_) => 0,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
