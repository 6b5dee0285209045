// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 输出缓冲模块
//!
//! `ResponseBuffer` 在请求处理期间累积状态码、头部与正文，
//! 最后由 `display` 一次性序列化为 HTTP 响应报文。
//!
//! 响应的状态流转：`Building -> (Cached | Computing) -> Ready -> Displayed`。
//! `display` 按值消费缓冲区，因此同一个请求不可能输出两次。

use crate::{
    cache::ResponseCache,
    config::WebConfig,
    exception::Exception,
    input::InputSnapshot,
    param::*,
    uri::UriIdentity,
};

use bytes::BytesMut;
use chrono::prelude::*;
use flate2::{write::GzEncoder, Compression};
use log::{debug, error};
use serde_derive::{Deserialize, Serialize};

use std::io::{self, Write};

/// 一条响应头。`replace` 为真时，它会覆盖此前所有同名头部。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub line: String,
    pub replace: bool,
}

#[derive(Debug)]
pub struct ResponseBuffer {
    version: HttpVersion,
    status_code: u16,
    information: String,
    headers: Vec<HeaderEntry>,
    output: BytesMut,
    /// 本次请求是否使用 gzip 压缩
    compress: bool,
    /// 缓存有效期（分钟），0 表示不缓存
    cache_ttl: u64,
    from_cache: bool,
    /// 正文已经是压缩后的缓存内容
    pre_encoded: bool,
    /// HEAD 请求：输出头部与真实的 `Content-Length`，不输出正文
    head_only: bool,
    charset: String,
    server_name: String,
}

impl ResponseBuffer {
    pub fn new(config: &WebConfig, accepts_gzip: bool) -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            headers: Vec::new(),
            output: BytesMut::new(),
            compress: config.compress_output() && accepts_gzip,
            cache_ttl: 0,
            from_cache: false,
            pre_encoded: false,
            head_only: false,
            charset: config.charset().to_string(),
            server_name: config.server_name().to_string(),
        }
    }

    /// 根据快照中的 `HTTP_ACCEPT_ENCODING` 协商压缩，并沿用请求的协议版本与方法
    pub fn for_input(config: &WebConfig, input: &InputSnapshot) -> Self {
        let accepts_gzip = input
            .meta_str("HTTP_ACCEPT_ENCODING")
            .map_or(false, |value| value.to_ascii_lowercase().contains("gzip"));
        let mut output = Self::new(config, accepts_gzip);
        if input.meta_str("SERVER_PROTOCOL") == Some("HTTP/1.0") {
            output.set_version(HttpVersion::V1_0);
        }
        if input.method().as_deref() == Some("HEAD") {
            output.set_head_only(true);
        }
        output
    }

    pub fn set_head_only(&mut self, head_only: bool) -> &mut Self {
        self.head_only = head_only;
        self
    }

    pub fn set_version(&mut self, version: HttpVersion) -> &mut Self {
        self.version = version;
        self
    }

    /// 设置状态码。未提供说明文字时从标准原因短语表中查找。
    pub fn set_status(&mut self, code: u16, text: Option<&str>) -> Result<&mut Self, Exception> {
        let information = match text {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => match STATUS_CODES.get(&code) {
                Some(phrase) => phrase.to_string(),
                None => return Err(Exception::UnknownStatus(code)),
            },
        };
        self.status_code = code;
        self.information = information;
        Ok(self)
    }

    /// 追加一条 `Name: value` 形式的头部。
    ///
    /// 压缩开启时，调用方提供的 `Content-Length` 会被丢弃。
    /// 含有 `\r` 或 `\n` 的头部会被拒绝，防止拆分出额外的头部行。
    pub fn set_header(&mut self, line: &str, replace: bool) -> &mut Self {
        if line.contains(['\r', '\n']) {
            error!("拒绝包含换行符的响应头：{:?}", line);
            return self;
        }
        let Some((name, _)) = line.split_once(':') else {
            error!("忽略格式错误的响应头：{:?}", line);
            return self;
        };
        let name = name.trim();
        if self.compress && name.eq_ignore_ascii_case("Content-Length") {
            debug!("压缩已开启，丢弃调用方设置的Content-Length");
            return self;
        }
        self.headers.push(HeaderEntry {
            name: name.to_string(),
            line: line.trim().to_string(),
            replace,
        });
        self
    }

    /// 设置 `Content-Type`，接受完整 MIME 类型或裸扩展名。
    ///
    /// 文本类类型会带上字符集；显式传入空字符集则不追加。
    pub fn set_content_type(&mut self, mime_or_ext: &str, charset: Option<&str>) -> &mut Self {
        let mime = if mime_or_ext.contains('/') {
            mime_or_ext.to_string()
        } else {
            let ext = mime_or_ext.trim_start_matches('.').to_ascii_lowercase();
            MIME_TYPES.get(ext.as_str()).copied().unwrap_or(DEFAULT_MIME).to_string()
        };
        let charset = charset.unwrap_or(&self.charset).to_string();
        let line = if !charset.is_empty() && is_textual(&mime) && !mime.contains("charset") {
            format!("Content-Type: {}; charset={}", mime, charset)
        } else {
            format!("Content-Type: {}", mime)
        };
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case("Content-Type"));
        self.headers.push(HeaderEntry {
            name: "Content-Type".to_string(),
            line,
            replace: true,
        });
        self
    }

    pub fn set_output(&mut self, body: &[u8]) -> &mut Self {
        self.output.clear();
        self.output.extend_from_slice(body);
        self
    }

    pub fn append_output(&mut self, body: &[u8]) -> &mut Self {
        self.output.extend_from_slice(body);
        self
    }

    /// 为当前响应开启缓存，单位为分钟
    pub fn cache(&mut self, ttl_minutes: u64) -> &mut Self {
        self.cache_ttl = ttl_minutes;
        self
    }

    /// 用缓存条目填充缓冲区
    pub fn replay_cached(&mut self, headers: Vec<HeaderEntry>, body: &[u8], pre_encoded: bool) {
        for header in headers {
            self.set_header(&header.line, header.replace);
        }
        self.set_output(body);
        self.from_cache = true;
        self.pre_encoded = pre_encoded;
    }

    pub fn get_cache(
        &mut self,
        cache: &ResponseCache,
        uri: &UriIdentity,
        input: &InputSnapshot,
        id: u128,
    ) -> bool {
        cache.get(self, uri, input, id)
    }

    pub fn write_cache(
        &self,
        cache: &ResponseCache,
        uri: &UriIdentity,
        input: &InputSnapshot,
        id: u128,
    ) -> bool {
        cache.write(self, uri, input, id)
    }

    /// 序列化并输出响应，消费缓冲区。
    pub fn display(self, id: u128) -> Vec<u8> {
        let mut body = self.output.freeze().to_vec();
        let mut gzip = self.compress;
        if self.compress && !self.pre_encoded {
            match compress(&body) {
                Ok(compressed) => {
                    debug!("[ID{}]gzip压缩：{} bytes -> {} bytes", id, body.len(), compressed.len());
                    body = compressed;
                }
                Err(e) => {
                    error!("[ID{}]压缩正文失败：{}，返回未压缩内容", id, e);
                    gzip = false;
                }
            }
        }

        let mut head = format!(
            "{} {} {}{}",
            self.version, self.status_code, self.information, CRLF
        );
        let effective = effective_headers(&self.headers);
        if !effective
            .iter()
            .any(|header| header.name.eq_ignore_ascii_case("Content-Type"))
        {
            head.push_str(&format!("Content-Type: text/html; charset={}{}", self.charset, CRLF));
        }
        for header in effective {
            head.push_str(&header.line);
            head.push_str(CRLF);
        }
        if gzip {
            head.push_str(&["Content-Encoding: gzip", CRLF, "Vary: Accept-Encoding", CRLF].concat());
        }
        head.push_str(&[
            "Content-Length: ",
            &body.len().to_string(),
            CRLF,
            "Date: ",
            &format_date(&Utc::now()),
            CRLF,
            "Server: ",
            &self.server_name,
            CRLF,
            CRLF,
        ]
        .concat());

        if self.head_only {
            debug!("[ID{}]HEAD请求，省略{}字节正文", id, body.len());
            return head.into_bytes();
        }
        [head.as_bytes(), &body[..]].concat()
    }
}

impl ResponseBuffer {
    pub fn status(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn headers(&self) -> &[HeaderEntry] {
        &self.headers
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn cache_ttl(&self) -> u64 {
        self.cache_ttl
    }

    pub fn compressing(&self) -> bool {
        self.compress
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn is_head_only(&self) -> bool {
        self.head_only
    }
}

/// 计算最终输出的头部：去掉暴露实现的头部与调用方的 `Content-Length`，
/// 并让后出现的 `replace` 头部覆盖此前的同名头部。
fn effective_headers(headers: &[HeaderEntry]) -> Vec<&HeaderEntry> {
    headers
        .iter()
        .enumerate()
        .filter(|(_, header)| {
            !header.name.eq_ignore_ascii_case("X-Powered-By")
                && !header.name.eq_ignore_ascii_case("Content-Length")
        })
        .filter(|(index, header)| {
            !headers[index + 1..]
                .iter()
                .any(|later| later.replace && later.name.eq_ignore_ascii_case(&header.name))
        })
        .map(|(_, header)| header)
        .collect()
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("json")
        || mime.ends_with("javascript")
        || mime.ends_with("xml")
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
