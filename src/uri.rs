// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # URI 解析模块
//!
//! 从输入快照的服务器元数据推导出规范化、分段的请求路径。
//! 解析是纯函数：相同的元数据与配置总是得到相同的 `UriIdentity`。

use crate::{config::WebConfig, exception::Exception, input::InputSnapshot, utf8::remove_invisible_characters};

use log::{debug, error, warn};
use regex::Regex;

/// 解析后的请求路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriIdentity {
    raw_path: String,
    segments: Vec<String>,
    base_url: String,
}

impl UriIdentity {
    /// 只有基础 URL、没有任何段的标识，URI 非法时用于兜底。
    pub fn from_base(base_url: String) -> Self {
        Self {
            raw_path: String::new(),
            segments: Vec::new(),
            base_url,
        }
    }

    /// 取第 `n` 段，从 1 开始计数
    pub fn segment(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|index| self.segments.get(index))
            .map(String::as_str)
    }

    pub fn segment_array(&self) -> &[String] {
        &self.segments
    }

    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    /// 各段以 `/` 连接，首页为空串
    pub fn uri_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn site_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }
}

pub struct UriResolver<'a> {
    config: &'a WebConfig,
    permitted: Option<Regex>,
    misconfigured: bool,
}

impl<'a> UriResolver<'a> {
    pub fn new(config: &'a WebConfig) -> Self {
        let chars = config.permitted_uri_chars();
        let (permitted, misconfigured) = if chars.is_empty() {
            (None, false)
        } else {
            match Regex::new(&format!("(?i)^[{}]+$", chars)) {
                Ok(re) => (Some(re), false),
                Err(e) => {
                    error!("permitted_uri_chars无法编译为字符类：{}，所有非空URI段都将被拒绝", e);
                    (None, true)
                }
            }
        };
        Self {
            config,
            permitted,
            misconfigured,
        }
    }

    pub fn resolve(&self, input: &InputSnapshot) -> Result<UriIdentity, Exception> {
        let base_url = self.base_url(input);
        let path = self.parse_path(input);
        let segments = self.assign_segments(&path)?;
        debug!("URI解析完成：{:?} -> {:?}", path, segments);
        Ok(UriIdentity {
            raw_path: path.trim_matches('/').to_string(),
            segments,
            base_url,
        })
    }

    /// 推导站点基础 URL，总以 `/` 结尾。
    pub fn base_url(&self, input: &InputSnapshot) -> String {
        let configured = self.config.base_url();
        if !configured.is_empty() {
            return if configured.ends_with('/') {
                configured.to_string()
            } else {
                format!("{}/", configured)
            };
        }
        let Some(addr) = input.meta_str("SERVER_ADDR").filter(|addr| !addr.is_empty()) else {
            return "http://localhost/".to_string();
        };
        let host = if addr.contains(':') && !addr.starts_with('[') {
            format!("[{}]", addr)
        } else {
            addr.to_string()
        };
        let script = input.meta_str("SCRIPT_NAME").unwrap_or("");
        let dir = match script.rfind('/') {
            Some(pos) => &script[..=pos],
            None => "/",
        };
        let scheme = if input.is_https() { "https" } else { "http" };
        if dir.starts_with('/') {
            format!("{}://{}{}", scheme, host, dir)
        } else {
            format!("{}://{}/{}", scheme, host, dir)
        }
    }

    /// 从 `REQUEST_URI` 中取出相对于入口脚本的路径。
    pub fn parse_path(&self, input: &InputSnapshot) -> String {
        let (Some(request_uri), Some(script)) =
            (input.meta_str("REQUEST_URI"), input.meta_str("SCRIPT_NAME"))
        else {
            return String::new();
        };

        let mut path = request_uri;
        if let Some(pos) = path.find(['?', '#']) {
            path = &path[..pos];
        }

        if !script.is_empty() {
            if let Some(rest) = path.strip_prefix(script) {
                path = rest;
            } else if let Some(rest) = path.strip_prefix(dirname(script)) {
                path = rest;
            }
        }

        if path.is_empty() || path == "/" {
            return "/".to_string();
        }
        remove_relative_directory(path)
    }

    /// 校验并切分路径
    pub fn assign_segments(&self, path: &str) -> Result<Vec<String>, Exception> {
        let cleaned = remove_invisible_characters(path, false);
        let mut segments = Vec::new();
        for segment in cleaned.trim_matches('/').split('/') {
            let segment = segment.trim();
            if segment.is_empty() || segment == ".." {
                continue;
            }
            self.filter_segment(segment)?;
            segments.push(segment.to_string());
        }
        Ok(segments)
    }

    fn filter_segment(&self, segment: &str) -> Result<(), Exception> {
        let allowed = match &self.permitted {
            Some(re) => re.is_match(segment),
            None => !self.misconfigured,
        };
        if allowed {
            Ok(())
        } else {
            warn!("URI段包含不允许的字符：{:?}", segment);
            Err(Exception::IllegalUri(segment.to_string()))
        }
    }
}

/// 与 POSIX `dirname` 一致：`/index.php` -> `/`，`/app/index.php` -> `/app`，`index.php` -> `.`
fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "." } else { "/" };
    }
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(pos) => trimmed[..pos].trim_end_matches('/'),
        None => ".",
    }
}

fn remove_relative_directory(path: &str) -> String {
    path.split('/')
        .filter(|token| !token.is_empty() && *token != "..")
        .collect::<Vec<_>>()
        .join("/")
}
