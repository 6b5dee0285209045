// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 配置模块
//!
//! 管线只通过只读 getter 访问配置。所有键都带有默认值，
//! 因此一个空的 TOML 文件也能得到完整可用的配置。

use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebConfig {
    // 传输层
    www_root: String,
    port: u16,
    worker_threads: usize,
    local: bool,
    server_name: String,
    resources: BTreeMap<String, String>,

    // 输入
    allow_query_input: bool,
    empty_ambient_on_capture: bool,
    restore_ambient_on_shutdown: bool,
    charset: String,

    // URI
    base_url: String,
    permitted_uri_chars: String,
    redirect_to_https: bool,

    // 输出与缓存
    compress_output: bool,
    cache_output: bool,
    cache_path: String,

    // 安全
    xss_clean: bool,
    csrf_protection: bool,
    csrf_token_name: String,
    csrf_cookie_name: String,
    csrf_expire: u64,
    csrf_regenerate: bool,
    csrf_exclude_uris: Vec<String>,
    cookie_prefix: String,
    cookie_domain: String,
    cookie_path: String,
    cookie_secure: bool,
    cookie_httponly: bool,
}

impl WebConfig {
    pub fn new() -> Self {
        Self {
            www_root: ".".to_string(),
            port: 7878,
            worker_threads: 0,
            local: true,
            server_name: "webpipe".to_string(),
            resources: BTreeMap::new(),
            allow_query_input: true,
            empty_ambient_on_capture: true,
            restore_ambient_on_shutdown: true,
            charset: "UTF-8".to_string(),
            base_url: String::new(),
            permitted_uri_chars: r"a-z 0-9~%.:_\-".to_string(),
            redirect_to_https: false,
            compress_output: false,
            cache_output: true,
            cache_path: "cache/output".to_string(),
            xss_clean: true,
            csrf_protection: false,
            csrf_token_name: "csrf_token".to_string(),
            csrf_cookie_name: "csrf_cookie".to_string(),
            csrf_expire: 7200,
            csrf_regenerate: true,
            csrf_exclude_uris: Vec::new(),
            cookie_prefix: String::new(),
            cookie_domain: String::new(),
            cookie_path: "/".to_string(),
            cookie_secure: false,
            cookie_httponly: false,
        }
    }

    /// 从 TOML 文件载入配置，文件缺失或格式错误时退回默认配置。
    pub fn from_toml(filename: &str) -> Self {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => {
                error!("无法打开配置文件{}：{}，使用默认配置", filename, e);
                return Self::new().normalized();
            }
        };
        let mut str_val = String::new();
        if let Err(e) = file.read_to_string(&mut str_val) {
            error!("读取配置文件{}失败：{}，使用默认配置", filename, e);
            return Self::new().normalized();
        }
        Self::from_toml_str(&str_val)
    }

    /// 从 TOML 文本构建配置。
    pub fn from_toml_str(text: &str) -> Self {
        let raw_config: WebConfig = match toml::from_str(text) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象：{}，使用默认配置", e);
                Self::new()
            }
        };
        raw_config.normalized()
    }

    fn normalized(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = num_cpus::get();
        }
        if !self.charset.eq_ignore_ascii_case("UTF-8") {
            warn!("charset被设置为{}，但目前仅支持UTF-8，该值将被改为UTF-8。", self.charset);
            self.charset = "UTF-8".to_string();
        }
        self
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self::new().normalized()
    }
}

impl WebConfig {
    pub fn www_root(&self) -> &str {
        &self.www_root
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// 静态资源名到目录的映射
    pub fn resources(&self) -> &BTreeMap<String, String> {
        &self.resources
    }

    pub fn allow_query_input(&self) -> bool {
        self.allow_query_input
    }

    pub fn empty_ambient_on_capture(&self) -> bool {
        self.empty_ambient_on_capture
    }

    pub fn restore_ambient_on_shutdown(&self) -> bool {
        self.restore_ambient_on_shutdown
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn permitted_uri_chars(&self) -> &str {
        &self.permitted_uri_chars
    }

    pub fn redirect_to_https(&self) -> bool {
        self.redirect_to_https
    }

    pub fn compress_output(&self) -> bool {
        self.compress_output
    }

    pub fn cache_output(&self) -> bool {
        self.cache_output
    }

    pub fn cache_path(&self) -> &str {
        &self.cache_path
    }

    pub fn xss_clean(&self) -> bool {
        self.xss_clean
    }

    pub fn csrf_protection(&self) -> bool {
        self.csrf_protection
    }

    pub fn csrf_token_name(&self) -> &str {
        &self.csrf_token_name
    }

    pub fn csrf_cookie_name(&self) -> &str {
        &self.csrf_cookie_name
    }

    pub fn csrf_expire(&self) -> u64 {
        self.csrf_expire
    }

    pub fn csrf_regenerate(&self) -> bool {
        self.csrf_regenerate
    }

    pub fn csrf_exclude_uris(&self) -> &[String] {
        &self.csrf_exclude_uris
    }

    /// 所有 Cookie 名称的前缀，CSRF Cookie 的实际名称为 `cookie_prefix + csrf_cookie_name`
    pub fn cookie_prefix(&self) -> &str {
        &self.cookie_prefix
    }

    /// 为空时不下发 `Domain` 属性
    pub fn cookie_domain(&self) -> &str {
        &self.cookie_domain
    }

    pub fn cookie_path(&self) -> &str {
        &self.cookie_path
    }

    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    pub fn cookie_httponly(&self) -> bool {
        self.cookie_httponly
    }
}
