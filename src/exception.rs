// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了请求管线在生命周期中可能产生的各类异常情况。
//!
//! ## 传播规则
//! - **输入与 URI**：`InvalidKey` 与 `IllegalUri` 终止当前阶段，由调度器转为错误响应。
//! - **安全**：`CsrfMismatch` 先被挂起，交给路由处理器决定是否放行。
//! - **缓存**：`CacheWrite` 只记录日志，永远不会到达客户端。
//! - **传输**：请求报文解析错误由传输层直接回复 400。

use std::fmt;

/// 管线处理请求过程中发生的异常类型。
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// 请求头部字节流无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 请求行格式错误或使用了未知的 HTTP 方法。
    UnSupportedRequestMethod,
    /// 客户端使用了不支持的 HTTP 协议版本。
    UnsupportedHttpVersion,
    /// 输入键包含 `[A-Za-z0-9:_/|-]` 之外的字符。
    InvalidKey(String),
    /// URI 段包含不在允许字符集中的字符。
    IllegalUri(String),
    /// 提交的 CSRF 令牌与 Cookie 中的令牌不一致。
    CsrfMismatch,
    /// 状态码不在原因短语表中，且调用方没有提供说明文字。
    UnknownStatus(u16),
    /// 缓存目录或缓存文件无法写入。
    CacheWrite(String),
    /// 静态资源注册失败（重名或目录不存在）。
    ResourceRegistration(String),
}

use Exception::*;

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            InvalidKey(key) => write!(f, "Disallowed key characters in input key '{}'", key),
            IllegalUri(segment) => {
                write!(f, "The submitted URI has illegal characters: '{}'", segment)
            }
            CsrfMismatch => write!(f, "The action you have requested is not allowed (CSRF)"),
            UnknownStatus(code) => write!(f, "No status text available for status code {}", code),
            CacheWrite(reason) => write!(f, "Unable to write output cache: {}", reason),
            ResourceRegistration(reason) => {
                write!(f, "Could not register resources: {}", reason)
            }
        }
    }
}

impl std::error::Error for Exception {}
