// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由模块
//!
//! 应用逻辑通过 `Router` trait 接入管线。`RouteTable` 是自带的实现：
//! 每条路径持有一张 `HttpRequestMethod -> Handler` 的查找表，每个请求只查找一次。

use crate::{input::InputSnapshot, output::ResponseBuffer, param::HttpRequestMethod, uri::UriIdentity};

use log::debug;

use std::collections::HashMap;

/// 一次路由调用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// 正常处理，携带响应正文
    Ok(String),
    NotFound,
    /// 处理器要求拒绝访问（403）
    Denied,
    /// 处理器主动中止请求
    Halted,
    Failed(String),
}

/// 请求期间交给处理器与钩子的上下文
#[derive(Debug)]
pub struct RequestScope {
    pub input: InputSnapshot,
    pub uri: UriIdentity,
    pub output: ResponseBuffer,
    pub method: HttpRequestMethod,
    /// CSRF 校验失败但尚未裁决
    pub security_exception: bool,
}

impl RequestScope {
    pub fn new(
        input: InputSnapshot,
        uri: UriIdentity,
        output: ResponseBuffer,
        method: HttpRequestMethod,
    ) -> Self {
        Self {
            input,
            uri,
            output,
            method,
            security_exception: false,
        }
    }
}

pub trait Router {
    /// 处理 `path`（不含首尾 `/` 的 URI 字符串，首页为空串）
    fn route(&self, path: &str, scope: &mut RequestScope) -> RouteOutcome;

    /// CSRF 校验失败时询问处理器是否仍然放行。`None` 表示没有定义覆盖，按拒绝处理。
    fn security_override(&self, _path: &str, _scope: &RequestScope) -> Option<bool> {
        None
    }
}

pub type Handler = Box<dyn Fn(&mut RequestScope) -> RouteOutcome + Send + Sync>;

#[derive(Default)]
struct Route {
    handlers: HashMap<HttpRequestMethod, Handler>,
    csrf_override: Option<bool>,
}

#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, path: &str, method: HttpRequestMethod, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestScope) -> RouteOutcome + Send + Sync + 'static,
    {
        self.routes
            .entry(normalize(path))
            .or_default()
            .handlers
            .insert(method, Box::new(handler));
        self
    }

    pub fn get<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestScope) -> RouteOutcome + Send + Sync + 'static,
    {
        self.add(path, HttpRequestMethod::Get, handler)
    }

    pub fn post<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestScope) -> RouteOutcome + Send + Sync + 'static,
    {
        self.add(path, HttpRequestMethod::Post, handler)
    }

    /// 为某条路径设置 CSRF 校验失败时的裁决
    pub fn csrf_override(&mut self, path: &str, allow: bool) -> &mut Self {
        self.routes.entry(normalize(path)).or_default().csrf_override = Some(allow);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Router for RouteTable {
    fn route(&self, path: &str, scope: &mut RequestScope) -> RouteOutcome {
        let Some(route) = self.routes.get(&normalize(path)) else {
            debug!("没有与{:?}匹配的路由", path);
            return RouteOutcome::NotFound;
        };
        // HEAD 请求沿用 GET 处理器
        let handler = route.handlers.get(&scope.method).or_else(|| {
            (scope.method == HttpRequestMethod::Head)
                .then(|| route.handlers.get(&HttpRequestMethod::Get))
                .flatten()
        });
        match handler {
            Some(handler) => handler(scope),
            None => {
                debug!("路由{:?}没有{}方法的处理器", path, scope.method);
                RouteOutcome::NotFound
            }
        }
    }

    fn security_override(&self, path: &str, _scope: &RequestScope) -> Option<bool> {
        self.routes
            .get(&normalize(path))
            .and_then(|route| route.csrf_override)
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}
