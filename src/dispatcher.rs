// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求调度模块
//!
//! 把一个请求从环境数据一路处理到最终的响应字节，严格按以下顺序：
//!
//! 1. 捕获输入；非法输入键直接返回 400。
//! 2. 解析 URI；非法字符进入 404 兜底。
//! 3. HTTPS 重定向（绕过缓存与路由）。
//! 4. 查找响应缓存，命中即输出。
//! 5. 静态资源，命中即输出且不缓存。
//! 6. CSRF 校验，失败时挂起，交由处理器裁决。
//! 7. 路由，失败时进入 404/403/500 兜底链。
//! 8. 写入响应缓存。
//! 9. 关闭钩子，然后恰好一次 `display`。
//!
//! 任何路径都会产生一个完整的响应。

use crate::{
    cache::ResponseCache,
    config::WebConfig,
    hooks::{Checkpoint, HookRegistry},
    input::{AmbientRequest, InputSnapshot},
    output::ResponseBuffer,
    param::HttpRequestMethod,
    resources::StaticResources,
    router::{RequestScope, RouteOutcome, Router},
    security::SecurityGate,
    uri::{UriIdentity, UriResolver},
};

use log::{debug, error, info, warn};

use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
};

const BAD_REQUEST: &str = "ERROR 400. Bad Request.";

/// 兜底链的三个层级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    NotFound,
    Forbidden,
    ServerError,
}

impl Fallback {
    pub fn status(&self) -> u16 {
        match self {
            Fallback::NotFound => 404,
            Fallback::Forbidden => 403,
            Fallback::ServerError => 500,
        }
    }

    /// 错误页面的路由名
    pub fn route(&self) -> &'static str {
        match self {
            Fallback::NotFound => "Error/error404",
            Fallback::Forbidden => "Error/error403",
            Fallback::ServerError => "Error/error500",
        }
    }

    /// 错误页面也无法路由时使用的正文
    pub fn literal(&self) -> &'static str {
        match self {
            Fallback::NotFound => "ERROR 404. Page was not found.",
            Fallback::Forbidden => "ERROR 403. Forbidden.",
            Fallback::ServerError => "ERROR 500. Page could not be loaded.",
        }
    }
}

pub struct Dispatcher<'a> {
    config: &'a WebConfig,
    router: &'a dyn Router,
    resources: &'a StaticResources,
    hooks: &'a HookRegistry,
    cache: ResponseCache,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        config: &'a WebConfig,
        router: &'a dyn Router,
        resources: &'a StaticResources,
        hooks: &'a HookRegistry,
    ) -> Self {
        Self {
            config,
            router,
            resources,
            hooks,
            cache: ResponseCache::new(config),
        }
    }

    /// 处理一个请求并返回完整的响应报文
    pub fn dispatch(&self, ambient: &mut AmbientRequest, id: u128) -> Vec<u8> {
        let input = match InputSnapshot::capture(ambient, self.config, id) {
            Ok(input) => input,
            Err(e) => {
                warn!("[ID{}]输入捕获失败：{}，返回400", id, e);
                return self.bad_request(id);
            }
        };

        let method = input
            .method()
            .and_then(|method| HttpRequestMethod::parse(&method))
            .unwrap_or(HttpRequestMethod::Get);
        let resolver = UriResolver::new(self.config);
        let resolved = resolver.resolve(&input);
        let uri = match &resolved {
            Ok(uri) => uri.clone(),
            Err(_) => UriIdentity::from_base(resolver.base_url(&input)),
        };
        let output = ResponseBuffer::for_input(self.config, &input);
        let mut scope = RequestScope::new(input, uri, output, method);

        if let Err(e) = resolved {
            warn!("[ID{}]{}", id, e);
            self.fallback(Fallback::NotFound, &mut scope, id);
            return self.finish(scope, ambient, id);
        }
        debug!("[ID{}]{} /{}", id, method, scope.uri.uri_string());

        if self.config.redirect_to_https() && !scope.input.is_https() {
            self.redirect_to_https(&mut scope, id);
            return self.finish(scope, ambient, id);
        }

        if self
            .cache
            .get(&mut scope.output, &scope.uri, &scope.input, id)
        {
            return self.finish(scope, ambient, id);
        }

        if let Some((path, contents)) = self.resources.serve(scope.uri.segment_array()) {
            info!("[ID{}]输出静态资源：{}", id, path.display());
            let ext = extension(&path);
            scope.output.set_content_type(&ext, None).set_output(&contents);
            return self.finish(scope, ambient, id);
        }

        let mut gate = SecurityGate::new(self.config, &scope.input);
        if gate.verify(&scope.input, &scope.uri, id).is_err() {
            scope.security_exception = true;
        }
        if self.config.csrf_protection() {
            gate.set_cookie(&mut scope.output);
        }

        self.hooks.run(Checkpoint::BeforeRoute, &mut scope, id);

        let path = scope.uri.uri_string();
        let outcome = if scope.security_exception {
            match self.router.security_override(&path, &scope) {
                Some(true) => {
                    info!("[ID{}]处理器放行了CSRF校验失败的请求", id);
                    self.route(&path, &mut scope, id)
                }
                _ => RouteOutcome::Denied,
            }
        } else {
            self.route(&path, &mut scope, id)
        };

        let fresh = match outcome {
            RouteOutcome::Ok(body) => {
                scope.output.append_output(body.as_bytes());
                true
            }
            RouteOutcome::NotFound => {
                self.fallback(Fallback::NotFound, &mut scope, id);
                false
            }
            RouteOutcome::Denied => {
                self.fallback(Fallback::Forbidden, &mut scope, id);
                false
            }
            RouteOutcome::Halted => {
                warn!("[ID{}]处理器中止了请求", id);
                self.fallback(Fallback::ServerError, &mut scope, id);
                false
            }
            RouteOutcome::Failed(detail) => {
                error!("[ID{}]处理器失败：{}", id, detail);
                self.fallback(Fallback::ServerError, &mut scope, id);
                false
            }
        };

        self.hooks.run(Checkpoint::AfterRoute, &mut scope, id);

        if fresh && scope.output.status() == 200 {
            self.cache.write(&scope.output, &scope.uri, &scope.input, id);
        }

        self.finish(scope, ambient, id)
    }

    /// 调用路由器，处理器 panic 视为失败
    fn route(&self, path: &str, scope: &mut RequestScope, id: u128) -> RouteOutcome {
        let router = self.router;
        match panic::catch_unwind(AssertUnwindSafe(|| router.route(path, scope))) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("[ID{}]处理{:?}时处理器panic", id, path);
                RouteOutcome::Failed(format!("handler for {:?} panicked", path))
            }
        }
    }

    /// 执行一个兜底层级。错误页面路由失败时退回固定文字，不再继续传播。
    fn fallback(&self, tier: Fallback, scope: &mut RequestScope, id: u128) {
        info!("[ID{}]进入{}兜底", id, tier.status());
        if let Err(e) = scope.output.set_status(tier.status(), None) {
            error!("[ID{}]{}", id, e);
        }
        // 错误页面与请求方法无关，统一按 GET 查找
        let method = std::mem::replace(&mut scope.method, HttpRequestMethod::Get);
        let outcome = self.route(tier.route(), scope, id);
        scope.method = method;
        match outcome {
            RouteOutcome::Ok(body) => {
                scope.output.set_output(body.as_bytes());
            }
            other => {
                debug!("[ID{}]错误页面{}不可用（{:?}），使用默认文字", id, tier.route(), other);
                scope.output.set_output(tier.literal().as_bytes());
            }
        }
    }

    fn redirect_to_https(&self, scope: &mut RequestScope, id: u128) {
        let input = &scope.input;
        let host = ["HTTP_HOST", "SERVER_NAME", "SERVER_ADDR"]
            .iter()
            .filter_map(|key| input.meta_str(key))
            .find(|host| is_valid_host(host))
            .unwrap_or("localhost")
            .to_string();
        let request_uri = input
            .meta_str("REQUEST_URI")
            .unwrap_or("/")
            .replace('\r', "%0D")
            .replace('\n', "%0A");
        let location = format!("https://{}{}", host, request_uri);
        info!("[ID{}]重定向到{}", id, location);
        if let Err(e) = scope.output.set_status(301, None) {
            error!("[ID{}]{}", id, e);
        }
        scope.output.set_header(&format!("Location: {}", location), true);
    }

    fn bad_request(&self, id: u128) -> Vec<u8> {
        let mut output = ResponseBuffer::new(self.config, false);
        if let Err(e) = output.set_status(400, None) {
            error!("[ID{}]{}", id, e);
        }
        output.set_output(BAD_REQUEST.as_bytes());
        output.display(id)
    }

    /// 关闭阶段：执行钩子，按需恢复环境数据，然后输出一次。
    fn finish(&self, mut scope: RequestScope, ambient: &mut AmbientRequest, id: u128) -> Vec<u8> {
        self.hooks.run(Checkpoint::Shutdown, &mut scope, id);
        if self.config.empty_ambient_on_capture() && self.config.restore_ambient_on_shutdown() {
            scope.input.restore_ambient(ambient);
        }
        info!(
            "[ID{}]{} {} {}",
            id,
            scope.output.status(),
            scope.output.information(),
            if scope.output.is_from_cache() { "(cache)" } else { "" }
        );
        scope.output.display(id)
    }
}

/// 主机名只允许字母、数字与 `-._:[]`（含端口与 IPv6 字面量）
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-._:[]".contains(&b))
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_string()
}
