// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求管线端到端测试
//!
//! 路由器由 mockall 生成，缓存目录使用 tempfile 创建的临时目录，
//! 每个用例都构建独立的配置，互不干扰。

use chrono::Utc;
use mockall::mock;
use tempfile::TempDir;

use webpipe::{
    AmbientRequest, CacheEnvelope, Dispatcher, HookRegistry, InputSnapshot, RequestScope,
    ResponseBuffer, ResponseCache, RouteOutcome, Router, StaticResources, UriResolver, WebConfig,
};

use std::{fs, io::Read};

mock! {
    pub AppRouter {}

    impl Router for AppRouter {
        fn route(&self, path: &str, scope: &mut RequestScope) -> RouteOutcome;
        fn security_override(&self, path: &str, scope: &RequestScope) -> Option<bool>;
    }
}

const TOKEN_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const TOKEN_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// 返回配置与持有缓存目录的 `TempDir`（离开作用域即删除）
fn config_with(extra: &str) -> (WebConfig, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let text = format!(
        "cache_path = {:?}\n{}",
        dir.path().join("output").display().to_string(),
        extra
    );
    (WebConfig::from_toml_str(&text), dir)
}

fn get(uri: &str) -> AmbientRequest {
    AmbientRequest::new()
        .with_meta("REQUEST_METHOD", "GET")
        .with_meta("REQUEST_URI", uri)
        .with_meta("SCRIPT_NAME", "")
}

fn run(router: &dyn Router, config: &WebConfig, ambient: AmbientRequest) -> Vec<u8> {
    let resources = StaticResources::new();
    let hooks = HookRegistry::new();
    let mut ambient = ambient;
    Dispatcher::new(config, router, &resources, &hooks).dispatch(&mut ambient, 0)
}

/// 把响应拆成（状态码, 头部行, 正文字节）
fn parse(bytes: &[u8]) -> (u16, Vec<String>, Vec<u8>) {
    let split = bytes
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response has a head");
    let head = String::from_utf8_lossy(&bytes[..split]).to_string();
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    (status, lines.map(str::to_string).collect(), bytes[split + 4..].to_vec())
}

fn header<'a>(headers: &'a [String], name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter_map(|line| line.split_once(": "))
        .filter(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
        .collect()
}

#[test]
fn home_page_is_routed() {
    let (config, _dir) = config_with("");
    let mut router = MockAppRouter::new();
    router
        .expect_route()
        .withf(|path, _| path.is_empty())
        .times(1)
        .returning(|_, _| RouteOutcome::Ok("Home".to_string()));
    router.expect_security_override().never();

    let (status, _, body) = parse(&run(&router, &config, get("/")));
    assert_eq!(status, 200);
    assert_eq!(body, b"Home");
}

#[test]
fn missing_page_degrades_to_literal() {
    let (config, _dir) = config_with("");
    let mut router = MockAppRouter::new();
    router
        .expect_route()
        .withf(|path, _| path.eq_ignore_ascii_case("missing"))
        .times(1)
        .returning(|_, _| RouteOutcome::NotFound);
    router
        .expect_route()
        .withf(|path, _| path.eq_ignore_ascii_case("Error/error404"))
        .times(1)
        .returning(|_, _| RouteOutcome::Failed("no error view".to_string()));

    let (status, _, body) = parse(&run(&router, &config, get("/missing")));
    assert_eq!(status, 404);
    assert_eq!(body, b"ERROR 404. Page was not found.");
}

#[test]
fn error_view_replaces_literal() {
    let (config, _dir) = config_with("");
    let mut router = MockAppRouter::new();
    router
        .expect_route()
        .withf(|path, _| path.eq_ignore_ascii_case("broken"))
        .returning(|_, _| RouteOutcome::Halted);
    router
        .expect_route()
        .withf(|path, _| path.eq_ignore_ascii_case("Error/error500"))
        .returning(|_, _| RouteOutcome::Ok("Sorry".to_string()));

    let (status, _, body) = parse(&run(&router, &config, get("/broken")));
    assert_eq!(status, 500);
    assert_eq!(body, b"Sorry");
}

#[test]
fn cached_page_skips_router() {
    let (config, _dir) = config_with(r#"base_url = "http://x/""#);
    let cache = ResponseCache::new(&config);
    let identifier = ResponseCache::identifier_for("http://x/", "about", "");
    let envelope = CacheEnvelope {
        expire_at: Utc::now().timestamp() + 3600,
        headers: Vec::new(),
    };
    cache.store(&identifier, false, &envelope, b"Cached body").unwrap();

    let mut router = MockAppRouter::new();
    router.expect_route().never();

    let (status, _, body) = parse(&run(&router, &config, get("/about")));
    assert_eq!(status, 200);
    assert_eq!(body, b"Cached body");
}

#[test]
fn csrf_mismatch_without_override_is_forbidden() {
    let (config, _dir) = config_with("csrf_protection = true");
    let mut router = MockAppRouter::new();
    router
        .expect_security_override()
        .times(1)
        .returning(|_, _| None);
    router
        .expect_route()
        .withf(|path, _| path.eq_ignore_ascii_case("Error/error403"))
        .times(1)
        .returning(|_, _| RouteOutcome::NotFound);
    router
        .expect_route()
        .withf(|path, _| path.eq_ignore_ascii_case("form"))
        .never();

    let ambient = get("/form")
        .with_meta("REQUEST_METHOD", "POST")
        .with_body("csrf_token", TOKEN_A)
        .with_cookie("csrf_cookie", TOKEN_B);
    let (status, headers, body) = parse(&run(&router, &config, ambient));
    assert_eq!(status, 403);
    assert_eq!(body, b"ERROR 403. Forbidden.");
    // 令牌 Cookie 仍然下发
    assert_eq!(header(&headers, "Set-Cookie").len(), 1);
}

#[test]
fn csrf_override_lets_handler_decide() {
    let (config, _dir) = config_with("csrf_protection = true");
    let mut router = MockAppRouter::new();
    router
        .expect_security_override()
        .returning(|_, _| Some(true));
    router
        .expect_route()
        .withf(|path, scope| path.eq_ignore_ascii_case("form") && scope.security_exception)
        .times(1)
        .returning(|_, _| RouteOutcome::Ok("Accepted".to_string()));

    let ambient = get("/form")
        .with_meta("REQUEST_METHOD", "POST")
        .with_body("csrf_token", TOKEN_A);
    let (status, _, body) = parse(&run(&router, &config, ambient));
    assert_eq!(status, 200);
    assert_eq!(body, b"Accepted");
}

#[test]
fn csrf_match_passes() {
    let (config, _dir) = config_with("csrf_protection = true");
    let mut router = MockAppRouter::new();
    router.expect_security_override().never();
    router
        .expect_route()
        .times(1)
        .returning(|_, _| RouteOutcome::Ok("Saved".to_string()));

    let ambient = get("/form")
        .with_meta("REQUEST_METHOD", "POST")
        .with_body("csrf_token", TOKEN_A)
        .with_cookie("csrf_cookie", TOKEN_A);
    let (status, _, body) = parse(&run(&router, &config, ambient));
    assert_eq!(status, 200);
    assert_eq!(body, b"Saved");
}

#[test]
fn handler_content_length_dropped_under_compression() {
    let (config, _dir) = config_with("compress_output = true");
    let mut router = MockAppRouter::new();
    router.expect_route().returning(|_, scope| {
        scope.output.set_header("Content-Length: 3", true);
        RouteOutcome::Ok("a body that is longer than three bytes".to_string())
    });

    let ambient = get("/").with_meta("HTTP_ACCEPT_ENCODING", "gzip, deflate");
    let (status, headers, body) = parse(&run(&router, &config, ambient));
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Encoding"), vec!["gzip"]);
    let lengths = header(&headers, "Content-Length");
    assert_eq!(lengths, vec![body.len().to_string().as_str()]);

    let mut decoded = String::new();
    flate2::read::GzDecoder::new(&body[..])
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, "a body that is longer than three bytes");
}

#[test]
fn fresh_response_round_trips_through_cache() {
    let (config, _dir) = config_with("");
    let mut first = MockAppRouter::new();
    first.expect_route().times(1).returning(|_, scope| {
        scope.output.cache(5);
        scope.output.set_header("X-Custom: 1", true);
        RouteOutcome::Ok("Fresh".to_string())
    });
    let (_, first_headers, first_body) = parse(&run(&first, &config, get("/news?page=2")));

    let mut second = MockAppRouter::new();
    second.expect_route().never();
    let (status, headers, body) = parse(&run(&second, &config, get("/news?page=2")));

    assert_eq!(status, 200);
    assert_eq!(body, first_body);
    assert_eq!(header(&headers, "X-Custom"), header(&first_headers, "X-Custom"));
}

#[test]
fn compressed_responses_use_gzip_entry() {
    let (config, dir) = config_with("compress_output = true");
    let mut router = MockAppRouter::new();
    router.expect_route().times(1).returning(|_, scope| {
        scope.output.cache(5);
        RouteOutcome::Ok("zipped".to_string())
    });
    let ambient = get("/z").with_meta("HTTP_ACCEPT_ENCODING", "gzip");
    let fresh = run(&router, &config, ambient.clone());

    let entries: Vec<String> = fs::read_dir(dir.path().join("output"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].ends_with("_gzip"));

    // 命中缓存时正文已是压缩后的字节，不会再次压缩
    let mut never = MockAppRouter::new();
    never.expect_route().never();
    let (_, headers, body) = parse(&run(&never, &config, ambient));
    assert_eq!(header(&headers, "Content-Encoding"), vec!["gzip"]);
    assert_eq!(body, parse(&fresh).2);
}

#[test]
fn non_cacheable_responses_are_not_written() {
    let (config, dir) = config_with("");
    let mut router = MockAppRouter::new();
    router
        .expect_route()
        .returning(|_, _| RouteOutcome::Ok("no ttl".to_string()));
    run(&router, &config, get("/plain"));
    assert!(!dir.path().join("output").exists());
}

#[test]
fn expired_entry_is_removed_once() {
    let (config, _dir) = config_with(r#"base_url = "http://x/""#);
    let cache = ResponseCache::new(&config);
    let envelope = CacheEnvelope {
        expire_at: Utc::now().timestamp() - 60,
        headers: Vec::new(),
    };
    let identifier = ResponseCache::identifier_for("http://x/", "old", "");
    let path = cache.store(&identifier, false, &envelope, b"stale").unwrap();

    let mut ambient = get("/old");
    let input = InputSnapshot::capture(&mut ambient, &config, 0).unwrap();
    let uri = UriResolver::new(&config).resolve(&input).unwrap();

    let mut output = ResponseBuffer::new(&config, false);
    assert!(!cache.get(&mut output, &uri, &input, 0));
    assert!(!path.exists());
    assert!(!cache.get(&mut output, &uri, &input, 0));
    assert!(output.output().is_empty());
}

#[test]
fn corrupt_entry_is_a_miss() {
    let (config, _dir) = config_with(r#"base_url = "http://x/""#);
    let cache = ResponseCache::new(&config);
    let identifier = ResponseCache::identifier_for("http://x/", "bad", "");
    let path = cache
        .store(
            &identifier,
            false,
            &CacheEnvelope {
                expire_at: 0,
                headers: Vec::new(),
            },
            b"",
        )
        .unwrap();
    fs::write(&path, b"garbage without delimiter").unwrap();

    let mut router = MockAppRouter::new();
    router
        .expect_route()
        .times(1)
        .returning(|_, _| RouteOutcome::Ok("recomputed".to_string()));
    let (_, _, body) = parse(&run(&router, &config, get("/bad")));
    assert_eq!(body, b"recomputed");
}

#[test]
fn static_resource_is_served_without_routing() {
    let (config, dir) = config_with("");
    let assets = dir.path().join("assets");
    fs::create_dir_all(assets.join("css")).unwrap();
    fs::write(assets.join("css/site.css"), "body{}").unwrap();

    let mut resources = StaticResources::new();
    resources.register("static", &assets).unwrap();
    let hooks = HookRegistry::new();
    let mut router = MockAppRouter::new();
    router.expect_route().never();

    let mut ambient = get("/static/css/site.css");
    let bytes = Dispatcher::new(&config, &router, &resources, &hooks).dispatch(&mut ambient, 0);
    let (status, headers, body) = parse(&bytes);
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Type"), vec!["text/css; charset=UTF-8"]);
    assert_eq!(body, b"body{}");
}
