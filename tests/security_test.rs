// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

#[cfg(test)]
mod security_tests {
    //! # 安全回归测试套件
    //!
    //! 以原始报文模拟常见的攻击向量，整条管线在进程内执行。
    //! 覆盖范围包括：
    //! - 路径遍历（含编码混淆与符号链接逃逸）
    //! - 注入攻击（空字节、CRLF、脚本）
    //! - 协议健壮性
    //! - 非法输入键与 CSRF

    use webpipe::{
        Dispatcher, Exception, HookRegistry, Request, RouteOutcome, RouteTable, StaticResources,
        WebConfig,
    };

    use std::fs;
    use tempfile::TempDir;

    fn routes() -> RouteTable {
        let mut routes = RouteTable::new();
        routes
            .get("hello", |scope| {
                let name = scope
                    .input
                    .query("name")
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_else(|| "world".to_string());
                RouteOutcome::Ok(format!("Hello, {}!", name))
            })
            .post("account/delete", |_| RouteOutcome::Ok("deleted".to_string()));
        routes
    }

    /// 发送原始报文，返回状态码与完整响应文本
    fn send_with(raw: &str, config: &WebConfig, resources: &StaticResources) -> (u16, String) {
        let request = Request::try_from(raw.as_bytes(), 0).unwrap();
        let mut ambient = request.into_ambient(
            "127.0.0.1:7878".parse().unwrap(),
            "10.0.0.1:40000".parse().unwrap(),
        );
        let routes = routes();
        let hooks = HookRegistry::new();
        let bytes = Dispatcher::new(config, &routes, resources, &hooks).dispatch(&mut ambient, 0);
        let response = String::from_utf8_lossy(&bytes).to_string();
        (extract_status_code(&response), response)
    }

    fn send(raw: &str) -> (u16, String) {
        send_with(
            raw,
            &WebConfig::from_toml_str("cache_output = false"),
            &StaticResources::new(),
        )
    }

    /// 从原始响应字符串中提取 HTTP 状态码
    fn extract_status_code(response: &str) -> u16 {
        response
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    fn head_of(response: &str) -> &str {
        response.split_once("\r\n\r\n").map_or(response, |(head, _)| head)
    }

    /// 公开目录 `public/ok.txt`，目录外放一份 `secret.txt`
    fn resource_tree() -> (TempDir, StaticResources) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("public")).unwrap();
        fs::write(dir.path().join("public/ok.txt"), "public data").unwrap();
        fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
        let mut resources = StaticResources::new();
        resources.register("static", &dir.path().join("public")).unwrap();
        (dir, resources)
    }

    /// ## 攻击向量：基础路径遍历
    #[test]
    fn test_path_traversal_simple() {
        let attacks = [
            "GET /../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /hello/../../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ];
        for attack in attacks {
            let (status, response) = send(attack);
            assert_eq!(status, 404, "路径遍历攻击应该被阻止: {}", attack);
            assert!(!response.contains("root:"));
        }
    }

    /// ## 攻击向量：静态资源目录逃逸
    #[test]
    fn test_static_resource_traversal() {
        let (_dir, resources) = resource_tree();
        let config = WebConfig::from_toml_str("cache_output = false");

        let (status, response) = send_with(
            "GET /static/ok.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            &config,
            &resources,
        );
        assert_eq!(status, 200);
        assert!(response.ends_with("public data"));

        let attacks = [
            "GET /static/../secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /static/%2e%2e/secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /static/..%2fsecret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ];
        for attack in attacks {
            let (status, response) = send_with(attack, &config, &resources);
            assert_eq!(status, 404, "资源目录逃逸应该被阻止: {}", attack);
            assert!(!response.contains("top secret"));
        }
    }

    /// ## 攻击向量：符号链接指向资源目录之外
    #[cfg(unix)]
    #[test]
    fn test_static_resource_symlink_escape() {
        let (dir, resources) = resource_tree();
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), dir.path().join("public/link.txt"))
            .unwrap();
        let (status, response) = send_with(
            "GET /static/link.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            &WebConfig::from_toml_str("cache_output = false"),
            &resources,
        );
        assert_eq!(status, 404);
        assert!(!response.contains("top secret"));
    }

    /// ## 攻击向量：空字节注入
    #[test]
    fn test_null_byte_injection() {
        let (status, response) = send("GET /secret\0.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status, 404);
        assert!(!response.contains('\0'));

        // 空字节被剥离后路径与正常路径一致
        let (status, response) = send("GET /hello\0 HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status, 200);
        assert!(response.ends_with("Hello, world!"));
    }

    /// ## 攻击向量：URI 中的特殊字符
    #[test]
    fn test_special_characters_in_path() {
        let attacks = [
            "GET /hello;rm HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /<script> HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /hello|id HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /a'b HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ];
        for attack in attacks {
            let (status, response) = send(attack);
            assert_eq!(status, 404, "非法URI字符应该被拒绝: {}", attack);
            assert!(response.ends_with("ERROR 404. Page was not found."));
        }
    }

    /// ## 攻击向量：反射型 XSS
    #[test]
    fn test_script_injection_in_query() {
        let (status, response) = send(
            "GET /hello?name=<script>alert(1)</script> HTTP/1.1\r\nHost: localhost\r\n\r\n",
        );
        assert_eq!(status, 200);
        assert!(!response.contains("<script"));
        assert!(response.ends_with("Hello, [removed]!"));

        let (_, response) = send(
            "GET /hello?name=%3Cimg%20src%3Dx%20onerror%3Dalert(1)%3E HTTP/1.1\r\nHost: localhost\r\n\r\n",
        );
        assert!(!response.contains("onerror"));
        assert!(!response.contains("<img"));
    }

    /// ## 攻击向量：通过查询参数进行 CRLF 头部注入
    #[test]
    fn test_crlf_injection() {
        let (status, response) = send(
            "GET /hello?name=a%0d%0aSet-Cookie:%20admin=1 HTTP/1.1\r\nHost: localhost\r\n\r\n",
        );
        assert_eq!(status, 200);
        assert!(!head_of(&response).contains("Set-Cookie"));
    }

    /// ## 攻击向量：通过 Host 头部注入重定向响应头
    #[test]
    fn test_host_header_injection_in_redirect() {
        let config = WebConfig::from_toml_str("cache_output = false\nredirect_to_https = true");
        let (status, response) = send_with(
            "GET /hello HTTP/1.1\r\nHost: evil.com\nSet-Cookie: admin=1\r\n\r\n",
            &config,
            &StaticResources::new(),
        );
        assert_eq!(status, 301);
        let head = head_of(&response);
        assert!(!head.contains("Set-Cookie"));
        assert!(!head.contains("evil.com"));
        assert!(head.contains("Location: https://127.0.0.1/hello\r\n"));
    }

    /// ## 拒绝服务：超大的 Content-Length
    #[test]
    fn test_oversized_content_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 18446744073709551615\r\n\r\n";
        let expected = std::panic::catch_unwind(|| Request::expected_length(raw));
        assert_eq!(expected.ok(), Some(Some(usize::MAX)));
    }

    /// ## 非法输入键：查询与正文键致命，Cookie 键静默丢弃
    #[test]
    fn test_invalid_input_keys() {
        let (status, response) = send("GET /hello?a<b=1 HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status, 400);
        assert!(response.ends_with("ERROR 400. Bad Request."));

        let (status, _) = send(
            "GET /hello HTTP/1.1\r\nHost: localhost\r\nCookie: bad key=1; good=2\r\n\r\n",
        );
        assert_eq!(status, 200);
    }

    /// ## 跨站请求伪造
    #[test]
    fn test_csrf_forged_post() {
        let config = WebConfig::from_toml_str("cache_output = false\ncsrf_protection = true");
        let resources = StaticResources::new();
        let token = "0123456789abcdef0123456789abcdef";

        let forged = "POST /account/delete HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 13\r\n\r\ncsrf_token=no";
        let (status, response) = send_with(forged, &config, &resources);
        assert_eq!(status, 403);
        assert!(!response.contains("deleted"));

        let body = format!("csrf_token={}", token);
        let genuine = format!(
            "POST /account/delete HTTP/1.1\r\nHost: localhost\r\nCookie: csrf_cookie={}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            token,
            body.len(),
            body
        );
        let (status, response) = send_with(&genuine, &config, &resources);
        assert_eq!(status, 200);
        assert!(response.ends_with("deleted"));
        // 校验通过后令牌被轮换
        assert!(head_of(&response).contains("Set-Cookie: csrf_cookie="));
        assert!(!head_of(&response).contains(token));
    }

    /// ## 协议健壮性：畸形请求行与版本
    #[test]
    fn test_malformed_requests() {
        let malformed: [&[u8]; 4] = [
            b"GET / HTTP/9.9\r\nHost: localhost\r\n\r\n",
            b"GET / FTP/1.0\r\n\r\n",
            b"GARBAGE\r\n\r\n",
            b"BREW /pot HTTP/1.1\r\n\r\n",
        ];
        for raw in malformed {
            assert!(Request::try_from(raw, 0).is_err());
        }

        let not_utf8 = b"GET /\xff\xfe HTTP/1.1\r\n\r\n";
        assert!(matches!(
            Request::try_from(not_utf8, 0),
            Err(Exception::RequestIsNotUtf8)
        ));
    }

    /// ## 协议健壮性：缺少 Host 头部仍能得到完整响应
    #[test]
    fn test_missing_host_header() {
        let (status, response) = send("GET /hello HTTP/1.0\r\n\r\n");
        assert_eq!(status, 200);
        assert!(response.starts_with("HTTP/1.0 200"));
    }
}
