// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 演示服务器
//!
//! 基于 Tokio 运行时的传输层：接受 HTTP/1.1 连接，把报文解析为环境请求数据，
//! 在阻塞线程池上运行同步的请求管线，再把输出写回套接字。
//! - 每个连接一个异步任务
//! - 后台管理控制台（stop / status / help）
//! - Ctrl-C 优雅停机

use webpipe::{
    Dispatcher, HookRegistry, Request, RouteOutcome, RouteTable, StaticResources, WebConfig,
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Builder,
    sync::Notify,
};

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

/// 单个请求报文的大小上限
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// 所有连接共享的只读状态
struct Shared {
    config: WebConfig,
    routes: RouteTable,
    resources: StaticResources,
    hooks: HookRegistry,
}

fn main() {
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
    }

    let config = WebConfig::from_toml("config/development.toml");
    info!("配置文件已载入");
    info!("www root: {}", config.www_root());

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建Tokio运行时：{}", e);
            return;
        }
    };
    runtime.block_on(serve(config));
}

async fn serve(config: WebConfig) {
    let port = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    info!("服务端将在{}:{}上监听Socket连接", address, port);

    let listener = match TcpListener::bind(SocketAddrV4::new(address, port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("无法绑定端口：{}，错误：{}", port, e);
            return;
        }
    };
    info!("端口{}绑定完成", port);

    let shared = Arc::new(Shared {
        resources: StaticResources::from_config(&config),
        routes: demo_routes(),
        hooks: HookRegistry::new(),
        config,
    });
    let shutdown = Arc::new(Notify::new());
    let active_connection = Arc::new(AtomicUsize::new(0));

    tokio::spawn(console(Arc::clone(&shutdown), Arc::clone(&active_connection)));

    let mut id: u128 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("接受连接失败：{}", e);
                        continue;
                    }
                };
                debug!("[ID{}]TCP连接已建立：{}", id, remote);

                let shared = Arc::clone(&shared);
                let active_connection = Arc::clone(&active_connection);
                tokio::spawn(async move {
                    active_connection.fetch_add(1, Ordering::SeqCst);
                    handle_connection(stream, remote, id, shared).await;
                    active_connection.fetch_sub(1, Ordering::SeqCst);
                });
                id += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到Ctrl-C，正在退出...");
                break;
            }
            _ = shutdown.notified() => {
                info!("主循环接收到停机指令，正在退出...");
                break;
            }
        }
    }
}

async fn console(shutdown: Arc<Notify>, active_connection: Arc<AtomicUsize>) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        match reader.read_line(&mut input).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，服务器即将关闭...");
                shutdown.notify_one();
                break;
            }
            "status" => {
                println!("== Webpipe 状态 ===");
                println!("当前活跃连接数: {}", active_connection.load(Ordering::SeqCst));
                println!("===================");
            }
            "help" => {
                println!("== Webpipe Help ==");
                println!("stop   - 发出停机信号");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("==================");
            }
            "" => {}
            cmd => println!("无效的命令：{}", cmd),
        }
    }
}

async fn handle_connection(mut stream: TcpStream, remote: SocketAddr, id: u128, shared: Arc<Shared>) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            error!("[ID{}]无法获取本地地址：{}", id, e);
            return;
        }
    };

    let buffer = match read_request(&mut stream, id).await {
        Some(buffer) => buffer,
        None => return,
    };
    let start_time = Instant::now();

    let request = match Request::try_from(&buffer, id) {
        Ok(request) => request,
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败：{}", id, e);
            let response = "HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\n\r\nBad Request";
            let _ = stream.write_all(response.as_bytes()).await;
            return;
        }
    };
    info!(
        "[ID{}] {}, {}, {}, {}",
        id,
        request.version(),
        request.method(),
        request.target(),
        request.user_agent()
    );

    let mut ambient = request.into_ambient(local, remote);
    let pipeline = Arc::clone(&shared);
    let response = tokio::task::spawn_blocking(move || {
        let dispatcher = Dispatcher::new(
            &pipeline.config,
            &pipeline.routes,
            &pipeline.resources,
            &pipeline.hooks,
        );
        dispatcher.dispatch(&mut ambient, id)
    })
    .await;

    let response = match response {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("[ID{}]请求管线异常终止：{}", id, e);
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 36\r\n\r\nERROR 500. Page could not be loaded."
                .to_vec()
        }
    };
    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );

    if let Err(e) = stream.write_all(&response).await {
        error!("[ID{}]发送响应失败：{}", id, e);
        return;
    }
    let _ = stream.flush().await;
}

/// 读取完整的请求报文（头部加上 `Content-Length` 指定的正文）
async fn read_request(stream: &mut TcpStream, id: u128) -> Option<Vec<u8>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) if buffer.is_empty() => return None, // 客户端主动关闭连接
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
                return None;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);
        let expected = Request::expected_length(&buffer);
        if buffer.len() > MAX_REQUEST_SIZE || expected.map_or(false, |len| len > MAX_REQUEST_SIZE) {
            warn!("[ID{}]请求报文超过{}字节，放弃读取", id, MAX_REQUEST_SIZE);
            let response = "HTTP/1.1 413 Content Too Large\r\nContent-Length: 0\r\n\r\n";
            let _ = stream.write_all(response.as_bytes()).await;
            return None;
        }
        if let Some(expected) = expected {
            if buffer.len() >= expected {
                buffer.truncate(expected);
                break;
            }
        }
    }
    debug!("[ID{}]HTTP请求接收完毕，共{}字节", id, buffer.len());
    Some(buffer)
}

fn demo_routes() -> RouteTable {
    let mut routes = RouteTable::new();
    routes
        .get("", |scope| {
            scope.output.cache(1);
            RouteOutcome::Ok("Home".to_string())
        })
        .get("hello", |scope| {
            let name = scope
                .input
                .query("name")
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_else(|| "world".to_string());
            RouteOutcome::Ok(format!("Hello, {}!", name))
        });
    routes
}
