// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 响应缓存模块
//!
//! 以文件形式保存完整的响应（头部与正文），多个请求并发访问同一目录。
//!
//! ## 条目格式
//! ```text
//! {"expire_at":1700000000,"headers":[...]}\nENDCACHE--->正文字节
//! ```
//! 信封是紧凑 JSON，正文可能是 gzip 压缩后的字节（文件名带 `_gzip` 后缀）。
//! 写入先落到同目录下的临时文件，再原子重命名，读者不会看到写了一半的条目。

use crate::{
    config::WebConfig,
    exception::Exception,
    input::{InputMap, InputSnapshot, InputValue, Space},
    output::{compress, HeaderEntry, ResponseBuffer},
    param::{CACHE_DELIMITER, CACHE_GZIP_SUFFIX},
    uri::UriIdentity,
};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// 缓存条目的信封部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub expire_at: i64,
    pub headers: Vec<HeaderEntry>,
}

pub struct ResponseCache {
    dir: PathBuf,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(config: &WebConfig) -> Self {
        Self {
            dir: PathBuf::from(config.cache_path()),
            enabled: config.cache_output(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 缓存标识：`sha256(base_url + uri_string + "|" + canonical_query)` 的小写十六进制
    pub fn identifier(uri: &UriIdentity, input: &InputSnapshot) -> String {
        let query = canonical_query(&input.get_all(Space::Query, false));
        Self::identifier_for(uri.base_url(), &uri.uri_string(), &query)
    }

    pub fn identifier_for(base_url: &str, uri_string: &str, query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base_url.as_bytes());
        hasher.update(uri_string.as_bytes());
        hasher.update(b"|");
        hasher.update(query.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn entry_path(&self, identifier: &str, compressed: bool) -> PathBuf {
        if compressed {
            self.dir.join(format!("{}{}", identifier, CACHE_GZIP_SUFFIX))
        } else {
            self.dir.join(identifier)
        }
    }

    /// 查找缓存，命中时把头部与正文回放到 `output`。
    pub fn get(
        &self,
        output: &mut ResponseBuffer,
        uri: &UriIdentity,
        input: &InputSnapshot,
        id: u128,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let compressed = output.compressing();
        let path = self.entry_path(&Self::identifier(uri, input), compressed);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => {
                debug!("[ID{}]缓存未命中：{}", id, path.display());
                return false;
            }
        };

        let Some((envelope, body)) = split_entry(&data) else {
            warn!("[ID{}]缓存条目{}已损坏，视为未命中", id, path.display());
            return false;
        };

        if Utc::now().timestamp() > envelope.expire_at {
            info!("[ID{}]缓存条目{}已过期，删除", id, path.display());
            if let Err(e) = fs::remove_file(&path) {
                warn!("[ID{}]无法删除过期缓存{}：{}", id, path.display(), e);
            }
            return false;
        }

        output.replay_cached(envelope.headers, body, compressed);
        info!("[ID{}]缓存命中：{}", id, path.display());
        true
    }

    /// 把当前响应写入缓存。失败只记录日志，不影响响应本身。
    pub fn write(
        &self,
        output: &ResponseBuffer,
        uri: &UriIdentity,
        input: &InputSnapshot,
        id: u128,
    ) -> bool {
        let ttl = output.cache_ttl();
        if !self.enabled || ttl == 0 {
            return false;
        }
        let compressed = output.compressing();
        let body = if compressed {
            match compress(output.output()) {
                Ok(body) => body,
                Err(e) => {
                    error!("[ID{}]压缩缓存正文失败：{}", id, e);
                    return false;
                }
            }
        } else {
            output.output().to_vec()
        };
        let envelope = CacheEnvelope {
            expire_at: Utc::now().timestamp() + (ttl as i64) * 60,
            headers: output
                .headers()
                .iter()
                .filter(|header| !header.name.eq_ignore_ascii_case("Set-Cookie"))
                .cloned()
                .collect(),
        };

        match self.store(&Self::identifier(uri, input), compressed, &envelope, &body) {
            Ok(path) => {
                info!("[ID{}]响应已写入缓存：{}，有效期{}分钟", id, path.display(), ttl);
                true
            }
            Err(e) => {
                error!("[ID{}]{}", id, e);
                false
            }
        }
    }

    /// 原子地写入一个条目，返回条目路径。
    pub fn store(
        &self,
        identifier: &str,
        compressed: bool,
        envelope: &CacheEnvelope,
        body: &[u8],
    ) -> Result<PathBuf, Exception> {
        self.ensure_dir()?;

        let header = serde_json::to_vec(envelope)
            .map_err(|e| Exception::CacheWrite(format!("无法序列化缓存信封：{}", e)))?;
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|e| {
            Exception::CacheWrite(format!("缓存目录{}不可写：{}", self.dir.display(), e))
        })?;
        write_entry(&mut temp, &header, body)
            .map_err(|e| Exception::CacheWrite(format!("写入临时缓存文件失败：{}", e)))?;

        let path = self.entry_path(identifier, compressed);
        temp.persist(&path).map_err(|e| {
            Exception::CacheWrite(format!("无法重命名缓存文件{}：{}", path.display(), e.error))
        })?;
        set_mode(&path, 0o640);
        Ok(path)
    }

    fn ensure_dir(&self) -> Result<(), Exception> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|e| {
            Exception::CacheWrite(format!("无法创建缓存目录{}：{}", self.dir.display(), e))
        })?;
        set_mode(&self.dir, 0o700);
        Ok(())
    }
}

fn write_entry(file: &mut NamedTempFile, header: &[u8], body: &[u8]) -> io::Result<()> {
    file.write_all(header)?;
    file.write_all(CACHE_DELIMITER)?;
    file.write_all(body)?;
    file.as_file().sync_all()
}

/// 把条目拆分为信封与正文，分隔符缺失或 JSON 无法解析时返回 `None`。
fn split_entry(data: &[u8]) -> Option<(CacheEnvelope, &[u8])> {
    let pos = data
        .windows(CACHE_DELIMITER.len())
        .position(|window| window == CACHE_DELIMITER)?;
    let envelope = serde_json::from_slice(&data[..pos]).ok()?;
    Some((envelope, &data[pos + CACHE_DELIMITER.len()..]))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!("无法设置{}的权限：{}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// 把查询参数序列化为稳定的规范形式：键按字典序排列，`key=value` 以 `&` 连接，
/// 嵌套映射写作 `key[sub]=value`。
pub fn canonical_query(query: &InputMap) -> String {
    let mut pairs = Vec::new();
    flatten(query, None, &mut pairs);
    pairs.join("&")
}

fn flatten(map: &InputMap, prefix: Option<&str>, pairs: &mut Vec<String>) {
    for (key, value) in map {
        let name = match prefix {
            Some(prefix) => format!("{}[{}]", prefix, key),
            None => key.clone(),
        };
        match value {
            InputValue::Text(text) => pairs.push(format!("{}={}", name, escape(text))),
            InputValue::Map(nested) => flatten(nested, Some(&name), pairs),
        }
    }
}

fn escape(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('&', "%26")
        .replace('=', "%3D")
}
