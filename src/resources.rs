// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 静态资源注册表
//!
//! 把资源名映射到磁盘目录。请求的第一个 URI 段选择资源，
//! 其余段拼接为该目录下的相对文件路径。

use crate::{
    config::WebConfig,
    exception::Exception,
    utf8::{clean_string, url_decode},
};

use log::{debug, error, info, warn};

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Default)]
pub struct StaticResources {
    entries: BTreeMap<String, PathBuf>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册配置中 `[resources]` 表列出的全部资源，失败的条目只记录日志。
    pub fn from_config(config: &WebConfig) -> Self {
        let mut resources = Self::new();
        for (name, dir) in config.resources() {
            let dir = Path::new(config.www_root()).join(dir);
            if let Err(e) = resources.register(name, &dir) {
                error!("{}", e);
            }
        }
        resources
    }

    pub fn register(&mut self, name: &str, dir: &Path) -> Result<(), Exception> {
        if self.entries.contains_key(name) {
            return Err(Exception::ResourceRegistration(format!(
                "资源名{}已被注册",
                name
            )));
        }
        if !dir.is_dir() {
            return Err(Exception::ResourceRegistration(format!(
                "资源{}的目录{}不存在",
                name,
                dir.display()
            )));
        }
        info!("注册静态资源：{} -> {}", name, dir.display());
        self.entries.insert(name.to_string(), dir.to_path_buf());
        Ok(())
    }

    pub fn exists(&self, segments: &[String]) -> bool {
        self.locate(segments).is_some()
    }

    /// 读取资源文件，返回文件路径与内容
    pub fn serve(&self, segments: &[String]) -> Option<(PathBuf, Vec<u8>)> {
        let path = self.locate(segments)?;
        match fs::read(&path) {
            Ok(contents) => {
                debug!("静态资源命中：{}", path.display());
                Some((path, contents))
            }
            Err(e) => {
                warn!("无法读取静态资源{}：{}", path.display(), e);
                None
            }
        }
    }

    fn locate(&self, segments: &[String]) -> Option<PathBuf> {
        if segments.len() < 2 {
            return None;
        }
        let name = clean_string(&url_decode(&segments[0], false));
        let root = self.entries.get(&name)?;

        let mut path = root.clone();
        for segment in &segments[1..] {
            if segment == ".." || segment.contains(['/', '\\']) {
                return None;
            }
            path.push(segment);
        }
        if !path.is_file() {
            return None;
        }

        // 符号链接可能指向目录之外
        let canonical_root = root.canonicalize().ok()?;
        let canonical = path.canonicalize().ok()?;
        if !canonical.starts_with(&canonical_root) {
            warn!("静态资源路径{}越出了资源目录", path.display());
            return None;
        }
        Some(path)
    }
}
