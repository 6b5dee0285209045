// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 生命周期钩子
//!
//! 在管线的固定检查点同步调用的回调列表。优先级高的先执行，
//! 同一优先级按注册顺序执行。

use crate::router::RequestScope;

use log::debug;

/// 钩子优先级，`Highest` 最先执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// 路由之前
    BeforeRoute,
    /// 路由之后、写缓存之前，可以改写正文
    AfterRoute,
    /// 输出响应之前
    Shutdown,
}

pub type Hook = Box<dyn Fn(&mut RequestScope) + Send + Sync>;

struct Registration {
    checkpoint: Checkpoint,
    priority: Priority,
    hook: Hook,
}

#[derive(Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, checkpoint: Checkpoint, priority: Priority, hook: F) -> &mut Self
    where
        F: Fn(&mut RequestScope) + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            checkpoint,
            priority,
            hook: Box::new(hook),
        });
        // 稳定排序保持同优先级的注册顺序
        self.registrations
            .sort_by(|a, b| b.priority.cmp(&a.priority));
        self
    }

    pub fn run(&self, checkpoint: Checkpoint, scope: &mut RequestScope, id: u128) {
        for registration in self
            .registrations
            .iter()
            .filter(|registration| registration.checkpoint == checkpoint)
        {
            debug!("[ID{}]执行{:?}钩子（{:?}）", id, checkpoint, registration.priority);
            (registration.hook)(scope);
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
