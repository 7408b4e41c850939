//! 订阅期上下文与跨线程环境状态传播。
//!
//! # 设计综述（Why）
//! - [`Context`] 是不可变的键值映射，沿订阅建立方向（自下游向上游）传递：
//!   某阶段写入的新上下文只对其上游可见，下游与兄弟订阅不受影响；
//! - 读取时自读取点向外查找，命中的是“最近的包围写入”，而不是全局最后一次写入；
//! - 线程局部的环境状态（日志 MDC、追踪上下文等）与 `Context` 相互独立，
//!   由 [`propagation`] 在调度切换点抓取快照并在工作线程上恢复。
//!
//! # 实现（How）
//! - 采用持久化链表覆盖层：每次 `put` 只新建一个节点并共享父链，写入是 O(1)、
//!   读取是自头部向根部的线性查找，与典型上下文规模（个位数键）匹配。

pub mod propagation;

use std::{any::Any, borrow::Cow, collections::HashSet, fmt, sync::Arc};

type Value = Arc<dyn Any + Send + Sync>;

struct Node {
    key: Cow<'static, str>,
    value: Option<Value>,
    parent: Option<Arc<Node>>,
}

/// 不可变的订阅期上下文。
///
/// # 契约说明（What）
/// - `put`/`delete`/`put_all` 返回新上下文，原上下文保持不变，可在多个订阅间安全共享；
/// - 同名键以离读取点最近的写入为准；`delete` 写入墓碑，遮蔽更早的同名值；
/// - 值以 `Any` 存储，[`Context::get`] 在类型不匹配时返回 `None`。
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<Node>>,
    len: usize,
}

impl Context {
    /// 空上下文。
    pub fn empty() -> Self {
        Self::default()
    }

    /// 以单个键值构造。
    pub fn of<V>(key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        Self::empty().put(key, value)
    }

    /// 写入键值，返回派生的新上下文。
    pub fn put<V>(&self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let key = key.into();
        let len = if self.contains(&key) {
            self.len
        } else {
            self.len + 1
        };
        Self {
            head: Some(Arc::new(Node {
                key,
                value: Some(Arc::new(value)),
                parent: self.head.clone(),
            })),
            len,
        }
    }

    /// 删除键，返回派生的新上下文；键不存在时返回自身的副本。
    pub fn delete(&self, key: &str) -> Self {
        if !self.contains(key) {
            return self.clone();
        }
        Self {
            head: Some(Arc::new(Node {
                key: Cow::Owned(key.to_owned()),
                value: None,
                parent: self.head.clone(),
            })),
            len: self.len - 1,
        }
    }

    /// 把 `other` 的全部可见键写入当前上下文，冲突时 `other` 优先。
    pub fn put_all(&self, other: &Context) -> Self {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = other.head.as_ref();
        while let Some(node) = cursor {
            if seen.insert(node.key.as_ref()) {
                entries.push(node);
            }
            cursor = node.parent.as_ref();
        }
        let mut merged = self.clone();
        for node in entries.into_iter().rev() {
            merged = match &node.value {
                Some(value) => merged.put_raw(node.key.clone(), value.clone()),
                None => merged.delete(&node.key),
            };
        }
        merged
    }

    fn put_raw(&self, key: Cow<'static, str>, value: Value) -> Self {
        let len = if self.contains(&key) {
            self.len
        } else {
            self.len + 1
        };
        Self {
            head: Some(Arc::new(Node {
                key,
                value: Some(value),
                parent: self.head.clone(),
            })),
            len,
        }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut cursor = self.head.as_ref();
        while let Some(node) = cursor {
            if node.key == key {
                return node.value.as_ref();
            }
            cursor = node.parent.as_ref();
        }
        None
    }

    /// 读取并向下转型。
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.lookup(key).and_then(|value| value.downcast_ref::<V>())
    }

    /// 读取并克隆，缺失或类型不匹配时返回默认值。
    pub fn get_or<V: Any + Clone>(&self, key: &str, default: V) -> V {
        self.get::<V>(key).cloned().unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// 可见键的数量。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 可见键，按最近写入优先的顺序。
    pub fn keys(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor = self.head.as_ref();
        while let Some(node) = cursor {
            if seen.insert(node.key.as_ref()) && node.value.is_some() {
                keys.push(node.key.as_ref());
            }
            cursor = node.parent.as_ref();
        }
        keys
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_do_not_mutate_the_source_context() {
        let base = Context::of("user", "alice".to_string());
        let derived = base.put("tenant", 7_u32);
        assert_eq!(base.len(), 1);
        assert_eq!(derived.len(), 2);
        assert!(!base.contains("tenant"));
        assert_eq!(derived.get::<u32>("tenant"), Some(&7));
        assert_eq!(derived.get::<String>("user").map(String::as_str), Some("alice"));
    }

    #[test]
    fn nearest_write_shadows_older_values() {
        let ctx = Context::of("k", 1_i32).put("k", 2_i32);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get::<i32>("k"), Some(&2));
        assert_eq!(ctx.get::<u64>("k"), None);
        assert_eq!(ctx.get_or("missing", 9_i32), 9);
    }

    #[test]
    fn delete_and_put_all() {
        let a = Context::of("x", 1_i32).put("y", 2_i32);
        let b = Context::of("y", 20_i32).put("z", 30_i32);
        let merged = a.put_all(&b);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get::<i32>("y"), Some(&20));

        let pruned = merged.delete("x");
        assert_eq!(pruned.len(), 2);
        assert!(!pruned.contains("x"));
        assert!(merged.contains("x"));
        assert_eq!(pruned.delete("absent").len(), 2);
    }
}
