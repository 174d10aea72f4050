use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::{KvError, KvResult, KvStore};

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Option<Instant>)>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<String> {
        let expired = match self.values.get(key) {
            Some((_, Some(deadline))) => *deadline <= Instant::now(),
            Some((_, None)) => false,
            None => return None,
        };
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|(v, _)| v.clone())
    }
}

/// In-process store with Redis list/string/pub-sub semantics. Used for
/// single-process deployments (`memory://`) and tests.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pubsub: broadcast::Sender<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            pubsub,
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> KvResult<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| KvError::Unavailable(format!("memory store lock poisoned: {}", e)))?;
        Ok(f(&mut inner))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve Redis-style inclusive `start..=stop` (negative counts from the
/// end) against a list of `len` items.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Glob match supporting `*` and `?`, as Redis `SCAN MATCH` does.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn rpush(&self, key: &str, value: &str) -> KvResult<usize> {
        self.with_inner(|inner| {
            let list = inner.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_string());
            list.len()
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<usize> {
        self.with_inner(|inner| {
            let list = inner.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_string());
            list.len()
        })
    }

    async fn lpop(&self, key: &str, count: usize) -> KvResult<Vec<String>> {
        self.with_inner(|inner| {
            let Some(list) = inner.lists.get_mut(key) else {
                return vec![];
            };
            let n = count.min(list.len());
            let popped: Vec<String> = list.drain(..n).collect();
            if list.is_empty() {
                inner.lists.remove(key);
            }
            popped
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        self.with_inner(|inner| {
            let Some(list) = inner.lists.get(key) else {
                return vec![];
            };
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => vec![],
            }
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> KvResult<()> {
        self.with_inner(|inner| {
            let Some(list) = inner.lists.get_mut(key) else {
                return;
            };
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
            if list.is_empty() {
                inner.lists.remove(key);
            }
        })
    }

    async fn llen(&self, key: &str) -> KvResult<usize> {
        self.with_inner(|inner| inner.lists.get(key).map_or(0, |l| l.len()))
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<usize> {
        self.with_inner(|inner| {
            let Some(list) = inner.lists.get_mut(key) else {
                return 0;
            };
            let removed = match list.iter().position(|v| v == value) {
                Some(idx) => {
                    list.remove(idx);
                    1
                }
                None => 0,
            };
            if list.is_empty() {
                inner.lists.remove(key);
            }
            removed
        })
    }

    async fn drain_front(&self, key: &str, max: usize) -> KvResult<Vec<String>> {
        self.lpop(key, max).await
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.with_inner(|inner| inner.live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.with_inner(|inner| {
            inner
                .values
                .insert(key.to_string(), (value.to_string(), None));
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.with_inner(|inner| {
            inner.values.insert(
                key.to_string(),
                (value.to_string(), Some(Instant::now() + ttl)),
            );
        })
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        self.with_inner(|inner| {
            let had_value = inner.live_value(key).is_some();
            inner.values.remove(key);
            let had_list = inner.lists.remove(key).is_some();
            had_value || had_list
        })
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        self.with_inner(|inner| keys.iter().map(|k| inner.live_value(k)).collect())
    }

    async fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.with_inner(|inner| {
            let candidates: Vec<String> = inner
                .values
                .keys()
                .chain(inner.lists.keys())
                .cloned()
                .collect();
            let mut keys: Vec<String> = candidates
                .into_iter()
                .filter(|k| glob_match(pattern, k))
                .filter(|k| inner.lists.contains_key(k) || inner.live_value(k).is_some())
                .collect();
            keys.sort();
            keys.dedup();
            keys
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        // No subscribers is not an error, same as Redis PUBLISH returning 0
        let _ = self.pubsub.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::UnboundedReceiver<String>> {
        let mut source = self.pubsub.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok((ch, payload)) if ch == channel => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Memory subscription to {} lagged by {} messages", channel, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
