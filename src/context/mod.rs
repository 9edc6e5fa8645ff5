//! Session-scoped execution context
//!
//! Every capability call and pattern executor sees the same context type.
//! Concurrent branches never share a context: each branch gets a fork and
//! the parent folds the fork back in with `merge` once the branch finishes.
//!
//! Storage is a shared base map plus a local overlay of every key touched
//! since the context was forked, so a merge costs one insert per touched key.
//! The overlay is kept when the context forks again: it is the delta the
//! parent receives on merge.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
    RememberedEntities,
    Preferences,
    ConversationContext,
    StepOutputs,
}

type ContextKey = (Namespace, String);

pub const PRIMARY_ACCOUNT: &str = "primary_account_id";
pub const LAST_ACCOUNT: &str = "last_account_accessed";
/// Payload of the event being handled, in `conversation-context`
pub const LAST_EVENT: &str = "last_event";
pub const LAST_REQUEST: &str = "last_request";
pub const LAST_WORKFLOW: &str = "last_workflow";

/// Canonical, sorted view of a context.
pub type ContextSnapshot = BTreeMap<Namespace, BTreeMap<String, Value>>;

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    base: Arc<HashMap<ContextKey, Value>>,
    /// `None` marks a removal that shadows the base
    overlay: HashMap<ContextKey, Option<Value>>,
    /// Overlay already applied to `base`
    folded: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        let base = snapshot
            .into_iter()
            .flat_map(|(namespace, entries)| {
                entries
                    .into_iter()
                    .map(move |(key, value)| ((namespace, key), value))
            })
            .collect();

        Self {
            base: Arc::new(base),
            overlay: HashMap::new(),
            folded: true,
        }
    }

    // ================= Core operations =================

    pub fn get(&self, namespace: Namespace, key: &str) -> Option<&Value> {
        let k = (namespace, key.to_string());
        match self.overlay.get(&k) {
            Some(entry) => entry.as_ref(),
            None => self.base.get(&k),
        }
    }

    pub fn set(&mut self, namespace: Namespace, key: impl Into<String>, value: Value) {
        self.overlay.insert((namespace, key.into()), Some(value));
        self.folded = false;
    }

    pub fn remove(&mut self, namespace: Namespace, key: &str) -> Option<Value> {
        let previous = self.get(namespace, key).cloned();
        self.overlay.insert((namespace, key.to_string()), None);
        self.folded = false;
        previous
    }

    /// Independent copy for a concurrent branch.
    ///
    /// Pending writes are applied to the shared base first, in place while
    /// no other fork holds it. They stay in the overlay so a later `merge`
    /// of this context into its own parent still carries them.
    pub fn fork(&mut self) -> ExecutionContext {
        self.fold();
        Self {
            base: Arc::clone(&self.base),
            overlay: HashMap::new(),
            folded: true,
        }
    }

    /// Fold a finished branch back in. Later merges win on conflicting keys.
    pub fn merge(&mut self, child: ExecutionContext) {
        if child.overlay.is_empty() {
            return;
        }
        self.overlay.extend(child.overlay);
        self.folded = false;
    }

    /// Keys written or removed since this context was created or forked.
    pub fn touched(&self) -> usize {
        self.overlay.len()
    }

    fn fold(&mut self) {
        if self.folded || self.overlay.is_empty() {
            return;
        }
        let base = Arc::make_mut(&mut self.base);
        for (key, entry) in &self.overlay {
            match entry {
                Some(value) => {
                    base.insert(key.clone(), value.clone());
                }
                None => {
                    base.remove(key);
                }
            }
        }
        self.folded = true;
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::new();
        let live = self
            .base
            .iter()
            .filter(|(key, _)| !self.overlay.contains_key(*key))
            .map(|(key, value)| (key, Some(value)))
            .chain(self.overlay.iter().map(|(key, entry)| (key, entry.as_ref())));

        for ((namespace, key), value) in live {
            if let Some(value) = value {
                snapshot
                    .entry(*namespace)
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.snapshot().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ================= Memory helpers =================

    /// Remember the account the session is working on.
    pub fn remember_account(&mut self, account_id: &str) {
        let value = Value::String(account_id.to_string());
        self.set(Namespace::RememberedEntities, PRIMARY_ACCOUNT, value.clone());
        self.set(Namespace::RememberedEntities, LAST_ACCOUNT, value);
    }

    pub fn current_account(&self) -> Option<&str> {
        self.get(Namespace::RememberedEntities, PRIMARY_ACCOUNT)
            .or_else(|| self.get(Namespace::RememberedEntities, LAST_ACCOUNT))
            .and_then(Value::as_str)
    }

    pub fn remember(&mut self, key: impl Into<String>, value: Value) {
        self.set(Namespace::RememberedEntities, key, value);
    }

    pub fn set_preference(&mut self, key: impl Into<String>, value: Value) {
        self.set(Namespace::Preferences, key, value);
    }

    pub fn preference(&self, key: &str) -> Option<&Value> {
        self.get(Namespace::Preferences, key)
    }

    pub fn record_conversation(&mut self, key: impl Into<String>, value: Value) {
        self.set(Namespace::ConversationContext, key, value);
    }

    pub fn record_step_output(&mut self, key: impl Into<String>, value: Value) {
        self.set(Namespace::StepOutputs, key, value);
    }

    pub fn step_output(&self, key: &str) -> Option<&Value> {
        self.get(Namespace::StepOutputs, key)
    }

    /// SHA-256 of the canonical snapshot, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();

        // BTreeMap keys keep the serialization order stable
        if serde_json::to_writer(&mut HashWriter(&mut hasher), &self.snapshot()).is_err() {
            return String::new();
        }

        hex::encode(hasher.finalize())
    }
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fork_is_isolated_from_parent() {
        let mut parent = ExecutionContext::new();
        parent.remember_account("WM100001");

        let mut child = parent.fork();
        child.remember_account("WM200002");
        child.record_step_output("summary", json!({"total": 10}));

        assert_eq!(parent.current_account(), Some("WM100001"));
        assert!(parent.step_output("summary").is_none());
        assert_eq!(child.current_account(), Some("WM200002"));
    }

    #[test]
    fn test_merge_in_completion_order_last_writer_wins() {
        let mut parent = ExecutionContext::new();
        let mut first = parent.fork();
        let mut second = parent.fork();

        first.record_step_output("risk", json!(1));
        second.record_step_output("risk", json!(2));
        second.set_preference("tone", json!("brief"));

        parent.merge(second);
        parent.merge(first);

        assert_eq!(parent.step_output("risk"), Some(&json!(1)));
        assert_eq!(parent.preference("tone"), Some(&json!("brief")));
    }

    #[test]
    fn test_removal_propagates_through_merge() {
        let mut parent = ExecutionContext::new();
        parent.record_conversation("last_request", json!("hello"));

        let mut child = parent.fork();
        assert_eq!(
            child.remove(Namespace::ConversationContext, "last_request"),
            Some(json!("hello"))
        );
        assert!(parent.get(Namespace::ConversationContext, "last_request").is_some());

        parent.merge(child);
        assert!(parent.get(Namespace::ConversationContext, "last_request").is_none());
        assert!(parent.is_empty());
    }

    #[test]
    fn test_fork_after_merge_sees_merged_values() {
        let mut parent = ExecutionContext::new();
        let mut child = parent.fork();
        child.record_step_output("a", json!(true));
        parent.merge(child);

        let grandchild = parent.fork();
        assert_eq!(grandchild.step_output("a"), Some(&json!(true)));
        assert_eq!(grandchild.touched(), 0);
    }

    #[test]
    fn test_nested_fork_keeps_branch_writes_for_parent() {
        let mut parent = ExecutionContext::new();
        parent.remember_account("WM100001");

        let mut branch = parent.fork();
        branch.record_conversation(LAST_EVENT, json!({"vix": 42}));

        let mut left = branch.fork();
        let mut right = branch.fork();
        assert_eq!(left.get(Namespace::ConversationContext, LAST_EVENT), Some(&json!({"vix": 42})));
        left.record_step_output("a", json!(1));
        right.record_step_output("b", json!(2));
        branch.merge(right);
        branch.merge(left);

        // Fork once more after the merges; nothing may be dropped on the way up
        let _ = branch.fork();
        assert_eq!(branch.touched(), 3);
        parent.merge(branch);

        assert_eq!(parent.get(Namespace::ConversationContext, LAST_EVENT), Some(&json!({"vix": 42})));
        assert_eq!(parent.step_output("a"), Some(&json!(1)));
        assert_eq!(parent.step_output("b"), Some(&json!(2)));
        assert_eq!(parent.current_account(), Some("WM100001"));
    }

    #[test]
    fn test_removal_before_nested_fork_reaches_parent() {
        let mut parent = ExecutionContext::new();
        parent.set_preference("tone", json!("formal"));

        let mut branch = parent.fork();
        branch.remove(Namespace::Preferences, "tone");
        let grandchild = branch.fork();
        assert!(grandchild.preference("tone").is_none());
        branch.merge(grandchild);

        parent.merge(branch);
        assert!(parent.preference("tone").is_none());
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut a = ExecutionContext::new();
        a.set_preference("x", json!(1));
        a.set_preference("y", json!(2));

        let mut b = ExecutionContext::new();
        b.set_preference("y", json!(2));
        b.set_preference("x", json!(1));
        let _ = b.fork();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        b.set_preference("x", json!(3));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut context = ExecutionContext::new();
        context.remember_account("WM1");
        let restored = ExecutionContext::from_snapshot(context.snapshot());
        assert_eq!(restored.current_account(), Some("WM1"));
        assert_eq!(restored.len(), 2);
    }
}
