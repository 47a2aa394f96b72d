//! Sessions: environment state shared across executions
//!
//! A [`Session`] owns an ordered sequence of `KEY=VALUE` bindings. Later
//! entries shadow earlier ones, and [`Session::get_env`] collapses the
//! sequence to last-writer-wins while preserving first-seen ordering. The
//! [`SessionStore`] keeps every live session and tracks the most recently
//! used one for the `MOST_RECENT` selection strategy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use uuid::Uuid;

/// Name under which the most recent captured stdout is always stored.
pub const ANONYMOUS_CAPTURE_NAME: &str = "__";

/// Shell-managed variables excluded from the post-execution env diff so
/// incidental shell state does not accumulate in sessions.
const DIFF_EXCLUDED_KEYS: &[&str] = &["_", "SHLVL", "PWD", "OLDPWD"];

/// Environment state persisting across executions
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    env: Vec<String>,
    known: HashSet<String>,
}

impl Session {
    /// Create an empty session with a fresh id
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(SessionState::default()),
        })
    }

    /// The session's opaque identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Environment bindings, collapsed to last-writer-wins per key
    pub fn get_env(&self) -> Vec<String> {
        let state = self.state.lock().expect("session lock poisoned");
        collapse_env(&state.env)
    }

    /// Append bindings; entries without a `=` are ignored
    pub fn set_env(&self, pairs: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock().expect("session lock poisoned");
        state.env.extend(pairs.into_iter().filter(|p| p.contains('=')));
    }

    /// Store a named capture, overwriting any previous value under the name
    pub fn put_known(&self, name: &str, value: &str) {
        let mut state = self.state.lock().expect("session lock poisoned");
        state.known.insert(name.to_string());
        state.env.push(format!("{name}={value}"));
    }

    /// Names of captures stored via [`Session::put_known`]
    pub fn known_names(&self) -> Vec<String> {
        let state = self.state.lock().expect("session lock poisoned");
        let mut names = state.known.iter().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

/// Registry of live sessions with a most-recently-used pointer
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    most_recent: Mutex<Option<String>>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, register and touch a new session
    pub fn create(&self) -> Arc<Session> {
        let session = Session::new();
        self.sessions
            .insert(session.id().to_string(), session.clone());
        self.touch(session.id());
        session
    }

    /// Look up a session by id, marking it most recent on success
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|s| s.value().clone())?;
        self.touch(id);
        Some(session)
    }

    /// The most recently used session, or a fresh one if none exists
    pub fn most_recent_or_create(&self) -> Arc<Session> {
        let id = self
            .most_recent
            .lock()
            .expect("most-recent lock poisoned")
            .clone();
        match id.and_then(|id| self.sessions.get(&id).map(|s| s.value().clone())) {
            Some(session) => session,
            None => self.create(),
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn touch(&self, id: &str) {
        *self.most_recent.lock().expect("most-recent lock poisoned") = Some(id.to_string());
    }
}

/// Collapse an ordered binding sequence to last-writer-wins, keeping the
/// position of each key's first occurrence.
pub fn collapse_env(env: &[String]) -> Vec<String> {
    let mut order = Vec::new();
    for pair in env {
        let Some((key, _)) = pair.split_once('=') else {
            continue;
        };
        if !order.iter().any(|k| k == key) {
            order.push(key.to_string());
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            env.iter()
                .rev()
                .find(|pair| pair.split_once('=').is_some_and(|(k, _)| k == key))
                .cloned()
        })
        .collect()
}

/// Parse NUL-separated `KEY=VALUE` records as written by the env-dump
/// expression. Malformed records are skipped.
pub fn parse_env_dump(data: &[u8]) -> Vec<String> {
    data.split(|b| *b == 0)
        .filter_map(|record| std::str::from_utf8(record).ok())
        .map(str::trim_end)
        .filter(|record| {
            record
                .split_once('=')
                .is_some_and(|(key, _)| !key.is_empty())
        })
        .map(str::to_string)
        .collect()
}

/// Bindings present in `after` but not in `before`, excluding shell-managed
/// keys and `exclude_key`.
pub fn diff_env(before: &[String], after: &[String], exclude_key: &str) -> Vec<String> {
    let before: HashSet<&str> = before.iter().map(String::as_str).collect();
    after
        .iter()
        .filter(|pair| !before.contains(pair.as_str()))
        .filter(|pair| {
            pair.split_once('=').is_some_and(|(key, _)| {
                !DIFF_EXCLUDED_KEYS.contains(&key) && key != exclude_key
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_bindings_shadow_earlier_ones() {
        let session = Session::new();
        session.set_env(vec!["A=1".to_string(), "B=2".to_string()]);
        session.set_env(vec!["A=3".to_string()]);
        assert_eq!(session.get_env(), vec!["A=3", "B=2"]);
    }

    #[test]
    fn entries_without_separator_are_dropped() {
        let session = Session::new();
        session.set_env(vec!["A=1".to_string(), "garbage".to_string()]);
        assert_eq!(session.get_env(), vec!["A=1"]);
    }

    #[test]
    fn put_known_overwrites_and_tracks_names() {
        let session = Session::new();
        session.put_known(ANONYMOUS_CAPTURE_NAME, "first");
        session.put_known(ANONYMOUS_CAPTURE_NAME, "second");
        session.put_known("MY_VAR", "second");

        assert_eq!(
            session.get_env(),
            vec!["__=second", "MY_VAR=second"],
        );
        assert_eq!(session.known_names(), vec!["MY_VAR", "__"]);
    }

    #[test]
    fn store_tracks_most_recent_session() {
        let store = SessionStore::new();
        let first = store.create();
        let second = store.create();

        assert_eq!(store.most_recent_or_create().id(), second.id());

        // Touching an older session makes it most recent again.
        store.get(first.id()).unwrap();
        assert_eq!(store.most_recent_or_create().id(), first.id());
    }

    #[test]
    fn most_recent_creates_when_store_is_empty() {
        let store = SessionStore::new();
        assert!(store.is_empty());
        let session = store.most_recent_or_create();
        assert_eq!(store.len(), 1);
        assert_eq!(store.most_recent_or_create().id(), session.id());
    }

    #[test]
    fn get_unknown_session_returns_none() {
        let store = SessionStore::new();
        assert!(store.get("no-such-id").is_none());
    }

    #[test]
    fn parses_nul_separated_records() {
        let data = b"A=1\0B=two words\0\0=broken\0C=3";
        assert_eq!(parse_env_dump(data), vec!["A=1", "B=two words", "C=3"]);
    }

    #[test]
    fn diff_picks_up_new_and_changed_bindings() {
        let before = vec!["A=1".to_string(), "B=2".to_string()];
        let after = vec![
            "A=1".to_string(),
            "B=changed".to_string(),
            "C=new".to_string(),
            "SHLVL=2".to_string(),
            "PWD=/tmp".to_string(),
            "_=env".to_string(),
        ];
        assert_eq!(
            diff_env(&before, &after, "RUNLET_ENV_DUMP_FILE"),
            vec!["B=changed", "C=new"],
        );
    }

    #[test]
    fn diff_excludes_the_dump_path_binding() {
        let after = vec!["RUNLET_ENV_DUMP_FILE=/tmp/dump".to_string()];
        assert!(diff_env(&[], &after, "RUNLET_ENV_DUMP_FILE").is_empty());
    }
}
