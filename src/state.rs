//! Scoped session state
//!
//! State lives in four scopes:
//! - temporary: per-turn loop control, dropped by `end_turn`
//! - session: conversation history, append/merge only
//! - user: profile shared by every session of a user id
//! - application: global metadata
//!
//! User and application scopes can be persisted to a JSON file guarded by an
//! exclusive lock file.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::critic::QualityAssessment;
use crate::models::{EntityMentions, RetrievalResult};
use crate::{Error, Result};

/// Characters of a query kept in a history entry
pub const HISTORY_QUERY_CHARS: usize = 100;
/// Questions kept in a user's query history
pub const MAX_USER_QUERY_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateScope {
    Temporary,
    Session,
    User,
    Application,
}

impl StateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateScope::Temporary => "temporary",
            StateScope::Session => "session",
            StateScope::User => "user",
            StateScope::Application => "application",
        }
    }
}

impl fmt::Display for StateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "temporary" | "temp" => Ok(StateScope::Temporary),
            "session" => Ok(StateScope::Session),
            "user" => Ok(StateScope::User),
            "application" | "app" => Ok(StateScope::Application),
            other => Err(Error::InvalidArgument(format!("Unknown state scope: {}", other))),
        }
    }
}

/// Loop control for the running turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnState {
    pub iteration: u32,
    pub needs_followup: bool,
    pub followup_query: Option<String>,
}

/// One retriever call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tool: String,
    /// Truncated to [`HISTORY_QUERY_CHARS`]
    pub query: String,
    pub result_count: usize,
    pub has_error: bool,
    pub score: Option<u32>,
}

impl HistoryEntry {
    pub fn new(tool: &str, query: &str, results: &[RetrievalResult], score: Option<u32>) -> Self {
        Self {
            tool: tool.to_string(),
            query: query.chars().take(HISTORY_QUERY_CHARS).collect(),
            result_count: results.iter().filter(|r| !r.is_error()).count(),
            has_error: results.iter().any(RetrievalResult::is_error),
            score,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub query_count: u64,
    pub last_query: Option<String>,
    pub current_query: Option<String>,
    pub last_answer_score: Option<u32>,
    pub retrieval_history: Vec<HistoryEntry>,
    pub extracted_entities: EntityMentions,
    pub tools_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    #[serde(default)]
    pub preferences: Map<String, Value>,
    /// Oldest first, capped at [`MAX_USER_QUERY_HISTORY`]
    #[serde(default)]
    pub query_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl AppMetadata {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.app.name.clone(),
            description: config.app.description.clone(),
            extra: Map::new(),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn decode<T: serde::de::DeserializeOwned>(scope: StateScope, key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::StateError(format!("Invalid value for {}:{}: {}", scope, key, e)))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Owner of the user and application scopes.
///
/// Cheap to clone; clones share the same profiles.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    users: Arc<RwLock<HashMap<String, Arc<RwLock<UserProfile>>>>>,
    app: Arc<RwLock<AppMetadata>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    app: AppMetadata,
    #[serde(default)]
    users: HashMap<String, UserProfile>,
}

impl StateStore {
    pub fn new(app: AppMetadata) -> Self {
        Self {
            users: Arc::default(),
            app: Arc::new(RwLock::new(app)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(AppMetadata::from_config(config))
    }

    /// Profile for a user id, created on first use
    pub fn user(&self, user_id: &str) -> Arc<RwLock<UserProfile>> {
        if let Some(profile) = read(&self.users).get(user_id) {
            return profile.clone();
        }
        write(&self.users)
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    pub fn user_profile(&self, user_id: &str) -> Option<UserProfile> {
        read(&self.users)
            .get(user_id)
            .map(|profile| read(profile).clone())
    }

    pub fn app(&self) -> AppMetadata {
        read(&self.app).clone()
    }

    /// Start a new conversation for `user_id`
    pub fn session(&self, user_id: &str) -> SessionState {
        SessionState {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            record: SessionRecord::default(),
            turn: None,
            user: self.user(user_id),
            app: self.app.clone(),
        }
    }

    /// Write user and application scopes to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let _lock = StateFileLock::acquire(path)?;

        let snapshot = PersistedState {
            app: self.app(),
            users: read(&self.users)
                .iter()
                .map(|(id, profile)| (id.clone(), read(profile).clone()))
                .collect(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &snapshot)?;

        info!(path = %path.display(), users = snapshot.users.len(), "Saved state");
        Ok(())
    }

    /// Load user and application scopes from `path`.
    /// A missing file yields an empty store with `app` metadata.
    pub fn load_from(path: &Path, app: AppMetadata) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No state file, starting empty");
            return Ok(Self::new(app));
        }

        let _lock = StateFileLock::acquire(path)?;
        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedState = serde_json::from_str(&content)?;

        let users = persisted
            .users
            .into_iter()
            .map(|(id, profile)| (id, Arc::new(RwLock::new(profile))))
            .collect();

        // Name and description follow the current config; stored extra keys
        // survive unless the caller sets them again.
        let mut extra = persisted.app.extra;
        extra.extend(app.extra);

        Ok(Self {
            users: Arc::new(RwLock::new(users)),
            app: Arc::new(RwLock::new(AppMetadata {
                name: app.name,
                description: app.description,
                extra,
            })),
        })
    }
}

/// Exclusive lock on `<state file>.lock`, released on drop
struct StateFileLock {
    file: File,
}

impl StateFileLock {
    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn acquire(path: &Path) -> Result<Self> {
        let lock_path = Self::lock_path(path);
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)
            .map_err(|e| Error::LockError(format!("Failed to open lock file: {}", e)))?;

        file.try_lock_exclusive().map_err(|_| {
            Error::LockError(format!(
                "State file {} is in use by another process",
                path.display()
            ))
        })?;
        Ok(Self { file })
    }
}

impl Drop for StateFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Caller-visible view of a session. Temporary state is never included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub session: SessionRecord,
    pub user: UserProfile,
    pub app: AppMetadata,
}

/// Compact state summary for prompts and logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub iteration: u32,
    pub query: Option<String>,
    pub retrieval_count: usize,
    pub quality_score: Option<u32>,
    pub entities: EntityMentions,
    pub needs_followup: bool,
    pub query_count: u64,
}

/// State of one conversation
#[derive(Debug)]
pub struct SessionState {
    id: String,
    user_id: String,
    record: SessionRecord,
    turn: Option<TurnState>,
    user: Arc<RwLock<UserProfile>>,
    app: Arc<RwLock<AppMetadata>>,
}

impl SessionState {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Temporary state of the running turn
    pub fn turn(&self) -> Option<&TurnState> {
        self.turn.as_ref()
    }

    /// Fresh temporary state; counts the question in session and user scopes
    pub fn begin_turn(&mut self, question: &str) {
        self.turn = Some(TurnState::default());
        self.record.query_count += 1;
        if !question.is_empty() {
            self.record.last_query = Some(question.to_string());
            self.record.current_query = Some(question.to_string());

            let mut user = write(&self.user);
            user.query_history.push(question.to_string());
            let overflow = user.query_history.len().saturating_sub(MAX_USER_QUERY_HISTORY);
            user.query_history.drain(..overflow);
        }
        debug!(session = %self.id, query_count = self.record.query_count, "Turn started");
    }

    /// Drop temporary state, returning it
    pub fn end_turn(&mut self) -> Option<TurnState> {
        let turn = self.turn.take();
        debug!(session = %self.id, iterations = turn.as_ref().map(|t| t.iteration), "Turn ended");
        turn
    }

    /// Increment the iteration counter, starting a turn state if none is active
    pub fn increment_iteration(&mut self) -> u32 {
        let turn = self.turn.get_or_insert_with(TurnState::default);
        turn.iteration += 1;
        turn.iteration
    }

    pub fn iteration(&self) -> u32 {
        self.turn.as_ref().map_or(0, |t| t.iteration)
    }

    /// More rounds allowed and the last assessment asked for one
    pub fn should_continue(&self, max_iterations: u32) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| t.iteration < max_iterations && t.needs_followup)
    }

    pub fn set_current_query(&mut self, text: &str) {
        self.record.current_query = Some(text.to_string());
    }

    pub fn update_quality(&mut self, assessment: &QualityAssessment) {
        self.record.last_answer_score = Some(assessment.score);
        if let Some(turn) = self.turn.as_mut() {
            turn.needs_followup = assessment.needs_followup;
            turn.followup_query = assessment.followup_query.clone();
        }
    }

    pub fn record_retrieval(
        &mut self,
        tool: &str,
        query: &str,
        results: &[RetrievalResult],
        score: Option<u32>,
    ) {
        self.record
            .retrieval_history
            .push(HistoryEntry::new(tool, query, results, score));
        push_unique(&mut self.record.tools_used, tool.to_string());
    }

    pub fn merge_entities(&mut self, entities: &EntityMentions) {
        self.record.extracted_entities.merge(entities);
    }

    /// Read a value by scope and key. Temporary keys read as `None` outside a turn.
    pub fn get(&self, scope: StateScope, key: &str) -> Option<Value> {
        match scope {
            StateScope::Temporary => {
                let turn = self.turn.as_ref()?;
                match key {
                    "iteration" | "iteration_count" => Some(Value::from(turn.iteration)),
                    "needs_followup" => Some(Value::from(turn.needs_followup)),
                    "followup_query" => Some(
                        turn.followup_query
                            .clone()
                            .map_or(Value::Null, Value::String),
                    ),
                    _ => None,
                }
            }
            StateScope::Session => {
                let r = &self.record;
                match key {
                    "query_count" => Some(Value::from(r.query_count)),
                    "last_query" => Some(to_value(&r.last_query)),
                    "current_query" => Some(to_value(&r.current_query)),
                    "last_answer_score" => Some(to_value(&r.last_answer_score)),
                    "retrieval_history" => Some(to_value(&r.retrieval_history)),
                    "extracted_entities" => Some(to_value(&r.extracted_entities)),
                    "tools_used" => Some(to_value(&r.tools_used)),
                    other => r.extra.get(other).cloned(),
                }
            }
            StateScope::User => {
                let user = read(&self.user);
                match key {
                    "name" => Some(to_value(&user.name)),
                    "preferences" => Some(Value::Object(user.preferences.clone())),
                    "query_history" => Some(to_value(&user.query_history)),
                    other => user.extra.get(other).cloned(),
                }
            }
            StateScope::Application => {
                let app = read(&self.app);
                match key {
                    "name" => Some(Value::String(app.name.clone())),
                    "description" => Some(Value::String(app.description.clone())),
                    other => app.extra.get(other).cloned(),
                }
            }
        }
    }

    /// Write a value by scope and key.
    ///
    /// List and map fields merge rather than replace: history entries and
    /// queries are appended, entities and preferences are merged.
    pub fn set(&mut self, scope: StateScope, key: &str, value: Value) -> Result<()> {
        match scope {
            StateScope::Temporary => {
                let turn = self.turn.as_mut().ok_or_else(|| {
                    Error::StateError(format!("No active turn for temporary key {}", key))
                })?;
                match key {
                    "iteration" | "iteration_count" => turn.iteration = decode(scope, key, value)?,
                    "needs_followup" => turn.needs_followup = decode(scope, key, value)?,
                    "followup_query" => turn.followup_query = decode(scope, key, value)?,
                    other => {
                        return Err(Error::StateError(format!(
                            "Unknown temporary key: {}",
                            other
                        )))
                    }
                }
            }
            StateScope::Session => {
                let r = &mut self.record;
                match key {
                    "query_count" => r.query_count = decode(scope, key, value)?,
                    "last_query" => r.last_query = decode(scope, key, value)?,
                    "current_query" => r.current_query = decode(scope, key, value)?,
                    "last_answer_score" => r.last_answer_score = decode(scope, key, value)?,
                    "retrieval_history" => {
                        let entries: Vec<HistoryEntry> = match value {
                            Value::Array(_) => decode(scope, key, value)?,
                            single => vec![decode(scope, key, single)?],
                        };
                        r.retrieval_history.extend(entries);
                    }
                    "extracted_entities" => {
                        let entities: EntityMentions = decode(scope, key, value)?;
                        r.extracted_entities.merge(&entities);
                    }
                    "tools_used" => {
                        let tools: Vec<String> = match value {
                            Value::Array(_) => decode(scope, key, value)?,
                            single => vec![decode(scope, key, single)?],
                        };
                        for tool in tools {
                            push_unique(&mut r.tools_used, tool);
                        }
                    }
                    other => {
                        r.extra.insert(other.to_string(), value);
                    }
                }
            }
            StateScope::User => {
                let mut user = write(&self.user);
                match key {
                    "name" => user.name = decode(scope, key, value)?,
                    "preferences" => {
                        let prefs: Map<String, Value> = decode(scope, key, value)?;
                        user.preferences.extend(prefs);
                    }
                    "query_history" => {
                        let query: String = decode(scope, key, value)?;
                        user.query_history.push(query);
                        let overflow =
                            user.query_history.len().saturating_sub(MAX_USER_QUERY_HISTORY);
                        user.query_history.drain(..overflow);
                    }
                    other => {
                        user.extra.insert(other.to_string(), value);
                    }
                }
            }
            StateScope::Application => {
                let mut app = write(&self.app);
                match key {
                    "name" => app.name = decode(scope, key, value)?,
                    "description" => app.description = decode(scope, key, value)?,
                    other => {
                        app.extra.insert(other.to_string(), value);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            session: self.record.clone(),
            user: read(&self.user).clone(),
            app: read(&self.app).clone(),
        }
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            iteration: self.iteration(),
            query: self.record.current_query.clone(),
            retrieval_count: self.record.retrieval_history.len(),
            quality_score: self.record.last_answer_score,
            entities: self.record.extracted_entities.clone(),
            needs_followup: self.turn.as_ref().is_some_and(|t| t.needs_followup),
            query_count: self.record.query_count,
        }
    }
}
