//! Path registry.
//!
//! Maps a URL of the form `<task-prefix><session-id>` to the task that owns
//! it. Prefixes may never overlap: registering a prefix that is a prefix of
//! (or extends) an existing one fails, so resolution has at most one match by
//! construction and an ambiguous setup is caught at startup.

use std::{fmt, time::Duration};

use crate::{
    error::PathError,
    listener::MessageHandler,
    task::{First, Second, Zeroth, first, second, zeroth},
};

/// Known task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Arithmetic warm-up
    Zeroth,
    /// Noisy digit recognition
    First,
    /// Histogram aiming game
    Second,
}

impl TaskKind {
    /// All task kinds.
    pub const ALL: [Self; 3] = [Self::Zeroth, Self::First, Self::Second];

    /// URL prefix the task is served under by default.
    pub fn default_path(self) -> &'static str {
        match self {
            Self::Zeroth => zeroth::PATH,
            Self::First => first::PATH,
            Self::Second => second::PATH,
        }
    }

    /// Default connection TTL.
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Zeroth => zeroth::DEFAULT_TTL,
            Self::First => first::DEFAULT_TTL,
            Self::Second => second::DEFAULT_TTL,
        }
    }

    /// Fresh executor in its start state.
    pub fn spawn(self) -> Box<dyn MessageHandler> {
        match self {
            Self::Zeroth => Box::new(Zeroth::new()),
            Self::First => Box::new(First::new()),
            Self::Second => Box::new(Second::new()),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zeroth => "zeroth",
            Self::First => "first",
            Self::Second => "second",
        })
    }
}

/// A registered task prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// URL prefix, `/name/`
    pub prefix: String,
    /// Task served under the prefix
    pub kind: TaskKind,
    /// TTL of every connection on this route
    pub ttl: Duration,
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<'a> {
    /// Matching route
    pub route: &'a Route,
    /// URL suffix after the prefix; never empty
    pub session_id: &'a str,
}

/// Prefix table of tasks.
#[derive(Debug, Clone, Default)]
pub struct PathRegistry {
    routes: Vec<Route>,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every task under its default prefix.
    ///
    /// `ttl` overrides the default TTL per task.
    pub fn with_defaults(ttl: impl Fn(TaskKind) -> Duration) -> Result<Self, PathError> {
        let mut registry = Self::new();
        for kind in TaskKind::ALL {
            registry.register(kind.default_path(), kind, ttl(kind))?;
        }
        Ok(registry)
    }

    /// Add a route.
    pub fn register(
        &mut self,
        prefix: impl Into<String>,
        kind: TaskKind,
        ttl: Duration,
    ) -> Result<(), PathError> {
        let prefix = prefix.into();
        if prefix.len() < 2 || !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(PathError::InvalidPrefix(prefix));
        }

        if let Some(existing) =
            self.routes.iter().find(|r| r.prefix.starts_with(&prefix) || prefix.starts_with(&r.prefix))
        {
            return Err(PathError::Ambiguous { existing: existing.prefix.clone(), new: prefix });
        }

        self.routes.push(Route { prefix, kind, ttl });
        Ok(())
    }

    /// Find the task owning `path`.
    ///
    /// `None` unless `path` starts with a registered prefix and carries a
    /// non-empty session id after it.
    pub fn resolve<'a>(&'a self, path: &'a str) -> Option<Resolved<'a>> {
        self.routes.iter().find_map(|route| {
            path.strip_prefix(route.prefix.as_str())
                .filter(|session_id| !session_id.is_empty())
                .map(|session_id| Resolved { route, session_id })
        })
    }

    /// Registered routes, in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> PathRegistry {
        PathRegistry::with_defaults(TaskKind::default_ttl).unwrap()
    }

    #[test]
    fn resolves_task_and_session() {
        let registry = defaults();

        let resolved = registry.resolve("/first/abc123").unwrap();
        assert_eq!(resolved.route.kind, TaskKind::First);
        assert_eq!(resolved.session_id, "abc123");
        assert_eq!(resolved.route.ttl, Duration::from_secs(300));

        let resolved = registry.resolve("/zeroth/a/b").unwrap();
        assert_eq!(resolved.route.kind, TaskKind::Zeroth);
        assert_eq!(resolved.session_id, "a/b");
    }

    #[test]
    fn session_id_is_mandatory() {
        let registry = defaults();

        assert!(registry.resolve("/zeroth/").is_none());
        assert!(registry.resolve("/zeroth").is_none());
    }

    #[test]
    fn unknown_paths_do_not_resolve() {
        let registry = defaults();

        assert!(registry.resolve("/third/x").is_none());
        assert!(registry.resolve("").is_none());
        assert!(registry.resolve("zeroth/x").is_none());
    }

    #[test]
    fn overlapping_prefix_fails_loudly() {
        let mut registry = defaults();

        let err = registry.register("/zeroth/extra/", TaskKind::First, Duration::from_secs(1));
        assert_eq!(
            err,
            Err(PathError::Ambiguous { existing: "/zeroth/".to_string(), new: "/zeroth/extra/".to_string() })
        );

        let err = registry.register("/", TaskKind::First, Duration::from_secs(1));
        assert!(matches!(err, Err(PathError::InvalidPrefix(_))));

        let mut registry = PathRegistry::new();
        registry.register("/a/b/", TaskKind::First, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            registry.register("/a/", TaskKind::Second, Duration::from_secs(1)),
            Err(PathError::Ambiguous { .. })
        ));
    }

    #[test]
    fn malformed_prefix_is_rejected() {
        let mut registry = PathRegistry::new();

        assert!(registry.register("zeroth/", TaskKind::Zeroth, Duration::ZERO).is_err());
        assert!(registry.register("/zeroth", TaskKind::Zeroth, Duration::ZERO).is_err());
        assert!(registry.routes().is_empty());
    }

    #[test]
    fn spawned_executors_start_fresh() {
        for kind in TaskKind::ALL {
            let handler = kind.spawn();
            assert_eq!(handler.role(), crate::listener::Role::Executor(kind));
        }
    }
}
