use std::fmt;

/// A fan-out channel name, constructed by convention:
/// `session:<id>`, `agent:<user_id>`, `queue`, `admin-stats`, `broadcast`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn session(session_id: &str) -> Self {
        Self(format!("session:{session_id}"))
    }

    pub fn agent(user_id: i64) -> Self {
        Self(format!("agent:{user_id}"))
    }

    pub fn queue() -> Self {
        Self("queue".into())
    }

    pub fn admin_stats() -> Self {
        Self("admin-stats".into())
    }

    pub fn broadcast() -> Self {
        Self("broadcast".into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_convention() {
        assert_eq!(Topic::session("abc").name(), "session:abc");
        assert_eq!(Topic::agent(12).name(), "agent:12");
        assert_eq!(Topic::queue().name(), "queue");
        assert_eq!(Topic::admin_stats().name(), "admin-stats");
        assert_eq!(Topic::broadcast().name(), "broadcast");
    }
}
